//! 网关配置：平台音频参数、VAD、会话超时与日志输出。

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;
use crate::pipeline::{AudioFormat, CodecTag, TransportKind};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub platforms: PlatformProfiles,
    pub vad: VadConfig,
    pub session: SessionConfig,
    pub telemetry: TelemetryConfig,
}

impl GatewayConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigurationError> {
        let config: GatewayConfig =
            toml::from_str(raw).map_err(|err| ConfigurationError::load(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|err| ConfigurationError::load(format!("{}: {err}", path.display())))?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        for kind in [
            TransportKind::Telephony,
            TransportKind::Browser,
            TransportKind::VoiceChat,
        ] {
            self.platforms.for_kind(kind).validate(kind)?;
        }
        self.vad.validate()?;
        self.session.validate()
    }
}

/// 各接入平台的队列容量与音频格式。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformProfiles {
    pub telephony: PlatformProfile,
    pub browser: PlatformProfile,
    pub voice_chat: PlatformProfile,
}

impl PlatformProfiles {
    pub fn for_kind(&self, kind: TransportKind) -> &PlatformProfile {
        match kind {
            TransportKind::Telephony => &self.telephony,
            TransportKind::Browser => &self.browser,
            TransportKind::VoiceChat => &self.voice_chat,
        }
    }
}

impl Default for PlatformProfiles {
    fn default() -> Self {
        Self {
            telephony: PlatformProfile::new(CodecTag::G711Ulaw, 8_000, 1),
            browser: PlatformProfile::new(CodecTag::Pcm16, 24_000, 1),
            voice_chat: PlatformProfile::new(CodecTag::Opus, 48_000, 2),
        }
    }
}

/// A platform section must name its format; capacities fall back to the default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformProfile {
    #[serde(default = "default_queue_capacity")]
    pub input_queue_capacity: usize,
    #[serde(default = "default_queue_capacity")]
    pub output_queue_capacity: usize,
    pub codec: CodecTag,
    pub sample_rate_hz: u32,
    pub channels: u16,
}

impl PlatformProfile {
    pub fn new(codec: CodecTag, sample_rate_hz: u32, channels: u16) -> Self {
        Self {
            input_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            output_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            codec,
            sample_rate_hz,
            channels,
        }
    }

    pub fn format(&self) -> AudioFormat {
        AudioFormat::new(self.codec, self.sample_rate_hz, self.channels)
    }

    pub fn validate(&self, kind: TransportKind) -> Result<(), ConfigurationError> {
        if self.input_queue_capacity == 0 {
            return Err(ConfigurationError::invalid_value(
                format!("platforms.{kind}.input_queue_capacity"),
                "must be greater than zero",
            ));
        }
        if self.output_queue_capacity == 0 {
            return Err(ConfigurationError::invalid_value(
                format!("platforms.{kind}.output_queue_capacity"),
                "must be greater than zero",
            ));
        }
        self.format().validate()
    }
}

pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

/// Server-side speech detection parameters forwarded to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

impl VadConfig {
    fn validate(&self) -> Result<(), ConfigurationError> {
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(ConfigurationError::invalid_value(
                "vad.threshold",
                format!("{} is outside 0.0..=1.0", self.threshold),
            ));
        }
        Ok(())
    }
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub initial_greeting: Option<String>,
    /// Zero means unlimited.
    pub max_sessions: usize,
    pub max_errors: u32,
    pub max_session_duration_secs: u64,
    /// Zero disables the background reaper.
    pub cleanup_interval_secs: u64,
    pub receive_poll_ms: u64,
    pub drain_poll_ms: u64,
    pub audio_shutdown_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub cleanup_step_timeout_ms: u64,
    pub notification_capacity: usize,
    pub fault_queue_capacity: usize,
}

impl SessionConfig {
    pub fn max_session_duration(&self) -> Duration {
        Duration::from_secs(self.max_session_duration_secs)
    }

    pub fn cleanup_interval(&self) -> Option<Duration> {
        (self.cleanup_interval_secs > 0).then(|| Duration::from_secs(self.cleanup_interval_secs))
    }

    pub fn receive_poll(&self) -> Duration {
        Duration::from_millis(self.receive_poll_ms)
    }

    pub fn drain_poll(&self) -> Duration {
        Duration::from_millis(self.drain_poll_ms)
    }

    pub fn audio_shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.audio_shutdown_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn cleanup_step_timeout(&self) -> Duration {
        Duration::from_millis(self.cleanup_step_timeout_ms)
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        let positive = [
            ("session.receive_poll_ms", self.receive_poll_ms),
            ("session.drain_poll_ms", self.drain_poll_ms),
            ("session.audio_shutdown_timeout_ms", self.audio_shutdown_timeout_ms),
            ("session.shutdown_timeout_ms", self.shutdown_timeout_ms),
            ("session.cleanup_step_timeout_ms", self.cleanup_step_timeout_ms),
            ("session.notification_capacity", self.notification_capacity as u64),
            ("session.fault_queue_capacity", self.fault_queue_capacity as u64),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigurationError::invalid_value(
                    field,
                    "must be greater than zero",
                ));
            }
        }
        Ok(())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            initial_greeting: None,
            max_sessions: 0,
            max_errors: 5,
            max_session_duration_secs: 3_600,
            cleanup_interval_secs: 300,
            receive_poll_ms: 100,
            drain_poll_ms: 1_000,
            audio_shutdown_timeout_ms: 2_000,
            shutdown_timeout_ms: 5_000,
            cleanup_step_timeout_ms: 2_000,
            notification_capacity: 64,
            fault_queue_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Used when `RUST_LOG` is unset.
    pub level: String,
    pub json: bool,
    pub log_dir: Option<PathBuf>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
            log_dir: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_follow_platform_conventions() {
        let config = GatewayConfig::default();
        assert_eq!(
            config.platforms.for_kind(TransportKind::Telephony).format(),
            AudioFormat::new(CodecTag::G711Ulaw, 8_000, 1)
        );
        assert_eq!(
            config.platforms.for_kind(TransportKind::Browser).sample_rate_hz,
            24_000
        );
        assert_eq!(config.vad.prefix_padding_ms, 300);
        assert_eq!(config.vad.silence_duration_ms, 500);
        assert_eq!(config.session.max_errors, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let raw = r#"
            [platforms.telephony]
            input_queue_capacity = 2
            codec = "g711_alaw"
            sample_rate_hz = 8000
            channels = 1

            [session]
            initial_greeting = "Hello, how can I help?"
            cleanup_interval_secs = 0
        "#;

        let config = GatewayConfig::from_toml_str(raw).expect("config should parse");
        let telephony = config.platforms.for_kind(TransportKind::Telephony);
        assert_eq!(telephony.input_queue_capacity, 2);
        assert_eq!(telephony.output_queue_capacity, DEFAULT_QUEUE_CAPACITY);
        assert_eq!(telephony.codec, CodecTag::G711Alaw);
        assert_eq!(
            config.platforms.for_kind(TransportKind::VoiceChat).codec,
            CodecTag::Opus
        );
        assert_eq!(
            config.session.initial_greeting.as_deref(),
            Some("Hello, how can I help?")
        );
        assert_eq!(config.session.cleanup_interval(), None);
        assert_eq!(config.vad, VadConfig::default());
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let raw = r#"
            [platforms.browser]
            output_queue_capacity = 0
            codec = "pcm16"
            sample_rate_hz = 24000
            channels = 1
        "#;

        match GatewayConfig::from_toml_str(raw) {
            Err(ConfigurationError::InvalidValue { field, .. }) => {
                assert_eq!(field, "platforms.browser.output_queue_capacity");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn platform_section_without_format_fails_to_load() {
        let raw = r#"
            [platforms.telephony]
            input_queue_capacity = 2
        "#;

        assert!(matches!(
            GatewayConfig::from_toml_str(raw),
            Err(ConfigurationError::Load { .. })
        ));
    }

    #[test]
    fn out_of_range_vad_threshold_is_rejected() {
        let mut config = GatewayConfig::default();
        config.vad.threshold = 1.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn load_reads_file_from_disk() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            "[vad]\nthreshold = 0.7\n\n[telemetry]\nlevel = \"debug\"\njson = true"
        )
        .expect("write config");

        let config = GatewayConfig::load(file.path()).expect("config should load");
        assert!((config.vad.threshold - 0.7).abs() < f32::EPSILON);
        assert_eq!(config.telemetry.level, "debug");
        assert!(config.telemetry.json);
    }

    #[test]
    fn missing_file_reports_load_error() {
        let dir = tempfile::tempdir().expect("temp dir");
        let result = GatewayConfig::load(dir.path().join("absent.toml"));
        assert!(matches!(result, Err(ConfigurationError::Load { .. })));
    }
}
