use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::CodecError;

use super::traits::Codec;
use super::types::{AudioFrame, TransportKind};

/// Hands frames through untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughCodec;

impl Codec for PassthroughCodec {
    fn decode(&self, raw: &[u8]) -> Result<AudioFrame, CodecError> {
        Ok(AudioFrame::new(Bytes::copy_from_slice(raw)))
    }

    fn encode(&self, frame: &AudioFrame) -> Result<Bytes, CodecError> {
        Ok(frame.clone().into_bytes())
    }
}

/// Codec per transport kind; unregistered kinds fall back to passthrough.
#[derive(Clone)]
pub struct CodecRegistry {
    codecs: HashMap<TransportKind, Arc<dyn Codec>>,
    fallback: Arc<dyn Codec>,
}

impl CodecRegistry {
    pub fn register(mut self, kind: TransportKind, codec: Arc<dyn Codec>) -> Self {
        self.codecs.insert(kind, codec);
        self
    }

    pub fn for_kind(&self, kind: TransportKind) -> Arc<dyn Codec> {
        self.codecs
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self {
            codecs: HashMap::new(),
            fallback: Arc::new(PassthroughCodec),
        }
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("registered", &self.codecs.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Inverting;

    impl Codec for Inverting {
        fn decode(&self, raw: &[u8]) -> Result<AudioFrame, CodecError> {
            Ok(AudioFrame::from(raw.iter().map(|b| !b).collect::<Vec<u8>>()))
        }

        fn encode(&self, frame: &AudioFrame) -> Result<Bytes, CodecError> {
            Ok(Bytes::from(
                frame.as_bytes().iter().map(|b| !b).collect::<Vec<u8>>(),
            ))
        }
    }

    #[test]
    fn registry_prefers_registered_codec() {
        let registry = CodecRegistry::default().register(TransportKind::Telephony, Arc::new(Inverting));

        let telephony = registry.for_kind(TransportKind::Telephony);
        let decoded = telephony.decode(&[0x00, 0xff]).expect("decode");
        assert_eq!(decoded.as_bytes(), &[0xff, 0x00]);

        let browser = registry.for_kind(TransportKind::Browser);
        let decoded = browser.decode(&[0x01]).expect("decode");
        assert_eq!(decoded.as_bytes(), &[0x01]);
    }
}
