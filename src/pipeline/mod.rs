//! Capability seams between the gateway core and its adapters.

pub mod codec;
pub mod traits;
pub mod types;

pub use codec::{CodecRegistry, PassthroughCodec};
pub use traits::{Codec, ConversationalEngine, EngineEvents, Transport};
pub use types::{
    AudioFormat, AudioFrame, CodecTag, EngineEvent, FormatUpdate, InboundFrame, Outbound,
    SessionContext, TransportKind,
};
