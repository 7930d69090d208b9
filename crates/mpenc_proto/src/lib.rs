//! Wire types and codec for the mpenc group-chat protocol: greet
//! (key-agreement) frames, data envelopes, signed error frames, query
//! frames, and the padding/framing codec that ties them together.

pub mod codec;
pub mod data;
pub mod error;
pub mod error_frame;
pub mod greet;
pub mod query;

pub use codec::{classify, encode_protocol_frame, pad, unpad, ProtocolPayload, WireFrame};
pub use data::{DataBody, DataEnvelope, PROTOCOL_VERSION};
pub use error::ProtoError;
pub use error_frame::{ErrorFrame, Severity};
pub use greet::{GreetDirection, GreetMessage, GreetMessageType, GreetOperation, GreetVariant};
pub use query::QueryFrame;
