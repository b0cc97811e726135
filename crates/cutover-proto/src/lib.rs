//! Cutover Proto - wire protocol between service and agents
//!
//! Messages are length-prefixed JSON: a little-endian 4-byte length followed
//! by a UTF-8 JSON object `{id, type, timestamp, payload}`. Field names are
//! camelCase on the wire. The closed set of message types and their typed
//! payloads live in [`message`]; framing in [`codec`].

pub mod codec;
pub mod message;

pub use codec::{decode, encode, read_frame, write_frame, ProtoError, MAX_FRAME_LEN};
pub use message::{Envelope, MessageType, Payload};
