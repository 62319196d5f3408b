//! Wire protocol for peercall signaling: length-prefixed framing, the JSON
//! signaling documents carried inside encrypted envelopes, and the small
//! tagged control schema used over an established call.

pub mod codec;
pub mod error;
pub mod messages;
pub mod types;

pub use error::ProtocolError;
pub use messages::{ControlMessage, SignalMessage};
