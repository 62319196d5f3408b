use serde::{Deserialize, Serialize};

use crate::types::{StreamState, STATUS_OFFLINE};

/// Signaling documents exchanged inside encrypted envelopes.
///
/// Serialized as JSON objects discriminated by an `action` field, e.g.
/// `{"action":"call","offer":"v=0..."}`. Exactly one message per frame,
/// request/response style.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SignalMessage {
    /// Liveness probe. Answered inline with `Pong`, never opens a call.
    Ping,

    Pong,

    /// Caller asks to start a call.
    Call {
        /// Caller's SDP offer.
        offer: String,
    },

    /// Callee is alerting the user.
    Ringing,

    /// Callee accepted.
    Connected {
        /// Callee's SDP answer.
        answer: String,
    },

    /// Call declined, cancelled or hung up.
    Dismissed,

    /// Unsolicited presence announcement (sent on shutdown).
    StatusChange { status: String },
}

impl SignalMessage {
    pub fn offline() -> Self {
        SignalMessage::StatusChange {
            status: STATUS_OFFLINE.into(),
        }
    }

    /// Wire name of the message, as carried in the `action` field.
    pub fn action(&self) -> &'static str {
        match self {
            SignalMessage::Ping => "ping",
            SignalMessage::Pong => "pong",
            SignalMessage::Call { .. } => "call",
            SignalMessage::Ringing => "ringing",
            SignalMessage::Connected { .. } => "connected",
            SignalMessage::Dismissed => "dismissed",
            SignalMessage::StatusChange { .. } => "status_change",
        }
    }
}

/// In-band notifications sent over the media engine's data channel once a
/// call is established. They never drive call-state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    StateChange(StreamState),
}
