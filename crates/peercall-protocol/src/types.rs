use serde::{Deserialize, Serialize};

/// Value of `status` in a `status_change` announcement sent on shutdown.
pub const STATUS_OFFLINE: &str = "offline";

/// Local camera state announced to the peer over the media data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamState {
    CameraEnabled,
    CameraDisabled,
}

impl StreamState {
    pub fn from_enabled(enabled: bool) -> Self {
        if enabled {
            StreamState::CameraEnabled
        } else {
            StreamState::CameraDisabled
        }
    }

    pub fn is_enabled(self) -> bool {
        matches!(self, StreamState::CameraEnabled)
    }
}
