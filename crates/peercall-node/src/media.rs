//! The media engine seam.
//!
//! Capture, codecs and ICE live outside this crate. A call only needs to
//! ask for an offer or answer, hand over the peer's description, toggle the
//! camera and exchange small data-channel messages. Everything the engine
//! reports back arrives on an mpsc channel.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("media engine failed: {0}")]
    Engine(String),

    #[error("invalid session description: {0}")]
    InvalidDescription(String),

    #[error("media connection closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    /// The remote stream started flowing.
    StreamAvailable,
    /// A data-channel message from the peer.
    Data(Vec<u8>),
    /// The media path is gone.
    Disconnected,
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Start a new peer connection using the given ICE servers.
    async fn open(
        &self,
        ice_servers: &[String],
    ) -> Result<(Box<dyn MediaConnection>, mpsc::Receiver<MediaEvent>), MediaError>;
}

#[async_trait]
pub trait MediaConnection: Send + Sync {
    /// Local SDP offer (caller side).
    async fn create_offer(&mut self) -> Result<String, MediaError>;

    /// Apply the caller's offer and return the local SDP answer.
    async fn create_answer(&mut self, offer: &str) -> Result<String, MediaError>;

    /// Apply the callee's answer (caller side).
    async fn apply_answer(&mut self, answer: &str) -> Result<(), MediaError>;

    async fn set_camera_enabled(&mut self, enabled: bool) -> Result<(), MediaError>;

    async fn send_data(&mut self, data: &[u8]) -> Result<(), MediaError>;

    /// Release capture devices and the peer connection. Must be idempotent.
    async fn close(&mut self);
}

/// Engine for headless nodes and tests. Produces placeholder descriptions,
/// reports the stream as available once both sides have a description, and
/// swallows data-channel traffic.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughMedia;

struct PassthroughConnection {
    events: mpsc::Sender<MediaEvent>,
    closed: bool,
}

const OFFER_PREFIX: &str = "v=0\r\ns=peercall-offer\r\n";
const ANSWER_PREFIX: &str = "v=0\r\ns=peercall-answer\r\n";

#[async_trait]
impl MediaEngine for PassthroughMedia {
    async fn open(
        &self,
        _ice_servers: &[String],
    ) -> Result<(Box<dyn MediaConnection>, mpsc::Receiver<MediaEvent>), MediaError> {
        let (tx, rx) = mpsc::channel(16);
        let conn = PassthroughConnection {
            events: tx,
            closed: false,
        };
        Ok((Box::new(conn), rx))
    }
}

impl PassthroughConnection {
    fn check_open(&self) -> Result<(), MediaError> {
        if self.closed {
            return Err(MediaError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl MediaConnection for PassthroughConnection {
    async fn create_offer(&mut self) -> Result<String, MediaError> {
        self.check_open()?;
        Ok(OFFER_PREFIX.to_string())
    }

    async fn create_answer(&mut self, offer: &str) -> Result<String, MediaError> {
        self.check_open()?;
        if !offer.starts_with("v=0") {
            return Err(MediaError::InvalidDescription("offer is not SDP".into()));
        }
        let _ = self.events.send(MediaEvent::StreamAvailable).await;
        Ok(ANSWER_PREFIX.to_string())
    }

    async fn apply_answer(&mut self, answer: &str) -> Result<(), MediaError> {
        self.check_open()?;
        if !answer.starts_with("v=0") {
            return Err(MediaError::InvalidDescription("answer is not SDP".into()));
        }
        let _ = self.events.send(MediaEvent::StreamAvailable).await;
        Ok(())
    }

    async fn set_camera_enabled(&mut self, enabled: bool) -> Result<(), MediaError> {
        self.check_open()?;
        tracing::debug!(enabled, "camera toggled");
        Ok(())
    }

    async fn send_data(&mut self, _data: &[u8]) -> Result<(), MediaError> {
        self.check_open()
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.events.try_send(MediaEvent::Disconnected);
        }
    }
}
