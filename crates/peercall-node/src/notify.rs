//! Fan-out of node events to whoever is watching (CLI, UI, tests).

use std::sync::Arc;

use tokio::sync::broadcast;

use peercall_crypto::PublicKey;

use crate::call::{CallSession, CallState};

#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// Contact list or contact presence changed.
    ContactsRefreshed,
    /// The call log changed.
    EventsRefreshed,
    CallStateChanged {
        peer: PublicKey,
        state: CallState,
    },
    /// A call is ringing and waits for [`CallSession::accept`] or
    /// [`CallSession::decline`].
    IncomingCall(Arc<CallSession>),
    /// The media engine reports the remote stream is flowing.
    StreamAvailable {
        peer: PublicKey,
    },
    /// The peer switched its camera on or off.
    RemoteCamera {
        peer: PublicKey,
        enabled: bool,
    },
    /// A call was refused before ringing (unknown or blocked caller).
    CallRejected {
        peer: PublicKey,
    },
    /// A background task failed.
    Error {
        context: &'static str,
        message: String,
    },
}

#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<NodeEvent>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.tx.subscribe()
    }

    /// Deliver to current subscribers. Nobody listening is fine.
    pub fn notify(&self, event: NodeEvent) {
        let _ = self.tx.send(event);
    }

    pub fn error(&self, context: &'static str, err: impl std::fmt::Display) {
        tracing::error!(context, "{}", err);
        self.notify(NodeEvent::Error {
            context,
            message: err.to_string(),
        });
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_events_in_order() {
        let notifier = Notifier::default();
        let mut rx = notifier.subscribe();
        notifier.notify(NodeEvent::ContactsRefreshed);
        notifier.error("probe", "boom");

        assert!(matches!(rx.recv().await.unwrap(), NodeEvent::ContactsRefreshed));
        match rx.recv().await.unwrap() {
            NodeEvent::Error { context, message } => {
                assert_eq!(context, "probe");
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn notify_without_subscribers_is_silent() {
        Notifier::default().notify(NodeEvent::EventsRefreshed);
    }
}
