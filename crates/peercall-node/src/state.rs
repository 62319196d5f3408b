use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

use peercall_crypto::{IdentityKeyPair, PublicKey};
use peercall_protocol::SignalMessage;

use crate::call::CallSession;
use crate::channel;
use crate::config::NodeConfig;
use crate::connector::{Connector, ConnectorConfig};
use crate::media::MediaEngine;
use crate::network::Network;
use crate::notify::Notifier;
use crate::store::{ContactState, StoreError, StoreOwner};

/// Upper bound for delivering one shutdown announcement.
const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("unknown contact {0}")]
    UnknownContact(String),

    #[error("another call is in progress")]
    Busy,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Everything a running node shares between its tasks.
pub struct NodeState {
    pub config: NodeConfig,
    pub store: StoreOwner,
    pub identity: Arc<IdentityKeyPair>,
    pub notifier: Notifier,
    pub network: Arc<dyn Network>,
    pub media: Arc<dyn MediaEngine>,
    /// The one call this node is part of, if any.
    current_call: Mutex<Option<Arc<CallSession>>>,
}

impl NodeState {
    pub async fn new(
        config: NodeConfig,
        store: StoreOwner,
        network: Arc<dyn Network>,
        media: Arc<dyn MediaEngine>,
    ) -> Result<Arc<Self>, NodeError> {
        let identity = store
            .settings()
            .await
            .identity()
            .map_err(|e| NodeError::Store(StoreError::Identity(e)))?;
        let notifier = store.notifier().clone();
        Ok(Arc::new(Self {
            config,
            store,
            identity: Arc::new(identity),
            notifier,
            network,
            media,
            current_call: Mutex::new(None),
        }))
    }

    fn slot(&self) -> MutexGuard<'_, Option<Arc<CallSession>>> {
        self.current_call
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Connector using the current connect policy.
    pub async fn connector(&self) -> Connector {
        let settings = self.store.settings().await;
        Connector::new(
            ConnectorConfig::from_settings(&settings, self.config.peer_port),
            self.network.clone(),
        )
    }

    pub fn current_call(&self) -> Option<Arc<CallSession>> {
        self.slot().clone()
    }

    /// Make `session` the current call unless another one is active.
    pub(crate) fn try_claim_call(&self, session: &Arc<CallSession>) -> bool {
        let mut slot = self.slot();
        if slot.is_some() {
            return false;
        }
        *slot = Some(session.clone());
        true
    }

    pub(crate) fn release_call(&self, session: &CallSession) {
        let mut slot = self.slot();
        if slot
            .as_ref()
            .is_some_and(|current| std::ptr::eq(Arc::as_ptr(current), session))
        {
            *slot = None;
        }
    }

    /// Create an outgoing call to a stored contact. It dials right away
    /// unless the user wants to confirm outgoing calls, in which case the
    /// caller starts it with [`CallSession::start`].
    pub async fn start_call(self: &Arc<Self>, key: &PublicKey) -> Result<Arc<CallSession>, NodeError> {
        let contact = self
            .store
            .contact(key)
            .await
            .ok_or_else(|| NodeError::UnknownContact(key.short()))?;
        let prompt = self.store.settings().await.prompt_outgoing_calls;

        let session = CallSession::outgoing(self.clone(), contact);
        if !self.try_claim_call(&session) {
            return Err(NodeError::Busy);
        }
        if !prompt {
            session.start();
        }
        Ok(session)
    }

    /// Tell every contact that may think we are up that we are going away.
    /// Best effort: failures are logged and skipped.
    pub async fn announce_offline(&self) {
        let connector = self.connector().await;
        let contacts = self.store.contacts().await;
        for contact in contacts
            .iter()
            .filter(|c| !c.blocked && c.state != ContactState::Offline)
        {
            let announce = async {
                let connected = connector.connect(contact).await.map_err(|e| e.to_string())?;
                let (_reader, mut writer) = channel::split(connected.stream, self.identity.clone());
                let sent = writer
                    .send(contact.public_key(), &SignalMessage::offline())
                    .await
                    .map_err(|e| e.to_string());
                writer.close().await;
                sent
            };
            match tokio::time::timeout(ANNOUNCE_TIMEOUT, announce).await {
                Ok(Ok(())) => info!(contact = %contact.name, "announced shutdown"),
                Ok(Err(e)) => debug!(contact = %contact.name, "shutdown announcement failed: {}", e),
                Err(_) => debug!(contact = %contact.name, "shutdown announcement timed out"),
            }
        }
    }
}
