//! Presence probing: one `ping` per contact, answered with `pong` by
//! reachable nodes.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use peercall_crypto::{IdentityKeyPair, PublicKey};
use peercall_protocol::SignalMessage;

use crate::address::Candidate;
use crate::channel::{self, ChannelError};
use crate::connector::Connector;
use crate::notify::NodeEvent;
use crate::state::NodeState;
use crate::store::{Contact, ContactState};

/// Outcome of probing one contact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub public_key: PublicKey,
    pub state: ContactState,
}

/// Probe `contacts` one after another and record what was found.
///
/// Every contact is marked pending first and has a final state afterwards.
/// Observers get one refresh at the start and one at the end.
pub async fn probe_contacts(node: &Arc<NodeState>, contacts: &[Contact]) -> Vec<ProbeResult> {
    let keys: Vec<PublicKey> = contacts.iter().map(|c| *c.public_key()).collect();
    node.store.set_all_states(&keys, ContactState::Pending).await;
    node.notifier.notify(NodeEvent::ContactsRefreshed);

    let connector = Arc::new(node.connector().await);
    let read_timeout = node.config.probe_read_timeout();
    let mut results = Vec::with_capacity(contacts.len());

    for contact in contacts {
        let probe = tokio::spawn(probe_one(
            connector.clone(),
            node.identity.clone(),
            contact.clone(),
            read_timeout,
        ));
        let (state, address) = match probe.await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(contact = %contact.name, "probe task failed: {}", e);
                (ContactState::CommunicationFailed, None)
            }
        };

        node.store.set_state(contact.public_key(), state).await;
        if let Some(address) = address {
            if let Err(e) = node
                .store
                .update_last_working_address(contact.public_key(), address)
                .await
            {
                node.notifier.error("store", e);
            }
        }
        debug!(contact = %contact.name, ?state, "probe finished");
        results.push(ProbeResult {
            public_key: *contact.public_key(),
            state,
        });
    }

    let online = results
        .iter()
        .filter(|r| r.state == ContactState::Online)
        .count();
    info!(probed = results.len(), online, "presence check done");
    node.notifier.notify(NodeEvent::ContactsRefreshed);
    results
}

/// Probe every stored contact.
pub async fn probe_all(node: &Arc<NodeState>) -> Vec<ProbeResult> {
    let contacts = node.store.contacts().await;
    probe_contacts(node, &contacts).await
}

async fn probe_one(
    connector: Arc<Connector>,
    identity: Arc<IdentityKeyPair>,
    contact: Contact,
    read_timeout: Duration,
) -> (ContactState, Option<Candidate>) {
    let connected = match connector.connect(&contact).await {
        Ok(connected) => connected,
        Err(failure) => return (failure.into(), None),
    };
    let address = connected.working_address(connector.network());
    let (mut reader, mut writer) = channel::split(connected.stream, identity);

    if let Err(e) = writer.send(contact.public_key(), &SignalMessage::Ping).await {
        debug!(contact = %contact.name, "ping not delivered: {}", e);
        return (ContactState::CommunicationFailed, None);
    }

    let reply = tokio::time::timeout(read_timeout, reader.recv_from(contact.public_key()))
        .await
        .unwrap_or(Err(ChannelError::Timeout));
    writer.close().await;

    match reply {
        Ok(SignalMessage::Pong) => (ContactState::Online, Some(address)),
        Ok(other) => {
            debug!(contact = %contact.name, action = other.action(), "unexpected reply to ping");
            (ContactState::CommunicationFailed, None)
        }
        Err(ChannelError::Crypto(_) | ChannelError::Impostor(_)) => {
            warn!(contact = %contact.name, "contact failed authentication");
            (ContactState::AuthenticationFailed, None)
        }
        Err(e) => {
            debug!(contact = %contact.name, "no pong: {}", e);
            (ContactState::CommunicationFailed, None)
        }
    }
}
