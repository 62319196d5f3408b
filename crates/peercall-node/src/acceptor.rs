//! Inbound signaling: the listening socket and per-connection dispatch.
//!
//! Every accepted connection carries exactly one opening envelope. Pings
//! and shutdown announcements are answered inline; a `call` hands the
//! stream over to a [`CallSession`].

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use peercall_crypto::PublicKey;
use peercall_protocol::types::STATUS_OFFLINE;
use peercall_protocol::SignalMessage;

use crate::address::{mac_from_eui64, Candidate};
use crate::call::CallSession;
use crate::channel::{self, ChannelError, SignalReader, SignalWriter};
use crate::network::BoxStream;
use crate::notify::NodeEvent;
use crate::state::NodeState;
use crate::store::{Contact, ContactState};

const LISTEN_BACKLOG: i32 = 128;

/// Name given to callers that are not in the contact list.
pub const UNKNOWN_CALLER: &str = "Unknown caller";

/// Bind the signaling listener. An IPv6 wildcard accepts IPv4 peers too.
pub fn bind(host: &str, port: u16) -> io::Result<TcpListener> {
    let ip: IpAddr = host
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("invalid host {host}")))?;
    let addr = SocketAddr::new(ip, port);

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    if addr.is_ipv6() {
        if let Err(e) = socket.set_only_v6(false) {
            warn!("cannot enable dual-stack listening: {}", e);
        }
    }
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener)
}

/// Accept connections until `shutdown` turns true.
pub async fn run_acceptor(
    listener: TcpListener,
    node: Arc<NodeState>,
    mut shutdown: watch::Receiver<bool>,
) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "accepting signaling connections");
    }
    loop {
        let accepted = tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer_addr) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("accept error: {}", e);
                continue;
            }
        };
        let node = node.clone();
        tokio::spawn(async move {
            handle_connection(Box::new(stream), peer_addr, node).await;
        });
    }
    info!("acceptor stopped");
}

/// Read the opening envelope of one inbound connection and act on it.
pub async fn handle_connection(stream: BoxStream, peer_addr: SocketAddr, node: Arc<NodeState>) {
    debug!(peer = %peer_addr, "new signaling connection");
    let (mut reader, mut writer) = channel::split(stream, node.identity.clone());

    let first = tokio::time::timeout(node.config.call_read_timeout(), reader.recv_any()).await;
    let (msg, sender) = match first {
        Ok(Ok(opened)) => opened,
        Ok(Err(ChannelError::Closed)) => {
            debug!(peer = %peer_addr, "connection closed before any message");
            return;
        }
        Ok(Err(e)) => {
            warn!(peer = %peer_addr, "rejecting connection: {}", e);
            writer.close().await;
            return;
        }
        Err(_) => {
            warn!(peer = %peer_addr, "no message received, closing");
            writer.close().await;
            return;
        }
    };

    let address = Candidate::from_socket_addr(peer_addr, |index| node.network.interface_name(index));
    let contact = node.store.contact(&sender).await;
    let block_unknown = node.store.settings().await.block_unknown;
    let refused = match &contact {
        Some(c) => c.blocked,
        None => block_unknown,
    };

    match msg {
        SignalMessage::Ping => {
            if refused {
                debug!(peer = %peer_addr, sender = %sender.short(), "ignoring ping from refused sender");
                writer.close().await;
                return;
            }
            if let Err(e) = writer.send(&sender, &SignalMessage::Pong).await {
                debug!(peer = %peer_addr, "pong not delivered: {}", e);
            }
            writer.close().await;
            if contact.is_some() {
                mark_reachable(&node, &sender, address).await;
            }
        }
        SignalMessage::StatusChange { status } => {
            writer.close().await;
            if status != STATUS_OFFLINE {
                debug!(peer = %peer_addr, %status, "ignoring status change");
                return;
            }
            if contact.is_some() && node.store.set_state(&sender, ContactState::Offline).await {
                info!(sender = %sender.short(), "contact went offline");
                node.notifier.notify(NodeEvent::ContactsRefreshed);
            }
        }
        SignalMessage::Call { offer } => {
            if refused {
                info!(peer = %peer_addr, sender = %sender.short(), "refusing call");
                node.notifier.notify(NodeEvent::CallRejected { peer: sender });
                writer.close().await;
                return;
            }
            let known = contact.is_some();
            let contact = contact.unwrap_or_else(|| unknown_caller(sender, address.as_ref()));
            accept_call(&node, contact, reader, writer, offer, address.clone()).await;
            if let Some(address) = address.filter(|_| known) {
                if let Err(e) = node.store.update_last_working_address(&sender, address).await {
                    node.notifier.error("store", e);
                }
            }
        }
        other => {
            warn!(peer = %peer_addr, action = other.action(), "unexpected opening message");
            writer.close().await;
        }
    }
}

async fn accept_call(
    node: &Arc<NodeState>,
    contact: Contact,
    reader: SignalReader,
    writer: SignalWriter,
    offer: String,
    address: Option<Candidate>,
) {
    info!(contact = %contact.name, ?address, "incoming call");
    let session = CallSession::incoming(node.clone(), contact, writer, offer, address);
    if node.try_claim_call(&session) {
        session.spawn_incoming(reader);
    } else {
        session.reject_busy().await;
    }
}

async fn mark_reachable(node: &NodeState, sender: &PublicKey, address: Option<Candidate>) {
    node.store.set_state(sender, ContactState::Online).await;
    if let Some(address) = address {
        if let Err(e) = node.store.update_last_working_address(sender, address).await {
            node.notifier.error("store", e);
        }
    }
    node.notifier.notify(NodeEvent::ContactsRefreshed);
}

/// Transient contact for a caller we know nothing about but its key and
/// where it called from.
fn unknown_caller(key: PublicKey, address: Option<&Candidate>) -> Contact {
    let address = address.map(|address| match address {
        Candidate::Ip(IpAddr::V6(ip)) | Candidate::LinkLocal { ip, .. } => {
            mac_from_eui64(ip).map_or_else(|| address.clone(), Candidate::Mac)
        }
        other => other.clone(),
    });
    Contact::new(UNKNOWN_CALLER, key, address.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::eui64_link_local;
    use peercall_crypto::IdentityKeyPair;

    #[test]
    fn unknown_caller_prefers_mac_from_eui64() {
        let key = *IdentityKeyPair::generate().public();
        let mac = [0x02, 0x11, 0x22, 0x33, 0x44, 0x55];
        let ip = eui64_link_local(&mac);
        let contact = unknown_caller(
            key,
            Some(&Candidate::LinkLocal {
                ip,
                interface: "wlan0".into(),
            }),
        );
        assert_eq!(contact.name, UNKNOWN_CALLER);
        assert_eq!(contact.addresses(), &[Candidate::Mac(mac)]);
    }

    #[test]
    fn unknown_caller_keeps_plain_ip() {
        let key = *IdentityKeyPair::generate().public();
        let address = Candidate::parse("192.168.1.5").unwrap();
        let contact = unknown_caller(key, Some(&address));
        assert_eq!(contact.addresses(), &[address]);
    }

    #[test]
    fn unknown_caller_without_address() {
        let key = *IdentityKeyPair::generate().public();
        assert!(unknown_caller(key, None).addresses().is_empty());
    }

    #[tokio::test]
    async fn bind_loopback_picks_port() {
        let listener = bind("127.0.0.1", 0).unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }
}
