//! Outgoing connection establishment.
//!
//! Walks a contact's address candidates (last working address first),
//! resolving domains and MACs, and tries each resulting socket address a
//! bounded number of times. On total failure the most telling failure seen
//! is reported.

use std::net::{SocketAddr, SocketAddrV6};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

use crate::address::{eui64_link_local, Candidate};
use crate::network::{BoxStream, Network};
use crate::store::{Contact, Settings};

/// Why no connection could be opened.
///
/// Variants are ordered by how much they tell the user: a refused
/// connection proves the host is up, which beats a timeout, which beats a
/// failed lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Error)]
pub enum ConnectFailure {
    #[error("no usable addresses")]
    NoAddresses,

    #[error("host name could not be resolved")]
    UnknownHost,

    #[error("network unreachable")]
    NetworkUnreachable,

    #[error("host reachable but app not running")]
    AppNotRunning,
}

impl ConnectFailure {
    fn from_io(err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::ConnectionRefused => ConnectFailure::AppNotRunning,
            _ => ConnectFailure::NetworkUnreachable,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub port: u16,
    pub connect_timeout: Duration,
    pub connect_retries: u32,
    pub use_neighbor_table: bool,
    pub guess_eui64_address: bool,
}

impl ConnectorConfig {
    pub fn from_settings(settings: &Settings, port: u16) -> Self {
        Self {
            port,
            connect_timeout: Duration::from_millis(settings.connect_timeout_ms),
            connect_retries: settings.connect_retries,
            use_neighbor_table: settings.use_neighbor_table,
            guess_eui64_address: settings.guess_eui64_address,
        }
    }
}

/// An open stream and how it was reached.
pub struct Connected {
    pub stream: BoxStream,
    pub candidate: Candidate,
    pub addr: SocketAddr,
}

impl Connected {
    /// The address worth remembering for next time. MACs are remembered as
    /// the address they resolved to if that can be named, everything else
    /// as given.
    pub fn working_address(&self, network: &dyn Network) -> Candidate {
        match self.candidate {
            Candidate::Mac(_) => {
                Candidate::from_socket_addr(self.addr, |idx| network.interface_name(idx))
                    .unwrap_or_else(|| self.candidate.clone())
            }
            ref other => other.clone(),
        }
    }
}

impl std::fmt::Debug for Connected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connected")
            .field("candidate", &self.candidate)
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}

pub struct Connector {
    config: ConnectorConfig,
    network: Arc<dyn Network>,
}

impl Connector {
    pub fn new(config: ConnectorConfig, network: Arc<dyn Network>) -> Self {
        Self { config, network }
    }

    pub fn network(&self) -> &dyn Network {
        self.network.as_ref()
    }

    /// Candidates in the order they will be tried.
    pub fn attempt_order(contact: &Contact) -> Vec<Candidate> {
        let mut order = Vec::with_capacity(contact.addresses().len() + 1);
        if let Some(last) = &contact.last_working_address {
            order.push(last.clone());
        }
        for candidate in contact.addresses() {
            if !order.contains(candidate) {
                order.push(candidate.clone());
            }
        }
        order
    }

    pub async fn connect(&self, contact: &Contact) -> Result<Connected, ConnectFailure> {
        let mut worst: Option<ConnectFailure> = None;
        let mut note = |failure: ConnectFailure| {
            worst = Some(worst.map_or(failure, |w| w.max(failure)));
        };

        for candidate in Self::attempt_order(contact) {
            let targets = match self.targets(&candidate).await {
                Ok(targets) => targets,
                Err(failure) => {
                    debug!(contact = %contact.name, address = %candidate, ?failure, "skipping address");
                    note(failure);
                    continue;
                }
            };

            for addr in targets {
                match self.try_address(addr).await {
                    Ok(stream) => {
                        info!(contact = %contact.name, address = %candidate, %addr, "connected");
                        return Ok(Connected {
                            stream,
                            candidate,
                            addr,
                        });
                    }
                    Err(failure) => note(failure),
                }
            }
        }

        Err(worst.unwrap_or(ConnectFailure::NoAddresses))
    }

    async fn try_address(&self, addr: SocketAddr) -> Result<BoxStream, ConnectFailure> {
        let attempts = self.config.connect_retries.max(1);
        let mut last = ConnectFailure::NetworkUnreachable;
        for attempt in 1..=attempts {
            match self
                .network
                .connect(addr, self.config.connect_timeout)
                .await
            {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!(%addr, attempt, attempts, "connect failed: {}", e);
                    last = ConnectFailure::from_io(&e);
                }
            }
        }
        Err(last)
    }

    /// Socket addresses to try for one candidate. A MAC that resolves to
    /// nothing yields an empty list, which counts as no address at all.
    async fn targets(&self, candidate: &Candidate) -> Result<Vec<SocketAddr>, ConnectFailure> {
        let port = self.config.port;
        match candidate {
            Candidate::Ip(ip) => Ok(vec![SocketAddr::new(*ip, port)]),
            Candidate::LinkLocal { ip, interface } => {
                let scope = self
                    .network
                    .interface_index(interface)
                    .ok_or(ConnectFailure::NetworkUnreachable)?;
                Ok(vec![SocketAddr::V6(SocketAddrV6::new(*ip, port, 0, scope))])
            }
            Candidate::Domain(name) => match self.network.resolve(name, port).await {
                Ok(addrs) if !addrs.is_empty() => Ok(addrs),
                Ok(_) => Err(ConnectFailure::UnknownHost),
                Err(e) => {
                    debug!(host = %name, "lookup failed: {}", e);
                    Err(ConnectFailure::UnknownHost)
                }
            },
            Candidate::Mac(mac) => {
                let mut resolved = Vec::new();
                if self.config.use_neighbor_table {
                    for neighbor in self.network.neighbors().await {
                        if neighbor.mac == *mac {
                            resolved.push(neighbor.candidate());
                        }
                    }
                }
                if self.config.guess_eui64_address {
                    let ip = eui64_link_local(mac);
                    for interface in self.network.interfaces() {
                        resolved.push(Candidate::LinkLocal { ip, interface });
                    }
                }

                let mut addrs = Vec::new();
                for candidate in resolved {
                    match candidate {
                        Candidate::Ip(ip) => addrs.push(SocketAddr::new(ip, port)),
                        Candidate::LinkLocal { ip, interface } => {
                            if let Some(scope) = self.network.interface_index(&interface) {
                                let addr = SocketAddr::V6(SocketAddrV6::new(ip, port, 0, scope));
                                if !addrs.contains(&addr) {
                                    addrs.push(addr);
                                }
                            }
                        }
                        _ => {}
                    }
                }
                if addrs.is_empty() {
                    Err(ConnectFailure::NoAddresses)
                } else {
                    Ok(addrs)
                }
            }
        }
    }
}
