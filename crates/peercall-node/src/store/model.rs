use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use peercall_crypto::{IdentityKeyPair, PublicKey, SecretKey};

use crate::address::{
    dedup_candidates, deserialize_candidates, deserialize_optional_candidate, Candidate,
};
use crate::connector::ConnectFailure;

/// Presence of a contact as last observed. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactState {
    #[default]
    Unknown,
    /// A probe is in flight.
    Pending,
    Online,
    /// The contact announced it is shutting down.
    Offline,
    AppNotRunning,
    NetworkUnreachable,
    UnknownHost,
    NoAddresses,
    AuthenticationFailed,
    CommunicationFailed,
}

impl ContactState {
    pub fn is_pending(self) -> bool {
        self == ContactState::Pending
    }
}

impl From<ConnectFailure> for ContactState {
    fn from(failure: ConnectFailure) -> Self {
        match failure {
            ConnectFailure::NoAddresses => ContactState::NoAddresses,
            ConnectFailure::UnknownHost => ContactState::UnknownHost,
            ConnectFailure::NetworkUnreachable => ContactState::NetworkUnreachable,
            ConnectFailure::AppNotRunning => ContactState::AppNotRunning,
        }
    }
}

/// A known peer.
///
/// Serializes to `{name, public_key, addresses}` plus `blocked` and
/// `last_working_address` when set, so the same document doubles as the
/// contact exchange format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub name: String,
    public_key: PublicKey,
    #[serde(default, deserialize_with = "deserialize_candidates")]
    addresses: Vec<Candidate>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub blocked: bool,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_optional_candidate"
    )]
    pub last_working_address: Option<Candidate>,
    #[serde(skip)]
    pub state: ContactState,
}

impl Contact {
    pub fn new(name: impl Into<String>, public_key: PublicKey, addresses: Vec<Candidate>) -> Self {
        Self {
            name: name.into(),
            public_key,
            addresses: dedup_candidates(addresses),
            blocked: false,
            last_working_address: None,
            state: ContactState::Unknown,
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn addresses(&self) -> &[Candidate] {
        &self.addresses
    }

    pub fn set_addresses(&mut self, addresses: Vec<Candidate>) {
        self.addresses = dedup_candidates(addresses);
    }
}

/// Equality over persisted fields; presence is ignored.
impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.public_key == other.public_key
            && self.addresses == other.addresses
            && self.blocked == other.blocked
            && self.last_working_address == other.last_working_address
    }
}

impl Eq for Contact {}

/// User settings, including the node's own identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub username: String,
    pub public_key: PublicKey,
    pub secret_key: SecretKey,
    /// Addresses this node advertises in its own contact card.
    #[serde(default, deserialize_with = "deserialize_candidates")]
    pub addresses: Vec<Candidate>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
    /// Passed to the media engine untouched.
    #[serde(default)]
    pub ice_servers: Vec<String>,
    #[serde(default)]
    pub block_unknown: bool,
    #[serde(default)]
    pub use_neighbor_table: bool,
    #[serde(default)]
    pub guess_eui64_address: bool,
    /// Outgoing calls wait for an explicit start instead of dialing at once.
    #[serde(default)]
    pub prompt_outgoing_calls: bool,
}

fn default_connect_timeout_ms() -> u64 {
    500
}

fn default_connect_retries() -> u32 {
    3
}

impl Settings {
    /// Fresh settings with a newly generated identity.
    pub fn generate(username: impl Into<String>) -> Self {
        Self::with_identity(username, &IdentityKeyPair::generate())
    }

    pub fn with_identity(username: impl Into<String>, identity: &IdentityKeyPair) -> Self {
        Self {
            username: username.into(),
            public_key: *identity.public(),
            secret_key: identity.secret().clone(),
            addresses: Vec::new(),
            connect_timeout_ms: default_connect_timeout_ms(),
            connect_retries: default_connect_retries(),
            ice_servers: Vec::new(),
            block_unknown: false,
            use_neighbor_table: false,
            guess_eui64_address: false,
            prompt_outgoing_calls: false,
        }
    }

    pub fn identity(&self) -> Result<IdentityKeyPair, peercall_crypto::CryptoError> {
        IdentityKeyPair::from_parts(self.public_key, self.secret_key.clone())
    }

    /// This node as others should store it.
    pub fn own_contact(&self) -> Contact {
        Contact::new(
            self.username.clone(),
            self.public_key,
            self.addresses.clone(),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    IncomingAccepted,
    IncomingDeclined,
    IncomingMissed,
    IncomingError,
    OutgoingAccepted,
    OutgoingDeclined,
    OutgoingMissed,
    OutgoingError,
}

/// Immutable record of how a call ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub public_key: PublicKey,
    pub kind: EventKind,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_optional_candidate"
    )]
    pub address: Option<Candidate>,
    /// Seconds since the UNIX epoch.
    pub timestamp: u64,
}

impl Event {
    pub fn new(public_key: PublicKey, kind: EventKind, address: Option<Candidate>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            id: Uuid::new_v4(),
            public_key,
            kind,
            address,
            timestamp,
        }
    }
}
