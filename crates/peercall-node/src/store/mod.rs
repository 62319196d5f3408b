//! The encrypted local database: settings, contacts and the call log.
//!
//! The whole aggregate is serialized to one JSON document and sealed as a
//! single blob (see [`peercall_crypto::persistence`]). Mutation goes through
//! [`StoreOwner`], the only writer.

mod model;
mod owner;

pub use model::{Contact, ContactState, Event, EventKind, Settings};
pub use owner::StoreOwner;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use peercall_crypto::persistence::{self, SealingKey};
use peercall_crypto::{CryptoError, PublicKey};

#[derive(Debug, Error)]
pub enum StoreError {
    /// No database exists yet; the caller should run first-time setup.
    #[error("no database at this location")]
    NotFound,

    #[error("wrong password or corrupted database")]
    Decrypt,

    #[error("invalid database: {0}")]
    Format(String),

    #[error("contact {0} not found")]
    UnknownContact(String),

    #[error("settings hold an invalid identity: {0}")]
    Identity(#[source] CryptoError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CryptoError> for StoreError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::Unseal => StoreError::Decrypt,
            other => StoreError::Format(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Store {
    pub settings: Settings,
    #[serde(default)]
    pub contacts: Vec<Contact>,
    #[serde(default)]
    pub events: Vec<Event>,
}

impl Store {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            contacts: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn contact(&self, key: &PublicKey) -> Option<&Contact> {
        self.contacts.iter().find(|c| c.public_key() == key)
    }

    pub fn contact_mut(&mut self, key: &PublicKey) -> Option<&mut Contact> {
        self.contacts.iter_mut().find(|c| c.public_key() == key)
    }

    /// Add a contact. A contact with the same key already present wins.
    pub fn add_contact(&mut self, contact: Contact) -> bool {
        if self.contact(contact.public_key()).is_some() {
            return false;
        }
        self.contacts.push(contact);
        true
    }

    pub fn delete_contact(&mut self, key: &PublicKey) -> bool {
        let before = self.contacts.len();
        self.contacts.retain(|c| c.public_key() != key);
        self.contacts.len() != before
    }

    /// Append an event unless one with the same id is already logged.
    pub fn add_event(&mut self, event: Event) -> bool {
        if self.events.iter().any(|e| e.id == event.id) {
            return false;
        }
        self.events.push(event);
        true
    }

    /// Fold a restored backup into this store: settings are replaced,
    /// contacts and events are unioned (existing entries win).
    pub fn merge(&mut self, incoming: Store) {
        self.settings = incoming.settings;
        for contact in incoming.contacts {
            self.add_contact(contact);
        }
        for event in incoming.events {
            self.add_event(event);
        }
        self.events.sort_by_key(|e| e.timestamp);
    }

    /// Seal under `password` with a fresh salt.
    pub fn save(&self, password: &str, iterations: u32) -> Result<Vec<u8>, StoreError> {
        let key = SealingKey::generate(password, iterations)?;
        self.seal(&key)
    }

    /// Seal under an already derived key.
    pub fn seal(&self, key: &SealingKey) -> Result<Vec<u8>, StoreError> {
        let json = zeroize::Zeroizing::new(
            serde_json::to_vec(self).map_err(|e| StoreError::Format(e.to_string()))?,
        );
        Ok(persistence::seal_with_key(&json, key)?)
    }

    pub fn load(data: &[u8], password: &str) -> Result<Self, StoreError> {
        Self::open(data, password).map(|(store, _)| store)
    }

    /// Open a sealed blob, also returning the key for later saves.
    pub fn open(data: &[u8], password: &str) -> Result<(Self, SealingKey), StoreError> {
        let (json, key) = persistence::open(data, password)?;
        let store: Store =
            serde_json::from_slice(&json).map_err(|e| StoreError::Format(e.to_string()))?;
        store.settings.identity().map_err(StoreError::Identity)?;
        Ok((store, key))
    }
}
