use std::io;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::{debug, info};
use zeroize::Zeroizing;

use peercall_crypto::persistence::SealingKey;
use peercall_crypto::{PublicKey, DEFAULT_PBKDF2_ITERATIONS};

use super::{Contact, ContactState, Event, Settings, Store, StoreError};
use crate::address::Candidate;
use crate::notify::{NodeEvent, Notifier};

/// Sole owner of the open database.
///
/// Every persistent mutation is applied to a copy, sealed and written
/// atomically, and only then made visible. A failed write leaves both the
/// file and the in-memory store untouched.
pub struct StoreOwner {
    path: PathBuf,
    key: SealingKey,
    store: Mutex<Store>,
    notifier: Notifier,
}

impl StoreOwner {
    /// Open an existing database. A missing file is [`StoreError::NotFound`].
    pub async fn open(
        path: impl Into<PathBuf>,
        password: &str,
        notifier: Notifier,
    ) -> Result<Self, StoreError> {
        let path = path.into();
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(StoreError::NotFound),
            Err(e) => return Err(e.into()),
        };

        let password = Zeroizing::new(password.to_string());
        let (store, key) = tokio::task::spawn_blocking(move || Store::open(&data, &password))
            .await
            .map_err(|e| StoreError::Io(io::Error::other(e)))??;

        info!(path = %path.display(), contacts = store.contacts.len(), "database opened");
        Ok(Self {
            path,
            key,
            store: Mutex::new(store),
            notifier,
        })
    }

    /// Create a new database. Refuses to overwrite an existing file.
    pub async fn create(
        path: impl Into<PathBuf>,
        password: &str,
        settings: Settings,
        notifier: Notifier,
    ) -> Result<Self, StoreError> {
        Self::create_with_iterations(path, password, settings, notifier, DEFAULT_PBKDF2_ITERATIONS)
            .await
    }

    pub async fn create_with_iterations(
        path: impl Into<PathBuf>,
        password: &str,
        settings: Settings,
        notifier: Notifier,
        iterations: u32,
    ) -> Result<Self, StoreError> {
        let path = path.into();
        if tokio::fs::try_exists(&path).await? {
            return Err(StoreError::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} already exists", path.display()),
            )));
        }
        settings.identity().map_err(StoreError::Identity)?;

        let password = Zeroizing::new(password.to_string());
        let key = tokio::task::spawn_blocking(move || SealingKey::generate(&password, iterations))
            .await
            .map_err(|e| StoreError::Io(io::Error::other(e)))??;

        let store = Store::new(settings);
        write_atomic(&path, &store.seal(&key)?).await?;
        info!(path = %path.display(), "database created");

        Ok(Self {
            path,
            key,
            store: Mutex::new(store),
            notifier,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub async fn snapshot(&self) -> Store {
        self.store.lock().await.clone()
    }

    pub async fn settings(&self) -> Settings {
        self.store.lock().await.settings.clone()
    }

    pub async fn contacts(&self) -> Vec<Contact> {
        self.store.lock().await.contacts.clone()
    }

    pub async fn contact(&self, key: &PublicKey) -> Option<Contact> {
        self.store.lock().await.contact(key).cloned()
    }

    pub async fn events(&self) -> Vec<Event> {
        self.store.lock().await.events.clone()
    }

    async fn mutate<R>(&self, f: impl FnOnce(&mut Store) -> R) -> Result<R, StoreError> {
        let mut store = self.store.lock().await;
        let mut updated = store.clone();
        let out = f(&mut updated);
        write_atomic(&self.path, &updated.seal(&self.key)?).await?;
        *store = updated;
        Ok(out)
    }

    /// Returns false if a contact with this key already exists.
    pub async fn add_contact(&self, contact: Contact) -> Result<bool, StoreError> {
        let added = self.mutate(|s| s.add_contact(contact)).await?;
        if added {
            self.notifier.notify(NodeEvent::ContactsRefreshed);
        }
        Ok(added)
    }

    pub async fn delete_contact(&self, key: &PublicKey) -> Result<(), StoreError> {
        if !self.mutate(|s| s.delete_contact(key)).await? {
            return Err(StoreError::UnknownContact(key.short()));
        }
        self.notifier.notify(NodeEvent::ContactsRefreshed);
        Ok(())
    }

    pub async fn set_blocked(&self, key: &PublicKey, blocked: bool) -> Result<(), StoreError> {
        let found = self
            .mutate(|s| s.contact_mut(key).map(|c| c.blocked = blocked).is_some())
            .await?;
        if !found {
            return Err(StoreError::UnknownContact(key.short()));
        }
        self.notifier.notify(NodeEvent::ContactsRefreshed);
        Ok(())
    }

    /// Update volatile presence. Not persisted and not announced; callers
    /// batch their own refresh notification.
    pub async fn set_state(&self, key: &PublicKey, state: ContactState) -> bool {
        match self.store.lock().await.contact_mut(key) {
            Some(contact) => {
                contact.state = state;
                true
            }
            None => false,
        }
    }

    pub async fn set_all_states(&self, keys: &[PublicKey], state: ContactState) {
        let mut store = self.store.lock().await;
        for key in keys {
            if let Some(contact) = store.contact_mut(key) {
                contact.state = state;
            }
        }
    }

    /// Remember the address an authenticated exchange just succeeded on.
    pub async fn update_last_working_address(
        &self,
        key: &PublicKey,
        address: Candidate,
    ) -> Result<(), StoreError> {
        {
            let store = self.store.lock().await;
            match store.contact(key) {
                Some(c) if c.last_working_address.as_ref() == Some(&address) => return Ok(()),
                Some(_) => {}
                None => return Ok(()),
            }
        }
        debug!(contact = %key.short(), %address, "updating last working address");
        self.mutate(|s| {
            if let Some(c) = s.contact_mut(key) {
                c.last_working_address = Some(address);
            }
        })
        .await
    }

    pub async fn add_event(&self, event: Event) -> Result<(), StoreError> {
        if self.mutate(|s| s.add_event(event)).await? {
            self.notifier.notify(NodeEvent::EventsRefreshed);
        }
        Ok(())
    }

    pub async fn clear_events(&self) -> Result<(), StoreError> {
        self.mutate(|s| s.events.clear()).await?;
        self.notifier.notify(NodeEvent::EventsRefreshed);
        Ok(())
    }

    /// Change settings. The identity cannot be replaced this way.
    pub async fn update_settings(&self, f: impl FnOnce(&mut Settings)) -> Result<(), StoreError> {
        self.mutate(|s| {
            let public_key = s.settings.public_key;
            let secret_key = s.settings.secret_key.clone();
            f(&mut s.settings);
            s.settings.public_key = public_key;
            s.settings.secret_key = secret_key;
        })
        .await
    }

    pub async fn merge(&self, incoming: Store) -> Result<(), StoreError> {
        incoming.settings.identity().map_err(StoreError::Identity)?;
        self.mutate(|s| s.merge(incoming)).await?;
        self.notifier.notify(NodeEvent::ContactsRefreshed);
        self.notifier.notify(NodeEvent::EventsRefreshed);
        Ok(())
    }

    /// Encrypted backup of the current database, openable with the same
    /// password wherever it is stored.
    pub async fn export(&self) -> Result<Vec<u8>, StoreError> {
        self.store.lock().await.seal(&self.key)
    }

    /// Restore a backup produced by [`StoreOwner::export`] and merge it in.
    pub async fn import(&self, data: Vec<u8>, password: &str) -> Result<(), StoreError> {
        let password = Zeroizing::new(password.to_string());
        let incoming = tokio::task::spawn_blocking(move || Store::load(&data, &password))
            .await
            .map_err(|e| StoreError::Io(io::Error::other(e)))??;
        self.merge(incoming).await
    }
}

async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), StoreError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
