//! Peercall cryptographic layer.
//!
//! This crate provides:
//! - Ed25519 identity keys and their hex/serde representation
//! - Authenticated public-key envelopes for signaling messages
//! - Password-based sealing of the local database

pub mod envelope;
pub mod error;
pub mod identity;
pub mod persistence;

pub use envelope::{decrypt, encrypt, Opened};
pub use error::CryptoError;
pub use identity::{IdentityKeyPair, PublicKey, SecretKey};
pub use persistence::{SealingKey, DEFAULT_PBKDF2_ITERATIONS};
