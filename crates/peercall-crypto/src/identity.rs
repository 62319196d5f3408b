//! Identity key generation and serialization.
//!
//! Every peer has one long-term Ed25519 identity key pair, generated on first
//! launch and kept in the encrypted store. The 32-byte public key is the
//! peer's address book identity. For envelope encryption both halves are
//! mapped onto Curve25519 (see [`crate::envelope`]).

use std::fmt;
use std::str::FromStr;

use curve25519_dalek::edwards::CompressedEdwardsY;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha512};
use subtle::ConstantTimeEq;
use x25519_dalek::StaticSecret;
use zeroize::{Zeroize, Zeroizing};

use crate::error::CryptoError;

pub const KEY_LEN: usize = 32;

/// 32-byte Ed25519 public key, lowercase hex in documents.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; KEY_LEN]);

impl PublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!(
                "public key must be {KEY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| CryptoError::InvalidKey(format!("public key is not hex: {e}")))?;
        Self::from_bytes(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First eight hex digits, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Constant-time equality.
    pub fn ct_eq(&self, other: &PublicKey) -> bool {
        self.0[..].ct_eq(&other.0[..]).into()
    }

    /// Map the Edwards point onto its Montgomery form for X25519.
    pub(crate) fn to_x25519(self) -> Result<x25519_dalek::PublicKey, CryptoError> {
        let point = CompressedEdwardsY(self.0)
            .decompress()
            .ok_or_else(|| CryptoError::InvalidKey("not a valid Ed25519 point".into()))?;
        Ok(x25519_dalek::PublicKey::from(point.to_montgomery().to_bytes()))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}…)", self.short())
    }
}

impl FromStr for PublicKey {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(de::Error::custom)
    }
}

/// 32-byte Ed25519 seed. Zeroized on drop, never printed.
#[derive(Clone)]
pub struct SecretKey(Zeroizing<[u8; KEY_LEN]>);

impl SecretKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != KEY_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "secret key must be {KEY_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let mut arr = Zeroizing::new([0u8; KEY_LEN]);
        arr.copy_from_slice(bytes);
        Ok(Self(arr))
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = Zeroizing::new(
            hex::decode(s.trim())
                .map_err(|_| CryptoError::InvalidKey("secret key is not hex".into()))?,
        );
        Self::from_bytes(&bytes)
    }

    pub fn to_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(&self.0[..]))
    }

    /// Public half of this key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(SigningKey::from_bytes(&self.0).verifying_key().to_bytes())
    }

    /// X25519 scalar derived from the Ed25519 seed (RFC 8032 expansion,
    /// clamped per RFC 7748).
    pub(crate) fn to_x25519(&self) -> StaticSecret {
        let mut h = Sha512::digest(&self.0[..]);
        h[0] &= 248;
        h[31] &= 127;
        h[31] |= 64;
        let mut scalar = [0u8; KEY_LEN];
        scalar.copy_from_slice(&h[..KEY_LEN]);
        h.as_mut_slice().zeroize();
        let secret = StaticSecret::from(scalar);
        scalar.zeroize();
        secret
    }
}

impl PartialEq for SecretKey {
    fn eq(&self, other: &Self) -> bool {
        self.0[..].ct_eq(&other.0[..]).into()
    }
}

impl Eq for SecretKey {}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(<redacted>)")
    }
}

impl Serialize for SecretKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for SecretKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = Zeroizing::new(String::deserialize(deserializer)?);
        Self::from_hex(&s).map_err(de::Error::custom)
    }
}

/// A peer's long-term identity.
#[derive(Clone, PartialEq, Eq)]
pub struct IdentityKeyPair {
    public: PublicKey,
    secret: SecretKey,
}

impl IdentityKeyPair {
    /// Generate a fresh identity key pair.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let secret = SecretKey(Zeroizing::new(signing_key.to_bytes()));
        let public = PublicKey(signing_key.verifying_key().to_bytes());
        Self { public, secret }
    }

    pub fn from_secret(secret: SecretKey) -> Self {
        Self {
            public: secret.public_key(),
            secret,
        }
    }

    /// Rebuild from stored halves, rejecting a public key that does not
    /// belong to the secret.
    pub fn from_parts(public: PublicKey, secret: SecretKey) -> Result<Self, CryptoError> {
        if !secret.public_key().ct_eq(&public) {
            return Err(CryptoError::InvalidKey(
                "public key does not match secret key".into(),
            ));
        }
        Ok(Self { public, secret })
    }

    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    pub fn secret(&self) -> &SecretKey {
        &self.secret
    }
}

impl fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}
