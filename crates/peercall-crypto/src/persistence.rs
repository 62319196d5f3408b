//! Password-based sealing of the local database.
//!
//! PBKDF2-HMAC-SHA256 stretches the password into an AES-256-GCM key. The
//! salt and iteration count travel in the header so a database written with
//! one work factor can still be opened after the default changes.
//!
//! File format:
//!   [PCDB magic(4)] [version(1)] [iterations(4)] [salt(32)] [nonce(12)] [length(4)] [payload + tag(16)]

use std::num::NonZeroU32;

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use zeroize::Zeroizing;

use crate::error::CryptoError;

const MAGIC: &[u8; 4] = b"PCDB";
const VERSION: u8 = 0x01;
const SALT_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const ITER_OFFSET: usize = 5;
const SALT_OFFSET: usize = ITER_OFFSET + 4;
const NONCE_OFFSET: usize = SALT_OFFSET + SALT_LEN;
const LEN_OFFSET: usize = NONCE_OFFSET + NONCE_LEN;
const HEADER_LEN: usize = LEN_OFFSET + 4; // 57 bytes

pub const DEFAULT_PBKDF2_ITERATIONS: u32 = 600_000;
/// Headers claiming more work than this are treated as corrupt.
const MAX_PBKDF2_ITERATIONS: u32 = 10_000_000;

/// A derived database key together with the parameters it was derived from.
///
/// Held by the database owner so saves don't re-run PBKDF2.
pub struct SealingKey {
    key: LessSafeKey,
    salt: [u8; SALT_LEN],
    iterations: u32,
}

impl SealingKey {
    pub fn derive(password: &str, salt: [u8; SALT_LEN], iterations: u32) -> Result<Self, CryptoError> {
        let rounds = NonZeroU32::new(iterations)
            .filter(|n| n.get() <= MAX_PBKDF2_ITERATIONS)
            .ok_or(CryptoError::InvalidFormat("iteration count out of range"))?;

        let mut key_bytes = Zeroizing::new([0u8; 32]);
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            rounds,
            &salt,
            password.as_bytes(),
            &mut key_bytes[..],
        );
        let unbound = UnboundKey::new(&AES_256_GCM, &key_bytes[..])
            .map_err(|_| CryptoError::InvalidKey("AES-256-GCM key length".into()))?;

        Ok(Self {
            key: LessSafeKey::new(unbound),
            salt,
            iterations,
        })
    }

    /// Derive with a fresh random salt.
    pub fn generate(password: &str, iterations: u32) -> Result<Self, CryptoError> {
        Self::derive(password, generate_salt()?, iterations)
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }
}

impl std::fmt::Debug for SealingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealingKey")
            .field("iterations", &self.iterations)
            .finish_non_exhaustive()
    }
}

pub fn generate_salt() -> Result<[u8; SALT_LEN], CryptoError> {
    let mut salt = [0u8; SALT_LEN];
    SystemRandom::new()
        .fill(&mut salt)
        .map_err(|_| CryptoError::Rng)?;
    Ok(salt)
}

fn aad_bytes() -> [u8; 5] {
    let mut aad = [0u8; 5];
    aad[..4].copy_from_slice(MAGIC);
    aad[4] = VERSION;
    aad
}

/// Seal `plaintext` under an already derived key.
pub fn seal_with_key(plaintext: &[u8], key: &SealingKey) -> Result<Vec<u8>, CryptoError> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    SystemRandom::new()
        .fill(&mut nonce_bytes)
        .map_err(|_| CryptoError::Rng)?;

    let mut in_out = plaintext.to_vec();
    key.key
        .seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::from(aad_bytes()),
            &mut in_out,
        )
        .map_err(|_| CryptoError::Encrypt)?;

    let payload_len =
        u32::try_from(in_out.len()).map_err(|_| CryptoError::InvalidFormat("payload too large"))?;

    let mut file_data = Vec::with_capacity(HEADER_LEN + in_out.len());
    file_data.extend_from_slice(MAGIC);
    file_data.push(VERSION);
    file_data.extend_from_slice(&key.iterations.to_be_bytes());
    file_data.extend_from_slice(&key.salt);
    file_data.extend_from_slice(&nonce_bytes);
    file_data.extend_from_slice(&payload_len.to_be_bytes());
    file_data.extend_from_slice(&in_out);
    Ok(file_data)
}

/// Seal `plaintext` with a key freshly derived from `password`.
pub fn seal(plaintext: &[u8], password: &str, iterations: u32) -> Result<Vec<u8>, CryptoError> {
    let key = SealingKey::generate(password, iterations)?;
    seal_with_key(plaintext, &key)
}

struct Header {
    iterations: u32,
    salt: [u8; SALT_LEN],
    nonce: [u8; NONCE_LEN],
    payload_len: usize,
}

fn parse_header(file_data: &[u8]) -> Result<Header, CryptoError> {
    if file_data.len() < HEADER_LEN {
        return Err(CryptoError::InvalidFormat("file too short"));
    }
    if &file_data[0..4] != MAGIC {
        return Err(CryptoError::InvalidFormat("missing PCDB header"));
    }
    if file_data[4] != VERSION {
        return Err(CryptoError::InvalidFormat("unsupported version"));
    }

    let mut iter_bytes = [0u8; 4];
    iter_bytes.copy_from_slice(&file_data[ITER_OFFSET..SALT_OFFSET]);
    let mut salt = [0u8; SALT_LEN];
    salt.copy_from_slice(&file_data[SALT_OFFSET..NONCE_OFFSET]);
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&file_data[NONCE_OFFSET..LEN_OFFSET]);
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&file_data[LEN_OFFSET..HEADER_LEN]);
    let payload_len = u32::from_be_bytes(len_bytes) as usize;

    if payload_len < TAG_LEN || file_data.len() < HEADER_LEN + payload_len {
        return Err(CryptoError::InvalidFormat("file truncated"));
    }

    Ok(Header {
        iterations: u32::from_be_bytes(iter_bytes),
        salt,
        nonce,
        payload_len,
    })
}

/// Open a sealed blob, returning the plaintext and the key it was sealed
/// with so later saves can reuse it.
pub fn open(
    file_data: &[u8],
    password: &str,
) -> Result<(Zeroizing<Vec<u8>>, SealingKey), CryptoError> {
    let header = parse_header(file_data)?;
    tracing::debug!(iterations = header.iterations, "deriving database key");
    let key = SealingKey::derive(password, header.salt, header.iterations)?;

    let mut buffer =
        Zeroizing::new(file_data[HEADER_LEN..HEADER_LEN + header.payload_len].to_vec());
    let plain_len = key
        .key
        .open_in_place(
            Nonce::assume_unique_for_key(header.nonce),
            Aad::from(aad_bytes()),
            &mut buffer,
        )
        .map_err(|_| CryptoError::Unseal)?
        .len();
    buffer.truncate(plain_len);

    Ok((buffer, key))
}

/// Check if file data starts with a valid PCDB header.
pub fn has_valid_header(file_data: &[u8]) -> bool {
    parse_header(file_data).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const FAST: u32 = 1_000;

    #[test]
    fn seal_open_roundtrip() {
        let sealed = seal(b"{\"contacts\":[]}", "hunter2", FAST).unwrap();
        assert!(has_valid_header(&sealed));

        let (plain, key) = open(&sealed, "hunter2").unwrap();
        assert_eq!(plain.as_slice(), b"{\"contacts\":[]}");
        assert_eq!(key.iterations(), FAST);
    }

    #[test]
    fn wrong_password_is_unseal_error() {
        let sealed = seal(b"data", "right", FAST).unwrap();
        assert!(matches!(open(&sealed, "wrong"), Err(CryptoError::Unseal)));
    }

    #[test]
    fn reopened_key_reseals_compatibly() {
        let sealed = seal(b"v1", "pw", FAST).unwrap();
        let (_, key) = open(&sealed, "pw").unwrap();

        let resealed = seal_with_key(b"v2", &key).unwrap();
        assert_ne!(sealed[NONCE_OFFSET..LEN_OFFSET], resealed[NONCE_OFFSET..LEN_OFFSET]);
        let (plain, _) = open(&resealed, "pw").unwrap();
        assert_eq!(plain.as_slice(), b"v2");
    }

    #[test]
    fn empty_password_is_still_sealed() {
        let sealed = seal(b"plain", "", FAST).unwrap();
        assert!(!sealed.windows(5).any(|w| w == b"plain"));
        assert_eq!(open(&sealed, "").unwrap().0.as_slice(), b"plain");
        assert!(open(&sealed, "x").is_err());
    }

    #[test]
    fn bad_headers_rejected() {
        assert!(!has_valid_header(b"nope"));
        assert!(matches!(open(b"short", "pw"), Err(CryptoError::InvalidFormat(_))));

        let mut sealed = seal(b"data", "pw", FAST).unwrap();
        sealed[0] = b'X';
        assert!(matches!(open(&sealed, "pw"), Err(CryptoError::InvalidFormat(_))));

        let sealed = seal(b"data", "pw", FAST).unwrap();
        assert!(matches!(
            open(&sealed[..sealed.len() - 1], "pw"),
            Err(CryptoError::InvalidFormat(_))
        ));
    }

    #[test]
    fn absurd_iteration_count_rejected() {
        let mut sealed = seal(b"data", "pw", FAST).unwrap();
        sealed[ITER_OFFSET..SALT_OFFSET].copy_from_slice(&0u32.to_be_bytes());
        assert!(matches!(open(&sealed, "pw"), Err(CryptoError::InvalidFormat(_))));

        sealed[ITER_OFFSET..SALT_OFFSET].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(open(&sealed, "pw"), Err(CryptoError::InvalidFormat(_))));
    }

    #[test]
    fn tampered_payload_fails() {
        let mut sealed = seal(b"data", "pw", FAST).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;
        assert!(matches!(open(&sealed, "pw"), Err(CryptoError::Unseal)));
    }
}
