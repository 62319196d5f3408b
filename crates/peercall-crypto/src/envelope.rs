//! Authenticated public-key encryption of single signaling messages.
//!
//! Both identity keys are converted to X25519 and combined with a
//! static-static Diffie-Hellman. The shared secret goes through HKDF-SHA256,
//! bound to both public keys, and keys an AES-256-GCM seal. Only the holder
//! of the sender's secret key and the holder of the recipient's secret key
//! can compute that key, so a successful open proves who sealed it.
//!
//! Wire format:
//!   [ version (1) | sender public key (32) | nonce (12) | ciphertext + tag (16) ]
//!
//! The version byte and both public keys are authenticated as AAD.

use hkdf::Hkdf;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::identity::{PublicKey, SecretKey, KEY_LEN};

pub const ENVELOPE_VERSION: u8 = 0x01;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const HEADER_LEN: usize = 1 + KEY_LEN + NONCE_LEN; // 45 bytes
const KDF_INFO: &[u8] = b"peercall envelope v1";

/// A successfully opened envelope.
///
/// `sender` is whoever sealed it. Callers must still check it against the
/// contact they expect with [`Opened::is_from`].
#[derive(Debug)]
pub struct Opened {
    pub plaintext: Zeroizing<Vec<u8>>,
    pub sender: PublicKey,
}

impl Opened {
    pub fn is_from(&self, expected: &PublicKey) -> bool {
        self.sender.ct_eq(expected)
    }
}

fn aad_bytes(sender: &PublicKey, recipient: &PublicKey) -> [u8; 1 + 2 * KEY_LEN] {
    let mut aad = [0u8; 1 + 2 * KEY_LEN];
    aad[0] = ENVELOPE_VERSION;
    aad[1..1 + KEY_LEN].copy_from_slice(sender.as_bytes());
    aad[1 + KEY_LEN..].copy_from_slice(recipient.as_bytes());
    aad
}

/// Derive the AES-256-GCM key shared by `sender` and `recipient`.
fn derive_key(
    own_secret: &SecretKey,
    peer_public: &PublicKey,
    sender: &PublicKey,
    recipient: &PublicKey,
) -> Result<LessSafeKey, CryptoError> {
    let peer = peer_public.to_x25519()?;
    let shared = own_secret.to_x25519().diffie_hellman(&peer);
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidKey("low-order public key".into()));
    }

    let mut info = Vec::with_capacity(KDF_INFO.len() + 2 * KEY_LEN);
    info.extend_from_slice(KDF_INFO);
    info.extend_from_slice(sender.as_bytes());
    info.extend_from_slice(recipient.as_bytes());

    let mut key_bytes = Zeroizing::new([0u8; 32]);
    Hkdf::<Sha256>::new(None, shared.as_bytes())
        .expand(&info, &mut key_bytes[..])
        .map_err(|_| CryptoError::InvalidKey("HKDF output length".into()))?;

    let unbound = UnboundKey::new(&AES_256_GCM, &key_bytes[..])
        .map_err(|_| CryptoError::InvalidKey("AES-256-GCM key length".into()))?;
    Ok(LessSafeKey::new(unbound))
}

/// Seal `plaintext` for `recipient`, embedding `own_public` as the sender.
pub fn encrypt(
    plaintext: &[u8],
    recipient: &PublicKey,
    own_public: &PublicKey,
    own_secret: &SecretKey,
) -> Result<Vec<u8>, CryptoError> {
    if !own_secret.public_key().ct_eq(own_public) {
        return Err(CryptoError::InvalidKey(
            "own public key does not match secret key".into(),
        ));
    }

    let key = derive_key(own_secret, recipient, own_public, recipient)?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    SystemRandom::new()
        .fill(&mut nonce_bytes)
        .map_err(|_| CryptoError::Rng)?;

    let mut in_out = plaintext.to_vec();
    key.seal_in_place_append_tag(
        Nonce::assume_unique_for_key(nonce_bytes),
        Aad::from(aad_bytes(own_public, recipient)),
        &mut in_out,
    )
    .map_err(|_| CryptoError::Encrypt)?;

    let mut out = Vec::with_capacity(HEADER_LEN + in_out.len());
    out.push(ENVELOPE_VERSION);
    out.extend_from_slice(own_public.as_bytes());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&in_out);
    Ok(out)
}

/// Open an envelope addressed to `own_public`.
///
/// Any failure (short input, unknown version, invalid sender key, wrong
/// recipient, tampering) is reported as [`CryptoError::Decrypt`] and no
/// plaintext is returned.
pub fn decrypt(
    envelope: &[u8],
    own_public: &PublicKey,
    own_secret: &SecretKey,
) -> Result<Opened, CryptoError> {
    if envelope.len() < HEADER_LEN + TAG_LEN || envelope[0] != ENVELOPE_VERSION {
        return Err(CryptoError::Decrypt);
    }

    let sender =
        PublicKey::from_bytes(&envelope[1..1 + KEY_LEN]).map_err(|_| CryptoError::Decrypt)?;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    nonce_bytes.copy_from_slice(&envelope[1 + KEY_LEN..HEADER_LEN]);

    let key =
        derive_key(own_secret, &sender, &sender, own_public).map_err(|_| CryptoError::Decrypt)?;

    let mut buffer = Zeroizing::new(envelope[HEADER_LEN..].to_vec());
    let plain_len = key
        .open_in_place(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::from(aad_bytes(&sender, own_public)),
            &mut buffer,
        )
        .map_err(|_| CryptoError::Decrypt)?
        .len();
    buffer.truncate(plain_len);

    Ok(Opened {
        plaintext: buffer,
        sender,
    })
}
