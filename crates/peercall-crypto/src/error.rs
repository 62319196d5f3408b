use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("encryption failed")]
    Encrypt,

    /// Every malformed, tampered or misaddressed envelope ends up here.
    #[error("envelope could not be decrypted")]
    Decrypt,

    #[error("random number generator failed")]
    Rng,

    #[error("invalid sealed data: {0}")]
    InvalidFormat(&'static str),

    #[error("incorrect password or corrupted data")]
    Unseal,
}
