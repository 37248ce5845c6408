use thiserror::Error;

/// Everything the vault engine can fail with.
///
/// `NotFound` covers absent, expired and already-consumed
/// handles alike.
#[derive(Debug, Error)]
pub enum VaultError {
    /// The caller supplied neither a text nor a file payload, or the
    /// payload was malformed.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("secret not found or expired")]
    NotFound,

    /// Wrong or missing password. The record is left in place.
    #[error("password required or incorrect")]
    Forbidden,

    /// Authentication tag did not verify (tampered ciphertext or wrong key).
    #[error("ciphertext failed integrity check")]
    IntegrityError,

    /// Backend I/O failed or timed out. Retryable, never reported as `NotFound`.
    #[error("storage failure: {0}")]
    StorageFailure(String),

    /// Missing or malformed server key material. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),
}

impl VaultError {
    pub(crate) fn storage(e: impl std::fmt::Display) -> Self {
        VaultError::StorageFailure(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, VaultError>;
