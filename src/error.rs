//! Error types for key storage operations.

use std::path::PathBuf;

use thiserror::Error;

use crate::keymaster::KeymasterError;

/// Errors surfaced by storing, retrieving or destroying a protected key.
///
/// Authenticated decryption failures are deliberately reported as the bare
/// [`Error::DecryptionFailed`] so callers cannot tell a wrong credential apart
/// from a corrupted record.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Version mismatch, expected {expected:?} got {found:?}")]
    VersionMismatch { expected: String, found: String },

    #[error("Unknown stretching type: {0}")]
    UnknownStretching(String),

    #[error("Unable to parse scrypt params: {0}")]
    InvalidScryptParams(String),

    #[error("Stretching failed: {0}")]
    Stretch(String),

    #[error("Auth token should be {expected} bytes, was {actual} bytes")]
    InvalidAuthToken { expected: usize, actual: usize },

    #[error("Wrong number of bytes in {kind}, expected {expected} got {actual}")]
    WrongSize {
        kind: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("GCM ciphertext too small: {0}")]
    CiphertextTooShort(usize),

    #[error("Random read failed: {0}")]
    Random(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed")]
    DecryptionFailed,

    #[error("GCM encryption but no nonce generated")]
    MissingNonce,

    #[error("Keymaster requested but no keymaster is available")]
    KeymasterUnavailable,

    #[error("Keymaster error: {0}")]
    Keymaster(#[from] KeymasterError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("{program} failed: {reason}")]
    Command { program: String, reason: String },

    #[cfg(feature = "tpm")]
    #[error("TPM error: {0}")]
    Tpm(#[from] tss_esapi::Error),
}

impl Error {
    /// Wraps an I/O error with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn wrong_size(kind: &'static str, expected: usize, actual: usize) -> Self {
        Self::WrongSize {
            kind,
            expected,
            actual,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Fails with [`Error::WrongSize`] unless `actual == expected`.
pub(crate) fn check_size(kind: &'static str, actual: usize, expected: usize) -> Result<()> {
    if actual != expected {
        tracing::error!(
            "Wrong number of bytes in {}, expected {} got {}",
            kind,
            expected,
            actual
        );
        return Err(Error::wrong_size(kind, expected, actual));
    }
    Ok(())
}
