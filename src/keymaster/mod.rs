//! The hardware key-management capability.
//!
//! A [`Keymaster`] generates keys that never leave it, hands back opaque key
//! blobs, and runs cipher operations through a begin/update/finish lifecycle.
//! It is injected into [`crate::KeyStorage`] so deployments can plug in a real
//! trusted execution environment while tests and TEE-less devices use
//! [`soft::SoftKeymaster`].

pub mod params;
pub mod soft;

use thiserror::Error;
use tracing::{debug, error};

pub use params::{
    Algorithm, AuthorizationSet, BlockMode, HardwareAuthenticatorType, KeyParameter, KeyPurpose,
    PaddingMode,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeymasterError {
    /// The blob was produced by an older keymaster version and must be upgraded.
    #[error("key requires upgrade")]
    KeyRequiresUpgrade,
    #[error("invalid key blob")]
    InvalidKeyBlob,
    #[error("unsupported key parameter: {0}")]
    UnsupportedParameter(String),
    #[error("incompatible parameter: {0}")]
    IncompatibleParameter(String),
    #[error("invalid nonce")]
    InvalidNonce,
    #[error("key user not authenticated")]
    KeyUserNotAuthenticated,
    #[error("verification failed")]
    VerificationFailed,
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("keymaster unavailable: {0}")]
    Unavailable(String),
}

pub type KeymasterResult<T> = std::result::Result<T, KeymasterError>;

/// One in-flight cipher operation inside the keymaster.
pub trait Operation: Send {
    /// Feeds `input`; returns how many bytes were consumed and any output.
    fn update(&mut self, input: &[u8]) -> KeymasterResult<(usize, Vec<u8>)>;
    /// Completes the operation, returning trailing output (the GCM tag when
    /// encrypting).
    fn finish(&mut self) -> KeymasterResult<Vec<u8>>;
    /// Releases keymaster-side state without completing.
    fn abort(&mut self);
}

/// The key-management service.
pub trait Keymaster: Send + Sync {
    /// Generates a key bound to `params` and returns its opaque blob.
    fn generate_key(&self, params: &AuthorizationSet) -> KeymasterResult<Vec<u8>>;

    /// Opens an operation on `key_blob`. Output parameters, such as a
    /// keymaster-generated nonce, are returned alongside the handle.
    fn begin(
        &self,
        purpose: KeyPurpose,
        key_blob: &[u8],
        params: &AuthorizationSet,
    ) -> KeymasterResult<(Box<dyn Operation>, AuthorizationSet)>;

    /// Re-encodes an obsolete key blob in the current format.
    fn upgrade_key(&self, key_blob: &[u8], params: &AuthorizationSet) -> KeymasterResult<Vec<u8>>;

    /// Invalidates the key behind `key_blob`.
    fn delete_key(&self, key_blob: &[u8]) -> KeymasterResult<()>;
}

/// A begun operation, aborted on drop unless it was finished.
pub struct KeymasterOperation {
    op: Option<Box<dyn Operation>>,
}

impl KeymasterOperation {
    pub fn new(op: Box<dyn Operation>) -> Self {
        Self { op: Some(op) }
    }

    fn op(&mut self) -> KeymasterResult<&mut Box<dyn Operation>> {
        self.op
            .as_mut()
            .ok_or_else(|| KeymasterError::InvalidOperation("operation already closed".into()))
    }

    /// Feeds all of `input` through the operation, appending output to `output`.
    pub fn update_completely(&mut self, input: &[u8], output: &mut Vec<u8>) -> KeymasterResult<()> {
        let op = self.op()?;
        let mut remaining = input;
        while !remaining.is_empty() {
            let (consumed, produced) = op.update(remaining).inspect_err(|e| {
                error!("update failed: {}", e);
            })?;
            output.extend_from_slice(&produced);
            if consumed == 0 || consumed > remaining.len() {
                error!(
                    "update consumed {} of {} remaining bytes",
                    consumed,
                    remaining.len()
                );
                return Err(KeymasterError::InvalidOperation(
                    "update made no progress".into(),
                ));
            }
            remaining = &remaining[consumed..];
        }
        Ok(())
    }

    /// Finishes the operation and returns its trailing output.
    pub fn finish(mut self) -> KeymasterResult<Vec<u8>> {
        let mut op = self
            .op
            .take()
            .ok_or_else(|| KeymasterError::InvalidOperation("operation already closed".into()))?;
        op.finish().inspect_err(|e| {
            error!("finish failed: {}", e);
            op.abort();
        })
    }
}

impl Drop for KeymasterOperation {
    fn drop(&mut self) {
        if let Some(mut op) = self.op.take() {
            debug!("Aborting unfinished keymaster operation");
            op.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    /// Consumes at most `chunk` bytes per update and echoes them back.
    struct Echo {
        chunk: usize,
        aborts: Arc<AtomicUsize>,
    }

    impl Operation for Echo {
        fn update(&mut self, input: &[u8]) -> KeymasterResult<(usize, Vec<u8>)> {
            let n = self.chunk.min(input.len());
            Ok((n, input[..n].to_vec()))
        }

        fn finish(&mut self) -> KeymasterResult<Vec<u8>> {
            Ok(b"done".to_vec())
        }

        fn abort(&mut self) {
            self.aborts.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn echo(chunk: usize) -> (KeymasterOperation, Arc<AtomicUsize>) {
        let aborts = Arc::new(AtomicUsize::new(0));
        let op = KeymasterOperation::new(Box::new(Echo {
            chunk,
            aborts: aborts.clone(),
        }));
        (op, aborts)
    }

    #[test]
    fn update_completely_loops_over_partial_consumption() {
        let (mut op, aborts) = echo(3);
        let mut out = Vec::new();
        op.update_completely(b"hello world", &mut out).unwrap();
        assert_eq!(out, b"hello world");
        assert_eq!(op.finish().unwrap(), b"done");
        assert_eq!(aborts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn stalled_update_is_an_error() {
        let (mut op, _aborts) = echo(0);
        let mut out = Vec::new();
        let err = op.update_completely(b"abc", &mut out).unwrap_err();
        assert!(matches!(err, KeymasterError::InvalidOperation(_)));
    }

    #[test]
    fn dropping_unfinished_operation_aborts() {
        let (op, aborts) = echo(4);
        drop(op);
        assert_eq!(aborts.load(Ordering::SeqCst), 1);
    }
}
