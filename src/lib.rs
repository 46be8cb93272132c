//! Credential-bound key storage.
//!
//! A key is protected by wrapping it with AES-256-GCM under a key bound to the
//! caller's credentials, either inside a [`Keymaster`] or in software, and
//! persisting the wrapped form as a small directory of files. See
//! [`KeyStorage`] for the entry points.

pub mod app_id;
pub mod auth;
pub mod config;
pub mod crypt;
pub mod destroy;
pub mod error;
pub mod keymaster;
pub mod layout;
pub mod storage;
pub mod stretch;
#[cfg(feature = "tpm")]
pub mod tpm;
pub mod wrap;

pub use auth::{HardwareAuthToken, KeyAuthentication};
pub use config::{KeyStorageConfig, SecureDeleteConfig};
pub use crypt::MasterKey;
pub use destroy::DestroyReport;
pub use error::{Error, Result};
pub use keymaster::soft::SoftKeymaster;
pub use keymaster::{Keymaster, KeymasterError};
pub use storage::KeyStorage;
pub use stretch::Stretching;
