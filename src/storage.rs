//! Storing, retrieving and destroying protected keys.

use std::path::Path;
use std::sync::Arc;

use secrecy::SecretSlice;
use tracing::{debug, error, instrument};
use zeroize::Zeroizing;

use crate::app_id::generate_app_id;
use crate::auth::KeyAuthentication;
use crate::config::KeyStorageConfig;
use crate::crypt::{decrypt_without_keymaster, encrypt_without_keymaster, random_bytes};
use crate::destroy::{DestroyReport, destroy_key};
use crate::error::{Error, Result};
use crate::keymaster::Keymaster;
use crate::layout::{
    FILE_ENCRYPTED_KEY, FILE_KEYMASTER_KEY_BLOB, FILE_SALT, FILE_SECDISCARDABLE,
    FILE_STRETCHING, FILE_VERSION, KeyDir,
};
use crate::stretch::Stretching;
use crate::wrap::{
    begin_params, decrypt_with_keymaster_key, encrypt_with_keymaster_key, generate_keymaster_key,
};

/// Record format written by [`KeyStorage::store_key`].
pub const CURRENT_VERSION: &str = "1";
pub const SECDISCARDABLE_BYTES: usize = 1 << 14;
pub const SALT_BYTES: usize = 1 << 4;

/// Protects keys on disk under caller credentials.
///
/// Keys whose credentials carry an auth token, or no secret at all, are
/// wrapped by the keymaster. The rest are wrapped in software with a key
/// derived from the credentials. A storage built without a keymaster fails
/// the former with [`Error::KeymasterUnavailable`].
///
/// Calls on the same directory must not overlap; distinct directories are
/// independent.
#[derive(Clone)]
pub struct KeyStorage {
    keymaster: Option<Arc<dyn Keymaster>>,
    config: KeyStorageConfig,
}

impl KeyStorage {
    pub fn new(config: KeyStorageConfig) -> Self {
        Self {
            keymaster: None,
            config,
        }
    }

    pub fn with_keymaster(keymaster: Arc<dyn Keymaster>, config: KeyStorageConfig) -> Self {
        Self {
            keymaster: Some(keymaster),
            config,
        }
    }

    pub fn config(&self) -> &KeyStorageConfig {
        &self.config
    }

    fn keymaster(&self) -> Result<&dyn Keymaster> {
        self.keymaster.as_deref().ok_or_else(|| {
            error!("Keymaster requested but none is configured");
            Error::KeymasterUnavailable
        })
    }

    /// Wraps `key` under `auth` into a new record at `dir`.
    ///
    /// `dir` must not exist yet. A failure part way leaves a partial record
    /// behind; it is harmless and can be removed with
    /// [`KeyStorage::destroy_key`].
    #[instrument(skip_all, fields(dir = %dir.as_ref().display()))]
    pub fn store_key(
        &self,
        dir: impl AsRef<Path>,
        auth: &KeyAuthentication,
        key: &[u8],
    ) -> Result<()> {
        let dir = KeyDir::new(dir.as_ref());
        let keymaster = if auth.uses_keymaster() {
            Some(self.keymaster()?)
        } else {
            None
        };

        dir.create()?;
        dir.write(FILE_VERSION, CURRENT_VERSION.as_bytes())?;
        let secdiscardable = Zeroizing::new(random_bytes(SECDISCARDABLE_BYTES)?);
        dir.write(FILE_SECDISCARDABLE, &secdiscardable)?;
        let stretching = Stretching::for_auth(auth, &self.config)?;
        dir.write(FILE_STRETCHING, stretching.to_string().as_bytes())?;
        let salt = if stretching.needs_salt() {
            let salt = random_bytes(SALT_BYTES)?;
            dir.write(FILE_SALT, &salt)?;
            salt
        } else {
            Vec::new()
        };
        let app_id = generate_app_id(auth, &stretching, &salt, &secdiscardable)?;

        let encrypted_key = match keymaster {
            Some(keymaster) => {
                let key_blob = generate_keymaster_key(keymaster, auth, &app_id)?;
                dir.write(FILE_KEYMASTER_KEY_BLOB, &key_blob)?;
                let key_params = begin_params(auth, &app_id);
                encrypt_with_keymaster_key(keymaster, &dir, &key_params, key)?
            }
            None => encrypt_without_keymaster(&app_id, key)?,
        };
        dir.write(FILE_ENCRYPTED_KEY, &encrypted_key)?;
        debug!("Stored key with stretching {}", stretching);
        Ok(())
    }

    /// Recovers the key in the record at `dir`.
    ///
    /// Wrong credentials and a damaged record fail the same way, with
    /// [`Error::DecryptionFailed`].
    #[instrument(skip_all, fields(dir = %dir.as_ref().display()))]
    pub fn retrieve_key(
        &self,
        dir: impl AsRef<Path>,
        auth: &KeyAuthentication,
    ) -> Result<SecretSlice<u8>> {
        let dir = KeyDir::new(dir.as_ref());
        let version = dir.read_string(FILE_VERSION)?;
        if version != CURRENT_VERSION {
            error!(
                "Version mismatch, expected {} got {}",
                CURRENT_VERSION, version
            );
            return Err(Error::VersionMismatch {
                expected: CURRENT_VERSION.to_string(),
                found: version,
            });
        }
        let secdiscardable = Zeroizing::new(dir.read(FILE_SECDISCARDABLE)?);
        let stretching: Stretching = dir.read_string(FILE_STRETCHING)?.parse()?;
        let salt = if stretching.needs_salt() {
            dir.read(FILE_SALT)?
        } else {
            Vec::new()
        };
        let app_id = generate_app_id(auth, &stretching, &salt, &secdiscardable)?;
        let encrypted_key = dir.read(FILE_ENCRYPTED_KEY)?;

        if auth.uses_keymaster() {
            let keymaster = self.keymaster()?;
            let key_params = begin_params(auth, &app_id);
            decrypt_with_keymaster_key(keymaster, &dir, &key_params, &encrypted_key)
        } else {
            decrypt_without_keymaster(&app_id, &encrypted_key)
        }
    }

    /// Destroys the record at `dir` as thoroughly as possible.
    #[instrument(skip_all, fields(dir = %dir.as_ref().display()))]
    pub fn destroy_key(&self, dir: impl AsRef<Path>) -> DestroyReport {
        let dir = KeyDir::new(dir.as_ref());
        destroy_key(
            self.keymaster.as_deref(),
            &dir,
            &self.config.secure_delete,
        )
    }
}

impl std::fmt::Debug for KeyStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStorage")
            .field("keymaster", &self.keymaster.is_some())
            .field("config", &self.config)
            .finish()
    }
}
