//! The on-disk key record.
//!
//! Every protected key lives in its own directory holding one file per field:
//!
//! ```text
//! <dir>/version                       format tag, currently "1"
//! <dir>/stretching                    "none", "nopassword" or "scrypt N:r:p"
//! <dir>/salt                          scrypt salt, only when stretching needs one
//! <dir>/secdiscardable                16 KiB of randomness mixed into the app id
//! <dir>/keymaster_key_blob            keymaster key blob, hardware path only
//! <dir>/keymaster_key_blob_upgraded   transient, during key upgrade
//! <dir>/encrypted_key                 nonce || ciphertext || tag
//! ```

use std::fs::{self, DirBuilder};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::error;

use crate::error::{Error, Result};

pub const FILE_VERSION: &str = "version";
pub const FILE_STRETCHING: &str = "stretching";
pub const FILE_SALT: &str = "salt";
pub const FILE_SECDISCARDABLE: &str = "secdiscardable";
pub const FILE_KEYMASTER_KEY_BLOB: &str = "keymaster_key_blob";
pub const FILE_KEYMASTER_KEY_BLOB_UPGRADED: &str = "keymaster_key_blob_upgraded";
pub const FILE_ENCRYPTED_KEY: &str = "encrypted_key";

/// Files overwritten in place before the directory is removed. The salt and
/// version reveal nothing without these.
pub const SENSITIVE_FILES: [&str; 3] = [
    FILE_ENCRYPTED_KEY,
    FILE_KEYMASTER_KEY_BLOB,
    FILE_SECDISCARDABLE,
];

/// A key record directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDir {
    path: PathBuf,
}

impl KeyDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.file(name).is_file()
    }

    /// Creates the directory with mode 0700. Fails if it already exists,
    /// which is the only guard against two stores racing on one record.
    pub fn create(&self) -> Result<()> {
        let mut builder = DirBuilder::new();
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o700);
        }
        builder.create(&self.path).map_err(|e| {
            error!("key mkdir {}: {}", self.path.display(), e);
            Error::io(&self.path, e)
        })
    }

    pub fn read(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.file(name);
        fs::read(&path).map_err(|e| {
            error!("Failed to read from {}: {}", path.display(), e);
            Error::io(path, e)
        })
    }

    /// Reads a text field. Invalid UTF-8 is kept lossily so the caller's
    /// parse reports the bad value.
    pub fn read_string(&self, name: &str) -> Result<String> {
        Ok(String::from_utf8_lossy(&self.read(name)?).into_owned())
    }

    /// Writes a field, truncating any previous contents, and syncs it.
    pub fn write(&self, name: &str, data: &[u8]) -> Result<()> {
        let path = self.file(name);
        let written = fs::File::create(&path).and_then(|mut file| {
            file.write_all(data)?;
            file.sync_all()
        });
        written.map_err(|e| {
            error!("Failed to write to {}: {}", path.display(), e);
            Error::io(path, e)
        })
    }

    /// Replaces `name` with `data` by writing `staging` and renaming it over
    /// the original, so readers see either the old or the new contents.
    pub fn replace_atomically(&self, name: &str, staging: &str, data: &[u8]) -> Result<()> {
        self.write(staging, data)?;
        let from = self.file(staging);
        let to = self.file(name);
        fs::rename(&from, &to).map_err(|e| {
            error!("Unable to move {} to {}: {}", from.display(), to.display(), e);
            Error::io(to, e)
        })
    }
}
