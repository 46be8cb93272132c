//! Credential stretching.
//!
//! The stretching specification is persisted with every key as a short string:
//! `none`, `nopassword` or `scrypt N:r:p`, where N, r and p are log2 values.

use std::fmt;
use std::str::FromStr;

use secrecy::{ExposeSecret, SecretSlice};
use tracing::{error, warn};
use zeroize::Zeroizing;

use crate::auth::KeyAuthentication;
use crate::config::KeyStorageConfig;
use crate::error::{Error, Result};

/// Length of scrypt output mixed into the application id.
pub const STRETCHED_BYTES: usize = 1 << 6;

/// Largest scrypt working set accepted when stretching. The default `15:3:1`
/// needs 32 MiB.
pub const MAX_SCRYPT_MEMORY_BYTES: u64 = 1 << 30;

const STRETCH_NONE: &str = "none";
const STRETCH_NOPASSWORD: &str = "nopassword";
const STRETCH_PREFIX_SCRYPT: &str = "scrypt ";

/// scrypt cost parameters, each stored as a base-2 logarithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScryptParams {
    pub log_n: u8,
    pub log_r: u8,
    pub log_p: u8,
}

impl ScryptParams {
    /// Bytes scrypt allocates for these parameters, `128 * r * (N + p)`.
    pub fn memory_bytes(self) -> Option<u64> {
        let n = 1u64.checked_shl(self.log_n.into())?;
        let r = 1u64.checked_shl(self.log_r.into())?;
        let p = 1u64.checked_shl(self.log_p.into())?;
        128u64.checked_mul(r)?.checked_mul(n.checked_add(p)?)
    }

    fn to_scrypt(self) -> Result<scrypt::Params> {
        match self.memory_bytes() {
            Some(bytes) if bytes <= MAX_SCRYPT_MEMORY_BYTES => {}
            _ => {
                error!("scrypt params {} exceed the memory limit", self);
                return Err(Error::InvalidScryptParams(format!(
                    "{self}: needs more than {MAX_SCRYPT_MEMORY_BYTES} bytes"
                )));
            }
        }
        scrypt::Params::new(
            self.log_n,
            1u32 << self.log_r,
            1u32 << self.log_p,
            STRETCHED_BYTES,
        )
        .map_err(|e| Error::InvalidScryptParams(format!("{self}: {e}")))
    }
}

impl FromStr for ScryptParams {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let fields: Vec<&str> = s.split(':').collect();
        let [n, r, p] = fields.as_slice() else {
            return Err(Error::InvalidScryptParams(s.to_string()));
        };
        let parse = |field: &str| {
            field
                .trim()
                .parse::<u8>()
                .map_err(|_| Error::InvalidScryptParams(s.to_string()))
        };
        Ok(Self {
            log_n: parse(*n)?,
            log_r: parse(*r)?,
            log_p: parse(*p)?,
        })
    }
}

impl fmt::Display for ScryptParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.log_n, self.log_r, self.log_p)
    }
}

/// How a credential secret is turned into key material.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stretching {
    /// The secret is used as-is. Only for keys not bound to the keymaster.
    None,
    /// The key has no password; any supplied secret is ignored.
    NoPassword,
    Scrypt(ScryptParams),
}

impl Stretching {
    /// Picks the stretching for a new key.
    pub fn for_auth(auth: &KeyAuthentication, config: &KeyStorageConfig) -> Result<Self> {
        if !auth.uses_keymaster() {
            Ok(Self::None)
        } else if auth.secret().expose_secret().is_empty() {
            Ok(Self::NoPassword)
        } else {
            let params = config.scrypt_params();
            Ok(Self::Scrypt(params.parse().inspect_err(|_| {
                error!("Unable to parse configured scrypt params: {}", params);
            })?))
        }
    }

    /// Whether a salt file accompanies this stretching.
    pub fn needs_salt(&self) -> bool {
        matches!(self, Self::Scrypt(_))
    }

    /// Stretches `secret` with `salt`.
    pub fn stretch(&self, secret: &SecretSlice<u8>, salt: &[u8]) -> Result<SecretSlice<u8>> {
        match self {
            Self::NoPassword => {
                if !secret.expose_secret().is_empty() {
                    warn!("Password present but stretching is nopassword");
                }
                Ok(SecretSlice::from(Vec::new()))
            }
            Self::None => Ok(SecretSlice::from(secret.expose_secret().to_vec())),
            Self::Scrypt(params) => {
                let scrypt_params = params.to_scrypt()?;
                let mut out = Zeroizing::new(vec![0u8; STRETCHED_BYTES]);
                scrypt::scrypt(secret.expose_secret(), salt, &scrypt_params, &mut out).map_err(
                    |e| {
                        error!("scrypt failed with params: {}", params);
                        Error::Stretch(e.to_string())
                    },
                )?;
                Ok(SecretSlice::from(out.to_vec()))
            }
        }
    }
}

impl FromStr for Stretching {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            STRETCH_NONE => Ok(Self::None),
            STRETCH_NOPASSWORD => Ok(Self::NoPassword),
            _ => match s.strip_prefix(STRETCH_PREFIX_SCRYPT) {
                Some(params) => Ok(Self::Scrypt(params.parse().inspect_err(|_| {
                    error!("Unable to parse scrypt params in stretching: {}", s);
                })?)),
                None => {
                    error!("Unknown stretching type: {}", s);
                    Err(Error::UnknownStretching(s.to_string()))
                }
            },
        }
    }
}

impl fmt::Display for Stretching {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str(STRETCH_NONE),
            Self::NoPassword => f.write_str(STRETCH_NOPASSWORD),
            Self::Scrypt(params) => write!(f, "{STRETCH_PREFIX_SCRYPT}{params}"),
        }
    }
}
