//! Caller-supplied credentials.

use secrecy::{ExposeSecret, SecretSlice};

use crate::error::{Error, Result};

/// Size of a serialized hardware auth token: version, challenge, user id,
/// authenticator id, authenticator type, timestamp and a 32-byte HMAC.
pub const HW_AUTH_TOKEN_BYTES: usize = 1 + 8 + 8 + 8 + 4 + 8 + 32;

/// The credentials a key is bound to.
///
/// `secret` is a password-derived value (empty for "no password") and
/// `token` a hardware auth token blob (empty when no token is needed).
/// Never persisted.
pub struct KeyAuthentication {
    secret: SecretSlice<u8>,
    token: Vec<u8>,
}

impl KeyAuthentication {
    pub fn new(token: impl Into<Vec<u8>>, secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: SecretSlice::from(secret.into()),
            token: token.into(),
        }
    }

    /// No token and no secret.
    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new())
    }

    /// A password-only credential.
    pub fn with_secret(secret: impl Into<Vec<u8>>) -> Self {
        Self::new(Vec::new(), secret)
    }

    pub fn secret(&self) -> &SecretSlice<u8> {
        &self.secret
    }

    pub fn token(&self) -> &[u8] {
        &self.token
    }

    /// Whether the key is bound through the keymaster.
    ///
    /// A token always requires the keymaster. Without a secret there is
    /// nothing to derive a software key from, so the keymaster is used too.
    pub fn uses_keymaster(&self) -> bool {
        !self.token.is_empty() || self.secret.expose_secret().is_empty()
    }
}

impl std::fmt::Debug for KeyAuthentication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyAuthentication")
            .field("secret", &"[REDACTED]")
            .field("token_len", &self.token.len())
            .finish()
    }
}

/// The fields of a hardware auth token this crate looks at.
///
/// Integers in the token are in host order except `authenticator_type` and
/// `timestamp`, which are big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareAuthToken {
    pub version: u8,
    pub challenge: u64,
    pub user_id: u64,
    pub authenticator_id: u64,
    pub authenticator_type: u32,
    pub timestamp: u64,
}

impl HardwareAuthToken {
    pub fn parse(token: &[u8]) -> Result<Self> {
        if token.len() != HW_AUTH_TOKEN_BYTES {
            tracing::error!(
                "Auth token should be {} bytes, was {} bytes",
                HW_AUTH_TOKEN_BYTES,
                token.len()
            );
            return Err(Error::InvalidAuthToken {
                expected: HW_AUTH_TOKEN_BYTES,
                actual: token.len(),
            });
        }
        let u64_at = |at: usize| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&token[at..at + 8]);
            buf
        };
        let mut auth_type = [0u8; 4];
        auth_type.copy_from_slice(&token[25..29]);
        Ok(Self {
            version: token[0],
            challenge: u64::from_ne_bytes(u64_at(1)),
            user_id: u64::from_ne_bytes(u64_at(9)),
            authenticator_id: u64::from_ne_bytes(u64_at(17)),
            authenticator_type: u32::from_be_bytes(auth_type),
            timestamp: u64::from_be_bytes(u64_at(29)),
        })
    }

    /// Serializes the token with an all-zero HMAC. Only useful for tests and
    /// software keymasters that do not verify the HMAC.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HW_AUTH_TOKEN_BYTES);
        out.push(self.version);
        out.extend_from_slice(&self.challenge.to_ne_bytes());
        out.extend_from_slice(&self.user_id.to_ne_bytes());
        out.extend_from_slice(&self.authenticator_id.to_ne_bytes());
        out.extend_from_slice(&self.authenticator_type.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.resize(HW_AUTH_TOKEN_BYTES, 0);
        out
    }
}
