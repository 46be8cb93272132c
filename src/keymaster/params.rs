//! Typed key and operation parameters exchanged with a keymaster.
//!
//! An [`AuthorizationSet`] is an ordered list of [`KeyParameter`] tags. Key
//! generation receives the characteristics the key is bound to; `begin`
//! receives the same key-level tags plus per-operation ones (auth token,
//! nonce), and may hand back output tags such as a generated nonce.

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

#[derive(Serialize, Deserialize, Encode, Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPurpose {
    Encrypt,
    Decrypt,
}

#[derive(Serialize, Deserialize, Encode, Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Aes,
}

#[derive(Serialize, Deserialize, Encode, Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockMode {
    Gcm,
}

#[derive(Serialize, Deserialize, Encode, Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaddingMode {
    None,
}

/// Authenticator kinds, as a bit set in the hardware auth token.
#[derive(Serialize, Deserialize, Encode, Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareAuthenticatorType {
    Password,
    Fingerprint,
}

impl HardwareAuthenticatorType {
    pub fn bits(self) -> u32 {
        match self {
            Self::Password => 1 << 0,
            Self::Fingerprint => 1 << 1,
        }
    }
}

#[derive(Serialize, Deserialize, Encode, Decode, Clone, PartialEq, Eq)]
pub enum KeyParameter {
    Purpose(KeyPurpose),
    Algorithm(Algorithm),
    KeySize(u32),
    BlockMode(BlockMode),
    Padding(PaddingMode),
    /// Minimum GCM tag length in bits accepted for this key.
    MinMacLength(u32),
    /// GCM tag length in bits for one operation.
    MacLength(u32),
    ApplicationId(Vec<u8>),
    NoAuthRequired,
    UserSecureId(u64),
    UserAuthType(HardwareAuthenticatorType),
    /// Seconds an auth token stays valid for this key.
    AuthTimeout(u32),
    AuthToken(Vec<u8>),
    Nonce(Vec<u8>),
}

// Application ids carry stretched credential material and auth tokens carry
// an HMAC; neither may reach a log line.
impl std::fmt::Debug for KeyParameter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Purpose(p) => f.debug_tuple("Purpose").field(p).finish(),
            Self::Algorithm(a) => f.debug_tuple("Algorithm").field(a).finish(),
            Self::KeySize(bits) => f.debug_tuple("KeySize").field(bits).finish(),
            Self::BlockMode(m) => f.debug_tuple("BlockMode").field(m).finish(),
            Self::Padding(p) => f.debug_tuple("Padding").field(p).finish(),
            Self::MinMacLength(bits) => f.debug_tuple("MinMacLength").field(bits).finish(),
            Self::MacLength(bits) => f.debug_tuple("MacLength").field(bits).finish(),
            Self::ApplicationId(_) => f.write_str("ApplicationId([REDACTED])"),
            Self::NoAuthRequired => f.write_str("NoAuthRequired"),
            Self::UserSecureId(sid) => f.debug_tuple("UserSecureId").field(sid).finish(),
            Self::UserAuthType(t) => f.debug_tuple("UserAuthType").field(t).finish(),
            Self::AuthTimeout(secs) => f.debug_tuple("AuthTimeout").field(secs).finish(),
            Self::AuthToken(_) => f.write_str("AuthToken([REDACTED])"),
            Self::Nonce(n) => f.debug_tuple("Nonce").field(&n.len()).finish(),
        }
    }
}

impl Zeroize for KeyParameter {
    fn zeroize(&mut self) {
        match self {
            Self::ApplicationId(bytes) | Self::AuthToken(bytes) | Self::Nonce(bytes) => {
                bytes.zeroize()
            }
            _ => {}
        }
    }
}

/// An ordered set of key parameters.
#[derive(Serialize, Deserialize, Encode, Decode, Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthorizationSet {
    params: Vec<KeyParameter>,
}

impl AuthorizationSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a tag, builder style.
    pub fn with(mut self, param: KeyParameter) -> Self {
        self.params.push(param);
        self
    }

    /// AES key of `bits` length usable for both encryption and decryption.
    pub fn aes_encryption_key(self, bits: u32) -> Self {
        self.with(KeyParameter::Algorithm(Algorithm::Aes))
            .with(KeyParameter::KeySize(bits))
            .with(KeyParameter::Purpose(KeyPurpose::Encrypt))
            .with(KeyParameter::Purpose(KeyPurpose::Decrypt))
    }

    pub fn push(&mut self, param: KeyParameter) {
        self.params.push(param);
    }

    /// Appends every tag of `other` after the existing ones.
    pub fn extend(&mut self, other: &AuthorizationSet) {
        self.params.extend(other.params.iter().cloned());
    }

    pub fn iter(&self) -> impl Iterator<Item = &KeyParameter> {
        self.params.iter()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn contains(&self, param: &KeyParameter) -> bool {
        self.params.contains(param)
    }

    /// Returns a copy without any tag `predicate` matches.
    pub fn without(&self, predicate: impl Fn(&KeyParameter) -> bool) -> Self {
        Self {
            params: self.params.iter().filter(|p| !predicate(p)).cloned().collect(),
        }
    }

    pub fn has_purpose(&self, purpose: KeyPurpose) -> bool {
        self.contains(&KeyParameter::Purpose(purpose))
    }

    pub fn algorithm(&self) -> Option<Algorithm> {
        self.params.iter().find_map(|p| match p {
            KeyParameter::Algorithm(a) => Some(*a),
            _ => None,
        })
    }

    pub fn key_size(&self) -> Option<u32> {
        self.params.iter().find_map(|p| match p {
            KeyParameter::KeySize(bits) => Some(*bits),
            _ => None,
        })
    }

    pub fn block_mode(&self) -> Option<BlockMode> {
        self.params.iter().find_map(|p| match p {
            KeyParameter::BlockMode(m) => Some(*m),
            _ => None,
        })
    }

    pub fn padding(&self) -> Option<PaddingMode> {
        self.params.iter().find_map(|p| match p {
            KeyParameter::Padding(m) => Some(*m),
            _ => None,
        })
    }

    pub fn min_mac_length(&self) -> Option<u32> {
        self.params.iter().find_map(|p| match p {
            KeyParameter::MinMacLength(bits) => Some(*bits),
            _ => None,
        })
    }

    pub fn mac_length(&self) -> Option<u32> {
        self.params.iter().find_map(|p| match p {
            KeyParameter::MacLength(bits) => Some(*bits),
            _ => None,
        })
    }

    pub fn application_id(&self) -> Option<&[u8]> {
        self.params.iter().find_map(|p| match p {
            KeyParameter::ApplicationId(id) => Some(id.as_slice()),
            _ => None,
        })
    }

    pub fn no_auth_required(&self) -> bool {
        self.contains(&KeyParameter::NoAuthRequired)
    }

    pub fn user_secure_id(&self) -> Option<u64> {
        self.params.iter().find_map(|p| match p {
            KeyParameter::UserSecureId(sid) => Some(*sid),
            _ => None,
        })
    }

    pub fn user_auth_type(&self) -> Option<HardwareAuthenticatorType> {
        self.params.iter().find_map(|p| match p {
            KeyParameter::UserAuthType(t) => Some(*t),
            _ => None,
        })
    }

    pub fn auth_timeout(&self) -> Option<u32> {
        self.params.iter().find_map(|p| match p {
            KeyParameter::AuthTimeout(secs) => Some(*secs),
            _ => None,
        })
    }

    pub fn auth_token(&self) -> Option<&[u8]> {
        self.params.iter().find_map(|p| match p {
            KeyParameter::AuthToken(token) => Some(token.as_slice()),
            _ => None,
        })
    }

    pub fn nonce(&self) -> Option<&[u8]> {
        self.params.iter().find_map(|p| match p {
            KeyParameter::Nonce(nonce) => Some(nonce.as_slice()),
            _ => None,
        })
    }
}

impl Drop for AuthorizationSet {
    fn drop(&mut self) {
        self.params.iter_mut().for_each(Zeroize::zeroize);
    }
}
