//! A keymaster implemented in software.
//!
//! Keys are random AES-256 keys sealed into the returned blob under a subkey
//! of a [`MasterKey`]. The seal authenticates the application id and the key
//! characteristics, so a blob only opens for the app id it was generated
//! with and its auth requirements cannot be edited.
//!
//! This gives the same observable contract as a hardware keymaster, minus the
//! isolation: the root key lives in process memory. Auth tokens are matched
//! against the key's secure user id, but their HMAC and timeout are not
//! checked since there is no shared HMAC key or trusted clock here.

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use bincode::{Decode, Encode};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, error, warn};
use zeroize::{Zeroize, Zeroizing};

use super::{
    Algorithm, AuthorizationSet, BlockMode, HardwareAuthenticatorType, KeyParameter, KeyPurpose,
    Keymaster, KeymasterError, KeymasterResult, Operation, PaddingMode,
};
use crate::auth::HardwareAuthToken;
use crate::crypt::{
    AES_KEY_BYTES, DerivedKey, GCM_MAC_BYTES, GCM_NONCE_BYTES, MasterKey, random_bytes,
};

/// Blob format written by a freshly constructed [`SoftKeymaster`].
pub const INITIAL_BLOB_VERSION: u32 = 1;

const KEY_ID_BYTES: usize = 16;
const KEY_SEALING_INFO: &[u8] = b"ashura soft keymaster key sealing";
const GCM_MAC_BITS: u32 = (GCM_MAC_BYTES * 8) as u32;

#[derive(Serialize, Deserialize, Encode, Decode, Debug, Clone)]
struct SoftKeyBlob {
    format_version: u32,
    key_id: [u8; KEY_ID_BYTES],
    /// Key parameters minus the application id, which is never stored.
    characteristics: AuthorizationSet,
    /// `nonce || AES-256 key || tag`
    sealed_material: Vec<u8>,
}

impl SoftKeyBlob {
    fn decode(blob: &[u8]) -> KeymasterResult<Self> {
        let (decoded, read): (SoftKeyBlob, usize) =
            bincode::decode_from_slice(blob, bincode::config::standard()).map_err(|e| {
                error!("Failed to decode key blob: {}", e);
                KeymasterError::InvalidKeyBlob
            })?;
        if read != blob.len() {
            error!("Trailing bytes after key blob");
            return Err(KeymasterError::InvalidKeyBlob);
        }
        Ok(decoded)
    }

    fn encode(&self) -> KeymasterResult<Vec<u8>> {
        bincode::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| KeymasterError::Unavailable(format!("key blob encoding failed: {e}")))
    }

    /// Associated data binding the seal to the app id and the key's metadata.
    fn sealing_aad(&self, app_id: &[u8]) -> KeymasterResult<Vec<u8>> {
        let header = (self.format_version, self.key_id, &self.characteristics);
        let mut aad = Sha256::digest(app_id).to_vec();
        aad.extend(
            bincode::serde::encode_to_vec(header, bincode::config::standard()).map_err(|e| {
                KeymasterError::Unavailable(format!("key blob encoding failed: {e}"))
            })?,
        );
        Ok(aad)
    }
}

/// A software [`Keymaster`] rooted in a [`MasterKey`].
pub struct SoftKeymaster {
    master_key: MasterKey,
    blob_version: AtomicU32,
    revoked: Mutex<HashSet<[u8; KEY_ID_BYTES]>>,
}

impl SoftKeymaster {
    pub fn new(master_key: MasterKey) -> Self {
        Self {
            master_key,
            blob_version: AtomicU32::new(INITIAL_BLOB_VERSION),
            revoked: Mutex::new(HashSet::new()),
        }
    }

    /// A keymaster with a freshly generated, process-lifetime root key.
    pub fn ephemeral() -> crate::Result<Self> {
        Ok(Self::new(MasterKey::generate()?))
    }

    pub fn blob_version(&self) -> u32 {
        self.blob_version.load(Ordering::SeqCst)
    }

    /// Moves to a newer blob format. Blobs in older formats then report
    /// [`KeymasterError::KeyRequiresUpgrade`] until upgraded.
    pub fn set_blob_version(&self, version: u32) {
        self.blob_version.store(version, Ordering::SeqCst);
    }

    fn sealing_key(&self, key_id: &[u8]) -> KeymasterResult<DerivedKey> {
        self.master_key
            .derive(key_id, KEY_SEALING_INFO)
            .map_err(|e| KeymasterError::Unavailable(e.to_string()))
    }

    fn is_revoked(&self, key_id: &[u8; KEY_ID_BYTES]) -> KeymasterResult<bool> {
        let revoked = self
            .revoked
            .lock()
            .map_err(|_| KeymasterError::Unavailable("revocation list poisoned".into()))?;
        Ok(revoked.contains(key_id))
    }

    /// Seals `material` into a new blob in the current format.
    fn seal(
        &self,
        characteristics: AuthorizationSet,
        app_id: &[u8],
        material: &[u8],
    ) -> KeymasterResult<Vec<u8>> {
        let mut key_id = [0u8; KEY_ID_BYTES];
        key_id.copy_from_slice(&random_bytes(KEY_ID_BYTES).map_err(unavailable)?);
        let mut blob = SoftKeyBlob {
            format_version: self.blob_version(),
            key_id,
            characteristics,
            sealed_material: Vec::new(),
        };
        let aad = blob.sealing_aad(app_id)?;
        blob.sealed_material = self
            .sealing_key(&key_id)?
            .seal(material, &aad)
            .map_err(unavailable)?;
        blob.encode()
    }

    /// Opens a blob's key material. Fails for revoked keys and for any app
    /// id other than the one the key was generated with.
    fn unseal(&self, blob: &SoftKeyBlob, app_id: &[u8]) -> KeymasterResult<DerivedKey> {
        if self.is_revoked(&blob.key_id)? {
            error!("Key blob refers to a deleted key");
            return Err(KeymasterError::InvalidKeyBlob);
        }
        let aad = blob.sealing_aad(app_id)?;
        let material = self
            .sealing_key(&blob.key_id)?
            .open(&blob.sealed_material, &aad)
            .map_err(|_| KeymasterError::InvalidKeyBlob)?;
        let material = material.expose_secret();
        if material.len() != AES_KEY_BYTES {
            return Err(KeymasterError::InvalidKeyBlob);
        }
        let mut key = [0u8; AES_KEY_BYTES];
        key.copy_from_slice(material);
        let derived = DerivedKey::from_bytes(key);
        key.zeroize();
        Ok(derived)
    }
}

fn unavailable(e: crate::Error) -> KeymasterError {
    KeymasterError::Unavailable(e.to_string())
}

fn check_key_params(params: &AuthorizationSet) -> KeymasterResult<()> {
    if params.algorithm() != Some(Algorithm::Aes) {
        return Err(KeymasterError::UnsupportedParameter("algorithm".into()));
    }
    if params.key_size() != Some((AES_KEY_BYTES * 8) as u32) {
        return Err(KeymasterError::UnsupportedParameter("key size".into()));
    }
    if params.block_mode() != Some(BlockMode::Gcm) {
        return Err(KeymasterError::UnsupportedParameter("block mode".into()));
    }
    if params.padding() != Some(PaddingMode::None) {
        return Err(KeymasterError::UnsupportedParameter("padding".into()));
    }
    match params.min_mac_length() {
        Some(bits) if bits % 8 == 0 && (96..=GCM_MAC_BITS).contains(&bits) => {}
        _ => return Err(KeymasterError::UnsupportedParameter("min mac length".into())),
    }
    match (params.no_auth_required(), params.user_secure_id()) {
        (true, None) => Ok(()),
        (false, Some(_)) => Ok(()),
        _ => Err(KeymasterError::IncompatibleParameter(
            "exactly one of NoAuthRequired and UserSecureId".into(),
        )),
    }
}

fn check_operation_params(
    characteristics: &AuthorizationSet,
    params: &AuthorizationSet,
) -> KeymasterResult<()> {
    if params.block_mode() != Some(BlockMode::Gcm) {
        return Err(KeymasterError::IncompatibleParameter("block mode".into()));
    }
    if params.padding() != Some(PaddingMode::None) {
        return Err(KeymasterError::IncompatibleParameter("padding".into()));
    }
    let min = characteristics.min_mac_length().unwrap_or(GCM_MAC_BITS);
    match params.mac_length() {
        Some(bits) if bits == GCM_MAC_BITS && bits >= min => Ok(()),
        Some(_) => Err(KeymasterError::UnsupportedParameter("mac length".into())),
        None => Err(KeymasterError::IncompatibleParameter("missing mac length".into())),
    }
}

fn authorize(characteristics: &AuthorizationSet, params: &AuthorizationSet) -> KeymasterResult<()> {
    if characteristics.no_auth_required() {
        return Ok(());
    }
    let Some(secure_id) = characteristics.user_secure_id() else {
        return Err(KeymasterError::KeyUserNotAuthenticated);
    };
    let Some(token) = params.auth_token() else {
        warn!("Key requires an auth token but none was supplied");
        return Err(KeymasterError::KeyUserNotAuthenticated);
    };
    let token = HardwareAuthToken::parse(token).map_err(|_| KeymasterError::KeyUserNotAuthenticated)?;
    if token.user_id != secure_id && token.authenticator_id != secure_id {
        warn!("Auth token is for a different user");
        return Err(KeymasterError::KeyUserNotAuthenticated);
    }
    let required = characteristics
        .user_auth_type()
        .unwrap_or(HardwareAuthenticatorType::Password);
    if token.authenticator_type & required.bits() == 0 {
        warn!("Auth token is from the wrong authenticator");
        return Err(KeymasterError::KeyUserNotAuthenticated);
    }
    Ok(())
}

impl Keymaster for SoftKeymaster {
    fn generate_key(&self, params: &AuthorizationSet) -> KeymasterResult<Vec<u8>> {
        check_key_params(params)?;
        let app_id = params.application_id().unwrap_or_default();
        let characteristics = params.without(|p| matches!(p, KeyParameter::ApplicationId(_)));
        let material = Zeroizing::new(random_bytes(AES_KEY_BYTES).map_err(unavailable)?);
        debug!("Generating soft keymaster key");
        self.seal(characteristics, app_id, &material)
    }

    fn begin(
        &self,
        purpose: KeyPurpose,
        key_blob: &[u8],
        params: &AuthorizationSet,
    ) -> KeymasterResult<(Box<dyn Operation>, AuthorizationSet)> {
        let blob = SoftKeyBlob::decode(key_blob)?;
        let current = self.blob_version();
        if blob.format_version < current {
            debug!(
                "Key blob version {} is older than {}",
                blob.format_version, current
            );
            return Err(KeymasterError::KeyRequiresUpgrade);
        }
        if blob.format_version > current {
            error!("Key blob version {} is from the future", blob.format_version);
            return Err(KeymasterError::InvalidKeyBlob);
        }
        if !blob.characteristics.has_purpose(purpose) {
            return Err(KeymasterError::IncompatibleParameter("purpose".into()));
        }
        let key = self.unseal(&blob, params.application_id().unwrap_or_default())?;
        check_operation_params(&blob.characteristics, params)?;
        authorize(&blob.characteristics, params)?;

        let mut out_params = AuthorizationSet::new();
        let nonce = match purpose {
            KeyPurpose::Encrypt => {
                if params.nonce().is_some() {
                    return Err(KeymasterError::IncompatibleParameter(
                        "caller-provided nonce".into(),
                    ));
                }
                let nonce = random_bytes(GCM_NONCE_BYTES).map_err(unavailable)?;
                out_params.push(KeyParameter::Nonce(nonce.clone()));
                nonce
            }
            KeyPurpose::Decrypt => match params.nonce() {
                Some(nonce) if nonce.len() == GCM_NONCE_BYTES => nonce.to_vec(),
                _ => return Err(KeymasterError::InvalidNonce),
            },
        };

        let op = SoftOperation {
            purpose,
            key,
            nonce,
            input: Zeroizing::new(Vec::new()),
            tag: None,
        };
        Ok((Box::new(op), out_params))
    }

    fn upgrade_key(&self, key_blob: &[u8], params: &AuthorizationSet) -> KeymasterResult<Vec<u8>> {
        let blob = SoftKeyBlob::decode(key_blob)?;
        if blob.format_version >= self.blob_version() {
            return Err(KeymasterError::InvalidOperation(
                "key blob is already current".into(),
            ));
        }
        let app_id = params.application_id().unwrap_or_default();
        let key = self.unseal(&blob, app_id)?;
        debug!(
            "Upgrading key blob from version {} to {}",
            blob.format_version,
            self.blob_version()
        );
        self.seal(blob.characteristics.clone(), app_id, key.as_bytes())
    }

    fn delete_key(&self, key_blob: &[u8]) -> KeymasterResult<()> {
        let blob = SoftKeyBlob::decode(key_blob)?;
        let mut revoked = self
            .revoked
            .lock()
            .map_err(|_| KeymasterError::Unavailable("revocation list poisoned".into()))?;
        if !revoked.insert(blob.key_id) {
            return Err(KeymasterError::InvalidKeyBlob);
        }
        Ok(())
    }
}

/// AES-GCM operation on an unsealed key.
///
/// Encryption is single-shot: the first update produces the whole
/// ciphertext and `finish` returns the tag. Decryption buffers input until
/// `finish`, which only releases plaintext once the tag verifies.
struct SoftOperation {
    purpose: KeyPurpose,
    key: DerivedKey,
    nonce: Vec<u8>,
    input: Zeroizing<Vec<u8>>,
    tag: Option<[u8; GCM_MAC_BYTES]>,
}

impl SoftOperation {
    fn encrypt(&mut self, plaintext: &[u8]) -> KeymasterResult<Vec<u8>> {
        if self.tag.is_some() {
            return Err(KeymasterError::InvalidOperation(
                "encryption accepts a single update".into(),
            ));
        }
        let (body, tag) = self
            .key
            .seal_with_nonce(&self.nonce, plaintext, &[])
            .map_err(unavailable)?;
        self.tag = Some(tag);
        Ok(body)
    }
}

impl Operation for SoftOperation {
    fn update(&mut self, input: &[u8]) -> KeymasterResult<(usize, Vec<u8>)> {
        match self.purpose {
            KeyPurpose::Encrypt => Ok((input.len(), self.encrypt(input)?)),
            KeyPurpose::Decrypt => {
                self.input.extend_from_slice(input);
                Ok((input.len(), Vec::new()))
            }
        }
    }

    fn finish(&mut self) -> KeymasterResult<Vec<u8>> {
        match self.purpose {
            KeyPurpose::Encrypt => {
                if self.tag.is_none() {
                    self.encrypt(&[])?;
                }
                Ok(self.tag.map(|tag| tag.to_vec()).unwrap_or_default())
            }
            KeyPurpose::Decrypt => {
                let mut sealed = Zeroizing::new(self.nonce.clone());
                sealed.extend_from_slice(&self.input);
                let plaintext = self
                    .key
                    .open(&sealed, &[])
                    .map_err(|_| KeymasterError::VerificationFailed)?;
                self.input.zeroize();
                Ok(plaintext.expose_secret().to_vec())
            }
        }
    }

    fn abort(&mut self) {
        self.input.zeroize();
        self.tag = None;
    }
}
