//! Wrapping a key with a keymaster-held key.
//!
//! The wrapping key is generated inside the keymaster and bound to the app id,
//! so the stored blob is useless without both the keymaster and the
//! credentials. When the keymaster reports that a blob is stale, [`begin`]
//! upgrades it in place and retries.

use secrecy::{ExposeSecret, SecretSlice};
use tracing::{debug, error, info};
use zeroize::Zeroizing;

use crate::auth::{HardwareAuthToken, KeyAuthentication};
use crate::crypt::{GCM_MAC_BYTES, GCM_NONCE_BYTES};
use crate::error::{Error, Result, check_size};
use crate::keymaster::{
    AuthorizationSet, BlockMode, HardwareAuthenticatorType, KeyParameter, KeyPurpose, Keymaster,
    KeymasterError, KeymasterOperation, PaddingMode,
};
use crate::layout::{FILE_KEYMASTER_KEY_BLOB, FILE_KEYMASTER_KEY_BLOB_UPGRADED, KeyDir};

/// Seconds a password authentication stays valid for a key.
pub const AUTH_TIMEOUT_SECS: u32 = 30;

const GCM_MAC_BITS: u32 = (GCM_MAC_BYTES * 8) as u32;
const AES_KEY_BITS: u32 = 256;

/// Parameters for a new wrapping key bound to `app_id`.
///
/// Without a token the key is usable without authentication. With one, the
/// key is tied to the token's user and needs a password authentication no
/// older than [`AUTH_TIMEOUT_SECS`].
pub fn key_generation_params(
    auth: &KeyAuthentication,
    app_id: &SecretSlice<u8>,
) -> Result<AuthorizationSet> {
    let mut params = AuthorizationSet::new()
        .aes_encryption_key(AES_KEY_BITS)
        .with(KeyParameter::BlockMode(BlockMode::Gcm))
        .with(KeyParameter::MinMacLength(GCM_MAC_BITS))
        .with(KeyParameter::Padding(PaddingMode::None))
        .with(KeyParameter::ApplicationId(app_id.expose_secret().to_vec()));
    if auth.token().is_empty() {
        debug!("Creating key that doesn't need auth token");
        params.push(KeyParameter::NoAuthRequired);
    } else {
        debug!("Auth token required for key");
        let token = HardwareAuthToken::parse(auth.token())?;
        params.push(KeyParameter::UserSecureId(token.user_id));
        params.push(KeyParameter::UserAuthType(
            HardwareAuthenticatorType::Password,
        ));
        params.push(KeyParameter::AuthTimeout(AUTH_TIMEOUT_SECS));
    }
    Ok(params)
}

/// Generates a wrapping key and returns its blob.
pub fn generate_keymaster_key(
    keymaster: &dyn Keymaster,
    auth: &KeyAuthentication,
    app_id: &SecretSlice<u8>,
) -> Result<Vec<u8>> {
    let params = key_generation_params(auth, app_id)?;
    keymaster.generate_key(&params).map_err(|e| {
        error!("Keymaster key generation failed: {}", e);
        Error::from(e)
    })
}

/// Parameters supplied with every operation on a wrapping key.
pub fn begin_params(auth: &KeyAuthentication, app_id: &SecretSlice<u8>) -> AuthorizationSet {
    let mut params = AuthorizationSet::new()
        .with(KeyParameter::BlockMode(BlockMode::Gcm))
        .with(KeyParameter::MacLength(GCM_MAC_BITS))
        .with(KeyParameter::Padding(PaddingMode::None))
        .with(KeyParameter::ApplicationId(app_id.expose_secret().to_vec()));
    if !auth.token().is_empty() {
        debug!("Supplying auth token to Keymaster");
        params.push(KeyParameter::AuthToken(auth.token().to_vec()));
    }
    params
}

/// Begins an operation on the key stored in `dir`, upgrading the stored blob
/// as often as the keymaster asks.
///
/// An upgraded blob is committed by atomic rename before the old key is
/// deleted; failing to delete the old key is logged and ignored.
pub fn begin(
    keymaster: &dyn Keymaster,
    dir: &KeyDir,
    purpose: KeyPurpose,
    key_params: &AuthorizationSet,
    op_params: &AuthorizationSet,
) -> Result<(KeymasterOperation, AuthorizationSet)> {
    let mut key_blob = dir.read(FILE_KEYMASTER_KEY_BLOB)?;
    let mut in_params = key_params.clone();
    in_params.extend(op_params);
    loop {
        match keymaster.begin(purpose, &key_blob, &in_params) {
            Ok((op, out_params)) => return Ok((KeymasterOperation::new(op), out_params)),
            Err(KeymasterError::KeyRequiresUpgrade) => {}
            Err(e) => {
                error!("Keymaster begin failed: {}", e);
                return Err(e.into());
            }
        }
        debug!("Upgrading key: {}", dir.path().display());
        let upgraded = keymaster.upgrade_key(&key_blob, key_params).map_err(|e| {
            error!("Keymaster key upgrade failed: {}", e);
            Error::from(e)
        })?;
        dir.replace_atomically(
            FILE_KEYMASTER_KEY_BLOB,
            FILE_KEYMASTER_KEY_BLOB_UPGRADED,
            &upgraded,
        )?;
        if let Err(e) = keymaster.delete_key(&key_blob) {
            error!(
                "Key deletion failed during upgrade, continuing anyway: {}: {}",
                dir.path().display(),
                e
            );
        }
        key_blob = upgraded;
        info!("Key upgraded: {}", dir.path().display());
    }
}

/// Encrypts `message` under the wrapping key in `dir`.
///
/// Returns `nonce || ciphertext || tag`, with the nonce chosen by the
/// keymaster. A nonce, body or tag of the wrong length is an error.
pub fn encrypt_with_keymaster_key(
    keymaster: &dyn Keymaster,
    dir: &KeyDir,
    key_params: &AuthorizationSet,
    message: &[u8],
) -> Result<Vec<u8>> {
    let (mut op, out_params) = begin(
        keymaster,
        dir,
        KeyPurpose::Encrypt,
        key_params,
        &AuthorizationSet::new(),
    )?;
    let Some(nonce) = out_params.nonce() else {
        error!("GCM encryption but no nonce generated");
        return Err(Error::MissingNonce);
    };
    check_size("nonce", nonce.len(), GCM_NONCE_BYTES)?;

    let mut ciphertext = nonce.to_vec();
    op.update_completely(message, &mut ciphertext)?;
    check_size(
        "ciphertext",
        ciphertext.len(),
        GCM_NONCE_BYTES + message.len(),
    )?;
    let tag = op.finish().map_err(|e| {
        error!("Keymaster finish failed: {}", e);
        Error::from(e)
    })?;
    check_size("mac", tag.len(), GCM_MAC_BYTES)?;
    ciphertext.extend_from_slice(&tag);
    Ok(ciphertext)
}

/// Decrypts the output of [`encrypt_with_keymaster_key`].
///
/// A blob the keymaster will not open for this app id and a tag that does
/// not verify both surface as [`Error::DecryptionFailed`], the same outcome
/// as a wrong credential on the software path.
pub fn decrypt_with_keymaster_key(
    keymaster: &dyn Keymaster,
    dir: &KeyDir,
    key_params: &AuthorizationSet,
    ciphertext: &[u8],
) -> Result<SecretSlice<u8>> {
    if ciphertext.len() < GCM_NONCE_BYTES + GCM_MAC_BYTES {
        error!("GCM ciphertext too small: {}", ciphertext.len());
        return Err(Error::CiphertextTooShort(ciphertext.len()));
    }
    let (nonce, body_and_mac) = ciphertext.split_at(GCM_NONCE_BYTES);
    let op_params = AuthorizationSet::new().with(KeyParameter::Nonce(nonce.to_vec()));
    let (mut op, _) =
        begin(keymaster, dir, KeyPurpose::Decrypt, key_params, &op_params).map_err(opaque)?;

    let mut plaintext = Zeroizing::new(Vec::new());
    op.update_completely(body_and_mac, &mut plaintext)
        .map_err(|e| opaque(e.into()))?;
    let tail = Zeroizing::new(op.finish().map_err(|e| opaque(e.into()))?);
    plaintext.extend_from_slice(&tail);
    Ok(SecretSlice::from(plaintext.to_vec()))
}

fn opaque(e: Error) -> Error {
    match e {
        Error::Keymaster(KeymasterError::InvalidKeyBlob)
        | Error::Keymaster(KeymasterError::VerificationFailed) => Error::DecryptionFailed,
        other => other,
    }
}
