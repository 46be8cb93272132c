use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce, Tag};
use hkdf::Hkdf;
use rand::TryRngCore;
use rand::rngs::OsRng;
use secrecy::{ExposeSecret, SecretSlice};
use tracing::error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::app_id::{HASH_PREFIX_KEYGEN, hash_with_prefix};
use crate::error::{Error, Result};

pub const AES_KEY_BYTES: usize = 32;
pub const GCM_NONCE_BYTES: usize = 12;
pub const GCM_MAC_BYTES: usize = 16;

/// Fills a fresh buffer of `count` bytes from the operating system RNG.
pub fn random_bytes(count: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; count];
    OsRng.try_fill_bytes(&mut buf).map_err(|e| {
        error!("Random read failed: {}", e);
        Error::Random(e.to_string())
    })?;
    Ok(buf)
}

/// The root key of a software keymaster.
///
/// Every key blob the keymaster issues is sealed under a key derived from
/// this one, so it must be kept at least as safe as the keys it protects.
/// With the `tpm` feature it can be sealed to a TPM between runs.
pub struct MasterKey {
    key: SecretSlice<u8>,
}

impl MasterKey {
    pub fn generate() -> Result<Self> {
        let key = Zeroizing::new(random_bytes(AES_KEY_BYTES)?);
        Self::from_slice(&key)
    }

    pub fn from_slice(key: &[u8]) -> Result<Self> {
        if key.len() != AES_KEY_BYTES {
            return Err(Error::wrong_size("master key", AES_KEY_BYTES, key.len()));
        }
        Ok(Self {
            key: SecretSlice::from(key.to_vec()),
        })
    }

    pub fn key(&self) -> &SecretSlice<u8> {
        &self.key
    }

    /// Derives a 256-bit subkey with HKDF-SHA256.
    pub fn derive(&self, salt: &[u8], info: &[u8]) -> Result<DerivedKey> {
        let mut key = [0u8; AES_KEY_BYTES];
        let hkdf = Hkdf::<sha2::Sha256>::new(Some(salt), self.key.expose_secret());
        hkdf.expand(info, &mut key)
            .map_err(|e| Error::Encryption(format!("hkdf expansion failed: {e}")))?;
        let derived = DerivedKey { key };
        key.zeroize();
        Ok(derived)
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// A 256-bit AES key, zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey {
    key: [u8; AES_KEY_BYTES],
}

impl DerivedKey {
    /// The software wrapping key for an application id: the personalised
    /// SHA-512 of the app id, truncated to AES-256 size.
    pub fn for_app_id(app_id: &SecretSlice<u8>) -> Self {
        let digest = hash_with_prefix(HASH_PREFIX_KEYGEN, app_id.expose_secret());
        let mut key = [0u8; AES_KEY_BYTES];
        key.copy_from_slice(&digest[..AES_KEY_BYTES]);
        let derived = Self { key };
        key.zeroize();
        derived
    }

    pub fn from_bytes(key: [u8; AES_KEY_BYTES]) -> Self {
        Self { key }
    }

    pub(crate) fn as_bytes(&self) -> &[u8; AES_KEY_BYTES] {
        &self.key
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.key).map_err(|e| Error::Encryption(e.to_string()))
    }

    /// AES-256-GCM under a fresh random nonce; returns `nonce || ciphertext || tag`.
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let nonce = random_bytes(GCM_NONCE_BYTES)?;
        let (body, tag) = self.seal_with_nonce(&nonce, plaintext, aad)?;
        let mut out = Vec::with_capacity(GCM_NONCE_BYTES + body.len() + GCM_MAC_BYTES);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&body);
        out.extend_from_slice(&tag);
        Ok(out)
    }

    /// AES-256-GCM under a caller-chosen nonce; returns ciphertext and tag separately.
    pub fn seal_with_nonce(
        &self,
        nonce: &[u8],
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<(Vec<u8>, [u8; GCM_MAC_BYTES])> {
        if nonce.len() != GCM_NONCE_BYTES {
            return Err(Error::wrong_size("nonce", GCM_NONCE_BYTES, nonce.len()));
        }
        let mut body = plaintext.to_vec();
        let tag = self
            .cipher()?
            .encrypt_in_place_detached(Nonce::from_slice(nonce), aad, &mut body)
            .map_err(|e| {
                body.zeroize();
                error!("GCM encryption failed: {}", e);
                Error::Encryption(e.to_string())
            })?;
        let mut tag_bytes = [0u8; GCM_MAC_BYTES];
        tag_bytes.copy_from_slice(&tag);
        Ok((body, tag_bytes))
    }

    /// Reverses [`DerivedKey::seal`]. Any failure is reported as
    /// [`Error::DecryptionFailed`] without further detail.
    pub fn open(&self, ciphertext: &[u8], aad: &[u8]) -> Result<SecretSlice<u8>> {
        if ciphertext.len() < GCM_NONCE_BYTES + GCM_MAC_BYTES {
            error!("GCM ciphertext too small: {}", ciphertext.len());
            return Err(Error::CiphertextTooShort(ciphertext.len()));
        }
        let (nonce, rest) = ciphertext.split_at(GCM_NONCE_BYTES);
        let (body, tag) = rest.split_at(rest.len() - GCM_MAC_BYTES);
        let mut plaintext = body.to_vec();
        match self.cipher()?.decrypt_in_place_detached(
            Nonce::from_slice(nonce),
            aad,
            &mut plaintext,
            Tag::from_slice(tag),
        ) {
            Ok(()) => Ok(SecretSlice::from(plaintext)),
            Err(_) => {
                plaintext.zeroize();
                error!("GCM decryption failed");
                Err(Error::DecryptionFailed)
            }
        }
    }
}

/// Encrypts `plaintext` with a key derived directly from the app id.
///
/// Used for keys that are not bound to a keymaster. The output is
/// `nonce || ciphertext || tag` with no associated data.
pub fn encrypt_without_keymaster(app_id: &SecretSlice<u8>, plaintext: &[u8]) -> Result<Vec<u8>> {
    let key = DerivedKey::for_app_id(app_id);
    let ciphertext = key.seal(plaintext, &[])?;
    crate::error::check_size(
        "ciphertext",
        ciphertext.len(),
        GCM_NONCE_BYTES + plaintext.len() + GCM_MAC_BYTES,
    )?;
    Ok(ciphertext)
}

/// Decrypts the output of [`encrypt_without_keymaster`].
pub fn decrypt_without_keymaster(
    app_id: &SecretSlice<u8>,
    ciphertext: &[u8],
) -> Result<SecretSlice<u8>> {
    DerivedKey::for_app_id(app_id).open(ciphertext, &[])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app_id(bytes: &[u8]) -> SecretSlice<u8> {
        SecretSlice::from(bytes.to_vec())
    }

    #[test]
    fn random_bytes_are_fresh() {
        let a = random_bytes(32).unwrap();
        let b = random_bytes(32).unwrap();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }

    #[test]
    fn master_key_rejects_wrong_length() {
        assert!(MasterKey::from_slice(&[0u8; 16]).is_err());
        assert!(MasterKey::from_slice(&[0u8; 32]).is_ok());
    }

    #[test]
    fn derive_is_deterministic_per_salt_and_info() {
        let master = MasterKey::from_slice(&[7u8; 32]).unwrap();
        let a = master.derive(b"salt", b"info").unwrap();
        let b = master.derive(b"salt", b"info").unwrap();
        let c = master.derive(b"other", b"info").unwrap();
        let d = master.derive(b"salt", b"other").unwrap();
        assert_eq!(a.key, b.key);
        assert_ne!(a.key, c.key);
        assert_ne!(a.key, d.key);
    }

    #[test]
    fn software_wrap_layout() {
        let id = app_id(b"some app id");
        let key = [0x5Au8; 32];
        let ciphertext = encrypt_without_keymaster(&id, &key).unwrap();
        assert_eq!(ciphertext.len(), GCM_NONCE_BYTES + 32 + GCM_MAC_BYTES);
        let recovered = decrypt_without_keymaster(&id, &ciphertext).unwrap();
        assert_eq!(recovered.expose_secret(), &key[..]);
    }

    #[test]
    fn nonces_differ_between_encryptions() {
        let id = app_id(b"app");
        let a = encrypt_without_keymaster(&id, b"key").unwrap();
        let b = encrypt_without_keymaster(&id, b"key").unwrap();
        assert_ne!(a[..GCM_NONCE_BYTES], b[..GCM_NONCE_BYTES]);
    }

    #[test]
    fn wrong_app_id_fails_closed() {
        let ciphertext = encrypt_without_keymaster(&app_id(b"right"), b"key").unwrap();
        assert!(matches!(
            decrypt_without_keymaster(&app_id(b"wrong"), &ciphertext),
            Err(Error::DecryptionFailed)
        ));
    }

    #[test]
    fn every_flipped_byte_is_detected() {
        let id = app_id(b"app");
        let ciphertext = encrypt_without_keymaster(&id, b"0123456789").unwrap();
        for i in 0..ciphertext.len() {
            let mut tampered = ciphertext.clone();
            tampered[i] ^= 0x01;
            assert!(
                decrypt_without_keymaster(&id, &tampered).is_err(),
                "flip at {i} went unnoticed"
            );
        }
    }

    #[test]
    fn short_ciphertext_is_rejected() {
        let id = app_id(b"app");
        assert!(matches!(
            decrypt_without_keymaster(&id, &[0u8; 27]),
            Err(Error::CiphertextTooShort(27))
        ));
    }

    #[test]
    fn aad_is_authenticated() {
        let key = DerivedKey::from_bytes([3u8; 32]);
        let sealed = key.seal(b"material", b"context a").unwrap();
        assert!(key.open(&sealed, b"context a").is_ok());
        assert!(key.open(&sealed, b"context b").is_err());
    }
}
