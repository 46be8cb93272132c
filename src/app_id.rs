//! Binding a stored key to its credentials and per-key randomness.

use secrecy::{ExposeSecret, SecretSlice};
use sha2::{Digest, Sha512};
use zeroize::Zeroizing;

use crate::auth::KeyAuthentication;
use crate::error::Result;
use crate::stretch::Stretching;

/// SHA-512 block size; hash prefixes are zero-padded to fill one block.
const SHA512_BLOCK_BYTES: usize = 128;

pub(crate) const HASH_PREFIX_SECDISCARDABLE: &str = "Ashura secdiscardable SHA512";
pub(crate) const HASH_PREFIX_KEYGEN: &str = "Ashura key wrapping key generation SHA512";

/// SHA-512 personalised with `prefix`.
///
/// The prefix is padded to a whole block so distinct prefixes can never
/// produce colliding inputs.
pub fn hash_with_prefix(prefix: &str, data: &[u8]) -> Zeroizing<[u8; 64]> {
    let mut block = [0u8; SHA512_BLOCK_BYTES];
    let prefix = prefix.as_bytes();
    let len = prefix.len().min(SHA512_BLOCK_BYTES);
    block[..len].copy_from_slice(&prefix[..len]);

    let mut hasher = Sha512::new();
    hasher.update(block);
    hasher.update(data);
    let mut out = Zeroizing::new([0u8; 64]);
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Computes the application id: the personalised hash of the secdiscardable
/// blob followed by the stretched secret.
///
/// The app id is never stored; only its inputs are.
pub fn generate_app_id(
    auth: &KeyAuthentication,
    stretching: &Stretching,
    salt: &[u8],
    secdiscardable: &[u8],
) -> Result<SecretSlice<u8>> {
    let stretched = stretching.stretch(auth.secret(), salt)?;
    let digest = hash_with_prefix(HASH_PREFIX_SECDISCARDABLE, secdiscardable);
    let mut app_id = Vec::with_capacity(digest.len() + stretched.expose_secret().len());
    app_id.extend_from_slice(digest.as_slice());
    app_id.extend_from_slice(stretched.expose_secret());
    Ok(SecretSlice::from(app_id))
}
