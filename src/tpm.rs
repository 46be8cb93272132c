//! Sealing the software keymaster's root key to a TPM 2.0 device.
//!
//! The [`MasterKey`] is encrypted by a child key created under a primary key
//! in the owner hierarchy. The primary is re-derived from the same template on
//! every run, so only the child's public/private blobs and the ciphertext need
//! to be stored. AES-128-CFB is used when the TPM supports it, RSA-2048
//! otherwise.

use std::fs;
use std::io::Write;
use std::path::Path;

use bincode::{Decode, Encode};
use rand::TryRngCore;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use tpm2_rand::TpmRand;
use tracing::{debug, error, info, instrument, trace};
use tss_esapi::attributes::ObjectAttributesBuilder;
use tss_esapi::constants::{AlgorithmIdentifier, CapabilityType};
use tss_esapi::handles::KeyHandle;
use tss_esapi::interface_types::algorithm::{HashingAlgorithm, PublicAlgorithm, SymmetricMode};
use tss_esapi::interface_types::key_bits::{AesKeyBits, RsaKeyBits};
use tss_esapi::interface_types::resource_handles::Hierarchy;
use tss_esapi::structures::{
    CapabilityData, Data, Digest, InitialValue, MaxBuffer, Private, Public, PublicBuilder,
    PublicKeyRsa, PublicRsaParametersBuilder, RsaDecryptionScheme, RsaExponent, RsaScheme,
    SymmetricCipherParameters, SymmetricDefinitionObject,
};
use tss_esapi::traits::{Marshall, UnMarshall};
use tss_esapi::{Context, TctiNameConf, WrapperErrorKind};
use zeroize::Zeroizing;

use crate::crypt::{AES_KEY_BYTES, MasterKey};
use crate::error::{Error, Result};

const RSA_KEY_BITS: u16 = 2048;

/// The TCTI named in the environment, or the local device.
pub fn default_tcti() -> TctiNameConf {
    TctiNameConf::from_environment_variable()
        .unwrap_or_else(|_| TctiNameConf::Device(Default::default()))
}

fn wrapper_error(kind: WrapperErrorKind) -> tss_esapi::Error {
    tss_esapi::Error::WrapperError(kind)
}

/// How the master key ciphertext was produced.
#[derive(Serialize, Deserialize, Encode, Decode, Debug, Clone, PartialEq, Eq)]
pub enum SealScheme {
    Aes128Cfb { iv: Vec<u8> },
    Rsa2048,
}

/// A [`MasterKey`] encrypted by a TPM-resident key.
#[derive(Serialize, Deserialize, Encode, Decode, Debug, Clone)]
pub struct SealedMasterKey {
    pub scheme: SealScheme,
    /// Marshalled `TPM2B_PUBLIC` of the sealing key.
    pub public_key: Vec<u8>,
    /// `TPM2B_PRIVATE` of the sealing key, only loadable by the same TPM.
    pub private_key_blob: Vec<u8>,
    pub encrypted_key: Vec<u8>,
}

impl SealedMasterKey {
    #[instrument(level = "debug", skip_all)]
    pub fn seal(master_key: &MasterKey, ctx: Context) -> Result<Self> {
        let mut sealer = TpmSealer::new(ctx)?;
        let (public, private) = sealer.generate_child()?;
        let (encrypted_key, scheme) = sealer.encrypt(master_key.key().expose_secret())?;
        Ok(Self {
            scheme,
            public_key: public.marshall()?,
            private_key_blob: private.value().to_vec(),
            encrypted_key,
        })
    }

    #[instrument(level = "debug", skip_all)]
    pub fn unseal(&self, ctx: Context) -> Result<MasterKey> {
        let mut sealer = TpmSealer::new(ctx)?;
        let public = Public::unmarshall(&self.public_key)?;
        let private = Private::try_from(self.private_key_blob.clone())
            .map_err(|_| wrapper_error(WrapperErrorKind::InvalidParam))?;
        sealer.load_child(public, private)?;
        let key = Zeroizing::new(sealer.decrypt(&self.encrypted_key, &self.scheme)?);
        MasterKey::from_slice(&key)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (sealed, _) = bincode::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(sealed)
    }
}

/// Generates a master key from the TPM's random number generator.
pub fn generate_master_key(ctx: Context) -> Result<MasterKey> {
    let mut rng = TpmRand::new(ctx);
    let mut key = Zeroizing::new([0u8; AES_KEY_BYTES]);
    rng.try_fill_bytes(key.as_mut_slice())?;
    MasterKey::from_slice(key.as_slice())
}

/// Unseals the master key stored at `path`, or creates, seals and stores a
/// new one if there is none.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn load_or_create_master_key(path: &Path, tcti: TctiNameConf) -> Result<MasterKey> {
    if path.exists() {
        let bytes = fs::read(path).map_err(|e| Error::io(path, e))?;
        let sealed = SealedMasterKey::from_bytes(&bytes)?;
        debug!("Unsealing master key with {:?}", sealed.scheme);
        return sealed.unseal(Context::new(tcti)?);
    }

    info!("No sealed master key, generating one");
    let master_key = generate_master_key(Context::new(tcti.clone())?)?;
    let sealed = SealedMasterKey::seal(&master_key, Context::new(tcti)?)?;
    write_private(path, &sealed.to_bytes()?)?;
    Ok(master_key)
}

fn write_private(path: &Path, data: &[u8]) -> Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let written = options.open(path).and_then(|mut file| {
        file.write_all(data)?;
        file.sync_all()
    });
    written.map_err(|e| {
        error!("Failed to write sealed master key to {}: {}", path.display(), e);
        Error::io(path, e)
    })
}

/// Whether the TPM implements both AES and CFB mode.
pub fn is_aes_supported(ctx: &mut Context) -> std::result::Result<bool, tss_esapi::Error> {
    let (data, _) = ctx.get_capability(CapabilityType::Algorithms, 0, 50)?;
    let CapabilityData::Algorithms(algorithms) = data else {
        error!("Unexpected capability data type: {:?}", data);
        return Err(wrapper_error(WrapperErrorKind::UnsupportedParam));
    };
    let has = |id: AlgorithmIdentifier| algorithms.iter().any(|a| a.algorithm_identifier() == id);
    Ok(has(AlgorithmIdentifier::Aes) && has(AlgorithmIdentifier::Cfb))
}

/// A primary key plus at most one loaded child key used for sealing.
struct TpmSealer {
    ctx: Context,
    primary: KeyHandle,
    child: Option<KeyHandle>,
}

impl TpmSealer {
    fn new(mut ctx: Context) -> Result<Self> {
        let primary = if is_aes_supported(&mut ctx)? {
            debug!("Creating AES primary key in TPM");
            create_primary(&mut ctx, aes_primary_template()?)?
        } else {
            debug!("Creating RSA primary key in TPM");
            create_primary(&mut ctx, rsa_primary_template()?)?
        };
        Ok(Self {
            ctx,
            primary,
            child: None,
        })
    }

    fn child(&self) -> std::result::Result<KeyHandle, tss_esapi::Error> {
        self.child.ok_or_else(|| {
            error!("No sealing key loaded");
            wrapper_error(WrapperErrorKind::ParamsMissing)
        })
    }

    fn key_type(&mut self, handle: KeyHandle) -> std::result::Result<PublicAlgorithm, tss_esapi::Error> {
        let (public, _, _) = self
            .ctx
            .execute_with_nullauth_session(|ctx| ctx.read_public(handle))?;
        Ok(match public {
            Public::SymCipher { .. } => PublicAlgorithm::SymCipher,
            Public::Rsa { .. } => PublicAlgorithm::Rsa,
            Public::Ecc { .. } => PublicAlgorithm::Ecc,
            Public::KeyedHash { .. } => PublicAlgorithm::KeyedHash,
        })
    }

    /// Creates and loads a child key matching the primary's algorithm.
    fn generate_child(&mut self) -> Result<(Public, Private)> {
        let template = match self.key_type(self.primary)? {
            PublicAlgorithm::SymCipher => aes_child_template()?,
            PublicAlgorithm::Rsa => rsa_child_template()?,
            other => {
                error!("Unsupported primary key algorithm: {:?}", other);
                return Err(wrapper_error(WrapperErrorKind::UnsupportedParam).into());
            }
        };
        let primary = self.primary;
        let created = self.ctx.execute_with_nullauth_session(|ctx| {
            ctx.create(primary, template, None, None, None, None)
        })?;
        trace!(
            "Sealing key created, private blob is {} bytes",
            created.out_private.value().len()
        );
        self.load_child(created.out_public.clone(), created.out_private.clone())?;
        Ok((created.out_public, created.out_private))
    }

    fn load_child(&mut self, public: Public, private: Private) -> Result<()> {
        let primary = self.primary;
        let handle = self
            .ctx
            .execute_with_nullauth_session(|ctx| ctx.load(primary, private, public))?;
        self.child = Some(handle);
        Ok(())
    }

    fn encrypt(&mut self, plaintext: &[u8]) -> Result<(Vec<u8>, SealScheme)> {
        let child = self.child()?;
        match self.key_type(child)? {
            PublicAlgorithm::SymCipher => {
                let (ciphertext, iv) = self.aes_encrypt(child, plaintext)?;
                Ok((ciphertext, SealScheme::Aes128Cfb { iv }))
            }
            PublicAlgorithm::Rsa => Ok((self.rsa_encrypt(child, plaintext)?, SealScheme::Rsa2048)),
            other => {
                error!("Unsupported sealing key algorithm: {:?}", other);
                Err(wrapper_error(WrapperErrorKind::UnsupportedParam).into())
            }
        }
    }

    fn decrypt(&mut self, ciphertext: &[u8], scheme: &SealScheme) -> Result<Vec<u8>> {
        let child = self.child()?;
        match scheme {
            SealScheme::Aes128Cfb { iv } => self.aes_decrypt(child, ciphertext, iv),
            SealScheme::Rsa2048 => self.rsa_decrypt(child, ciphertext),
        }
    }

    /// CFB is a stream mode, so no padding is applied.
    fn aes_encrypt(&mut self, key: KeyHandle, plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
        let iv = self.ctx.execute_with_nullauth_session(|ctx| {
            ctx.get_random(InitialValue::MAX_SIZE).and_then(|random| {
                InitialValue::try_from(random.to_vec())
                    .map_err(|_| wrapper_error(WrapperErrorKind::InvalidParam))
            })
        })?;
        let data = MaxBuffer::try_from(plaintext.to_vec())?;
        let (encrypted, _) = self.ctx.execute_with_nullauth_session(|ctx| {
            ctx.encrypt_decrypt_2(key, false, SymmetricMode::Cfb, data, iv.clone())
        })?;
        Ok((encrypted.to_vec(), iv.value().to_vec()))
    }

    fn aes_decrypt(&mut self, key: KeyHandle, ciphertext: &[u8], iv: &[u8]) -> Result<Vec<u8>> {
        let iv = InitialValue::try_from(iv.to_vec())?;
        let data = MaxBuffer::try_from(ciphertext.to_vec())?;
        let (decrypted, _) = self.ctx.execute_with_nullauth_session(|ctx| {
            ctx.encrypt_decrypt_2(key, true, SymmetricMode::Cfb, data, iv)
        })?;
        Ok(decrypted.to_vec())
    }

    fn rsa_encrypt(&mut self, key: KeyHandle, plaintext: &[u8]) -> Result<Vec<u8>> {
        let message = PublicKeyRsa::try_from(plaintext.to_vec())?;
        let encrypted = self.ctx.execute_with_nullauth_session(|ctx| {
            ctx.rsa_encrypt(key, message, RsaDecryptionScheme::RsaEs, Data::default())
        })?;
        Ok(encrypted.value().to_vec())
    }

    fn rsa_decrypt(&mut self, key: KeyHandle, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let ciphertext = PublicKeyRsa::try_from(ciphertext.to_vec())?;
        let decrypted = self.ctx.execute_with_nullauth_session(|ctx| {
            ctx.rsa_decrypt(key, ciphertext, RsaDecryptionScheme::RsaEs, Data::default())
        })?;
        Ok(decrypted.value().to_vec())
    }
}

fn create_primary(ctx: &mut Context, template: Public) -> Result<KeyHandle> {
    let result = ctx.execute_with_nullauth_session(|ctx| {
        ctx.create_primary(Hierarchy::Owner, template, None, None, None, None)
    })?;
    Ok(result.key_handle)
}

/// Restricted AES-128-CFB storage primary. Sign must be clear for a
/// symmetric primary.
fn aes_primary_template() -> Result<Public> {
    let attributes = ObjectAttributesBuilder::new()
        .with_fixed_tpm(true)
        .with_fixed_parent(true)
        .with_sensitive_data_origin(true)
        .with_user_with_auth(true)
        .with_decrypt(true)
        .with_restricted(true)
        .build()?;
    Ok(PublicBuilder::new()
        .with_public_algorithm(PublicAlgorithm::SymCipher)
        .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
        .with_object_attributes(attributes)
        .with_symmetric_cipher_parameters(SymmetricCipherParameters::new(
            SymmetricDefinitionObject::AES_128_CFB,
        ))
        .with_symmetric_cipher_unique_identifier(Digest::default())
        .build()?)
}

fn rsa_primary_template() -> Result<Public> {
    let attributes = ObjectAttributesBuilder::new()
        .with_fixed_tpm(true)
        .with_fixed_parent(true)
        .with_sensitive_data_origin(true)
        .with_user_with_auth(true)
        .with_restricted(true)
        .with_decrypt(true)
        .build()?;
    let params = PublicRsaParametersBuilder::new_restricted_decryption_key(
        SymmetricDefinitionObject::AES_128_CFB,
        RsaKeyBits::try_from(RSA_KEY_BITS)?,
        RsaExponent::default(),
    )
    .build()?;
    Ok(PublicBuilder::new()
        .with_public_algorithm(PublicAlgorithm::Rsa)
        .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
        .with_object_attributes(attributes)
        .with_rsa_parameters(params)
        .with_rsa_unique_identifier(PublicKeyRsa::default())
        .build()?)
}

/// Unrestricted AES-128-CFB key. Not `st_clear`: the sealed key must load
/// again after a reboot.
fn aes_child_template() -> Result<Public> {
    let attributes = ObjectAttributesBuilder::new()
        .with_fixed_tpm(true)
        .with_fixed_parent(true)
        .with_sensitive_data_origin(true)
        .with_user_with_auth(true)
        .with_sign_encrypt(true)
        .with_decrypt(true)
        .with_restricted(false)
        .build()?;
    Ok(PublicBuilder::new()
        .with_public_algorithm(PublicAlgorithm::SymCipher)
        .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
        .with_object_attributes(attributes)
        .with_symmetric_cipher_parameters(SymmetricCipherParameters::new(
            SymmetricDefinitionObject::Aes {
                key_bits: AesKeyBits::Aes128,
                mode: SymmetricMode::Cfb,
            },
        ))
        .with_symmetric_cipher_unique_identifier(Digest::default())
        .build()?)
}

/// Unrestricted RSA decryption key with a null scheme, so the scheme is
/// chosen per call.
fn rsa_child_template() -> Result<Public> {
    let attributes = ObjectAttributesBuilder::new()
        .with_fixed_tpm(true)
        .with_fixed_parent(true)
        .with_sensitive_data_origin(true)
        .with_user_with_auth(true)
        .with_decrypt(true)
        .build()?;
    let params = PublicRsaParametersBuilder::new()
        .with_scheme(RsaScheme::Null)
        .with_key_bits(RsaKeyBits::try_from(RSA_KEY_BITS)?)
        .with_exponent(RsaExponent::default())
        .with_symmetric(SymmetricDefinitionObject::Null)
        .with_is_signing_key(false)
        .with_is_decryption_key(true)
        .with_restricted(false)
        .build()?;
    Ok(PublicBuilder::new()
        .with_public_algorithm(PublicAlgorithm::Rsa)
        .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
        .with_object_attributes(attributes)
        .with_rsa_parameters(params)
        .with_rsa_unique_identifier(PublicKeyRsa::default())
        .build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::tempdir;
    use tracing_test::traced_test;
    use tss_esapi::tcti_ldr::NetworkTPMConfig;

    fn test_tcti() -> TctiNameConf {
        TctiNameConf::from_environment_variable()
            .unwrap_or_else(|_| TctiNameConf::Swtpm(NetworkTPMConfig::default()))
    }

    #[test]
    #[serial]
    #[traced_test]
    fn seal_then_unseal() {
        let master = MasterKey::generate().unwrap();
        let sealed = SealedMasterKey::seal(&master, Context::new(test_tcti()).unwrap()).unwrap();
        assert_ne!(sealed.encrypted_key, master.key().expose_secret().to_vec());

        let bytes = sealed.to_bytes().unwrap();
        let restored = SealedMasterKey::from_bytes(&bytes).unwrap();
        let unsealed = restored.unseal(Context::new(test_tcti()).unwrap()).unwrap();
        assert_eq!(
            unsealed.key().expose_secret(),
            master.key().expose_secret()
        );
    }

    #[test]
    #[serial]
    fn tpm_generated_master_keys_differ() {
        let a = generate_master_key(Context::new(test_tcti()).unwrap()).unwrap();
        let b = generate_master_key(Context::new(test_tcti()).unwrap()).unwrap();
        assert_ne!(a.key().expose_secret(), b.key().expose_secret());
    }

    #[test]
    #[serial]
    #[traced_test]
    fn master_key_file_is_reused() {
        let root = tempdir().unwrap();
        let path = root.path().join("master_key");
        let first = load_or_create_master_key(&path, test_tcti()).unwrap();
        assert!(logs_contain("No sealed master key, generating one"));
        let second = load_or_create_master_key(&path, test_tcti()).unwrap();
        assert_eq!(first.key().expose_secret(), second.key().expose_secret());
    }
}
