//! A random number generator backed by a TPM 2.0 device.
//!
//! TPM commands can fail, so [`TpmRand`] implements the fallible
//! [`TryRngCore`] rather than [`rand_core::RngCore`].

use rand_core::{TryCryptoRng, TryRngCore};
use tss_esapi::Context;

/// Largest request a TPM is guaranteed to serve in one `TPM2_GetRandom`.
const MAX_TPM_RANDOM_BUF: usize = 32;

pub struct TpmRand {
    tpm_context: Context,
}

impl TpmRand {
    pub fn new(ctx: Context) -> Self {
        Self { tpm_context: ctx }
    }

    pub fn into_inner(self) -> Context {
        self.tpm_context
    }

    fn read<const N: usize>(&mut self) -> Result<[u8; N], tss_esapi::Error> {
        let mut buf = [0u8; N];
        self.try_fill_bytes(&mut buf)?;
        Ok(buf)
    }
}

impl TryRngCore for TpmRand {
    type Error = tss_esapi::Error;

    fn try_next_u32(&mut self) -> Result<u32, Self::Error> {
        Ok(u32::from_le_bytes(self.read()?))
    }

    fn try_next_u64(&mut self) -> Result<u64, Self::Error> {
        Ok(u64::from_le_bytes(self.read()?))
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), Self::Error> {
        for chunk in dest.chunks_mut(MAX_TPM_RANDOM_BUF) {
            let random = self.tpm_context.get_random(chunk.len())?;
            let bytes = random.value();
            if bytes.len() < chunk.len() {
                return Err(tss_esapi::Error::WrapperError(
                    tss_esapi::WrapperErrorKind::WrongParamSize,
                ));
            }
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
        Ok(())
    }
}

impl TryCryptoRng for TpmRand {}

#[cfg(test)]
mod tests {
    use super::*;
    use tss_esapi::TctiNameConf;
    use tss_esapi::tcti_ldr::NetworkTPMConfig;

    fn rng() -> TpmRand {
        let tcti = TctiNameConf::from_environment_variable()
            .unwrap_or_else(|_| TctiNameConf::Swtpm(NetworkTPMConfig::default()));
        TpmRand::new(Context::new(tcti).unwrap())
    }

    #[test]
    fn fills_buffers_longer_than_one_request() {
        let mut rng = rng();
        let mut buf = [0u8; 100];
        rng.try_fill_bytes(&mut buf).unwrap();
        assert!(buf.iter().any(|b| *b != 0));
    }

    #[test]
    fn consecutive_words_differ() {
        let mut rng = rng();
        let a = rng.try_next_u64().unwrap();
        let b = rng.try_next_u64().unwrap();
        assert_ne!(a, b);
    }
}
