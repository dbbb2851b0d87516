/// Hardware root-of-trust binding for the password pipeline.
///
/// The concrete TPM driver is an external collaborator; this module only
/// fixes the interface the finalization step needs: which digest the device
/// advertises, and a keyed HMAC run inside the device. Binding a suite to a
/// TPM makes it unopenable on any other machine.
use crate::error::Result;

/// Digest algorithms a TPM can advertise, largest first in preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TpmDigest {
    Sha512,
    Sha384,
    Sha256,
}

impl TpmDigest {
    /// Output width in bytes.
    pub fn len(&self) -> usize {
        match self {
            TpmDigest::Sha512 => 64,
            TpmDigest::Sha384 => 48,
            TpmDigest::Sha256 => 32,
        }
    }
}

/// A hardware device that can HMAC with a device-resident secret.
pub trait HardwareBinding: Send + Sync {
    /// The largest digest the device advertises.
    fn best_digest(&self) -> TpmDigest;

    /// HMAC `message` under `key` with the given digest, inside the device.
    fn hmac(&self, digest: TpmDigest, key: &[u8], message: &[u8]) -> Result<Vec<u8>>;
}

/// Probe for a TPM driver.
///
/// No driver is linked into this build; callers requesting TPM binding get
/// `TpmUnavailable` from the pipeline. Platform driver crates can slot in
/// here without touching the pipeline.
pub fn detect() -> Option<Box<dyn HardwareBinding>> {
    None
}

/// In-memory stand-in for a TPM, for tests only: HMACs with a fixed
/// device secret so outputs are machine-stable within a test run.
#[cfg(test)]
pub struct FakeTpm {
    pub device_secret: [u8; 32],
    pub digest: TpmDigest,
}

#[cfg(test)]
impl HardwareBinding for FakeTpm {
    fn best_digest(&self) -> TpmDigest {
        self.digest
    }

    fn hmac(&self, digest: TpmDigest, key: &[u8], message: &[u8]) -> Result<Vec<u8>> {
        use hmac::{Hmac, Mac};
        use sha2::{Sha256, Sha384, Sha512};

        // Mix the device secret into the key the way a TPM's keyed object
        // would: the same inputs on a different device give different output.
        let mut device_key = self.device_secret.to_vec();
        device_key.extend_from_slice(key);

        let out = match digest {
            TpmDigest::Sha512 => {
                let mut mac = Hmac::<Sha512>::new_from_slice(&device_key)
                    .map_err(|e| crate::error::SetupError::KeyDerivation(e.to_string()))?;
                mac.update(message);
                mac.finalize().into_bytes().to_vec()
            }
            TpmDigest::Sha384 => {
                let mut mac = Hmac::<Sha384>::new_from_slice(&device_key)
                    .map_err(|e| crate::error::SetupError::KeyDerivation(e.to_string()))?;
                mac.update(message);
                mac.finalize().into_bytes().to_vec()
            }
            TpmDigest::Sha256 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(&device_key)
                    .map_err(|e| crate::error::SetupError::KeyDerivation(e.to_string()))?;
                mac.update(message);
                mac.finalize().into_bytes().to_vec()
            }
        };
        Ok(out)
    }
}
