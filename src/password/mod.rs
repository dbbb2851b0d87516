/// Password acquisition and the two-stage finalization KDF.
///
/// Acquire: a named environment variable, or stdin read to EOF with a hard
/// 255-byte cap. Finalize: PBKDF2-HMAC-SHA3-384 then Argon2id, both salted
/// with `HMAC-SHA3-512(password, password)`, a deterministic salt bound to
/// the password itself; the output keys an AEAD that uses a random nonce
/// per encryption. An optional TPM HMAC stage binds the result to a
/// hardware root of trust.
///
/// Every intermediate lives in a zero-on-drop buffer.
pub mod secret;
pub mod tpm;

use argon2::{Algorithm, Argon2, Params, Version};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use sha3::{Sha3_384, Sha3_512};
use tokio::io::AsyncReadExt;
use zeroize::Zeroize;

use crate::error::{Result, SetupError};
use secret::SecretVec;
use tpm::HardwareBinding;

/// Hard cap on a password read from stdin.
pub const MAX_PASSWORD_LEN: usize = 255;

/// PBKDF2 stage: SHA3-384 PRF, SHA-512-sized output.
pub const PBKDF2_ITERATIONS: u32 = 250_000;
/// Argon2id stage: ~46 MiB, single lane.
pub const ARGON2_MEMORY_KIB: u32 = 47_104;
pub const ARGON2_TIME_COST: u32 = 1;
pub const ARGON2_PARALLELISM: u32 = 1;
/// Both KDF stages emit this many bytes.
pub const STRETCHED_LEN: usize = 64;

/// Read the cleartext password.
///
/// With `env_var`, the variable's UTF-8 value is used verbatim. Otherwise
/// stdin is read to EOF; anything past 255 bytes fails `PasswordTooLong`.
pub async fn acquire(env_var: Option<&str>) -> Result<SecretVec> {
    if let Some(name) = env_var {
        let value = std::env::var(name)
            .map_err(|_| SetupError::Password(format!("environment variable {name} is unset")))?;
        return Ok(SecretVec::new(value.into_bytes()));
    }

    let mut buf = Vec::with_capacity(MAX_PASSWORD_LEN + 1);
    tokio::io::stdin()
        .take(MAX_PASSWORD_LEN as u64 + 1)
        .read_to_end(&mut buf)
        .await?;
    if buf.len() > MAX_PASSWORD_LEN {
        buf.zeroize();
        return Err(SetupError::PasswordTooLong(MAX_PASSWORD_LEN));
    }
    Ok(SecretVec::new(buf))
}

/// Stretch a password into the finalized suite secret.
///
/// Deterministic for a fixed password; with `binding`, additionally bound to
/// that specific device.
pub fn finalize(password: &SecretVec, binding: Option<&dyn HardwareBinding>) -> Result<SecretVec> {
    let params = Params::new(
        ARGON2_MEMORY_KIB,
        ARGON2_TIME_COST,
        ARGON2_PARALLELISM,
        Some(STRETCHED_LEN),
    )
    .map_err(|e| SetupError::KeyDerivation(e.to_string()))?;
    finalize_with(password, PBKDF2_ITERATIONS, params, binding)
}

fn finalize_with(
    password: &SecretVec,
    pbkdf2_iterations: u32,
    argon2_params: Params,
    binding: Option<&dyn HardwareBinding>,
) -> Result<SecretVec> {
    if password.is_empty() {
        return Err(SetupError::Password("empty password".to_string()));
    }

    let mut salt = self_salt(password.as_bytes())?;

    let mut stage1 = [0u8; STRETCHED_LEN];
    pbkdf2_hmac::<Sha3_384>(password.as_bytes(), &salt, pbkdf2_iterations, &mut stage1);

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);
    let mut stage2 = [0u8; STRETCHED_LEN];
    let derived = argon2.hash_password_into(&stage1, &salt, &mut stage2);
    stage1.zeroize();
    salt.zeroize();
    if let Err(e) = derived {
        stage2.zeroize();
        return Err(SetupError::KeyDerivation(e.to_string()));
    }

    let finalized = match binding {
        Some(device) => {
            let digest = device.best_digest();
            let bound = device.hmac(digest, &stage2, &stage2);
            stage2.zeroize();
            SecretVec::new(bound?)
        }
        None => {
            let out = SecretVec::new(stage2.to_vec());
            stage2.zeroize();
            out
        }
    };

    // An AEAD key is carved from the front of the finalized secret.
    if finalized.len() < 32 {
        return Err(SetupError::KeyDerivation(
            "finalized secret too short".to_string(),
        ));
    }
    Ok(finalized)
}

/// `HMAC-SHA3-512(password, password)`: password as both key and message.
fn self_salt(password: &[u8]) -> Result<[u8; 64]> {
    let mut mac = Hmac::<Sha3_512>::new_from_slice(password)
        .map_err(|e| SetupError::KeyDerivation(e.to_string()))?;
    mac.update(password);
    let mut out = [0u8; 64];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// Reduced-cost finalization for tests. Same structure, fast parameters.
#[cfg(test)]
pub fn finalize_test(
    password: &SecretVec,
    binding: Option<&dyn HardwareBinding>,
) -> Result<SecretVec> {
    let params = Params::new(1024, 1, 1, Some(STRETCHED_LEN))
        .map_err(|e| SetupError::KeyDerivation(e.to_string()))?;
    finalize_with(password, 2, params, binding)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tpm::{FakeTpm, TpmDigest};

    fn pw(bytes: &[u8]) -> SecretVec {
        SecretVec::new(bytes.to_vec())
    }

    #[test]
    fn test_finalize_deterministic() {
        let a = finalize_test(&pw(b"correct horse"), None).unwrap();
        let b = finalize_test(&pw(b"correct horse"), None).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_eq!(a.len(), STRETCHED_LEN);
    }

    #[test]
    fn test_finalize_password_sensitive() {
        let a = finalize_test(&pw(b"correct horse"), None).unwrap();
        let b = finalize_test(&pw(b"correct horsf"), None).unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_empty_password_rejected() {
        assert!(finalize_test(&pw(b""), None).is_err());
    }

    #[test]
    fn test_tpm_changes_output_and_disabling_restores_it() {
        let device = FakeTpm {
            device_secret: [7u8; 32],
            digest: TpmDigest::Sha512,
        };
        let plain = finalize_test(&pw(b"secret"), None).unwrap();
        let bound = finalize_test(&pw(b"secret"), Some(&device)).unwrap();
        assert_ne!(plain.as_bytes(), bound.as_bytes());

        let plain_again = finalize_test(&pw(b"secret"), None).unwrap();
        assert_eq!(plain.as_bytes(), plain_again.as_bytes());

        let bound_again = finalize_test(&pw(b"secret"), Some(&device)).unwrap();
        assert_eq!(bound.as_bytes(), bound_again.as_bytes());
    }

    #[test]
    fn test_tpm_smaller_digest_still_keys_aead() {
        let device = FakeTpm {
            device_secret: [9u8; 32],
            digest: TpmDigest::Sha256,
        };
        let bound = finalize_test(&pw(b"secret"), Some(&device)).unwrap();
        assert_eq!(bound.len(), 32);
    }

    #[test]
    fn test_self_salt_is_password_bound() {
        let a = self_salt(b"one").unwrap();
        let b = self_salt(b"two").unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_acquire_from_env() {
        std::env::set_var("INSTPAK_TEST_PWD", "from the environment");
        let got = acquire(Some("INSTPAK_TEST_PWD")).await.unwrap();
        assert_eq!(got.as_bytes(), b"from the environment");
        std::env::remove_var("INSTPAK_TEST_PWD");
    }

    #[tokio::test]
    async fn test_acquire_missing_env_fails() {
        assert!(acquire(Some("INSTPAK_TEST_PWD_MISSING")).await.is_err());
    }
}
