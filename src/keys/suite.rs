/// Private key suite: Ed25519 primary keypair + Dilithium3 (ML-DSA-65)
/// counter keypair, and after finalization their vendor-signed public forms.
///
/// At rest the suite is one AEAD blob: the framed serialization encrypted
/// with XChaCha20-Poly1305 under the first 32 bytes of the finalized
/// password, with a random 24-byte nonce. A wrong password surfaces as an
/// authentication failure, never as garbage key material.
use std::fs;
use std::io::Cursor;
use std::path::Path;

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use pqcrypto_dilithium::dilithium3;
use pqcrypto_traits::sign::{
    DetachedSignature, PublicKey as PqPublicKey, SecretKey as PqSecretKey,
};
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::info;
use zeroize::Zeroize;

use crate::error::{Result, SetupError};
use crate::password::secret::{SecretBytes32, SecretVec};
use crate::wire::{FrameReader, FrameWriter};

use super::signed::SignedPublicKey;
use super::{key_id, MAX_KEY_LEN};

const NONCE_LEN: usize = 24;
const SUITE_AAD: &[u8] = b"wan24Setup private key suite";

/// The private half of a signing identity.
pub struct KeySuite {
    primary: SigningKey,
    counter_public: Vec<u8>,
    counter_secret: Vec<u8>,
    /// Vendor-signed form of the primary public key, present after finalize.
    pub signed_primary: Option<SignedPublicKey>,
    /// Vendor-signed form of the counter public key, present after finalize.
    pub signed_counter: Option<SignedPublicKey>,
}

impl Drop for KeySuite {
    fn drop(&mut self) {
        self.counter_secret.zeroize();
    }
}

impl KeySuite {
    /// Generate a fresh suite: Ed25519 primary + Dilithium3 counter.
    pub fn generate() -> Self {
        let primary = SigningKey::generate(&mut OsRng);
        let (counter_pk, counter_sk) = dilithium3::keypair();
        Self {
            primary,
            counter_public: counter_pk.as_bytes().to_vec(),
            counter_secret: counter_sk.as_bytes().to_vec(),
            signed_primary: None,
            signed_counter: None,
        }
    }

    pub fn primary_public(&self) -> VerifyingKey {
        self.primary.verifying_key()
    }

    pub fn primary_public_bytes(&self) -> [u8; 32] {
        self.primary.verifying_key().to_bytes()
    }

    pub fn counter_public_bytes(&self) -> &[u8] {
        &self.counter_public
    }

    pub fn primary_key_id(&self) -> String {
        key_id(&self.primary_public_bytes())
    }

    pub fn counter_key_id(&self) -> String {
        key_id(&self.counter_public)
    }

    /// Ed25519 signature by the primary key.
    pub fn sign_primary(&self, message: &[u8]) -> Vec<u8> {
        self.primary.sign(message).to_bytes().to_vec()
    }

    /// Dilithium3 detached signature by the counter key.
    pub fn sign_counter(&self, message: &[u8]) -> Result<Vec<u8>> {
        let sk = dilithium3::SecretKey::from_bytes(&self.counter_secret)
            .map_err(|e| SetupError::Integrity(format!("counter secret key: {e:?}")))?;
        let sig = dilithium3::detached_sign(message, &sk);
        Ok(sig.as_bytes().to_vec())
    }

    /// Merge vendor-signed public keys into the suite (finalization).
    ///
    /// The signed keys must wrap this suite's own public keys.
    pub fn attach_signed_keys(
        &mut self,
        signed_primary: SignedPublicKey,
        signed_counter: SignedPublicKey,
    ) -> Result<()> {
        if signed_primary.key_id() != self.primary_key_id() {
            return Err(SetupError::Untrusted(
                "signed primary key does not match this suite".to_string(),
            ));
        }
        if signed_counter.key_id() != self.counter_key_id() {
            return Err(SetupError::Untrusted(
                "signed counter key does not match this suite".to_string(),
            ));
        }
        self.signed_primary = Some(signed_primary);
        self.signed_counter = Some(signed_counter);
        Ok(())
    }

    fn to_wire(&self) -> Result<SecretVec> {
        let mut w = FrameWriter::new(Vec::new());
        w.write_version()?;
        w.write_bytes(&self.primary.to_bytes())?;
        w.write_bytes(&self.counter_public)?;
        w.write_bytes(&self.counter_secret)?;
        for signed in [&self.signed_primary, &self.signed_counter] {
            match signed {
                Some(spk) => {
                    w.write_u8(1)?;
                    w.write_bytes(&spk.to_bytes()?)?;
                }
                None => w.write_u8(0)?,
            }
        }
        Ok(SecretVec::new(w.into_inner()))
    }

    fn from_wire(data: &[u8]) -> Result<Self> {
        let mut r = FrameReader::new(Cursor::new(data));
        r.read_version()?;

        let mut primary_bytes = r.read_bytes(MAX_KEY_LEN)?;
        let primary_arr: [u8; 32] = primary_bytes.as_slice().try_into().map_err(|_| {
            SetupError::InvalidFormat("primary secret key must be 32 bytes".to_string())
        })?;
        let primary = SigningKey::from_bytes(&primary_arr);
        primary_bytes.zeroize();

        let counter_public = r.read_bytes(MAX_KEY_LEN)?;
        let counter_secret = r.read_bytes(MAX_KEY_LEN)?;

        let mut signed = [None, None];
        for slot in signed.iter_mut() {
            *slot = match r.read_u8()? {
                0 => None,
                1 => Some(SignedPublicKey::from_bytes(&r.read_bytes(MAX_KEY_LEN * 4)?)?),
                other => {
                    return Err(SetupError::InvalidFormat(format!(
                        "invalid signed-key marker: {other}"
                    )))
                }
            };
        }
        let [signed_primary, signed_counter] = signed;

        Ok(Self {
            primary,
            counter_public,
            counter_secret,
            signed_primary,
            signed_counter,
        })
    }

    /// AEAD-encrypt the suite under the finalized password.
    ///
    /// Blob layout: `[version | nonce | ciphertext+tag]`.
    pub fn encrypt(&self, finalized: &SecretVec) -> Result<Vec<u8>> {
        let key = aead_key(finalized)?;
        let cipher = XChaCha20Poly1305::new_from_slice(key.as_bytes())
            .map_err(|e| SetupError::Integrity(e.to_string()))?;

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let plaintext = self.to_wire()?;
        let ciphertext = cipher
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: plaintext.as_bytes(),
                    aad: SUITE_AAD,
                },
            )
            .map_err(|e| SetupError::Integrity(e.to_string()))?;

        let mut out = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
        out.push(crate::wire::WIRE_VERSION);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt a suite blob. A wrong password fails the AEAD tag check.
    pub fn decrypt(blob: &[u8], finalized: &SecretVec) -> Result<Self> {
        if blob.len() < 1 + NONCE_LEN {
            return Err(SetupError::InvalidFormat("suite blob too short".to_string()));
        }
        let version = blob[0];
        if version == 0 || version > crate::wire::WIRE_VERSION {
            return Err(SetupError::UnsupportedFormat(version));
        }
        let nonce = &blob[1..1 + NONCE_LEN];
        let ciphertext = &blob[1 + NONCE_LEN..];

        let key = aead_key(finalized)?;
        let cipher = XChaCha20Poly1305::new_from_slice(key.as_bytes())
            .map_err(|e| SetupError::Integrity(e.to_string()))?;
        let plaintext = cipher
            .decrypt(
                XNonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: SUITE_AAD,
                },
            )
            .map_err(|_| {
                SetupError::Integrity("suite decryption failed (wrong password or tampering)".to_string())
            })?;

        let plaintext = SecretVec::new(plaintext);
        Self::from_wire(plaintext.as_bytes())
    }

    pub fn save(&self, path: &Path, finalized: &SecretVec) -> Result<()> {
        fs::write(path, self.encrypt(finalized)?)?;
        info!(path = %path.display(), "Key suite written");
        Ok(())
    }

    pub fn load(path: &Path, finalized: &SecretVec) -> Result<Self> {
        let blob = fs::read(path)?;
        Self::decrypt(&blob, finalized)
    }

    /// Secure destruction: overwrite the file with random bytes, then unlink.
    pub fn destroy(path: &Path) -> Result<()> {
        let len = fs::metadata(path)?.len() as usize;
        let mut noise = vec![0u8; len];
        OsRng.fill_bytes(&mut noise);
        fs::write(path, &noise)?;
        fs::remove_file(path)?;
        info!(path = %path.display(), "Key suite destroyed");
        Ok(())
    }
}

/// The AEAD key is the leading 32 bytes of the finalized password.
fn aead_key(finalized: &SecretVec) -> Result<SecretBytes32> {
    SecretBytes32::from_slice(finalized.as_bytes().get(..32).ok_or_else(|| {
        SetupError::KeyDerivation("finalized password shorter than 32 bytes".to_string())
    })?)
    .ok_or_else(|| SetupError::KeyDerivation("finalized password too short".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::Verifier;

    fn finalized() -> SecretVec {
        SecretVec::new(vec![0x42u8; 64])
    }

    #[test]
    fn test_sign_verify_both_halves() {
        let suite = KeySuite::generate();
        let message = b"package digest stand-in";

        let primary_sig = suite.sign_primary(message);
        let sig = ed25519_dalek::Signature::from_bytes(&primary_sig.as_slice().try_into().unwrap());
        assert!(suite.primary_public().verify(message, &sig).is_ok());

        let counter_sig = suite.sign_counter(message).unwrap();
        let pk = dilithium3::PublicKey::from_bytes(suite.counter_public_bytes()).unwrap();
        let detached = dilithium3::DetachedSignature::from_bytes(&counter_sig).unwrap();
        assert!(dilithium3::verify_detached_signature(&detached, message, &pk).is_ok());
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let suite = KeySuite::generate();
        let blob = suite.encrypt(&finalized()).unwrap();
        let recovered = KeySuite::decrypt(&blob, &finalized()).unwrap();

        assert_eq!(
            recovered.primary_public_bytes(),
            suite.primary_public_bytes()
        );
        assert_eq!(recovered.counter_public_bytes(), suite.counter_public_bytes());
        assert_eq!(recovered.counter_secret, suite.counter_secret);
        assert!(recovered.signed_primary.is_none());
    }

    #[test]
    fn test_wrong_password_is_integrity_failure() {
        let suite = KeySuite::generate();
        let blob = suite.encrypt(&finalized()).unwrap();
        let wrong = SecretVec::new(vec![0x43u8; 64]);
        assert!(matches!(
            KeySuite::decrypt(&blob, &wrong),
            Err(SetupError::Integrity(_))
        ));
    }

    #[test]
    fn test_tampered_blob_is_integrity_failure() {
        let suite = KeySuite::generate();
        let mut blob = suite.encrypt(&finalized()).unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        assert!(matches!(
            KeySuite::decrypt(&blob, &finalized()),
            Err(SetupError::Integrity(_))
        ));
    }

    #[test]
    fn test_save_load_destroy() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("private.key");

        let suite = KeySuite::generate();
        suite.save(&path, &finalized()).unwrap();
        let loaded = KeySuite::load(&path, &finalized()).unwrap();
        assert_eq!(loaded.primary_key_id(), suite.primary_key_id());

        KeySuite::destroy(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_attach_signed_keys_rejects_foreign_key() {
        let mut suite = KeySuite::generate();
        let vendor = KeySuite::generate();
        let other = KeySuite::generate();

        // Signed keys wrapping someone else's public key must be rejected.
        let foreign_primary = SignedPublicKey::issue(
            &other.primary_public_bytes(),
            &vendor,
            super::super::SIGNED_KEY_PURPOSE,
        )
        .unwrap();
        let counter = SignedPublicKey::issue(
            suite.counter_public_bytes(),
            &vendor,
            super::super::SIGNED_KEY_PURPOSE,
        )
        .unwrap();
        assert!(suite.attach_signed_keys(foreign_primary, counter).is_err());
    }
}
