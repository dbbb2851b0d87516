/// Signed public keys: a public key wrapped with one or more issuer
/// signatures, forming a chain that terminates in a PKI trust anchor.
///
/// Each signature record carries the signer's key id, a timestamp, the hash
/// algorithm, the purpose string, and two halves: an Ed25519 signature and
/// a Dilithium3 counter-signature by the issuer. Verification requires both
/// halves, so compromise of either primitive alone does not forge a record.
use std::fs;
use std::io::Cursor;
use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use pqcrypto_dilithium::dilithium3;
use pqcrypto_traits::sign::{DetachedSignature, PublicKey as PqPublicKey};

use crate::error::{Result, SetupError};
use crate::wire::{FrameReader, FrameWriter};

use super::suite::KeySuite;
use super::{digest, key_id, HASH_ALGORITHM, MAX_ATTR_LEN, MAX_KEY_LEN, MAX_SIG_LEN};

/// One issuer signature over a public key.
#[derive(Debug, Clone)]
pub struct KeySignature {
    /// Key id of the issuing (higher-tier) key.
    pub signer_id: String,
    pub signed_at: DateTime<Utc>,
    pub hash_algorithm: String,
    pub purpose: String,
    /// Ed25519 signature by the issuer's primary key.
    pub primary_signature: Vec<u8>,
    /// Dilithium3 counter-signature by the issuer's counter key.
    pub counter_signature: Vec<u8>,
}

/// A public key plus its issuer signatures.
#[derive(Debug, Clone)]
pub struct SignedPublicKey {
    /// Raw subject public key bytes (Ed25519 or Dilithium3).
    pub public_key: Vec<u8>,
    pub signatures: Vec<KeySignature>,
}

impl SignedPublicKey {
    /// Identifier of the wrapped public key.
    pub fn key_id(&self) -> String {
        key_id(&self.public_key)
    }

    /// Issue a signed public key: the issuer signs `subject_public` with
    /// both of its keys under the given purpose.
    pub fn issue(subject_public: &[u8], issuer: &KeySuite, purpose: &str) -> Result<Self> {
        let signed_at = Utc::now();
        let payload = signable(
            subject_public,
            &issuer.primary_key_id(),
            signed_at,
            HASH_ALGORITHM,
            purpose,
        )?;
        let payload_digest = digest(&payload);

        let signature = KeySignature {
            signer_id: issuer.primary_key_id(),
            signed_at,
            hash_algorithm: HASH_ALGORITHM.to_string(),
            purpose: purpose.to_string(),
            primary_signature: issuer.sign_primary(&payload_digest),
            counter_signature: issuer.sign_counter(&payload_digest)?,
        };

        Ok(Self {
            public_key: subject_public.to_vec(),
            signatures: vec![signature],
        })
    }

    /// Verify one signature record against the issuer's public keys.
    pub fn verify_signature(
        &self,
        signature: &KeySignature,
        issuer_primary: &[u8],
        issuer_counter: &[u8],
    ) -> Result<()> {
        if signature.hash_algorithm != HASH_ALGORITHM {
            return Err(SetupError::Untrusted(format!(
                "unexpected hash algorithm: {}",
                signature.hash_algorithm
            )));
        }

        let payload = signable(
            &self.public_key,
            &signature.signer_id,
            signature.signed_at,
            &signature.hash_algorithm,
            &signature.purpose,
        )?;
        let payload_digest = digest(&payload);

        let primary_arr: [u8; 32] = issuer_primary
            .try_into()
            .map_err(|_| SetupError::SignatureVerification)?;
        let verifying = VerifyingKey::from_bytes(&primary_arr)
            .map_err(|_| SetupError::SignatureVerification)?;
        let sig_arr: [u8; 64] = signature
            .primary_signature
            .as_slice()
            .try_into()
            .map_err(|_| SetupError::SignatureVerification)?;
        verifying
            .verify(&payload_digest, &Signature::from_bytes(&sig_arr))
            .map_err(|_| SetupError::SignatureVerification)?;

        let counter_pk = dilithium3::PublicKey::from_bytes(issuer_counter)
            .map_err(|_| SetupError::SignatureVerification)?;
        let counter_sig = dilithium3::DetachedSignature::from_bytes(&signature.counter_signature)
            .map_err(|_| SetupError::SignatureVerification)?;
        dilithium3::verify_detached_signature(&counter_sig, &payload_digest, &counter_pk)
            .map_err(|_| SetupError::SignatureVerification)?;

        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut w = FrameWriter::new(Vec::new());
        w.write_version()?;
        w.write_bytes(&self.public_key)?;
        w.write_varint(self.signatures.len() as u64)?;
        for sig in &self.signatures {
            w.write_string(&sig.signer_id)?;
            w.write_i64(sig.signed_at.timestamp())?;
            w.write_string(&sig.hash_algorithm)?;
            w.write_string(&sig.purpose)?;
            w.write_bytes(&sig.primary_signature)?;
            w.write_bytes(&sig.counter_signature)?;
        }
        Ok(w.into_inner())
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut r = FrameReader::new(Cursor::new(data));
        r.read_version()?;

        let public_key = r.read_bytes(MAX_KEY_LEN)?;
        let count = r.read_varint()?;
        if count == 0 || count > 16 {
            return Err(SetupError::InvalidFormat(format!(
                "implausible signature count: {count}"
            )));
        }

        let mut signatures = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let signer_id = r.read_string(MAX_ATTR_LEN)?;
            let ts = r.read_i64()?;
            let signed_at = Utc
                .timestamp_opt(ts, 0)
                .single()
                .ok_or_else(|| SetupError::InvalidFormat(format!("invalid timestamp: {ts}")))?;
            signatures.push(KeySignature {
                signer_id,
                signed_at,
                hash_algorithm: r.read_string(MAX_ATTR_LEN)?,
                purpose: r.read_string(MAX_ATTR_LEN)?,
                primary_signature: r.read_bytes(MAX_SIG_LEN)?,
                counter_signature: r.read_bytes(MAX_SIG_LEN)?,
            });
        }

        Ok(Self {
            public_key,
            signatures,
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_bytes(&fs::read(path)?)
    }
}

/// The two signed public keys a signing authority hands back for one KSR:
/// the requester's primary and counter keys, each vendor-wrapped.
#[derive(Debug, Clone)]
pub struct SignedKeyPair {
    pub primary: SignedPublicKey,
    pub counter: SignedPublicKey,
}

impl SignedKeyPair {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut w = FrameWriter::new(Vec::new());
        w.write_version()?;
        w.write_bytes(&self.primary.to_bytes()?)?;
        w.write_bytes(&self.counter.to_bytes()?)?;
        Ok(w.into_inner())
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut r = FrameReader::new(Cursor::new(data));
        r.read_version()?;
        Ok(Self {
            primary: SignedPublicKey::from_bytes(&r.read_bytes(MAX_KEY_LEN * 4)?)?,
            counter: SignedPublicKey::from_bytes(&r.read_bytes(MAX_KEY_LEN * 4)?)?,
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_bytes(&fs::read(path)?)
    }
}

/// Canonical byte form of what a key signature covers. Timestamps are
/// second-resolution so the wire roundtrip is lossless.
fn signable(
    public_key: &[u8],
    signer_id: &str,
    signed_at: DateTime<Utc>,
    hash_algorithm: &str,
    purpose: &str,
) -> Result<Vec<u8>> {
    let mut w = FrameWriter::new(Vec::new());
    w.write_version()?;
    w.write_bytes(public_key)?;
    w.write_string(signer_id)?;
    w.write_i64(signed_at.timestamp())?;
    w.write_string(hash_algorithm)?;
    w.write_string(purpose)?;
    Ok(w.into_inner())
}
