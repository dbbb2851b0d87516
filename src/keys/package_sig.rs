/// Detached package signatures.
///
/// The `.sig` artifact next to a package carries an Ed25519 signature and a
/// Dilithium3 counter-signature over the SHA3-512 digest of the package byte
/// stream, plus the signer's vendor-signed public keys. Verification
/// requires the whole set: both chains must terminate in the PKI, the
/// purpose and hash algorithm must match, and both signatures must verify.
/// Failure of any one fails the package.
use std::fs::{self, File};
use std::io::Cursor;
use std::path::{Path, PathBuf};

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use pqcrypto_dilithium::dilithium3;
use pqcrypto_traits::sign::{DetachedSignature, PublicKey as PqPublicKey};
use tracing::info;

use crate::error::{Result, SetupError};
use crate::wire::{FrameReader, FrameWriter};

use super::pki::TrustStore;
use super::signed::SignedPublicKey;
use super::suite::KeySuite;
use super::{
    digest_stream, HASH_ALGORITHM, MAX_ATTR_LEN, MAX_KEY_LEN, MAX_SIG_LEN,
    PACKAGE_SIGNATURE_PURPOSE, PKI_DOMAIN,
};

/// Detached signature container for one package file.
#[derive(Debug, Clone)]
pub struct PackageSignature {
    pub hash_algorithm: String,
    pub purpose: String,
    /// Ed25519 signature over the package digest.
    pub primary_signature: Vec<u8>,
    /// Dilithium3 counter-signature over the package digest.
    pub counter_signature: Vec<u8>,
    /// The signer's vendor-signed primary public key.
    pub signer_primary: SignedPublicKey,
    /// The signer's vendor-signed counter public key.
    pub signer_counter: SignedPublicKey,
}

/// Conventional location of the detached signature: `<package>.sig`.
pub fn sig_path(package: &Path) -> PathBuf {
    let mut name = package.as_os_str().to_os_string();
    name.push(".sig");
    PathBuf::from(name)
}

/// Sign a written package file with a finalized suite.
pub fn sign_package(suite: &KeySuite, package: &Path) -> Result<PackageSignature> {
    let (signer_primary, signer_counter) = match (&suite.signed_primary, &suite.signed_counter) {
        (Some(primary), Some(counter)) => (primary.clone(), counter.clone()),
        _ => {
            return Err(SetupError::Usage(
                "suite has no signed public keys; finalize it before signing packages".to_string(),
            ))
        }
    };

    let package_digest = digest_stream(File::open(package)?)?;
    let signature = PackageSignature {
        hash_algorithm: HASH_ALGORITHM.to_string(),
        purpose: PACKAGE_SIGNATURE_PURPOSE.to_string(),
        primary_signature: suite.sign_primary(&package_digest),
        counter_signature: suite.sign_counter(&package_digest)?,
        signer_primary,
        signer_counter,
    };
    info!(package = %package.display(), "Package signed");
    Ok(signature)
}

/// Verify a package against its detached signature and the trust store.
pub fn verify_package(
    package: &Path,
    signature: &PackageSignature,
    store: &TrustStore,
) -> Result<()> {
    if signature.purpose != PACKAGE_SIGNATURE_PURPOSE {
        return Err(SetupError::Untrusted(format!(
            "unexpected signature purpose: {:?}",
            signature.purpose
        )));
    }
    if signature.hash_algorithm != HASH_ALGORITHM {
        return Err(SetupError::Untrusted(format!(
            "unexpected hash algorithm: {:?}",
            signature.hash_algorithm
        )));
    }

    store.validate_chain(&signature.signer_primary, PKI_DOMAIN)?;
    store.validate_chain(&signature.signer_counter, PKI_DOMAIN)?;

    let package_digest = digest_stream(File::open(package)?)?;

    let key_arr: [u8; 32] = signature
        .signer_primary
        .public_key
        .as_slice()
        .try_into()
        .map_err(|_| SetupError::Integrity("malformed signer public key".to_string()))?;
    let verifying = VerifyingKey::from_bytes(&key_arr)
        .map_err(|_| SetupError::Integrity("malformed signer public key".to_string()))?;
    let sig_arr: [u8; 64] = signature
        .primary_signature
        .as_slice()
        .try_into()
        .map_err(|_| SetupError::Integrity("malformed package signature".to_string()))?;
    verifying
        .verify(&package_digest, &Signature::from_bytes(&sig_arr))
        .map_err(|_| SetupError::Integrity("package signature mismatch".to_string()))?;

    let counter_pk = dilithium3::PublicKey::from_bytes(&signature.signer_counter.public_key)
        .map_err(|_| SetupError::Integrity("malformed counter public key".to_string()))?;
    let counter_sig = dilithium3::DetachedSignature::from_bytes(&signature.counter_signature)
        .map_err(|_| SetupError::Integrity("malformed counter signature".to_string()))?;
    dilithium3::verify_detached_signature(&counter_sig, &package_digest, &counter_pk)
        .map_err(|_| SetupError::Integrity("package counter-signature mismatch".to_string()))?;

    info!(package = %package.display(), "Package signature verified");
    Ok(())
}

impl PackageSignature {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut w = FrameWriter::new(Vec::new());
        w.write_version()?;
        w.write_string(&self.hash_algorithm)?;
        w.write_string(&self.purpose)?;
        w.write_bytes(&self.primary_signature)?;
        w.write_bytes(&self.counter_signature)?;
        w.write_bytes(&self.signer_primary.to_bytes()?)?;
        w.write_bytes(&self.signer_counter.to_bytes()?)?;
        Ok(w.into_inner())
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut r = FrameReader::new(Cursor::new(data));
        r.read_version()?;
        Ok(Self {
            hash_algorithm: r.read_string(MAX_ATTR_LEN)?,
            purpose: r.read_string(MAX_ATTR_LEN)?,
            primary_signature: r.read_bytes(MAX_SIG_LEN)?,
            counter_signature: r.read_bytes(MAX_SIG_LEN)?,
            signer_primary: SignedPublicKey::from_bytes(&r.read_bytes(MAX_KEY_LEN * 4)?)?,
            signer_counter: SignedPublicKey::from_bytes(&r.read_bytes(MAX_KEY_LEN * 4)?)?,
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
