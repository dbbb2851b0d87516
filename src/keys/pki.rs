/// PKI trust store: the anchors every signature chain must terminate in.
///
/// An anchor holds a vendor's primary and counter public keys plus its
/// domain. The store persists as a single framed blob; when saved by a root
/// suite it carries a signature over the anchor section, which is verified
/// on load before any anchor is trusted.
use std::collections::BTreeMap;
use std::fs;
use std::io::Cursor;
use std::path::Path;

use tracing::debug;

use crate::error::{Result, SetupError};
use crate::wire::{FrameReader, FrameWriter};

use super::signed::SignedPublicKey;
use super::suite::KeySuite;
use super::{digest, key_id, MAX_ATTR_LEN, MAX_KEY_LEN, MAX_SIG_LEN};

const MAX_ANCHORS: u64 = 1024;
/// Upper bound on the serialized anchor section.
const MAX_STORE_LEN: usize = 64 * 1024 * 1024;

/// A trusted signing identity.
#[derive(Debug, Clone)]
pub struct TrustAnchor {
    pub primary_public: Vec<u8>,
    pub counter_public: Vec<u8>,
    pub domain: String,
}

impl TrustAnchor {
    pub fn key_id(&self) -> String {
        key_id(&self.primary_public)
    }
}

/// The set of trusted anchors, keyed by primary key id.
#[derive(Debug, Default)]
pub struct TrustStore {
    anchors: BTreeMap<String, TrustAnchor>,
}

impl TrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_anchor(&mut self, anchor: TrustAnchor) {
        self.anchors.insert(anchor.key_id(), anchor);
    }

    /// Add a suite's own public keys as an anchor (vendor bootstrap).
    pub fn add_suite(&mut self, suite: &KeySuite, domain: &str) {
        self.add_anchor(TrustAnchor {
            primary_public: suite.primary_public_bytes().to_vec(),
            counter_public: suite.counter_public_bytes().to_vec(),
            domain: domain.to_string(),
        });
    }

    pub fn get(&self, id: &str) -> Option<&TrustAnchor> {
        self.anchors.get(id)
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    /// Validate that a signed public key chains to this store.
    ///
    /// A chain is valid when some signature's signer id resolves to an
    /// anchor in the required domain and both halves of that signature
    /// verify. A self-signed key whose signer is not anchored fails.
    pub fn validate_chain(&self, signed: &SignedPublicKey, domain: &str) -> Result<()> {
        for signature in &signed.signatures {
            let Some(anchor) = self.anchors.get(&signature.signer_id) else {
                continue;
            };
            if anchor.domain != domain {
                return Err(SetupError::Untrusted(format!(
                    "signer is anchored in domain {:?}, expected {:?}",
                    anchor.domain, domain
                )));
            }
            signed.verify_signature(signature, &anchor.primary_public, &anchor.counter_public)?;
            debug!(
                key = %signed.key_id(),
                signer = %signature.signer_id,
                "Signature chain validated"
            );
            return Ok(());
        }
        Err(SetupError::Untrusted(
            "signature chain does not terminate in a trusted key".to_string(),
        ))
    }

    fn anchors_to_wire(&self) -> Result<Vec<u8>> {
        let mut w = FrameWriter::new(Vec::new());
        w.write_varint(self.anchors.len() as u64)?;
        for anchor in self.anchors.values() {
            w.write_bytes(&anchor.primary_public)?;
            w.write_bytes(&anchor.counter_public)?;
            w.write_string(&anchor.domain)?;
        }
        Ok(w.into_inner())
    }

    fn anchors_from_wire(data: &[u8]) -> Result<BTreeMap<String, TrustAnchor>> {
        let mut r = FrameReader::new(Cursor::new(data));
        let count = r.read_varint()?;
        if count > MAX_ANCHORS {
            return Err(SetupError::InvalidFormat(format!(
                "implausible anchor count: {count}"
            )));
        }
        let mut anchors = BTreeMap::new();
        for _ in 0..count {
            let anchor = TrustAnchor {
                primary_public: r.read_bytes(MAX_KEY_LEN)?,
                counter_public: r.read_bytes(MAX_KEY_LEN)?,
                domain: r.read_string(MAX_ATTR_LEN)?,
            };
            anchors.insert(anchor.key_id(), anchor);
        }
        Ok(anchors)
    }

    /// Persist the store. With `signer`, the anchor section is signed by
    /// that suite's primary key; the signer must itself be an anchor.
    pub fn save(&self, path: &Path, signer: Option<&KeySuite>) -> Result<()> {
        let body = self.anchors_to_wire()?;

        let mut w = FrameWriter::new(Vec::new());
        w.write_version()?;
        w.write_bytes(&body)?;
        match signer {
            Some(suite) => {
                w.write_u8(1)?;
                w.write_string(&suite.primary_key_id())?;
                w.write_bytes(&suite.sign_primary(&digest(&body)))?;
            }
            None => w.write_u8(0)?,
        }
        fs::write(path, w.into_inner())?;
        Ok(())
    }

    /// Load a store, verifying the embedded signature when present.
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path)?;
        let mut r = FrameReader::new(Cursor::new(data));
        r.read_version()?;

        let body = r.read_bytes(MAX_STORE_LEN)?;
        let anchors = Self::anchors_from_wire(&body)?;
        let store = Self { anchors };

        match r.read_u8()? {
            0 => {}
            1 => {
                let signer_id = r.read_string(MAX_ATTR_LEN)?;
                let signature = r.read_bytes(MAX_SIG_LEN)?;
                let anchor = store.get(&signer_id).ok_or_else(|| {
                    SetupError::Integrity("store signer is not among its anchors".to_string())
                })?;
                verify_store_signature(&anchor.primary_public, &digest(&body), &signature)?;
            }
            other => {
                return Err(SetupError::InvalidFormat(format!(
                    "invalid store signature marker: {other}"
                )))
            }
        }
        Ok(store)
    }
}

fn verify_store_signature(primary_public: &[u8], body_digest: &[u8], signature: &[u8]) -> Result<()> {
    use ed25519_dalek::{Signature, Verifier, VerifyingKey};

    let key_arr: [u8; 32] = primary_public
        .try_into()
        .map_err(|_| SetupError::Integrity("malformed store anchor key".to_string()))?;
    let verifying = VerifyingKey::from_bytes(&key_arr)
        .map_err(|_| SetupError::Integrity("malformed store anchor key".to_string()))?;
    let sig_arr: [u8; 64] = signature
        .try_into()
        .map_err(|_| SetupError::Integrity("malformed store signature".to_string()))?;
    verifying
        .verify(body_digest, &Signature::from_bytes(&sig_arr))
        .map_err(|_| SetupError::Integrity("trust store signature mismatch".to_string()))
}
