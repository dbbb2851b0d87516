/// Key signing requests: the unsigned-key side of the two-tier PKI.
///
/// A KSR bundles the requester's primary public key, an attribute map, a
/// purpose string, and a self-signature by the requester's primary key.
/// The attribute map is free-form but must name the PKI domain, the owner
/// email (lowercased), the granted usages, and the ids of both public keys.
use std::collections::BTreeMap;
use std::fs;
use std::io::Cursor;
use std::path::Path;

use ed25519_dalek::{Signature, Verifier, VerifyingKey};

use crate::error::{Result, SetupError};
use crate::wire::{FrameReader, FrameWriter};

use super::suite::KeySuite;
use super::{digest, KEY_SIGNING_PURPOSE, MAX_ATTR_LEN, MAX_KEY_LEN, MAX_SIG_LEN};

pub const ATTR_DOMAIN: &str = "domain";
pub const ATTR_OWNER: &str = "owner";
pub const ATTR_USAGES: &str = "usages";
pub const ATTR_PRIMARY_KEY_ID: &str = "primaryKeyId";
pub const ATTR_COUNTER_KEY_ID: &str = "counterKeyId";

const MAX_ATTRIBUTES: u64 = 64;

/// A self-signed request for a vendor signature over a public key.
///
/// The counter public key travels alongside the primary so the signing
/// authority can wrap both halves; its id is pinned in the attribute map.
#[derive(Debug, Clone)]
pub struct KeySigningRequest {
    /// Requester's Ed25519 public key (the key to be signed).
    pub primary_public: Vec<u8>,
    /// Requester's Dilithium3 public key.
    pub counter_public: Vec<u8>,
    pub attributes: BTreeMap<String, String>,
    pub purpose: String,
    /// Ed25519 self-signature by `primary_public`.
    pub self_signature: Vec<u8>,
}

impl KeySigningRequest {
    /// Build and self-sign a KSR for `suite` with the mandatory attributes.
    pub fn new(suite: &KeySuite, owner_email: &str, usages: &str) -> Result<Self> {
        let mut attributes = BTreeMap::new();
        attributes.insert(ATTR_DOMAIN.to_string(), super::PKI_DOMAIN.to_string());
        attributes.insert(ATTR_OWNER.to_string(), owner_email.to_lowercase());
        attributes.insert(ATTR_USAGES.to_string(), usages.to_string());
        attributes.insert(ATTR_PRIMARY_KEY_ID.to_string(), suite.primary_key_id());
        attributes.insert(ATTR_COUNTER_KEY_ID.to_string(), suite.counter_key_id());

        let primary_public = suite.primary_public_bytes().to_vec();
        let counter_public = suite.counter_public_bytes().to_vec();
        let payload = signable(
            &primary_public,
            &counter_public,
            &attributes,
            KEY_SIGNING_PURPOSE,
        )?;
        let self_signature = suite.sign_primary(&digest(&payload));

        Ok(Self {
            primary_public,
            counter_public,
            attributes,
            purpose: KEY_SIGNING_PURPOSE.to_string(),
            self_signature,
        })
    }

    /// Verify the self-signature.
    pub fn validate(&self) -> Result<()> {
        let payload = signable(
            &self.primary_public,
            &self.counter_public,
            &self.attributes,
            &self.purpose,
        )?;
        let payload_digest = digest(&payload);

        let key_arr: [u8; 32] = self
            .primary_public
            .as_slice()
            .try_into()
            .map_err(|_| SetupError::InvalidKsr("primary public key must be 32 bytes".to_string()))?;
        let verifying = VerifyingKey::from_bytes(&key_arr)
            .map_err(|_| SetupError::InvalidKsr("malformed primary public key".to_string()))?;
        let sig_arr: [u8; 64] = self
            .self_signature
            .as_slice()
            .try_into()
            .map_err(|_| SetupError::InvalidKsr("malformed self-signature".to_string()))?;
        verifying
            .verify(&payload_digest, &Signature::from_bytes(&sig_arr))
            .map_err(|_| SetupError::InvalidKsr("self-signature does not verify".to_string()))
    }

    /// Check the mandatory attributes exist and look sane.
    pub fn validate_attributes(&self) -> Result<()> {
        for key in [
            ATTR_DOMAIN,
            ATTR_OWNER,
            ATTR_USAGES,
            ATTR_PRIMARY_KEY_ID,
            ATTR_COUNTER_KEY_ID,
        ] {
            match self.attributes.get(key) {
                None => {
                    return Err(SetupError::InvalidKsr(format!("missing attribute: {key}")))
                }
                Some(value) if value.is_empty() => {
                    return Err(SetupError::InvalidKsr(format!("empty attribute: {key}")))
                }
                Some(_) => {}
            }
        }

        let owner = &self.attributes[ATTR_OWNER];
        if !owner.contains('@') || *owner != owner.to_lowercase() {
            return Err(SetupError::InvalidKsr(format!(
                "owner must be a lowercased email address: {owner}"
            )));
        }

        let declared = &self.attributes[ATTR_PRIMARY_KEY_ID];
        if *declared != super::key_id(&self.primary_public) {
            return Err(SetupError::InvalidKsr(
                "primary key id does not match the embedded key".to_string(),
            ));
        }
        let declared = &self.attributes[ATTR_COUNTER_KEY_ID];
        if *declared != super::key_id(&self.counter_public) {
            return Err(SetupError::InvalidKsr(
                "counter key id does not match the embedded key".to_string(),
            ));
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut w = FrameWriter::new(Vec::new());
        w.write_version()?;
        w.write_bytes(&self.primary_public)?;
        w.write_bytes(&self.counter_public)?;
        w.write_varint(self.attributes.len() as u64)?;
        for (key, value) in &self.attributes {
            w.write_string(key)?;
            w.write_string(value)?;
        }
        w.write_string(&self.purpose)?;
        w.write_bytes(&self.self_signature)?;
        Ok(w.into_inner())
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut r = FrameReader::new(Cursor::new(data));
        r.read_version()?;

        let primary_public = r.read_bytes(MAX_KEY_LEN)?;
        let counter_public = r.read_bytes(MAX_KEY_LEN)?;
        let count = r.read_varint()?;
        if count > MAX_ATTRIBUTES {
            return Err(SetupError::InvalidFormat(format!(
                "implausible attribute count: {count}"
            )));
        }
        let mut attributes = BTreeMap::new();
        for _ in 0..count {
            let key = r.read_string(MAX_ATTR_LEN)?;
            let value = r.read_string(MAX_ATTR_LEN)?;
            attributes.insert(key, value);
        }
        let purpose = r.read_string(MAX_ATTR_LEN)?;
        let self_signature = r.read_bytes(MAX_SIG_LEN)?;

        Ok(Self {
            primary_public,
            counter_public,
            attributes,
            purpose,
            self_signature,
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

/// Canonical signed payload: keys, sorted attributes, purpose. The BTreeMap
/// ordering makes re-serialization stable across processes.
fn signable(
    primary_public: &[u8],
    counter_public: &[u8],
    attributes: &BTreeMap<String, String>,
    purpose: &str,
) -> Result<Vec<u8>> {
    let mut w = FrameWriter::new(Vec::new());
    w.write_version()?;
    w.write_bytes(primary_public)?;
    w.write_bytes(counter_public)?;
    w.write_varint(attributes.len() as u64)?;
    for (key, value) in attributes {
        w.write_string(key)?;
        w.write_string(value)?;
    }
    w.write_string(purpose)?;
    Ok(w.into_inner())
}
