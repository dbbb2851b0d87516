/// Key identity, digests, and the protocol constants of the signing PKI.
///
/// Keys are identified by the lowercase hex SHA3-512 of their raw public
/// bytes. Purpose strings are part of the wire protocol: verifiers compare
/// them verbatim.
pub mod ksr;
pub mod package_sig;
pub mod pki;
pub mod signed;
pub mod suite;

use std::io::Read;

use sha3::{Digest, Sha3_512};

use crate::error::Result;

/// PKI domain every chain must terminate in.
pub const PKI_DOMAIN: &str = "wan24Setup";

/// Hash algorithm identifier carried by signatures.
pub const HASH_ALGORITHM: &str = "SHA3-512";

/// Purpose of a key signing request.
pub const KEY_SIGNING_PURPOSE: &str = "wan24Setup installer package signing";

/// Purpose stamped on a vendor-issued signed public key.
pub const SIGNED_KEY_PURPOSE: &str =
    "wan24Setup installer package signing permitted public signature key";

/// Purpose stamped on a detached package signature.
pub const PACKAGE_SIGNATURE_PURPOSE: &str = "wan24Setup installer package signature";

/// Generous upper bounds for framed key/signature fields on the wire.
/// Dilithium3 public keys are 1 952 bytes and signatures 3 309 bytes.
pub(crate) const MAX_KEY_LEN: usize = 16 * 1024;
pub(crate) const MAX_SIG_LEN: usize = 16 * 1024;
pub(crate) const MAX_ATTR_LEN: usize = 4 * 1024;

/// SHA3-512 over a byte slice.
pub fn digest(data: &[u8]) -> [u8; 64] {
    let mut out = [0u8; 64];
    out.copy_from_slice(&Sha3_512::digest(data));
    out
}

/// SHA3-512 over a byte stream, without buffering it.
pub fn digest_stream<R: Read>(mut source: R) -> Result<[u8; 64]> {
    let mut hasher = Sha3_512::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = source.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let mut out = [0u8; 64];
    out.copy_from_slice(&hasher.finalize());
    Ok(out)
}

/// Identifier of a public key: lowercase hex of its SHA3-512.
pub fn key_id(public_key: &[u8]) -> String {
    hex::encode(digest(public_key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_deterministic() {
        assert_eq!(digest(b"instpak"), digest(b"instpak"));
        assert_ne!(digest(b"instpak"), digest(b"instpak!"));
    }

    #[test]
    fn test_digest_stream_matches_digest() {
        let data = vec![0x5Au8; 200_000];
        let streamed = digest_stream(&data[..]).unwrap();
        assert_eq!(streamed, digest(&data));
    }

    #[test]
    fn test_key_id_shape() {
        let id = key_id(b"some public key bytes");
        assert_eq!(id.len(), 128);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(id, id.to_lowercase());
    }
}
