//! Cryptographic Verification
//!
//! M-of-N threshold checking of the signed index, plus the SHA-256 helpers
//! used to gate every patch hop.

use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::{debug, warn};

use super::error::{HashStage, Result, UpdateError};
use super::manifest::{Manifest, Sha256Digest, SignedManifest};
use super::signature::{self, KeyPoint};

/// Verifier for signed indexes
pub struct ThresholdVerifier {
    trusted_keys: HashSet<KeyPoint>,
    required_signers: usize,
}

impl ThresholdVerifier {
    pub fn new(trusted_keys: impl IntoIterator<Item = KeyPoint>, required_signers: usize) -> Self {
        Self {
            trusted_keys: trusted_keys.into_iter().collect(),
            required_signers,
        }
    }

    /// The text signers sign: the lowercase hex SHA-256 of the raw manifest
    /// bytes, as a string. External signers depend on this exact form.
    pub fn signing_message(raw_manifest: &[u8]) -> String {
        Sha256Digest::of(raw_manifest).to_hex()
    }

    /// Count distinct trusted signers over the raw bytes, then decode.
    ///
    /// A signature that fails to decode aborts verification. A signature that
    /// decodes but recovers no trusted (or an already counted) key is ignored.
    pub fn verify(&self, signed: &SignedManifest) -> Result<Manifest> {
        let message = Self::signing_message(&signed.manifest);
        let mut remaining = self.trusted_keys.clone();
        let mut valid = 0usize;

        for (index, sig) in signed.signatures.iter().enumerate() {
            let candidates = signature::candidate_keys(&message, sig)?;
            match candidates.iter().find(|key| remaining.contains(*key)) {
                Some(key) => {
                    // Each key counts once
                    remaining.remove(key);
                    valid += 1;
                    debug!("Signature {} valid, signed by {}", index, key);
                }
                None => match candidates.first() {
                    Some(key) => warn!("Found signature by unrecognised key: {}", key),
                    None => warn!("Signature {} recovered no key", index),
                },
            }
        }

        if valid < self.required_signers {
            return Err(UpdateError::InsufficientSigners {
                valid,
                required: self.required_signers,
            });
        }
        Manifest::from_bytes(&signed.manifest)
    }

    /// Calculate SHA256 of a file
    pub fn calculate_sha256(path: &Path) -> Result<Sha256Digest> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let mut hasher = Sha256::new();

        let mut buffer = [0u8; 8192];
        loop {
            let bytes_read = reader.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }

        Ok(Sha256Digest(hasher.finalize().into()))
    }

    /// Compare a digest for one of the three hops of an update entry
    pub fn check_digest(
        version: u32,
        stage: HashStage,
        expected: &Sha256Digest,
        actual: &Sha256Digest,
    ) -> Result<()> {
        if expected != actual {
            warn!(
                "{} hash mismatch for version {}: {} vs {}",
                stage, version, actual, expected
            );
            return Err(UpdateError::BadUpdateHash {
                version,
                stage,
                expected: expected.to_hex(),
                actual: actual.to_hex(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::updater::manifest::UpdateEntry;
    use crate::engine::updater::signature::{sign_message, PrivateKey};
    use std::collections::BTreeMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn keys(n: usize) -> Vec<PrivateKey> {
        (0..n).map(|_| PrivateKey::generate()).collect()
    }

    fn manifest_bytes() -> Vec<u8> {
        Manifest::new(vec![UpdateEntry {
            version: 2,
            urls: vec!["http://localhost/2.jar.bpatch".to_string()],
            pre_hash: Sha256Digest::of(b"1"),
            patch_hash: Sha256Digest::of(b"p"),
            post_hash: Sha256Digest::of(b"2"),
            patch_size: 1,
            gzipped: false,
            descriptions: BTreeMap::new(),
        }])
        .to_bytes()
        .unwrap()
    }

    fn signed_by(bytes: &[u8], signers: &[&PrivateKey]) -> SignedManifest {
        let message = ThresholdVerifier::signing_message(bytes);
        SignedManifest {
            manifest: bytes.to_vec(),
            signatures: signers
                .iter()
                .map(|k| sign_message(&message, k).unwrap())
                .collect(),
        }
    }

    fn verifier(keys: &[PrivateKey], threshold: usize) -> ThresholdVerifier {
        ThresholdVerifier::new(keys.iter().map(|k| k.public_key()), threshold)
    }

    #[test]
    fn test_threshold_met() {
        let keys = keys(3);
        let bytes = manifest_bytes();
        let signed = signed_by(&bytes, &[&keys[0], &keys[2]]);
        let manifest = verifier(&keys, 2).verify(&signed).unwrap();
        assert_eq!(manifest.entries[0].version, 2);
    }

    #[test]
    fn test_threshold_minus_one_fails() {
        let keys = keys(3);
        let bytes = manifest_bytes();
        let signed = signed_by(&bytes, &[&keys[1]]);
        assert!(matches!(
            verifier(&keys, 2).verify(&signed),
            Err(UpdateError::InsufficientSigners { valid: 1, required: 2 })
        ));
    }

    #[test]
    fn test_duplicate_signer_counts_once() {
        let keys = keys(3);
        let bytes = manifest_bytes();
        let signed = signed_by(&bytes, &[&keys[0], &keys[0]]);
        assert!(matches!(
            verifier(&keys, 2).verify(&signed),
            Err(UpdateError::InsufficientSigners { valid: 1, .. })
        ));
    }

    #[test]
    fn test_unknown_key_ignored() {
        let keys = keys(3);
        let evil = PrivateKey::generate();
        let bytes = manifest_bytes();
        let signed = signed_by(&bytes, &[&evil, &keys[1]]);
        assert!(matches!(
            verifier(&keys, 2).verify(&signed),
            Err(UpdateError::InsufficientSigners { valid: 1, .. })
        ));
    }

    #[test]
    fn test_signature_over_other_message_ignored() {
        let keys = keys(3);
        let bytes = manifest_bytes();
        let mut signed = signed_by(&bytes, &[&keys[0], &keys[1]]);
        signed.signatures[0] = sign_message("hash from some other project", &keys[0]).unwrap();
        assert!(matches!(
            verifier(&keys, 2).verify(&signed),
            Err(UpdateError::InsufficientSigners { .. })
        ));
    }

    #[test]
    fn test_undecodable_signature_is_fatal() {
        let keys = keys(3);
        let bytes = manifest_bytes();
        let mut signed = signed_by(&bytes, &[&keys[0], &keys[1], &keys[2]]);
        signed.signatures[2] = "bzzzz".to_string();
        assert!(matches!(
            verifier(&keys, 2).verify(&signed),
            Err(UpdateError::MalformedSignature(_))
        ));
    }

    #[test]
    fn test_unparseable_manifest_after_signatures() {
        let keys = keys(2);
        let signed = signed_by(b"\xffnot a manifest", &[&keys[0], &keys[1]]);
        assert!(matches!(
            verifier(&keys, 2).verify(&signed),
            Err(UpdateError::ManifestDecode(_))
        ));
    }

    #[test]
    fn test_sha256_calculation() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"hello world").unwrap();
        file.flush().unwrap();

        let digest = ThresholdVerifier::calculate_sha256(file.path()).unwrap();
        assert_eq!(
            digest.to_hex(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_signing_message_is_lowercase_hex() {
        assert_eq!(
            ThresholdVerifier::signing_message(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_check_digest_mismatch() {
        let err = ThresholdVerifier::check_digest(
            4,
            HashStage::Patch,
            &Sha256Digest::of(b"a"),
            &Sha256Digest::of(b"b"),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            UpdateError::BadUpdateHash { version: 4, stage: HashStage::Patch, .. }
        ));
    }
}
