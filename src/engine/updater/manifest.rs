//! Update Manifest
//!
//! The signed index served at `<base>/index`. The outer [`SignedManifest`]
//! keeps the manifest as opaque bytes; they are only decoded into a
//! [`Manifest`] after enough signatures over those exact bytes checked out.

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use super::error::{Result, UpdateError};

/// The only manifest layout this build understands
pub const MANIFEST_FORMAT_VERSION: u32 = 1;

/// A SHA-256 digest
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Sha256Digest(pub [u8; 32]);

impl Sha256Digest {
    pub fn of(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl From<[u8; 32]> for Sha256Digest {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl std::fmt::Display for Sha256Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl std::fmt::Debug for Sha256Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Sha256Digest({})", self.to_hex())
    }
}

impl Serialize for Sha256Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for Sha256Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct DigestVisitor;

        impl<'de> Visitor<'de> for DigestVisitor {
            type Value = Sha256Digest;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("32 digest bytes")
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> std::result::Result<Self::Value, E> {
                let bytes: [u8; 32] = v
                    .try_into()
                    .map_err(|_| E::invalid_length(v.len(), &self))?;
                Ok(Sha256Digest(bytes))
            }

            fn visit_byte_buf<E: de::Error>(
                self,
                v: Vec<u8>,
            ) -> std::result::Result<Self::Value, E> {
                self.visit_bytes(&v)
            }
        }

        deserializer.deserialize_bytes(DigestVisitor)
    }
}

/// One localized release note
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateDescription {
    pub summary: String,
    #[serde(default)]
    pub body: String,
}

/// A patch that turns version `version - 1` into `version`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateEntry {
    pub version: u32,
    pub urls: Vec<String>,
    pub pre_hash: Sha256Digest,
    pub patch_hash: Sha256Digest,
    pub post_hash: Sha256Digest,
    /// Informational, used for progress reporting
    #[serde(default)]
    pub patch_size: u64,
    #[serde(default)]
    pub gzipped: bool,
    /// Locale -> description
    #[serde(default)]
    pub descriptions: BTreeMap<String, UpdateDescription>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub entries: Vec<UpdateEntry>,
}

/// Just the format field, read before committing to the full layout
#[derive(Deserialize)]
struct ManifestHeader {
    format_version: u32,
}

impl Manifest {
    pub fn new(entries: Vec<UpdateEntry>) -> Self {
        Self {
            format_version: MANIFEST_FORMAT_VERSION,
            entries,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| UpdateError::InvalidManifest(format!("CBOR serialization failed: {e}")))?;
        Ok(buf)
    }

    /// Decode trusted manifest bytes.
    ///
    /// Only call this on bytes whose signatures already verified.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let header: ManifestHeader = ciborium::from_reader(bytes)
            .map_err(|e| UpdateError::ManifestDecode(e.to_string()))?;
        if header.format_version != MANIFEST_FORMAT_VERSION {
            return Err(UpdateError::UnknownManifestVersion {
                found: header.format_version,
                expected: MANIFEST_FORMAT_VERSION,
            });
        }
        ciborium::from_reader(bytes).map_err(|e| UpdateError::ManifestDecode(e.to_string()))
    }

    /// Check that entries ascend strictly by version and each has a URL
    pub fn validate(&self) -> Result<()> {
        let mut previous: Option<u32> = None;
        for entry in &self.entries {
            if entry.version == 0 {
                return Err(UpdateError::InvalidManifest(
                    "entry with version 0".to_string(),
                ));
            }
            if let Some(prev) = previous {
                if entry.version <= prev {
                    return Err(UpdateError::InvalidManifest(format!(
                        "entry {} follows {}: versions must strictly ascend",
                        entry.version, prev
                    )));
                }
            }
            if entry.urls.is_empty() {
                return Err(UpdateError::InvalidManifest(format!(
                    "entry {} has no URLs",
                    entry.version
                )));
            }
            previous = Some(entry.version);
        }
        Ok(())
    }

    pub fn entry(&self, version: u32) -> Option<&UpdateEntry> {
        self.entries.iter().find(|e| e.version == version)
    }

    pub fn highest_version(&self) -> Option<u32> {
        self.entries.iter().map(|e| e.version).max()
    }
}

/// The envelope served over HTTP
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedManifest {
    #[serde(with = "serde_bytes")]
    pub manifest: Vec<u8>,
    pub signatures: Vec<String>,
}

impl SignedManifest {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| UpdateError::InvalidIndex(format!("CBOR serialization failed: {e}")))?;
        Ok(buf)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ciborium::from_reader(bytes).map_err(|e| UpdateError::InvalidIndex(e.to_string()))
    }
}
