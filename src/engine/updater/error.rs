//! Update Error Types
//!
//! Every phase of an update run surfaces the first error it meets as an
//! [`UpdateError`]; there is no partial-success state.

use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

use super::delta::DeltaError;
use super::signature::SignatureError;
use crate::engine::config::ConfigError;

/// Network and HTTP failures
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("{url} exceeded the {limit} byte response limit")]
    TooLarge { url: String, limit: u64 },

    #[error("{url} was truncated: expected {expected} bytes, got {received}")]
    Truncated {
        url: String,
        expected: u64,
        received: u64,
    },

    #[error("invalid URL {0}")]
    InvalidUrl(String),

    #[error("could not build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

/// Which of the three digests in an update entry failed to match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashStage {
    Pre,
    Patch,
    Post,
}

impl std::fmt::Display for HashStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pre => write!(f, "pre-patch"),
            Self::Patch => write!(f, "patch"),
            Self::Post => write!(f, "post-patch"),
        }
    }
}

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("malformed signature: {0}")]
    MalformedSignature(#[from] SignatureError),

    #[error("insufficient signers: {valid} valid distinct signature(s), {required} required")]
    InsufficientSigners { valid: usize, required: usize },

    #[error("unknown manifest format version {found} (understood: {expected})")]
    UnknownManifestVersion { found: u32, expected: u32 },

    #[error("{stage} hash mismatch for version {version}: expected {expected}, got {actual}")]
    BadUpdateHash {
        version: u32,
        stage: HashStage,
        expected: String,
        actual: String,
    },

    #[error("pinned version {pinned} is older than the installed version {original}")]
    InconsistentPinState { pinned: u32, original: u32 },

    #[error("update cancelled")]
    Cancelled,

    #[error("signed index could not be decoded: {0}")]
    InvalidIndex(String),

    #[error("signatures verified but the manifest could not be decoded: {0}")]
    ManifestDecode(String),

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("another update run holds {0}")]
    RunInProgress(PathBuf),

    #[error("version {attempted} does not advance past {highest}")]
    NonMonotonic { attempted: u32, highest: u32 },

    #[error("delta engine: {0}")]
    Delta(#[from] DeltaError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Serializable failure classification reported alongside the message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transport,
    MalformedSignature,
    InsufficientSigners,
    UnknownManifestVersion,
    BadUpdateHash,
    InconsistentPinState,
    Cancelled,
    InvalidIndex,
    InvalidManifest,
    RunInProgress,
    Internal,
}

impl UpdateError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Transport(_) => FailureKind::Transport,
            Self::MalformedSignature(_) => FailureKind::MalformedSignature,
            Self::InsufficientSigners { .. } => FailureKind::InsufficientSigners,
            Self::UnknownManifestVersion { .. } => FailureKind::UnknownManifestVersion,
            Self::BadUpdateHash { .. } => FailureKind::BadUpdateHash,
            Self::InconsistentPinState { .. } => FailureKind::InconsistentPinState,
            Self::Cancelled => FailureKind::Cancelled,
            Self::InvalidIndex(_) => FailureKind::InvalidIndex,
            Self::ManifestDecode(_) | Self::InvalidManifest(_) => FailureKind::InvalidManifest,
            Self::RunInProgress(_) => FailureKind::RunInProgress,
            Self::NonMonotonic { .. } | Self::Delta(_) | Self::Io(_) | Self::Config(_) => {
                FailureKind::Internal
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, UpdateError>;
