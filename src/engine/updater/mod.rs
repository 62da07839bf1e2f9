//! deltaup Self-Update System
//!
//! Signed, delta-based updates for numbered application bundles.
//!
//! Components:
//! - `signature` - Recoverable secp256k1 signatures in signed-message framing
//! - `manifest` - Index data model and CBOR codec
//! - `verify` - M-of-N threshold verification and digest checks
//! - `delta` - Binary patch engine
//! - `download` - HTTP transport with bounded and streamed fetches
//! - `state` - Run phases, session bookkeeping, cancellation
//! - `orchestrator` - The update run itself
//! - `version_manager` - Cache layout, pinning and bundle resolution
//! - `publish` - Patch chain, index building and signing
//! - `loader` - Launching the resolved bundle

pub mod delta;
pub mod download;
pub mod error;
pub mod loader;
pub mod manifest;
pub mod orchestrator;
pub mod publish;
pub mod signature;
pub mod state;
pub mod verify;
pub mod version_manager;

pub use error::{FailureKind, HashStage, Result, TransportError, UpdateError};
pub use manifest::{Manifest, Sha256Digest, SignedManifest, UpdateEntry};
pub use orchestrator::{UpdateSummary, Updater};
pub use state::{CancelToken, UpdatePhase, UpdateSession};
pub use verify::ThresholdVerifier;
pub use version_manager::{ResolvedBundle, VersionResolver};
