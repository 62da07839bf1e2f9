//! Update State Machine
//!
//! One run moves through explicit phases so observers never see a
//! half-applied update. Nothing here is persisted: a session lives exactly
//! as long as the run that owns it.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::error::{FailureKind, Result, UpdateError};

/// Current phase of an update run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UpdatePhase {
    /// Run not started yet
    #[default]
    Idle,
    /// Fetching the signed index
    Fetching,
    /// Checking signatures
    Verifying,
    /// Picking the entries newer than the current version
    SelectingUpdates,
    /// Downloading patches
    Downloading {
        version: u32,
        progress: f32,
        bytes_downloaded: u64,
        total_bytes: u64,
    },
    /// Applying the patch that produces `version`
    Applying { version: u32 },
    /// Run finished; `highest_version` may equal the starting version
    Done { highest_version: u32 },
    /// Run aborted on its first error
    Failed { kind: FailureKind, reason: String },
}

impl UpdatePhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Failed { .. })
    }

    pub fn failed(err: &UpdateError) -> Self {
        Self::Failed {
            kind: err.kind(),
            reason: err.to_string(),
        }
    }
}

/// Transient bookkeeping for a single run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateSession {
    pub current_version: u32,
    pub highest_applied_version: u32,
    pub total_bytes_expected: u64,
    pub total_bytes_downloaded: u64,
}

impl UpdateSession {
    pub fn new(current_version: u32) -> Self {
        Self {
            current_version,
            highest_applied_version: current_version,
            total_bytes_expected: 0,
            total_bytes_downloaded: 0,
        }
    }

    /// Record a verified bundle. Versions must strictly increase.
    pub fn advance(&mut self, version: u32) -> Result<()> {
        if version <= self.highest_applied_version {
            return Err(UpdateError::NonMonotonic {
                attempted: version,
                highest: self.highest_applied_version,
            });
        }
        self.highest_applied_version = version;
        Ok(())
    }

    /// Overall download progress in percent
    pub fn progress(&self) -> f32 {
        if self.total_bytes_expected > 0 {
            (self.total_bytes_downloaded as f32 / self.total_bytes_expected as f32) * 100.0
        } else {
            0.0
        }
    }

    /// Phase snapshot for a download in progress
    pub fn downloading(&self, version: u32) -> UpdatePhase {
        UpdatePhase::Downloading {
            version,
            progress: self.progress(),
            bytes_downloaded: self.total_bytes_downloaded,
            total_bytes: self.total_bytes_expected,
        }
    }
}

/// Cooperative cancellation flag shared between a run and its caller
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Bail out with [`UpdateError::Cancelled`] once cancelled
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(UpdateError::Cancelled)
        } else {
            Ok(())
        }
    }
}
