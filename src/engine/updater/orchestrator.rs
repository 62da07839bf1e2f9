//! Update Orchestrator
//!
//! Drives one run: fetch the signed index, verify it, select the entries
//! newer than the baseline, download every patch, then apply them in order.
//! Reconstructed bundles are staged under `tmp/` and only moved into the
//! cache after the whole chain verified, so a failed or cancelled run never
//! leaves a bundle that `VersionResolver` would pick up.

use flate2::read::GzDecoder;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::delta::{DeltaEngine, GdiffEngine};
use super::download::{self, Downloader};
use super::error::{HashStage, Result, UpdateError};
use super::manifest::{Manifest, Sha256Digest, SignedManifest, UpdateDescription, UpdateEntry};
use super::state::{CancelToken, UpdatePhase, UpdateSession};
use super::verify::ThresholdVerifier;
use super::version_manager::VersionResolver;
use crate::engine::config::UpdaterConfig;
use crate::engine::locks::{LockError, RunLock};

/// Outcome of a successful run
#[derive(Debug, Clone, Serialize)]
pub struct UpdateSummary {
    /// Equal to the starting version when nothing applied
    pub highest_version: u32,
    /// Versions made visible in the cache by this run
    pub applied: Vec<u32>,
    /// Release notes for `highest_version`, by locale
    pub descriptions: BTreeMap<String, UpdateDescription>,
    #[serde(skip)]
    pub manifest: Manifest,
}

pub struct Updater {
    config: UpdaterConfig,
    baseline_version: u32,
    baseline_bundle: PathBuf,
    resolver: VersionResolver,
    verifier: ThresholdVerifier,
    downloader: Downloader,
    engine: Arc<dyn DeltaEngine>,
    phase_tx: watch::Sender<UpdatePhase>,
    cancel: CancelToken,
}

impl Updater {
    pub fn new(config: UpdaterConfig) -> Result<Self> {
        config.validate()?;
        let keys = config.trusted_key_points()?;
        let verifier = ThresholdVerifier::new(keys, config.required_signers);
        let resolver = VersionResolver::new(&config.cache_dir, config.bundle_extension());
        let downloader = Downloader::new(&config.user_agent, config.connect_timeout())?;
        let (phase_tx, _) = watch::channel(UpdatePhase::Idle);

        Ok(Self {
            baseline_version: config.current_version,
            baseline_bundle: config.original_bundle.clone(),
            config,
            resolver,
            verifier,
            downloader,
            engine: Arc::new(GdiffEngine::default()),
            phase_tx,
            cancel: CancelToken::new(),
        })
    }

    pub fn with_delta_engine(mut self, engine: Arc<dyn DeltaEngine>) -> Self {
        self.engine = engine;
        self
    }

    /// Update from an explicit bundle instead of the configured original
    pub fn with_baseline(mut self, version: u32, bundle: PathBuf) -> Self {
        self.baseline_version = version;
        self.baseline_bundle = bundle;
        self
    }

    /// Update from whatever bundle the resolver would launch
    pub fn resolve_baseline(self) -> Result<Self> {
        let resolved = self
            .resolver
            .resolve(self.config.current_version, &self.config.original_bundle)?;
        debug!("Baseline is version {} at {}", resolved.version, resolved.path.display());
        Ok(self.with_baseline(resolved.version, resolved.path))
    }

    pub fn subscribe(&self) -> watch::Receiver<UpdatePhase> {
        self.phase_tx.subscribe()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn resolver(&self) -> &VersionResolver {
        &self.resolver
    }

    /// Run on a background task
    pub fn spawn(self) -> JoinHandle<Result<UpdateSummary>> {
        tokio::spawn(async move { self.run().await })
    }

    pub async fn run(&self) -> Result<UpdateSummary> {
        let result = self.run_locked().await;
        match &result {
            Ok(summary) => {
                info!("Update run finished at version {}", summary.highest_version);
                self.set_phase(UpdatePhase::Done {
                    highest_version: summary.highest_version,
                });
            }
            Err(e) => {
                error!("Update run failed: {}", e);
                self.set_phase(UpdatePhase::failed(e));
            }
        }
        result
    }

    fn set_phase(&self, phase: UpdatePhase) {
        debug!("Phase: {:?}", phase);
        self.phase_tx.send_replace(phase);
    }

    async fn run_locked(&self) -> Result<UpdateSummary> {
        let _guard = RunLock::new(self.resolver.cache_dir())
            .acquire()
            .map_err(|e| match e {
                LockError::AlreadyLocked { path, .. } => UpdateError::RunInProgress(path),
                LockError::Io(e) => UpdateError::Io(e),
                LockError::Serialize(e) => UpdateError::Io(io::Error::other(e)),
            })?;
        self.resolver.purge_tmp()?;
        self.cancel.check()?;

        let result = self.run_phases().await;
        if let Err(e) = self.resolver.purge_tmp() {
            warn!("Could not clean up {}: {}", self.resolver.tmp_dir().display(), e);
        }
        result
    }

    async fn run_phases(&self) -> Result<UpdateSummary> {
        let mut session = UpdateSession::new(self.baseline_version);

        self.set_phase(UpdatePhase::Fetching);
        let raw = self
            .downloader
            .fetch_bounded(&self.config.index_url(), self.config.max_index_bytes)
            .await?;
        let signed = SignedManifest::from_bytes(&raw)?;

        self.set_phase(UpdatePhase::Verifying);
        let manifest = self.verifier.verify(&signed)?;
        info!(
            "Index verified: {} entries, {} signature(s)",
            manifest.entries.len(),
            signed.signatures.len()
        );

        self.set_phase(UpdatePhase::SelectingUpdates);
        manifest.validate()?;
        let selected: Vec<&UpdateEntry> = manifest
            .entries
            .iter()
            .filter(|e| e.version > session.current_version)
            .collect();
        if selected.is_empty() {
            info!("No updates newer than version {}", session.current_version);
            return Ok(self.summary(&session, Vec::new(), manifest));
        }
        session.total_bytes_expected = selected.iter().map(|e| e.patch_size).sum();
        info!(
            "{} update(s) to apply, {} bytes to download",
            selected.len(),
            session.total_bytes_expected
        );

        // Fail fast on an unexpected local bundle, before any download
        let baseline_digest = ThresholdVerifier::calculate_sha256(&self.baseline_bundle)?;
        ThresholdVerifier::check_digest(
            selected[0].version,
            HashStage::Pre,
            &selected[0].pre_hash,
            &baseline_digest,
        )?;

        for entry in &selected {
            self.cancel.check()?;
            self.download_patch(entry, &mut session).await?;
        }

        let mut base_path = self.baseline_bundle.clone();
        let mut staged = Vec::with_capacity(selected.len());
        for entry in &selected {
            self.cancel.check()?;
            self.set_phase(UpdatePhase::Applying {
                version: entry.version,
            });
            base_path = self.apply_patch(entry, &base_path).await?;
            session.advance(entry.version)?;
            staged.push(entry.version);
        }

        self.cancel.check()?;
        for path in self.resolver.commit_staged_all(&staged)? {
            info!("Available: {}", path.display());
        }

        Ok(self.summary(&session, staged, manifest))
    }

    fn patch_url(&self, entry: &UpdateEntry) -> Result<String> {
        let url = download::choose_url(&entry.urls).ok_or_else(|| {
            UpdateError::InvalidManifest(format!("entry {} has no URLs", entry.version))
        })?;
        if self.config.override_urls {
            Ok(download::override_url(url, self.config.base_url())?)
        } else {
            Ok(url.clone())
        }
    }

    async fn download_patch(&self, entry: &UpdateEntry, session: &mut UpdateSession) -> Result<()> {
        let url = self.patch_url(entry)?;
        let dest = self.resolver.patch_path(entry.version);
        self.set_phase(session.downloading(entry.version));

        let already_downloaded = session.total_bytes_downloaded;
        let result = self
            .downloader
            .download(&url, &dest, entry.patch_size, &self.cancel, |downloaded, _| {
                session.total_bytes_downloaded = already_downloaded + downloaded;
                self.phase_tx.send_replace(session.downloading(entry.version));
            })
            .await?;

        ThresholdVerifier::check_digest(
            entry.version,
            HashStage::Patch,
            &entry.patch_hash,
            &result.digest,
        )?;
        debug!(
            "Patch for version {} downloaded: {} bytes",
            entry.version, result.bytes_downloaded
        );
        Ok(())
    }

    /// Reconstruct `entry.version` from `base_path`, returning the staged path
    async fn apply_patch(&self, entry: &UpdateEntry, base_path: &Path) -> Result<PathBuf> {
        let base = fs::read(base_path)?;
        ThresholdVerifier::check_digest(
            entry.version,
            HashStage::Pre,
            &entry.pre_hash,
            &Sha256Digest::of(&base),
        )?;

        let mut patch = fs::read(self.resolver.patch_path(entry.version))?;
        if entry.gzipped {
            let mut decompressed = Vec::new();
            GzDecoder::new(patch.as_slice()).read_to_end(&mut decompressed)?;
            patch = decompressed;
        }

        let engine = Arc::clone(&self.engine);
        let candidate = tokio::task::spawn_blocking(move || engine.apply(&base, &patch))
            .await
            .map_err(|e| UpdateError::Io(io::Error::other(e)))??;

        ThresholdVerifier::check_digest(
            entry.version,
            HashStage::Post,
            &entry.post_hash,
            &Sha256Digest::of(&candidate),
        )?;

        let staged = self.resolver.staged_bundle_path(entry.version);
        fs::write(&staged, &candidate)?;
        info!("Applied update {} ({} bytes)", entry.version, candidate.len());
        Ok(staged)
    }

    fn summary(&self, session: &UpdateSession, applied: Vec<u32>, manifest: Manifest) -> UpdateSummary {
        let descriptions = manifest
            .entry(session.highest_applied_version)
            .map(|e| e.descriptions.clone())
            .unwrap_or_default();
        UpdateSummary {
            highest_version: session.highest_applied_version,
            applied,
            descriptions,
            manifest,
        }
    }
}
