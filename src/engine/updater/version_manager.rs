//! Version Manager
//!
//! Owns the update cache layout and decides which bundle is authoritative.
//!
//! ```text
//! <cache_dir>/
//! ├── <version>.<ext>          fully verified bundles
//! ├── version-pin.txt          optional pin, a single ASCII integer
//! ├── update.lock              held while a run is active
//! └── tmp/                     in-flight patches and staged bundles
//! ```

use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::error::{Result, UpdateError};

pub const PIN_FILE_NAME: &str = "version-pin.txt";
pub const TMP_DIR_NAME: &str = "tmp";
pub const PATCH_SUFFIX: &str = "bpatch";

/// Where a resolved bundle came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleSource {
    Original,
    Cached,
    Pinned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedBundle {
    pub version: u32,
    pub path: PathBuf,
    pub source: BundleSource,
}

/// Resolver over one cache directory
#[derive(Debug, Clone)]
pub struct VersionResolver {
    cache_dir: PathBuf,
    extension: String,
}

impl VersionResolver {
    pub fn new(cache_dir: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            extension: extension.into(),
        }
    }

    /// Create the cache and tmp directories
    pub fn init(&self) -> Result<()> {
        fs::create_dir_all(self.tmp_dir())?;
        Ok(())
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.cache_dir.join(TMP_DIR_NAME)
    }

    pub fn pin_path(&self) -> PathBuf {
        self.cache_dir.join(PIN_FILE_NAME)
    }

    pub fn bundle_file_name(&self, version: u32) -> String {
        format!("{}.{}", version, self.extension)
    }

    /// Path of a verified bundle in the cache
    pub fn bundle_path(&self, version: u32) -> PathBuf {
        self.cache_dir.join(self.bundle_file_name(version))
    }

    /// Path of a reconstructed bundle that is not yet visible
    pub fn staged_bundle_path(&self, version: u32) -> PathBuf {
        self.tmp_dir().join(self.bundle_file_name(version))
    }

    /// Path of a downloaded, not yet applied patch
    pub fn patch_path(&self, version: u32) -> PathBuf {
        self.tmp_dir()
            .join(format!("{}.{}", self.bundle_file_name(version), PATCH_SUFFIX))
    }

    /// Parse `<digits>.<ext>`; anything else is not a cached bundle
    pub fn parse_bundle_name(&self, name: &str) -> Option<u32> {
        let stem = name.strip_suffix(&self.extension)?.strip_suffix('.')?;
        if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        stem.parse().ok()
    }

    /// All cached bundle versions, ascending
    pub fn list_cached_versions(&self) -> Result<Vec<u32>> {
        let entries = match fs::read_dir(&self.cache_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };

        let mut versions = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            match self.parse_bundle_name(&name) {
                Some(version) => versions.push(version),
                None => debug!("Skipping {} in cache: not a bundle name", name),
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    pub fn best_cached_version(&self) -> Result<Option<u32>> {
        Ok(self.list_cached_versions()?.into_iter().max())
    }

    /// Read the pin. A pin file that cannot be parsed is logged and ignored.
    pub fn read_pin(&self) -> Result<Option<u32>> {
        let path = self.pin_path();
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match content.lines().next().unwrap_or("").trim().parse::<u32>() {
            Ok(version) => Ok(Some(version)),
            Err(e) => {
                warn!("Could not parse {}, ignoring: {}", path.display(), e);
                Ok(None)
            }
        }
    }

    /// Pin to `version`, replacing any existing pin. Not validated here.
    pub fn pin(&self, version: u32) -> Result<()> {
        fs::create_dir_all(&self.cache_dir)?;
        let pin_path = self.pin_path();
        let temp_path = pin_path.with_extension("tmp");
        fs::write(&temp_path, version.to_string())?;
        fs::rename(&temp_path, &pin_path)?;
        info!("Pinned to version {}", version);
        Ok(())
    }

    pub fn unpin(&self) -> Result<()> {
        match fs::remove_file(self.pin_path()) {
            Ok(()) => {
                info!("Removed version pin");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Pick the bundle to run.
    ///
    /// A pin wins when its bundle is cached or it names the original version.
    /// A pin below the original version is an error. A pin to a version that
    /// is not cached yet falls through to the newest cached bundle.
    pub fn resolve(&self, original_version: u32, original_bundle: &Path) -> Result<ResolvedBundle> {
        let original = ResolvedBundle {
            version: original_version,
            path: original_bundle.to_path_buf(),
            source: BundleSource::Original,
        };

        if let Some(pinned) = self.read_pin()? {
            let pinned_bundle = self.bundle_path(pinned);
            if pinned_bundle.is_file() {
                info!("Using pinned version {}", pinned);
                return Ok(ResolvedBundle {
                    version: pinned,
                    path: pinned_bundle,
                    source: BundleSource::Pinned,
                });
            }
            if pinned == original_version {
                info!("Pinned to the original version {}", pinned);
                return Ok(ResolvedBundle {
                    source: BundleSource::Pinned,
                    ..original
                });
            }
            if pinned < original_version {
                return Err(UpdateError::InconsistentPinState {
                    pinned,
                    original: original_version,
                });
            }
            warn!("Pinned version {} is not cached yet, ignoring pin", pinned);
        }

        match self.best_cached_version()? {
            Some(best) => {
                info!("Using cached version {}", best);
                Ok(ResolvedBundle {
                    version: best,
                    path: self.bundle_path(best),
                    source: BundleSource::Cached,
                })
            }
            None => Ok(original),
        }
    }

    /// Remove everything under tmp/
    pub fn purge_tmp(&self) -> Result<()> {
        let tmp = self.tmp_dir();
        match fs::remove_dir_all(&tmp) {
            Ok(()) => debug!("Purged {}", tmp.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        fs::create_dir_all(&tmp)?;
        Ok(())
    }

    /// Move a staged bundle into the cache, making it visible to `resolve`
    pub fn commit_staged(&self, version: u32) -> Result<PathBuf> {
        let final_path = self.bundle_path(version);
        fs::rename(self.staged_bundle_path(version), &final_path)?;
        Ok(final_path)
    }

    /// Commit every staged version, or none of them.
    ///
    /// On failure the bundles this call made visible are removed again;
    /// bundles that were already cached before the call are left alone.
    pub fn commit_staged_all(&self, versions: &[u32]) -> Result<Vec<PathBuf>> {
        let mut committed = Vec::with_capacity(versions.len());
        for &version in versions {
            let existed = self.bundle_path(version).is_file();
            match self.commit_staged(version) {
                Ok(path) => committed.push((path, existed)),
                Err(e) => {
                    for (path, existed) in committed.iter().rev() {
                        if *existed {
                            continue;
                        }
                        if let Err(undo) = fs::remove_file(path) {
                            warn!("Could not roll back {}: {}", path.display(), undo);
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(committed.into_iter().map(|(path, _)| path).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn resolver(dir: &Path) -> VersionResolver {
        VersionResolver::new(dir.join("updates"), "jar")
    }

    fn cache(resolver: &VersionResolver, version: u32) {
        fs::create_dir_all(resolver.cache_dir()).unwrap();
        fs::write(resolver.bundle_path(version), version.to_string()).unwrap();
    }

    #[test]
    fn test_parse_bundle_name_is_strict() {
        let r = VersionResolver::new("/tmp/unused", "jar");
        assert_eq!(r.parse_bundle_name("12.jar"), Some(12));
        assert_eq!(r.parse_bundle_name("0.jar"), Some(0));
        assert_eq!(r.parse_bundle_name("a12.jar"), None);
        assert_eq!(r.parse_bundle_name("12.jar.bpatch"), None);
        assert_eq!(r.parse_bundle_name("12jar"), None);
        assert_eq!(r.parse_bundle_name(".jar"), None);
        assert_eq!(r.parse_bundle_name("-1.jar"), None);
        assert_eq!(r.parse_bundle_name("+1.jar"), None);
        assert_eq!(r.parse_bundle_name("12.zip"), None);
        assert_eq!(r.parse_bundle_name("99999999999.jar"), None);
    }

    #[test]
    fn test_best_cached_version() {
        let dir = tempdir().unwrap();
        let r = resolver(dir.path());
        assert_eq!(r.best_cached_version().unwrap(), None);

        r.init().unwrap();
        assert_eq!(r.best_cached_version().unwrap(), None);

        cache(&r, 3);
        cache(&r, 10);
        cache(&r, 2);
        fs::write(r.cache_dir().join("notes.jar"), "x").unwrap();
        fs::write(r.cache_dir().join("11.jar.bpatch"), "x").unwrap();
        fs::create_dir_all(r.cache_dir().join("12.jar")).unwrap();

        assert_eq!(r.list_cached_versions().unwrap(), vec![2, 3, 10]);
        assert_eq!(r.best_cached_version().unwrap(), Some(10));
    }

    #[test]
    fn test_resolve_unpinned() {
        let dir = tempdir().unwrap();
        let r = resolver(dir.path());
        let original = dir.path().join("1.jar");

        let resolved = r.resolve(1, &original).unwrap();
        assert_eq!(resolved.source, BundleSource::Original);
        assert_eq!(resolved.path, original);

        cache(&r, 2);
        cache(&r, 3);
        let resolved = r.resolve(1, &original).unwrap();
        assert_eq!(resolved.version, 3);
        assert_eq!(resolved.path, r.bundle_path(3));
        assert_eq!(resolved.source, BundleSource::Cached);
    }

    #[test]
    fn test_resolve_takes_highest_cached_even_below_original() {
        let dir = tempdir().unwrap();
        let r = resolver(dir.path());
        cache(&r, 2);
        let resolved = r.resolve(5, Path::new("/opt/app/5.jar")).unwrap();
        assert_eq!(resolved.version, 2);
        assert_eq!(resolved.source, BundleSource::Cached);
    }

    #[test]
    fn test_resolve_pinned_to_cached_version() {
        let dir = tempdir().unwrap();
        let r = resolver(dir.path());
        cache(&r, 2);
        cache(&r, 3);
        r.pin(2).unwrap();

        let resolved = r.resolve(1, Path::new("/opt/app/1.jar")).unwrap();
        assert_eq!(resolved.version, 2);
        assert_eq!(resolved.source, BundleSource::Pinned);
    }

    #[test]
    fn test_resolve_pinned_to_original() {
        let dir = tempdir().unwrap();
        let r = resolver(dir.path());
        cache(&r, 3);
        r.pin(1).unwrap();

        let resolved = r.resolve(1, Path::new("/opt/app/1.jar")).unwrap();
        assert_eq!(resolved.version, 1);
        assert_eq!(resolved.path, Path::new("/opt/app/1.jar"));
    }

    #[test]
    fn test_pin_not_cached_falls_through() {
        let dir = tempdir().unwrap();
        let r = resolver(dir.path());
        cache(&r, 2);
        r.pin(3).unwrap();

        let resolved = r.resolve(1, Path::new("/opt/app/1.jar")).unwrap();
        assert_eq!(resolved.version, 2);
        assert_eq!(resolved.source, BundleSource::Cached);
    }

    #[test]
    fn test_pin_below_original_is_inconsistent() {
        let dir = tempdir().unwrap();
        let r = resolver(dir.path());
        r.pin(1).unwrap();
        assert!(matches!(
            r.resolve(2, Path::new("/opt/app/2.jar")),
            Err(UpdateError::InconsistentPinState { pinned: 1, original: 2 })
        ));
    }

    #[test]
    fn test_pin_overwrite_and_unpin() {
        let dir = tempdir().unwrap();
        let r = resolver(dir.path());
        assert_eq!(r.read_pin().unwrap(), None);

        r.pin(4).unwrap();
        r.pin(7).unwrap();
        assert_eq!(r.read_pin().unwrap(), Some(7));
        assert_eq!(fs::read_to_string(r.pin_path()).unwrap(), "7");

        r.unpin().unwrap();
        assert_eq!(r.read_pin().unwrap(), None);
        r.unpin().unwrap();
    }

    #[test]
    fn test_garbage_pin_ignored() {
        let dir = tempdir().unwrap();
        let r = resolver(dir.path());
        fs::create_dir_all(r.cache_dir()).unwrap();
        fs::write(r.pin_path(), "not a number").unwrap();
        assert_eq!(r.read_pin().unwrap(), None);
        assert_eq!(
            r.resolve(1, Path::new("/opt/app/1.jar")).unwrap().source,
            BundleSource::Original
        );
    }

    #[test]
    fn test_purge_and_commit() {
        let dir = tempdir().unwrap();
        let r = resolver(dir.path());
        r.init().unwrap();
        fs::write(r.patch_path(2), "patch").unwrap();
        r.purge_tmp().unwrap();
        assert!(r.tmp_dir().exists());
        assert!(!r.patch_path(2).exists());

        fs::write(r.staged_bundle_path(2), "bundle").unwrap();
        assert_eq!(r.best_cached_version().unwrap(), None);
        let path = r.commit_staged(2).unwrap();
        assert_eq!(fs::read_to_string(path).unwrap(), "bundle");
        assert_eq!(r.best_cached_version().unwrap(), Some(2));
    }

    #[test]
    fn test_commit_all_rolls_back_on_failure() {
        let dir = tempdir().unwrap();
        let r = resolver(dir.path());
        r.init().unwrap();
        cache(&r, 2);
        fs::write(r.staged_bundle_path(2), "bundle 2").unwrap();
        fs::write(r.staged_bundle_path(3), "bundle 3").unwrap();

        // Version 4 was never staged, so its rename fails after 2 and 3 landed
        assert!(r.commit_staged_all(&[2, 3, 4]).is_err());
        assert_eq!(r.list_cached_versions().unwrap(), vec![2]);
        assert!(!r.bundle_path(3).exists());

        fs::write(r.staged_bundle_path(3), "bundle 3").unwrap();
        fs::write(r.staged_bundle_path(4), "bundle 4").unwrap();
        let paths = r.commit_staged_all(&[3, 4]).unwrap();
        assert_eq!(paths, vec![r.bundle_path(3), r.bundle_path(4)]);
        assert_eq!(r.best_cached_version().unwrap(), Some(4));
    }
}
