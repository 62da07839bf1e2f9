//! Publishing
//!
//! Turns a directory of numbered builds into a site: one patch per version
//! hop plus a signed index.
//!
//! ```text
//! <workdir>/
//! ├── builds/   1.<ext>, 2.<ext>, ... and optional 2.txt release notes
//! │   └── processed/   normalised copies; these are what gets shipped
//! └── site/     2.<ext>.bpatch, ..., index
//! ```
//!
//! ZIP based bundles from the gzip version onwards are rewritten with every
//! entry stored uncompressed and a fixed timestamp, which keeps the deltas
//! between consecutive builds small.

use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::Url;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipArchive, ZipWriter};

use super::delta::DeltaEngine;
use super::error::UpdateError;
use super::manifest::{Manifest, Sha256Digest, SignedManifest, UpdateDescription, UpdateEntry};
use super::signature::{self, PrivateKey, SignatureError};
use super::verify::ThresholdVerifier;
use super::version_manager::{VersionResolver, PATCH_SUFFIX};

/// Locale used for notes read from `<n>.txt`
pub const DEFAULT_LOCALE: &str = "en";
pub const INDEX_FILE_NAME: &str = "index";
pub const PROCESSED_DIR_NAME: &str = "processed";
/// Release notes carried inside a ZIP bundle
pub const BUNDLE_DESCRIPTION_ENTRY: &str = "update-description.txt";

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("{0} must contain at least two consecutive builds")]
    NoBuilds(PathBuf),
    #[error("Base URL is malformed: {0}")]
    InvalidUrl(String),
    #[error("signing failed: {0}")]
    Signature(#[from] SignatureError),
    #[error("bundle archive: {0}")]
    Zip(#[from] ZipError),
    #[error(transparent)]
    Update(#[from] UpdateError),
}

/// One computed patch and the digests its entry needs
#[derive(Debug, Clone)]
pub struct PatchResult {
    pub version: u32,
    pub path: PathBuf,
    pub pre_hash: Sha256Digest,
    pub patch_hash: Sha256Digest,
    pub post_hash: Sha256Digest,
    pub patch_size: u64,
    pub gzipped: bool,
    pub description: Option<UpdateDescription>,
}

/// Outcome of [`prepare`]
#[derive(Debug)]
pub struct PrepareReport {
    pub patches: Vec<PatchResult>,
    /// Bundles the patches were computed against; ship these
    pub processed_dir: PathBuf,
    pub index_path: PathBuf,
    pub signed: SignedManifest,
}

/// Compute `<n>.<ext>.bpatch` for each consecutive build after the lowest.
///
/// Every build is first copied to `<builds_dir>/processed/`, normalised when
/// its version is `>= gzip_from`, and patches are computed between those
/// copies. Patches for versions `>= gzip_from` are gzip-framed; the patch
/// hash is over the bytes as served.
pub fn compute_delta_chain(
    builds_dir: &Path,
    out_dir: &Path,
    ext: &str,
    gzip_from: Option<u32>,
    engine: &dyn DeltaEngine,
) -> Result<Vec<PatchResult>, PublishError> {
    let builds = VersionResolver::new(builds_dir, ext);
    let versions = builds.list_cached_versions()?;
    let Some(&lowest) = versions.first() else {
        return Err(PublishError::NoBuilds(builds_dir.to_path_buf()));
    };

    let processed = VersionResolver::new(builds_dir.join(PROCESSED_DIR_NAME), ext);
    fs::create_dir_all(processed.cache_dir())?;
    for &version in &versions {
        let src = builds.bundle_path(version);
        let dest = processed.bundle_path(version);
        if gzip_from.is_some_and(|from| version >= from) {
            normalize_bundle(&src, &dest)?;
        } else {
            fs::copy(&src, &dest)?;
        }
    }
    fs::create_dir_all(out_dir)?;

    let mut results = Vec::new();
    let mut version = lowest + 1;
    while versions.contains(&version) {
        let prev = processed.bundle_path(version - 1);
        let cur = processed.bundle_path(version);
        info!("Calculating delta between {} and {}", prev.display(), cur.display());

        let base = fs::read(&prev)?;
        let target = fs::read(&cur)?;
        let gzipped = gzip_from.is_some_and(|from| version >= from);
        let mut patch = engine.compute(&base, &target);
        if gzipped {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&patch)?;
            patch = encoder.finish()?;
        }

        let path = out_dir.join(format!("{}.{}", builds.bundle_file_name(version), PATCH_SUFFIX));
        fs::write(&path, &patch)?;
        info!(
            "... done: {} ({:.2}kb){}",
            path.display(),
            patch.len() as f64 / 1024.0,
            if gzipped { " zipped" } else { "" }
        );

        let description = match read_description(builds_dir, version)? {
            Some(description) => Some(description),
            None => bundle_description(&cur)?,
        };
        results.push(PatchResult {
            version,
            path,
            pre_hash: Sha256Digest::of(&base),
            patch_hash: Sha256Digest::of(&patch),
            post_hash: Sha256Digest::of(&target),
            patch_size: patch.len() as u64,
            gzipped,
            description,
        });
        version += 1;
    }

    if results.is_empty() {
        return Err(PublishError::NoBuilds(builds_dir.to_path_buf()));
    }
    Ok(results)
}

/// Rewrite a ZIP bundle into `dest` with every entry stored uncompressed,
/// a fixed timestamp and fixed permissions.
///
/// Returns `false` when `src` is not a ZIP archive; `dest` is then a plain copy.
pub fn normalize_bundle(src: &Path, dest: &Path) -> Result<bool, PublishError> {
    let mut archive = match ZipArchive::new(File::open(src)?) {
        Ok(archive) => archive,
        Err(e) => {
            debug!("{} is not a ZIP archive ({}), copying as is", src.display(), e);
            fs::copy(src, dest)?;
            return Ok(false);
        }
    };

    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Stored)
        .last_modified_time(DateTime::default())
        .unix_permissions(0o644);
    let partial = dest.with_extension("partial");
    let mut writer = ZipWriter::new(File::create(&partial)?);
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let name = entry.name().to_string();
        if entry.is_dir() {
            writer.add_directory(name, options)?;
        } else {
            writer.start_file(name, options)?;
            io::copy(&mut entry, &mut writer)?;
        }
    }
    writer.finish()?;
    fs::rename(&partial, dest)?;
    info!("Normalised {} into {}", src.display(), dest.display());
    Ok(true)
}

/// First line is the summary, the rest the body; blank text has no notes
fn parse_description(content: &str) -> Option<UpdateDescription> {
    let content = content.trim_start();
    if content.trim().is_empty() {
        return None;
    }
    let (summary, body) = content.split_once('\n').unwrap_or((content, ""));
    Some(UpdateDescription {
        summary: summary.trim().to_string(),
        body: body.trim().to_string(),
    })
}

/// Read the `<n>.txt` sidecar next to a build
pub fn read_description(builds_dir: &Path, version: u32) -> Result<Option<UpdateDescription>, PublishError> {
    let path = builds_dir.join(format!("{}.txt", version));
    match fs::read_to_string(&path) {
        Ok(content) => Ok(parse_description(&content)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Read `update-description.txt` from inside a ZIP bundle
pub fn bundle_description(bundle: &Path) -> Result<Option<UpdateDescription>, PublishError> {
    let Ok(mut archive) = ZipArchive::new(File::open(bundle)?) else {
        return Ok(None);
    };
    let mut entry = match archive.by_name(BUNDLE_DESCRIPTION_ENTRY) {
        Ok(entry) => entry,
        Err(ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut content = String::new();
    entry.read_to_string(&mut content)?;
    Ok(parse_description(&content))
}

/// One entry per patch, with a candidate URL under every base URL
pub fn build_manifest(
    results: &[PatchResult],
    base_urls: &[String],
    ext: &str,
) -> Result<Manifest, PublishError> {
    let mut entries = Vec::with_capacity(results.len());
    for result in results {
        let file_name = format!("{}.{}.{}", result.version, ext, PATCH_SUFFIX);
        let urls = base_urls
            .iter()
            .map(|base| {
                let url = format!("{}/{}", base.trim_end_matches('/'), file_name);
                Url::parse(&url)
                    .map(String::from)
                    .map_err(|_| PublishError::InvalidUrl(base.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut descriptions = BTreeMap::new();
        if let Some(description) = &result.description {
            descriptions.insert(DEFAULT_LOCALE.to_string(), description.clone());
        }

        entries.push(UpdateEntry {
            version: result.version,
            urls,
            pre_hash: result.pre_hash,
            patch_hash: result.patch_hash,
            post_hash: result.post_hash,
            patch_size: result.patch_size,
            gzipped: result.gzipped,
            descriptions,
        });
    }

    let manifest = Manifest::new(entries);
    manifest.validate()?;
    Ok(manifest)
}

/// Serialize once and sign those exact bytes with every key
pub fn sign_manifest(manifest: &Manifest, keys: &[PrivateKey]) -> Result<SignedManifest, PublishError> {
    let bytes = manifest.to_bytes()?;
    let message = ThresholdVerifier::signing_message(&bytes);
    let signatures = keys
        .iter()
        .map(|key| signature::sign_message(&message, key))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(SignedManifest {
        manifest: bytes,
        signatures,
    })
}

/// Build patches, index and signatures for `<workdir>/builds` into `<workdir>/site`
pub fn prepare(
    workdir: &Path,
    base_urls: &[String],
    keys: &[PrivateKey],
    gzip_from: Option<u32>,
    ext: &str,
    engine: &dyn DeltaEngine,
) -> Result<PrepareReport, PublishError> {
    let builds = workdir.join("builds");
    let site = workdir.join("site");
    if site.is_dir() {
        // Delete existing patch files
        for entry in fs::read_dir(&site)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == PATCH_SUFFIX) {
                fs::remove_file(&path)?;
            }
        }
    }

    let patches = compute_delta_chain(&builds, &site, ext, gzip_from, engine)?;
    let manifest = build_manifest(&patches, base_urls, ext)?;
    let signed = sign_manifest(&manifest, keys)?;

    let index_path = site.join(INDEX_FILE_NAME);
    fs::write(&index_path, signed.to_bytes()?)?;
    info!(
        "Wrote {} with {} entries and {} signature(s)",
        index_path.display(),
        manifest.entries.len(),
        signed.signatures.len()
    );

    Ok(PrepareReport {
        patches,
        processed_dir: builds.join(PROCESSED_DIR_NAME),
        index_path,
        signed,
    })
}

/// Human-readable listing of an index. Signatures are not checked.
pub fn describe_index(signed: &SignedManifest) -> Result<String, PublishError> {
    let manifest = Manifest::from_bytes(&signed.manifest)?;
    let mut out = String::new();
    // Writing to a String cannot fail
    let _ = writeln!(
        out,
        "Index format {}: {} entries, {} signature(s), manifest sha256 {}",
        manifest.format_version,
        manifest.entries.len(),
        signed.signatures.len(),
        ThresholdVerifier::signing_message(&signed.manifest)
    );
    for entry in &manifest.entries {
        let _ = writeln!(
            out,
            "\nVersion {}: {} bytes{}",
            entry.version,
            entry.patch_size,
            if entry.gzipped { ", gzipped" } else { "" }
        );
        let _ = writeln!(out, "  pre   {}", entry.pre_hash);
        let _ = writeln!(out, "  patch {}", entry.patch_hash);
        let _ = writeln!(out, "  post  {}", entry.post_hash);
        for url in &entry.urls {
            let _ = writeln!(out, "  url   {}", url);
        }
        for (locale, description) in &entry.descriptions {
            let _ = writeln!(out, "  [{}] {}", locale, description.summary);
            if !description.body.is_empty() {
                for line in description.body.lines() {
                    let _ = writeln!(out, "       {}", line);
                }
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::updater::delta::GdiffEngine;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use tempfile::tempdir;

    fn bundle(lead: u8) -> Vec<u8> {
        let mut bytes = vec![0u8; 2048];
        bytes[0] = lead;
        bytes
    }

    fn write_builds(workdir: &Path) {
        let builds = workdir.join("builds");
        fs::create_dir_all(&builds).unwrap();
        for v in 1..=3u8 {
            fs::write(builds.join(format!("{}.jar", v)), bundle(v)).unwrap();
        }
        fs::write(builds.join("3.txt"), "Faster sync\nFixes a crash\non resume\n").unwrap();
    }

    #[test]
    fn test_delta_chain() {
        let dir = tempdir().unwrap();
        write_builds(dir.path());
        let engine = GdiffEngine::default();
        let out = dir.path().join("site");

        let results =
            compute_delta_chain(&dir.path().join("builds"), &out, "jar", Some(3), &engine).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].version, 2);
        assert!(!results[0].gzipped);
        assert!(results[1].gzipped);
        assert_eq!(results[0].pre_hash, Sha256Digest::of(&bundle(1)));
        assert_eq!(results[1].post_hash, Sha256Digest::of(&bundle(3)));
        assert!(out.join("3.jar.bpatch").exists());

        let raw = fs::read(&results[1].path).unwrap();
        assert_eq!(results[1].patch_hash, Sha256Digest::of(&raw));
        let mut patch = Vec::new();
        GzDecoder::new(raw.as_slice()).read_to_end(&mut patch).unwrap();
        assert_eq!(engine.apply(&bundle(2), &patch).unwrap(), bundle(3));

        let notes = results[1].description.as_ref().unwrap();
        assert_eq!(notes.summary, "Faster sync");
        assert_eq!(notes.body, "Fixes a crash\non resume");
        assert!(results[0].description.is_none());
    }

    fn write_zip(path: &Path, stamp: DateTime, files: &[(&str, &str)]) {
        let mut writer = ZipWriter::new(File::create(path).unwrap());
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .last_modified_time(stamp);
        for (name, data) in files {
            writer.start_file(*name, options).unwrap();
            writer.write_all(data.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn test_normalize_bundle_strips_compression_and_timestamps() {
        let dir = tempdir().unwrap();
        let payload = "class data ".repeat(200);
        let files = [
            ("META-INF/MANIFEST.MF", "Main-Class: app.Main\n"),
            ("app/Main.class", payload.as_str()),
        ];
        let a = dir.path().join("a.jar");
        let b = dir.path().join("b.jar");
        write_zip(&a, DateTime::from_date_and_time(2024, 5, 1, 12, 0, 0).unwrap(), &files);
        write_zip(&b, DateTime::from_date_and_time(2025, 1, 2, 3, 4, 6).unwrap(), &files);
        assert_ne!(fs::read(&a).unwrap(), fs::read(&b).unwrap());

        let a_out = dir.path().join("a.out.jar");
        let b_out = dir.path().join("b.out.jar");
        assert!(normalize_bundle(&a, &a_out).unwrap());
        assert!(normalize_bundle(&b, &b_out).unwrap());
        assert_eq!(fs::read(&a_out).unwrap(), fs::read(&b_out).unwrap());

        let mut archive = ZipArchive::new(File::open(&a_out).unwrap()).unwrap();
        assert_eq!(archive.len(), 2);
        for i in 0..archive.len() {
            assert_eq!(archive.by_index(i).unwrap().compression(), CompressionMethod::Stored);
        }
        let mut content = Vec::new();
        archive
            .by_name("app/Main.class")
            .unwrap()
            .read_to_end(&mut content)
            .unwrap();
        assert_eq!(content, payload.as_bytes());
    }

    #[test]
    fn test_normalize_copies_non_zip_bundles() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("1.bin");
        let dest = dir.path().join("1.out.bin");
        fs::write(&src, bundle(1)).unwrap();
        assert!(!normalize_bundle(&src, &dest).unwrap());
        assert_eq!(fs::read(&dest).unwrap(), bundle(1));
    }

    #[test]
    fn test_chain_uses_processed_bundles_and_embedded_notes() {
        let dir = tempdir().unwrap();
        let builds = dir.path().join("builds");
        fs::create_dir_all(&builds).unwrap();
        let stamp = DateTime::from_date_and_time(2024, 5, 1, 12, 0, 0).unwrap();
        write_zip(&builds.join("1.jar"), stamp, &[("app/Main.class", "v1 code")]);
        write_zip(
            &builds.join("2.jar"),
            stamp,
            &[
                ("app/Main.class", "v2 code"),
                (BUNDLE_DESCRIPTION_ENTRY, "Dark mode\nAll screens\n"),
            ],
        );
        write_zip(
            &builds.join("3.jar"),
            stamp,
            &[
                ("app/Main.class", "v3 code"),
                (BUNDLE_DESCRIPTION_ENTRY, "Embedded note"),
            ],
        );
        fs::write(builds.join("3.txt"), "Sidecar note\n").unwrap();

        let engine = GdiffEngine::default();
        let results =
            compute_delta_chain(&builds, &dir.path().join("site"), "jar", Some(1), &engine).unwrap();

        let processed = builds.join(PROCESSED_DIR_NAME);
        let processed_1 = fs::read(processed.join("1.jar")).unwrap();
        let processed_2 = fs::read(processed.join("2.jar")).unwrap();
        assert_eq!(results[0].pre_hash, Sha256Digest::of(&processed_1));
        assert_eq!(results[0].post_hash, Sha256Digest::of(&processed_2));
        assert_ne!(processed_1, fs::read(builds.join("1.jar")).unwrap());

        let notes = results[0].description.as_ref().unwrap();
        assert_eq!(notes.summary, "Dark mode");
        assert_eq!(notes.body, "All screens");
        assert_eq!(results[1].description.as_ref().unwrap().summary, "Sidecar note");
    }

    #[test]
    fn test_chain_stops_at_gap() {
        let dir = tempdir().unwrap();
        let builds = dir.path().join("builds");
        fs::create_dir_all(&builds).unwrap();
        for v in [4u8, 5, 7] {
            fs::write(builds.join(format!("{}.app", v)), bundle(v)).unwrap();
        }
        let results = compute_delta_chain(
            &builds,
            &dir.path().join("site"),
            "app",
            None,
            &GdiffEngine::default(),
        )
        .unwrap();
        assert_eq!(results.iter().map(|r| r.version).collect::<Vec<_>>(), vec![5]);
    }

    #[test]
    fn test_single_build_is_an_error() {
        let dir = tempdir().unwrap();
        let builds = dir.path().join("builds");
        fs::create_dir_all(&builds).unwrap();
        fs::write(builds.join("1.jar"), b"only").unwrap();
        assert!(matches!(
            compute_delta_chain(&builds, dir.path(), "jar", None, &GdiffEngine::default()),
            Err(PublishError::NoBuilds(_))
        ));
    }

    #[test]
    fn test_prepare_signs_verifiable_index() {
        let dir = tempdir().unwrap();
        write_builds(dir.path());
        let keys = vec![PrivateKey::generate(), PrivateKey::generate()];
        let urls = vec![
            "https://a.example.com/app".to_string(),
            "https://b.example.com/".to_string(),
        ];

        let report =
            prepare(dir.path(), &urls, &keys, None, "jar", &GdiffEngine::default()).unwrap();
        let raw = fs::read(&report.index_path).unwrap();
        let signed = SignedManifest::from_bytes(&raw).unwrap();
        assert_eq!(signed.signatures.len(), 2);

        let verifier = ThresholdVerifier::new(keys.iter().map(|k| k.public_key()), 2);
        let manifest = verifier.verify(&signed).unwrap();
        assert_eq!(
            manifest.entries[0].urls,
            vec![
                "https://a.example.com/app/2.jar.bpatch".to_string(),
                "https://b.example.com/2.jar.bpatch".to_string(),
            ]
        );
        assert_eq!(manifest.entries[1].descriptions["en"].summary, "Faster sync");

        let listing = describe_index(&signed).unwrap();
        assert!(listing.contains("Version 3"));
        assert!(listing.contains("[en] Faster sync"));
    }

    #[test]
    fn test_malformed_base_url() {
        let result = PatchResult {
            version: 2,
            path: PathBuf::from("2.jar.bpatch"),
            pre_hash: Sha256Digest::default(),
            patch_hash: Sha256Digest::default(),
            post_hash: Sha256Digest::default(),
            patch_size: 0,
            gzipped: false,
            description: None,
        };
        assert!(matches!(
            build_manifest(&[result], &["not a url".to_string()], "jar"),
            Err(PublishError::InvalidUrl(_))
        ));
    }
}
