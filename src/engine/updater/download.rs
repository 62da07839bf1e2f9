//! HTTP Download Manager
//!
//! The narrow transport contract the updater needs: a size-bounded GET for
//! the index, and a streamed patch download that hashes as it writes and
//! checks for cancellation at chunk granularity.

use futures_util::StreamExt;
use rand::seq::SliceRandom;
use reqwest::Url;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use super::error::{Result, TransportError};
use super::manifest::Sha256Digest;
use super::state::CancelToken;

/// Download result with metadata
#[derive(Debug)]
pub struct DownloadResult {
    pub path: PathBuf,
    pub bytes_downloaded: u64,
    pub digest: Sha256Digest,
}

/// Download manager for index and patch files
pub struct Downloader {
    client: reqwest::Client,
}

impl Downloader {
    /// Timeouts apply to connecting only; patches may be large
    pub fn new(
        user_agent: &str,
        connect_timeout: Duration,
    ) -> std::result::Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .connect_timeout(connect_timeout)
            .build()
            .map_err(TransportError::Client)?;
        Ok(Self { client })
    }

    async fn get(&self, url: &str) -> std::result::Result<reqwest::Response, TransportError> {
        info!("Requesting {}", url);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| TransportError::Request {
                url: url.to_string(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(TransportError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(response)
    }

    /// GET a small resource, refusing anything over `limit` bytes
    pub async fn fetch_bounded(
        &self,
        url: &str,
        limit: u64,
    ) -> std::result::Result<Vec<u8>, TransportError> {
        let response = self.get(url).await?;
        let too_large = || TransportError::TooLarge {
            url: url.to_string(),
            limit,
        };
        if response.content_length().is_some_and(|len| len > limit) {
            return Err(too_large());
        }

        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk_result) = stream.next().await {
            let chunk = chunk_result.map_err(|source| TransportError::Request {
                url: url.to_string(),
                source,
            })?;
            if body.len() as u64 + chunk.len() as u64 > limit {
                return Err(too_large());
            }
            body.extend_from_slice(&chunk);
        }
        debug!("Fetched {} bytes from {}", body.len(), url);
        Ok(body)
    }

    /// Stream `url` into `dest`, hashing on the way
    ///
    /// `on_progress` receives the bytes written so far and the expected total
    /// (content length, else `size_hint`).
    pub async fn download<F>(
        &self,
        url: &str,
        dest: &Path,
        size_hint: u64,
        cancel: &CancelToken,
        mut on_progress: F,
    ) -> Result<DownloadResult>
    where
        F: FnMut(u64, u64), // (downloaded, total)
    {
        cancel.check()?;
        let response = self.get(url).await?;
        let content_length = response.content_length();
        let total_size = content_length.unwrap_or(size_hint);

        let partial_path = dest.with_extension("partial");
        if let Some(parent) = partial_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = File::create(&partial_path)?;
        let mut hasher = Sha256::new();

        // Download in chunks
        let mut downloaded: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk_result) = stream.next().await {
            cancel.check()?;
            let chunk = chunk_result.map_err(|source| TransportError::Request {
                url: url.to_string(),
                source,
            })?;
            file.write_all(&chunk)?;
            hasher.update(&chunk);
            downloaded += chunk.len() as u64;
            on_progress(downloaded, total_size);
        }

        if let Some(expected) = content_length {
            if downloaded != expected {
                return Err(TransportError::Truncated {
                    url: url.to_string(),
                    expected,
                    received: downloaded,
                }
                .into());
            }
        }

        file.flush()?;
        drop(file);

        // Rename to final destination
        fs::rename(&partial_path, dest)?;

        Ok(DownloadResult {
            path: dest.to_path_buf(),
            bytes_downloaded: downloaded,
            digest: Sha256Digest(hasher.finalize().into()),
        })
    }
}

/// Pick one mirror, every candidate equally likely
pub fn choose_url(candidates: &[String]) -> Option<&String> {
    candidates.choose(&mut rand::thread_rng())
}

/// Keep only the final path segment of `url` and put it under `base`
pub fn override_url(url: &str, base: &str) -> std::result::Result<String, TransportError> {
    let parsed = Url::parse(url).map_err(|_| TransportError::InvalidUrl(url.to_string()))?;
    let file_name = parsed
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|segment| !segment.is_empty())
        .ok_or_else(|| TransportError::InvalidUrl(url.to_string()))?;
    Ok(format!("{}/{}", base.trim_end_matches('/'), file_name))
}
