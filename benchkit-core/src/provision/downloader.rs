//! Multi-source streaming downloader with resume and integrity support.
//!
//! Sources are tried strictly in ascending priority order. A partial file
//! left by an interrupted transfer is resumed with an HTTP `Range` request;
//! any per-source failure (bad status, timeout, connection error, size
//! mismatch) deletes the partial file and advances to the next source.
//! Failure surfaces only once every source is exhausted.

use futures::StreamExt;
use md5::Md5;
use serde_json::json;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use url::Url;

use super::cancel::CancelToken;
use super::notifier::Notifier;
use super::types::{DownloadProgress, DownloadSource, ProgressFn};
use crate::error::{ProvisionError, Result};

/// User agent sent with every request.
const USER_AGENT: &str = concat!("benchkit-downloader/", env!("CARGO_PKG_VERSION"));

/// Minimum interval between progress reports.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// Timeout for metadata-only requests (HEAD).
const HEAD_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Hash Algorithms
// ============================================================================

/// Digest algorithms accepted for integrity verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    Sha256,
}

impl FromStr for HashAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "md5" => Ok(Self::Md5),
            "sha1" => Ok(Self::Sha1),
            "sha256" => Ok(Self::Sha256),
            other => Err(format!("Unsupported hash algorithm: {}", other)),
        }
    }
}

// ============================================================================
// Outcome
// ============================================================================

/// Result of a successful multi-source download.
#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    /// Bytes moved over the network by this call. Zero when a partial file
    /// already covered the full remote size.
    pub bytes_transferred: u64,
    /// The source that won, with its verification metadata.
    pub source: DownloadSource,
}

/// Returns the sources in try order: ascending priority, ties keeping
/// list order.
fn order_sources(sources: &[DownloadSource]) -> Vec<DownloadSource> {
    let mut ordered: Vec<DownloadSource> = sources.to_vec();
    ordered.sort_by_key(|s| s.priority);
    ordered
}

fn validate_url(raw: &str) -> std::result::Result<Url, String> {
    let url = Url::parse(raw).map_err(|e| format!("invalid URL {}: {}", raw, e))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(format!("unsupported URL scheme: {}", raw));
    }
    if url.host_str().is_none() {
        return Err(format!("URL has no host: {}", raw));
    }
    Ok(url)
}

/// Formats a transfer rate for progress text.
fn format_speed(bytes_per_second: f64) -> String {
    if bytes_per_second < 1024.0 {
        format!("{:.1} B/s", bytes_per_second)
    } else if bytes_per_second < 1024.0 * 1024.0 {
        format!("{:.1} KB/s", bytes_per_second / 1024.0)
    } else {
        format!("{:.1} MB/s", bytes_per_second / (1024.0 * 1024.0))
    }
}

// ============================================================================
// Downloader
// ============================================================================

/// Downloader trying an ordered list of mirrors until one succeeds.
pub struct MultiSourceDownloader {
    client: reqwest::Client,
    notifier: Arc<dyn Notifier>,
}

impl MultiSourceDownloader {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_default();
        Self { client, notifier }
    }

    /// Downloads `output_path` from the first source that succeeds.
    ///
    /// Progress reports are throttled to [`PROGRESS_INTERVAL`] and carry
    /// the `-1` sentinel on per-source failure and final failure. Returns
    /// `SourceUnavailable` only after every source has failed; cancellation
    /// propagates immediately and removes the partial file.
    pub async fn download_with_fallback(
        &self,
        sources: &[DownloadSource],
        output_path: &Path,
        progress: ProgressFn<'_>,
        cancel: &CancelToken,
    ) -> Result<DownloadOutcome> {
        if let Some(parent) = output_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let ordered = order_sources(sources);
        debug!("{} download source candidates", ordered.len());

        for source in ordered {
            if cancel.is_cancelled() {
                remove_quietly(output_path).await;
                return Err(ProvisionError::Cancelled);
            }

            let url = match source.url.as_deref() {
                Some(url) => url.to_string(),
                None => {
                    warn!("Source {} has no URL, skipping", source.name);
                    continue;
                }
            };

            progress(DownloadProgress::at(
                format!("Downloading from {}...", source.name),
                0,
            ));

            match self
                .download_from_source(&source, &url, output_path, progress, cancel)
                .await
            {
                Ok(bytes_transferred) => {
                    progress(DownloadProgress::at(
                        format!("Download from {} complete", source.name),
                        100,
                    ));
                    return Ok(DownloadOutcome {
                        bytes_transferred,
                        source,
                    });
                }
                Err(ProvisionError::Cancelled) => {
                    remove_quietly(output_path).await;
                    return Err(ProvisionError::Cancelled);
                }
                Err(err) => {
                    warn!("Source {} failed: {}", source.name, err);
                    self.notifier.log_error(
                        err.kind(),
                        &err.to_string(),
                        Some(&json!({ "source": source.name, "url": url })),
                    );
                    progress(DownloadProgress::failed(format!(
                        "{} failed, trying next source...",
                        source.name
                    )));
                    remove_quietly(output_path).await;
                }
            }
        }

        progress(DownloadProgress::failed("All download sources failed"));
        let artifact = output_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| output_path.display().to_string());
        self.notifier.log_error(
            "source_unavailable",
            &format!("all download sources failed for {}", artifact),
            Some(&json!({
                "targets": sources.iter().filter_map(|s| s.url.clone()).collect::<Vec<_>>()
            })),
        );
        Err(ProvisionError::SourceUnavailable { artifact })
    }

    /// One transfer attempt from one source. Any error is that source's
    /// failure; the caller advances to the next source.
    async fn download_from_source(
        &self,
        source: &DownloadSource,
        url: &str,
        output_path: &Path,
        progress: ProgressFn<'_>,
        cancel: &CancelToken,
    ) -> Result<u64> {
        validate_url(url).map_err(ProvisionError::Network)?;
        let timeout = Duration::from_secs(source.timeout_secs);

        // Resume bookkeeping: a pre-existing partial file may already be
        // complete, or may be continued with a Range request.
        let mut resume_pos = match tokio::fs::metadata(output_path).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };

        if resume_pos > 0 {
            if let Some(total) = self.head(url, timeout).await.ok().flatten() {
                if resume_pos >= total {
                    info!("File already fully downloaded: {}", output_path.display());
                    return Ok(0);
                }
            }
            debug!("Resuming partial download from byte {}", resume_pos);
        }

        let mut request = self.client.get(url).timeout(timeout);
        if resume_pos > 0 {
            request = request.header(reqwest::header::RANGE, format!("bytes={}-", resume_pos));
        }

        let started = Instant::now();
        let response = request
            .send()
            .await
            .map_err(|e| ProvisionError::Network(e.to_string()))?;
        let status = response.status();
        self.notifier.log_network(
            url,
            "GET",
            Some(status.as_u16()),
            started.elapsed().as_millis() as u64,
        );

        if !matches!(status.as_u16(), 200 | 206) {
            return Err(ProvisionError::Network(format!(
                "HTTP {}: {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("unknown error")
            )));
        }

        // A 206 appends to the partial file; a 200 means the server ignored
        // the Range header, so the transfer restarts from zero.
        let append = status.as_u16() == 206 && resume_pos > 0;
        if !append {
            resume_pos = 0;
        }

        let total_size = match response.content_length() {
            Some(len) => Some(len + resume_pos),
            None => {
                warn!("Remote did not report a size for {}", url);
                None
            }
        };

        let mut file = if append {
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(output_path)
                .await?
        } else {
            tokio::fs::File::create(output_path).await?
        };

        let mut stream = response.bytes_stream();
        let mut downloaded = resume_pos;
        let transfer_started = Instant::now();
        let mut last_update = transfer_started;

        while let Some(chunk) = stream.next().await {
            cancel.check()?;
            let chunk = chunk.map_err(|e| ProvisionError::Network(e.to_string()))?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;

            let now = Instant::now();
            if now.duration_since(last_update) >= PROGRESS_INTERVAL {
                if let Some(total) = total_size.filter(|t| *t > 0) {
                    let percent = (downloaded * 100 / total).min(100) as i32;
                    let elapsed = now.duration_since(transfer_started).as_secs_f64();
                    let speed = if elapsed > 0.0 {
                        (downloaded - resume_pos) as f64 / elapsed
                    } else {
                        0.0
                    };
                    progress(DownloadProgress::at(
                        format!("Downloading from {} ({})", source.name, format_speed(speed)),
                        percent,
                    ));
                }
                last_update = now;
            }
        }
        file.flush().await?;

        // Reject truncated transfers before accepting the source.
        if let Some(total) = total_size {
            if downloaded != total {
                return Err(ProvisionError::Integrity {
                    path: output_path.to_path_buf(),
                    detail: format!("size mismatch: {}/{} bytes", downloaded, total),
                });
            }
        }
        if let Some(expected) = source.expected_size {
            if downloaded != expected {
                return Err(ProvisionError::Integrity {
                    path: output_path.to_path_buf(),
                    detail: format!("expected {} bytes, got {}", expected, downloaded),
                });
            }
        }

        info!(
            "Downloaded {} bytes from {} to {}",
            downloaded - resume_pos,
            source.name,
            output_path.display()
        );
        Ok(downloaded - resume_pos)
    }

    /// Validates a URL with a HEAD request. `Ok(content_length)` on a
    /// success status; any other status or transport failure is an error.
    pub async fn probe_remote(&self, url: &str) -> Result<Option<u64>> {
        self.head(url, HEAD_TIMEOUT).await
    }

    /// Remote file size via HEAD, `None` when unavailable.
    pub async fn get_remote_size(&self, url: &str) -> Option<u64> {
        self.head(url, HEAD_TIMEOUT).await.ok().flatten()
    }

    async fn head(&self, url: &str, timeout: Duration) -> Result<Option<u64>> {
        let started = Instant::now();
        let response = self
            .client
            .head(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                debug!("HEAD {} failed: {}", url, e);
                self.notifier
                    .log_network(url, "HEAD", None, started.elapsed().as_millis() as u64);
                ProvisionError::Network(e.to_string())
            })?;

        let status = response.status();
        self.notifier.log_network(
            url,
            "HEAD",
            Some(status.as_u16()),
            started.elapsed().as_millis() as u64,
        );
        if !status.is_success() {
            return Err(ProvisionError::Network(format!(
                "HTTP {} for HEAD {}",
                status.as_u16(),
                url
            )));
        }
        Ok(response.content_length())
    }

    /// Verifies a file against an expected digest. `expected` may carry an
    /// algorithm prefix (`sha256:<hex>`, `sha1:<hex>`, `md5:<hex>`) which
    /// overrides `algorithm`. A missing file is simply not intact.
    pub fn verify_file_integrity(
        &self,
        path: &Path,
        expected: &str,
        algorithm: HashAlgorithm,
    ) -> Result<bool> {
        if !path.exists() {
            return Ok(false);
        }

        let (algorithm, expected) = split_hash_prefix(expected, algorithm);
        let actual = hash_file(path, algorithm)?;
        let matches = actual.eq_ignore_ascii_case(expected);
        if matches {
            debug!("Integrity verified for {}", path.display());
        } else {
            warn!(
                "Integrity mismatch for {}: expected {}, got {}",
                path.display(),
                expected,
                actual
            );
        }
        Ok(matches)
    }
}

fn split_hash_prefix(expected: &str, fallback: HashAlgorithm) -> (HashAlgorithm, &str) {
    match expected.split_once(':') {
        Some((prefix, rest)) => match prefix.parse() {
            Ok(algorithm) => (algorithm, rest),
            Err(_) => (fallback, expected),
        },
        None => (fallback, expected),
    }
}

fn hash_file(path: &Path, algorithm: HashAlgorithm) -> Result<String> {
    let file = std::fs::File::open(path)?;
    match algorithm {
        HashAlgorithm::Md5 => digest_reader::<Md5>(file),
        HashAlgorithm::Sha1 => digest_reader::<Sha1>(file),
        HashAlgorithm::Sha256 => digest_reader::<Sha256>(file),
    }
}

fn digest_reader<D: Digest>(mut reader: impl Read) -> Result<String> {
    let mut hasher = D::new();
    let mut buf = [0u8; 8192];
    loop {
        let read = reader.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect())
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            debug!("Failed to remove partial file {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provision::notifier::NullNotifier;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn downloader() -> MultiSourceDownloader {
        MultiSourceDownloader::new(Arc::new(NullNotifier))
    }

    #[test]
    fn test_sources_ordered_by_ascending_priority() {
        let sources = vec![
            DownloadSource::new("backup", "https://backup.example.org/f", 2),
            DownloadSource::new("primary", "https://primary.example.org/f", 1),
            DownloadSource::new("tertiary", "https://third.example.org/f", 3),
        ];

        let ordered = order_sources(&sources);
        let names: Vec<&str> = ordered.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["primary", "backup", "tertiary"]);
    }

    #[test]
    fn test_order_is_stable_for_equal_priorities() {
        let sources = vec![
            DownloadSource::new("first", "https://a.example.org/f", 1),
            DownloadSource::new("second", "https://b.example.org/f", 1),
        ];
        let ordered = order_sources(&sources);
        assert_eq!(ordered[0].name, "first");
        assert_eq!(ordered[1].name, "second");
    }

    #[test]
    fn test_validate_url() {
        assert!(validate_url("https://example.org/tool.zip").is_ok());
        assert!(validate_url("http://mirror.example.cn/tool.zip").is_ok());
        assert!(validate_url("ftp://example.org/tool.zip").is_err());
        assert!(validate_url("file:///etc/passwd").is_err());
        assert!(validate_url("not a url").is_err());
    }

    #[test]
    fn test_format_speed() {
        assert_eq!(format_speed(512.0), "512.0 B/s");
        assert_eq!(format_speed(2048.0), "2.0 KB/s");
        assert_eq!(format_speed(3.0 * 1024.0 * 1024.0), "3.0 MB/s");
    }

    #[test]
    fn test_hash_algorithm_parse() {
        assert_eq!("md5".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Md5);
        assert_eq!(
            "SHA256".parse::<HashAlgorithm>().unwrap(),
            HashAlgorithm::Sha256
        );
        assert!("crc32".parse::<HashAlgorithm>().is_err());
    }

    #[test]
    fn test_verify_file_integrity_all_algorithms() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("data.bin");
        std::fs::write(&path, b"hello world").unwrap();

        let dl = downloader();
        assert!(dl
            .verify_file_integrity(
                &path,
                "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9",
                HashAlgorithm::Sha256,
            )
            .unwrap());
        assert!(dl
            .verify_file_integrity(
                &path,
                "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed",
                HashAlgorithm::Sha1,
            )
            .unwrap());
        assert!(dl
            .verify_file_integrity(&path, "5eb63bbbe01eeed093cb22bb8f5acdc3", HashAlgorithm::Md5)
            .unwrap());
    }

    #[test]
    fn test_verify_file_integrity_mismatch_and_prefix() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("data.bin");
        std::fs::write(&path, b"hello world").unwrap();

        let dl = downloader();
        assert!(!dl
            .verify_file_integrity(&path, "deadbeef", HashAlgorithm::Sha256)
            .unwrap());

        // Prefix overrides the passed algorithm.
        assert!(dl
            .verify_file_integrity(
                &path,
                "md5:5eb63bbbe01eeed093cb22bb8f5acdc3",
                HashAlgorithm::Sha256,
            )
            .unwrap());
    }

    #[test]
    fn test_verify_file_integrity_missing_file() {
        let dl = downloader();
        let intact = dl
            .verify_file_integrity(Path::new("/nonexistent/file"), "00", HashAlgorithm::Sha256)
            .unwrap();
        assert!(!intact);
    }

    #[tokio::test]
    async fn test_fallback_with_no_usable_sources() {
        let temp = TempDir::new().unwrap();
        let output = temp.path().join("tool.zip");
        let sources = vec![DownloadSource {
            name: "nameless".to_string(),
            url: None,
            priority: 1,
            timeout_secs: 1,
            expected_size: None,
            sha256: None,
            location: None,
        }];

        let reports: Mutex<Vec<DownloadProgress>> = Mutex::new(Vec::new());
        let result = downloader()
            .download_with_fallback(
                &sources,
                &output,
                &|p| reports.lock().unwrap().push(p),
                &CancelToken::new(),
            )
            .await;

        assert!(matches!(
            result,
            Err(ProvisionError::SourceUnavailable { .. })
        ));
        // The final report carries the failure sentinel.
        let reports = reports.lock().unwrap();
        assert!(reports.last().unwrap().is_failure());
    }

    #[tokio::test]
    async fn test_fallback_respects_cancellation() {
        let temp = TempDir::new().unwrap();
        let output = temp.path().join("tool.zip");
        std::fs::write(&output, b"partial").unwrap();

        let token = CancelToken::new();
        token.cancel();

        let sources = vec![DownloadSource::new(
            "mirror",
            "https://example.invalid/tool.zip",
            1,
        )];
        let result = downloader()
            .download_with_fallback(&sources, &output, &|_| {}, &token)
            .await;

        assert!(matches!(result, Err(ProvisionError::Cancelled)));
        assert!(!output.exists(), "partial file must be removed on cancel");
    }
}
