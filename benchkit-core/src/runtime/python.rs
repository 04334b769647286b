//! Python runtime provisioning from python-build-standalone releases.
//!
//! Managed interpreters live in `python-<minor>/` directories under the
//! runtime-cache root and ship with pip, so declared packages can be
//! installed into them after extraction.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::provisioner::{
    probe_command, runtime_binary_path, scan_managed_runtimes, RuntimeProvisioner, RuntimeStatus,
};
use super::resolver::recommended_version;
use super::version::{RuntimeKind, RuntimeRecord, RuntimeSource, VersionRequirement};
use crate::error::{ProvisionError, Result};
use crate::provision::cancel::CancelToken;
use crate::provision::downloader::MultiSourceDownloader;
use crate::provision::extractor;
use crate::provision::notifier::Notifier;
use crate::provision::paths::InstallLayout;
use crate::provision::platform::Platform;
use crate::provision::types::{DownloadProgress, DownloadSource, ProgressFn};

/// Timeout for release-index queries.
const INDEX_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for interpreter archive downloads.
const ARTIFACT_TIMEOUT_SECS: u64 = 45;

/// Timeout for one `pip install` invocation.
const PIP_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Deserialize)]
struct ReleaseAsset {
    name: String,
    browser_download_url: String,
    size: u64,
}

#[derive(Debug, Deserialize)]
struct ReleaseIndexResponse {
    tag_name: String,
    assets: Vec<ReleaseAsset>,
}

/// Provisioner for standalone CPython builds.
pub struct PythonProvisioner {
    layout: InstallLayout,
    platform: Platform,
    downloader: Arc<MultiSourceDownloader>,
    notifier: Arc<dyn Notifier>,
    client: reqwest::Client,
}

impl PythonProvisioner {
    pub fn new(
        layout: InstallLayout,
        platform: Platform,
        downloader: Arc<MultiSourceDownloader>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("benchkit-python/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self {
            layout,
            platform,
            downloader,
            notifier,
            client,
        }
    }

    /// Managed interpreters under the cache root, newest first.
    pub fn managed_runtimes(&self) -> Vec<RuntimeRecord> {
        let platform = self.platform;
        scan_managed_runtimes(self.layout.runtime_root(), RuntimeKind::Python, |home| {
            verify_python_home(home, platform)
        })
    }

    /// Probes the system interpreter (`python3`, then `python`).
    pub async fn system_runtime(&self) -> Option<RuntimeRecord> {
        for program in ["python3", "python"] {
            let Some(output) = probe_command(program, &["--version"]).await else {
                continue;
            };
            let Some(version) = output
                .split_whitespace()
                .find(|w| w.chars().next().is_some_and(|c| c.is_ascii_digit()))
            else {
                continue;
            };

            let install_home = python_home_from_executable(program)
                .await
                .unwrap_or_default();
            return Some(RuntimeRecord {
                version: version.to_string(),
                install_home,
                source: RuntimeSource::System,
            });
        }
        None
    }

    /// Installs a version and then its declared packages. Package failures
    /// are logged and do not fail the provisioning (mirrors launch-time
    /// tolerance: the tool may not need every extra).
    pub async fn install_with_packages(
        &self,
        version: &str,
        packages: &[String],
        progress: ProgressFn<'_>,
        cancel: &CancelToken,
    ) -> Result<RuntimeRecord> {
        let record = self.install(version, progress, cancel).await?;
        if !packages.is_empty() {
            cancel.check()?;
            progress(DownloadProgress::at("Installing Python packages...", 90));
            self.install_packages(&record.install_home, packages).await;
            progress(DownloadProgress::at("Python environment ready", 100));
        }
        Ok(record)
    }

    async fn install_packages(&self, home: &Path, packages: &[String]) {
        let python = runtime_binary_path(home, self.platform, "python3");
        for package in packages {
            let result = tokio::time::timeout(
                PIP_TIMEOUT,
                Command::new(&python)
                    .args(["-m", "pip", "install", package])
                    .output(),
            )
            .await;

            let failed = match &result {
                Ok(Ok(output)) => !output.status.success(),
                _ => true,
            };
            if failed {
                // Keep installing the rest; a missing extra is not fatal.
                warn!("Package install failed: {}", package);
                self.notifier.log_error(
                    "runtime_unsatisfied",
                    &format!("failed to install Python package {}", package),
                    Some(&serde_json::json!({ "home": home.display().to_string() })),
                );
            }
        }
    }

    /// Finds the matching `install_only` asset in the latest
    /// python-build-standalone release.
    async fn resolve_asset(&self, minor: &str) -> Result<(ReleaseAsset, String)> {
        let index_url =
            "https://api.github.com/repos/astral-sh/python-build-standalone/releases/latest";
        debug!("Querying Python release index: {}", index_url);

        let started = Instant::now();
        let response = self
            .client
            .get(index_url)
            .header(reqwest::header::ACCEPT, "application/vnd.github.v3+json")
            .timeout(INDEX_TIMEOUT)
            .send()
            .await
            .map_err(|e| ProvisionError::Network(e.to_string()))?;
        self.notifier.log_network(
            index_url,
            "GET",
            Some(response.status().as_u16()),
            started.elapsed().as_millis() as u64,
        );

        if !response.status().is_success() {
            return Err(ProvisionError::Network(format!(
                "release index returned HTTP {}",
                response.status().as_u16()
            )));
        }

        let release: ReleaseIndexResponse = response
            .json()
            .await
            .map_err(|e| ProvisionError::Network(e.to_string()))?;
        info!("Latest Python release tag: {}", release.tag_name);

        let triple = python_platform_triple(self.platform);
        let prefix = format!("cpython-{}.", minor);
        release
            .assets
            .into_iter()
            .find(|asset| {
                asset.name.starts_with(&prefix)
                    && asset.name.contains(triple)
                    && asset.name.ends_with("install_only.tar.gz")
            })
            .map(|asset| (asset, release.tag_name))
            .ok_or_else(|| {
                ProvisionError::Layout(format!(
                    "no cpython {} build for {} in the latest release",
                    minor, triple
                ))
            })
    }

    async fn install_archive(&self, archive: &Path, home: &Path) -> Result<()> {
        let home = home.to_path_buf();
        let archive = archive.to_path_buf();
        let platform = self.platform;
        tokio::task::spawn_blocking(move || -> Result<()> {
            extractor::extract(&archive, &home)?;
            extractor::collapse_nested_dir(&home)?;
            if !verify_python_home(&home, platform) {
                return Err(ProvisionError::Layout(format!(
                    "python binary missing under {}",
                    home.display()
                )));
            }
            Ok(())
        })
        .await
        .map_err(|e| ProvisionError::Layout(format!("extraction task failed: {}", e)))?
    }
}

#[async_trait]
impl RuntimeProvisioner for PythonProvisioner {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Python
    }

    async fn check_requirements(&self, requirement: &VersionRequirement) -> RuntimeStatus {
        for record in self.managed_runtimes() {
            if record.satisfies(requirement) {
                return RuntimeStatus::Satisfied(record);
            }
        }

        if let Some(record) = self.system_runtime().await {
            if record.satisfies(requirement) {
                return RuntimeStatus::Satisfied(record);
            }
        }

        RuntimeStatus::Missing {
            recommended: recommended_version(RuntimeKind::Python, requirement),
        }
    }

    async fn install(
        &self,
        version: &str,
        progress: ProgressFn<'_>,
        cancel: &CancelToken,
    ) -> Result<RuntimeRecord> {
        let home = self.layout.runtime_dir(RuntimeKind::Python, version);

        if verify_python_home(&home, self.platform) {
            debug!(
                "Python {} already provisioned at {}",
                version,
                home.display()
            );
            return Ok(RuntimeRecord {
                version: version.to_string(),
                install_home: home,
                source: RuntimeSource::Managed,
            });
        }

        cancel.check()?;
        progress(DownloadProgress::at(
            "Fetching Python release information...",
            5,
        ));
        let (asset, tag) = self.resolve_asset(version).await?;

        // Commit only to URLs that answer a HEAD request.
        self.downloader
            .probe_remote(&asset.browser_download_url)
            .await?;
        info!(
            "Resolved Python {} from release {} ({} bytes)",
            version, tag, asset.size
        );

        let sources = vec![DownloadSource::new(
            "python-build-standalone",
            asset.browser_download_url.clone(),
            1,
        )
        .with_timeout(ARTIFACT_TIMEOUT_SECS)
        .with_expected_size(asset.size)
        .with_location("GitHub")];

        let archive_path = self.layout.downloads_dir().join(&asset.name);
        progress(DownloadProgress::at("Downloading Python runtime...", 10));
        let download_progress = |report: DownloadProgress| {
            if report.is_failure() {
                progress(report);
            } else {
                progress(DownloadProgress::at(
                    report.status,
                    10 + report.percent * 7 / 10,
                ));
            }
        };
        self.downloader
            .download_with_fallback(&sources, &archive_path, &download_progress, cancel)
            .await?;

        cancel.check()?;
        progress(DownloadProgress::at("Installing Python runtime...", 85));
        if let Err(e) = self.install_archive(&archive_path, &home).await {
            let _ = tokio::fs::remove_dir_all(&home).await;
            self.notifier.log_error(
                e.kind(),
                &e.to_string(),
                Some(&serde_json::json!({ "runtime": "python", "version": version })),
            );
            return Err(e);
        }

        if let Err(e) = tokio::fs::remove_file(&archive_path).await {
            warn!("Failed to clean up archive: {}", e);
        }

        progress(DownloadProgress::at("Python runtime installed", 100));
        Ok(RuntimeRecord {
            version: version.to_string(),
            install_home: home,
            source: RuntimeSource::Managed,
        })
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Target triple used in python-build-standalone asset names.
fn python_platform_triple(platform: Platform) -> &'static str {
    match platform {
        Platform::LinuxX64 => "x86_64-unknown-linux-gnu",
        Platform::LinuxArm64 => "aarch64-unknown-linux-gnu",
        Platform::MacosX64 => "x86_64-apple-darwin",
        Platform::MacosArm64 => "aarch64-apple-darwin",
        Platform::WindowsX64 => "x86_64-pc-windows-msvc",
    }
}

/// Whether a directory holds a usable interpreter. Windows standalone
/// builds place `python.exe` at the home root instead of `bin/`.
fn verify_python_home(home: &Path, platform: Platform) -> bool {
    if platform.is_windows() {
        home.join("python.exe").is_file()
    } else {
        runtime_binary_path(home, platform, "python3").is_file()
    }
}

/// Home directory derived from the system interpreter's own path.
async fn python_home_from_executable(program: &str) -> Option<PathBuf> {
    let output = probe_command(program, &["-c", "import sys; print(sys.executable)"]).await?;
    let exe = PathBuf::from(output.trim());
    exe.parent()?.parent().map(Path::to_path_buf)
}
