//! Java runtime provisioning from Eclipse Temurin releases.
//!
//! Managed runtimes live in versioned `java-<major>/` directories under the
//! runtime-cache root. Missing versions are resolved against the Adoptium
//! GitHub release index, downloaded with mirror fallback, extracted and
//! flattened into the canonical layout.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
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

/// Timeout for runtime artifact downloads.
const ARTIFACT_TIMEOUT_SECS: u64 = 45;

#[derive(Debug, Deserialize)]
struct ReleaseIndexResponse {
    tag_name: String,
}

/// A concrete build resolved from the release index.
#[derive(Debug, Clone)]
struct ResolvedJavaBuild {
    tag: String,
    file_name: String,
    download_url: String,
}

/// Provisioner for Eclipse Temurin JRE builds.
pub struct JavaProvisioner {
    layout: InstallLayout,
    platform: Platform,
    downloader: Arc<MultiSourceDownloader>,
    notifier: Arc<dyn Notifier>,
    client: reqwest::Client,
}

impl JavaProvisioner {
    pub fn new(
        layout: InstallLayout,
        platform: Platform,
        downloader: Arc<MultiSourceDownloader>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("benchkit-java/", env!("CARGO_PKG_VERSION")))
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

    /// Managed runtimes under the cache root, newest first.
    pub fn managed_runtimes(&self) -> Vec<RuntimeRecord> {
        let platform = self.platform;
        scan_managed_runtimes(self.layout.runtime_root(), RuntimeKind::Java, |home| {
            verify_java_home(home, platform)
        })
    }

    /// Probes the system `java`, if any.
    pub async fn system_runtime(&self) -> Option<RuntimeRecord> {
        let output = probe_command("java", &["-version"]).await?;
        let version = extract_java_version(&output)?;

        let install_home = match std::env::var_os("JAVA_HOME") {
            Some(home) => PathBuf::from(home),
            None => java_home_from_properties().await.unwrap_or_default(),
        };

        Some(RuntimeRecord {
            version,
            install_home,
            source: RuntimeSource::System,
        })
    }

    /// Resolves the latest build of a major version from the Adoptium
    /// release index and constructs the platform download URL.
    async fn resolve_build(&self, major: &str) -> Result<ResolvedJavaBuild> {
        let index_url = format!(
            "https://api.github.com/repos/adoptium/temurin{}-binaries/releases/latest",
            major
        );
        debug!("Querying Java release index: {}", index_url);

        let started = Instant::now();
        let response = self
            .client
            .get(&index_url)
            .header(reqwest::header::ACCEPT, "application/vnd.github.v3+json")
            .timeout(INDEX_TIMEOUT)
            .send()
            .await
            .map_err(|e| ProvisionError::Network(e.to_string()))?;
        self.notifier.log_network(
            &index_url,
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
        info!("Latest Java {} release tag: {}", major, release.tag_name);

        build_from_tag(major, &release.tag_name, self.platform).ok_or_else(|| {
            ProvisionError::Layout(format!(
                "could not interpret release tag {} for Java {}",
                release.tag_name, major
            ))
        })
    }

    /// Download sources for a resolved build: the GitHub release asset
    /// first, the Adoptium API redirect as fallback mirror.
    fn download_sources(&self, major: &str, build: &ResolvedJavaBuild) -> Vec<DownloadSource> {
        let api_mirror = format!(
            "https://api.adoptium.net/v3/binary/latest/{}/ga/{}/{}/jre/hotspot/normal/eclipse",
            major,
            self.platform.os_token(),
            self.platform.arch_token()
        );
        vec![
            DownloadSource::new("Temurin GitHub release", build.download_url.clone(), 1)
                .with_timeout(ARTIFACT_TIMEOUT_SECS)
                .with_location("GitHub"),
            DownloadSource::new("Adoptium API", api_mirror, 2)
                .with_timeout(ARTIFACT_TIMEOUT_SECS)
                .with_location("Adoptium"),
        ]
    }

    async fn install_archive(&self, archive: &Path, home: &Path) -> Result<()> {
        let home = home.to_path_buf();
        let archive = archive.to_path_buf();
        let platform = self.platform;
        tokio::task::spawn_blocking(move || -> Result<()> {
            extractor::extract(&archive, &home)?;
            extractor::collapse_nested_dir(&home)?;
            if !verify_java_home(&home, platform) {
                return Err(ProvisionError::Layout(format!(
                    "java binary missing under {}",
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
impl RuntimeProvisioner for JavaProvisioner {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Java
    }

    async fn check_requirements(&self, requirement: &VersionRequirement) -> RuntimeStatus {
        // Managed runtimes are preferred: their layout is under our control.
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
            recommended: recommended_version(RuntimeKind::Java, requirement),
        }
    }

    async fn install(
        &self,
        version: &str,
        progress: ProgressFn<'_>,
        cancel: &CancelToken,
    ) -> Result<RuntimeRecord> {
        let home = self.layout.runtime_dir(RuntimeKind::Java, version);

        // Repeat installs of a verified runtime skip all network activity.
        if verify_java_home(&home, self.platform) {
            debug!("Java {} already provisioned at {}", version, home.display());
            return Ok(RuntimeRecord {
                version: version.to_string(),
                install_home: home,
                source: RuntimeSource::Managed,
            });
        }

        cancel.check()?;
        progress(DownloadProgress::at("Fetching Java release information...", 5));
        let build = self.resolve_build(version).await?;

        // Commit only to URLs that answer a HEAD request.
        let expected_size = self.downloader.probe_remote(&build.download_url).await?;
        info!(
            "Resolved Java {} build {} ({} bytes)",
            version,
            build.tag,
            expected_size.unwrap_or(0)
        );

        let mut sources = self.download_sources(version, &build);
        if let Some(size) = expected_size {
            sources[0].expected_size = Some(size);
        }

        let archive_path = self.layout.downloads_dir().join(&build.file_name);
        progress(DownloadProgress::at("Downloading Java runtime...", 10));
        let download_progress = |report: DownloadProgress| {
            if report.is_failure() {
                progress(report);
            } else {
                // Download spans 10%..80% of the install.
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
        progress(DownloadProgress::at("Installing Java runtime...", 85));
        if let Err(e) = self.install_archive(&archive_path, &home).await {
            // Leave no partially-created runtime behind.
            let _ = tokio::fs::remove_dir_all(&home).await;
            self.notifier.log_error(
                e.kind(),
                &e.to_string(),
                Some(&serde_json::json!({ "runtime": "java", "version": version })),
            );
            return Err(e);
        }

        if let Err(e) = tokio::fs::remove_file(&archive_path).await {
            warn!("Failed to clean up archive: {}", e);
        }

        progress(DownloadProgress::at("Java runtime installed", 100));
        Ok(RuntimeRecord {
            version: version.to_string(),
            install_home: home,
            source: RuntimeSource::Managed,
        })
    }
}

// ============================================================================
// Release Tag Parsing
// ============================================================================

/// Builds the artifact name and download URL from a release tag.
///
/// Tag shapes: `jdk8u392-b08` for Java 8, `jdk-17.0.12+7` for 11 and later.
fn build_from_tag(major: &str, tag: &str, platform: Platform) -> Option<ResolvedJavaBuild> {
    let (arch, os, ext) = (
        platform.arch_token(),
        platform.os_token(),
        platform.archive_ext(),
    );

    let file_name = if major == "8" {
        let rest = tag.strip_prefix("jdk8u")?;
        let (update, build) = rest.split_once("-b")?;
        if update.is_empty() || build.is_empty() {
            return None;
        }
        format!(
            "OpenJDK8U-jre_{}_{}_hotspot_8u{}b{}.{}",
            arch, os, update, build, ext
        )
    } else {
        let rest = tag.strip_prefix("jdk-")?;
        let (version, build) = rest.split_once('+')?;
        if !version.starts_with(major) || build.is_empty() {
            return None;
        }
        format!(
            "OpenJDK{}U-jre_{}_{}_hotspot_{}_{}.{}",
            major, arch, os, version, build, ext
        )
    };

    let download_url = format!(
        "https://github.com/adoptium/temurin{}-binaries/releases/download/{}/{}",
        major, tag, file_name
    );

    Some(ResolvedJavaBuild {
        tag: tag.to_string(),
        file_name,
        download_url,
    })
}

/// Whether a directory holds a usable Java runtime.
fn verify_java_home(home: &Path, platform: Platform) -> bool {
    runtime_binary_path(home, platform, "java").is_file()
}

/// Extracts the feature version from `java -version` output, normalizing
/// the legacy `1.8.0_xx` scheme to `8`.
fn extract_java_version(output: &str) -> Option<String> {
    let line = output.lines().find(|l| l.contains("version"))?;
    let start = line.find('"')? + 1;
    let end = line[start..].find('"')? + start;
    let raw = &line[start..end];

    if let Some(rest) = raw.strip_prefix("1.") {
        rest.split('.').next().map(str::to_string)
    } else {
        Some(raw.to_string())
    }
}

/// Reads `java.home` from `java -XshowSettings:properties` output.
async fn java_home_from_properties() -> Option<PathBuf> {
    let output = probe_command("java", &["-XshowSettings:properties", "-version"]).await?;
    output.lines().find_map(|line| {
        let line = line.trim();
        line.strip_prefix("java.home")
            .and_then(|rest| rest.split_once('='))
            .map(|(_, value)| PathBuf::from(value.trim()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_from_modern_tag() {
        let build = build_from_tag("17", "jdk-17.0.12+7", Platform::LinuxX64).unwrap();
        assert_eq!(
            build.file_name,
            "OpenJDK17U-jre_x64_linux_hotspot_17.0.12_7.tar.gz"
        );
        assert!(build
            .download_url
            .starts_with("https://github.com/adoptium/temurin17-binaries/releases/download/jdk-17.0.12+7/"));
    }

    #[test]
    fn test_build_from_java8_tag() {
        let build = build_from_tag("8", "jdk8u392-b08", Platform::WindowsX64).unwrap();
        assert_eq!(build.file_name, "OpenJDK8U-jre_x64_windows_hotspot_8u392b08.zip");
        assert!(build.download_url.contains("temurin8-binaries"));
    }

    #[test]
    fn test_build_from_tag_rejects_garbage() {
        assert!(build_from_tag("17", "v17.0.12", Platform::LinuxX64).is_none());
        assert!(build_from_tag("17", "jdk-11.0.2+9", Platform::LinuxX64).is_none());
        assert!(build_from_tag("8", "jdk8u-b", Platform::LinuxX64).is_none());
    }

    #[test]
    fn test_extract_java_version_modern() {
        let output = "openjdk version \"17.0.12\" 2024-07-16\nOpenJDK Runtime Environment";
        assert_eq!(extract_java_version(output).as_deref(), Some("17.0.12"));
    }

    #[test]
    fn test_extract_java_version_legacy() {
        let output = "java version \"1.8.0_392\"\nJava(TM) SE Runtime Environment";
        assert_eq!(extract_java_version(output).as_deref(), Some("8"));
    }

    #[test]
    fn test_extract_java_version_garbage() {
        assert!(extract_java_version("command not found").is_none());
    }

    #[test]
    fn test_verify_java_home() {
        let temp = tempfile::TempDir::new().unwrap();
        let home = temp.path().join("java-17");
        assert!(!verify_java_home(&home, Platform::LinuxX64));

        std::fs::create_dir_all(home.join("bin")).unwrap();
        std::fs::write(home.join("bin/java"), b"stub").unwrap();
        assert!(verify_java_home(&home, Platform::LinuxX64));
    }
}
