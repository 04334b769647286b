//! Core types for tool acquisition and lifecycle tracking.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::runtime::version::RuntimeRequirement;

// ============================================================================
// Download Sources
// ============================================================================

/// Default per-source network timeout in seconds.
pub const DEFAULT_SOURCE_TIMEOUT_SECS: u64 = 30;

/// One candidate origin for a download, with priority and verification
/// metadata. Lower priority values are tried first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadSource {
    /// Human-readable mirror name ("GitHub release", "EU mirror", ...).
    pub name: String,
    /// Download URL. A source without a URL is skipped, not failed.
    pub url: Option<String>,
    /// Ascending try order; ties keep list order.
    pub priority: u32,
    /// Per-request timeout for this source.
    pub timeout_secs: u64,
    /// Expected artifact size in bytes, when the descriptor knows it.
    pub expected_size: Option<u64>,
    /// Expected SHA-256 of the artifact, lowercase hex.
    pub sha256: Option<String>,
    /// Server location tag ("CN", "US", "GitHub", ...), informational only.
    pub location: Option<String>,
}

impl DownloadSource {
    pub fn new(name: impl Into<String>, url: impl Into<String>, priority: u32) -> Self {
        Self {
            name: name.into(),
            url: Some(url.into()),
            priority,
            timeout_secs: DEFAULT_SOURCE_TIMEOUT_SECS,
            expected_size: None,
            sha256: None,
            location: None,
        }
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn with_expected_size(mut self, size: u64) -> Self {
        self.expected_size = Some(size);
        self
    }

    pub fn with_sha256(mut self, sha256: impl Into<String>) -> Self {
        self.sha256 = Some(sha256.into());
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
}

// ============================================================================
// Download Progress
// ============================================================================

/// Sentinel percentage reported when an operation stalled or failed.
/// Distinct from `0`, which means "just started".
pub const PROGRESS_FAILED: i32 = -1;

/// Progress report delivered to observers. `percent` is `0..=100` during
/// normal operation and [`PROGRESS_FAILED`] on failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadProgress {
    pub status: String,
    pub percent: i32,
}

impl DownloadProgress {
    pub fn at(status: impl Into<String>, percent: i32) -> Self {
        Self {
            status: status.into(),
            percent,
        }
    }

    /// A failure report carrying the sentinel percentage.
    pub fn failed(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            percent: PROGRESS_FAILED,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.percent == PROGRESS_FAILED
    }
}

/// Callback signature for progress observers. Invoked from worker tasks and
/// rate-limited by the producer before crossing to any observer.
pub type ProgressFn<'a> = &'a (dyn Fn(DownloadProgress) + Send + Sync);

// ============================================================================
// Archive Formats
// ============================================================================

/// Supported archive formats, detected by content rather than extension
/// because mislabeled downloads occur.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArchiveFormat {
    /// ZIP archive (.zip)
    Zip,
    /// Gzip-compressed tar archive (.tar.gz, .tgz)
    TarGz,
    /// XZ-compressed tar archive (.tar.xz)
    TarXz,
    /// Uncompressed tar archive (.tar)
    Tar,
}

impl ArchiveFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Zip => "zip",
            Self::TarGz => "tar.gz",
            Self::TarXz => "tar.xz",
            Self::Tar => "tar",
        }
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Tool Metadata
// ============================================================================

/// Static description of a tool, supplied by the descriptor collaborator.
#[derive(Debug, Clone)]
pub struct ToolMetadata {
    pub name: String,
    pub version: String,
    /// Runtimes the tool needs at launch time, in declaration order.
    pub required_runtimes: Vec<RuntimeRequirement>,
}

// ============================================================================
// Installation State
// ============================================================================

/// Lifecycle state of one tool installation. Mutated only by the
/// orchestrator while the per-tool lock is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallState {
    Available,
    ResolvingDeps,
    Downloading,
    Verifying,
    Extracting,
    Locating,
    Configuring,
    VerifyingInstall,
    Installed,
    Uninstalling,
    Failed,
}

impl InstallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::ResolvingDeps => "resolving_deps",
            Self::Downloading => "downloading",
            Self::Verifying => "verifying",
            Self::Extracting => "extracting",
            Self::Locating => "locating",
            Self::Configuring => "configuring",
            Self::VerifyingInstall => "verifying_install",
            Self::Installed => "installed",
            Self::Uninstalling => "uninstalling",
            Self::Failed => "failed",
        }
    }

    /// True while a mutating operation owns the record.
    pub fn is_busy(&self) -> bool {
        !matches!(self, Self::Available | Self::Installed | Self::Failed)
    }
}

impl fmt::Display for InstallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Mutable per-tool installation record, exclusively owned by one
/// orchestrator instance. Created on first metadata query.
#[derive(Debug, Clone)]
pub struct ToolInstallationRecord {
    pub name: String,
    pub version: String,
    pub install_dir: PathBuf,
    pub executable_path: Option<PathBuf>,
    pub state: InstallState,
    pub disk_usage_bytes: u64,
}

impl ToolInstallationRecord {
    pub fn new(name: impl Into<String>, version: impl Into<String>, install_dir: PathBuf) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            install_dir,
            executable_path: None,
            state: InstallState::Available,
            disk_usage_bytes: 0,
        }
    }
}
