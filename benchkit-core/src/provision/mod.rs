//! Tool acquisition and installation lifecycle.
//!
//! This module owns everything between "the user wants this tool" and "the
//! tool is installed, verified and launchable":
//!
//! - `types`: download sources, progress reports, installation records
//! - `platform`: OS/arch capability interface
//! - `paths`: configurable install and runtime-cache roots
//! - `notifier`: push interface for steps, errors and network events
//! - `descriptor`: per-tool collaborator interface
//! - `cancel`: cooperative cancellation token
//! - `downloader`: multi-source transfers with resume and integrity checks
//! - `extractor`: format-sniffing archive extraction
//! - `manifest`: durable installed-tool bookkeeping
//! - `cache`: TTL metadata cache
//! - `orchestrator`: the per-tool install/uninstall/launch state machine

pub mod cache;
pub mod cancel;
pub mod descriptor;
pub mod downloader;
pub mod extractor;
pub mod manifest;
pub mod notifier;
pub mod orchestrator;
pub mod paths;
pub mod platform;
pub mod types;

pub use cache::MetadataCache;
pub use cancel::CancelToken;
pub use descriptor::{ConfigFile, ToolDescriptor};
pub use downloader::{DownloadOutcome, HashAlgorithm, MultiSourceDownloader};
pub use extractor::{collapse_nested_dir, detect_archive_format, extract, make_executable};
pub use manifest::{load_manifest, save_manifest, InstallManifest, InstalledToolInfo};
pub use notifier::{Notifier, NullNotifier, TracingNotifier};
pub use orchestrator::{InstallationOrchestrator, ToolInfo, UninstallOutcome};
pub use paths::InstallLayout;
pub use platform::Platform;
pub use types::{
    ArchiveFormat, DownloadProgress, DownloadSource, InstallState, ProgressFn,
    ToolInstallationRecord, ToolMetadata, PROGRESS_FAILED,
};
