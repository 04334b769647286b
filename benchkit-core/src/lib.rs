//! BenchKit Core Library
//!
//! This crate provides the acquisition-and-provisioning engine behind
//! BenchKit: it selects among alternate download mirrors, resumes
//! interrupted transfers, verifies integrity, extracts archives, resolves
//! and provisions required language runtimes (Java/Python), and drives an
//! install/uninstall/launch lifecycle that tolerates locked files and
//! running processes.
//!
//! The crate is a library with no UI or CLI surface. The surrounding
//! application supplies per-tool knowledge through the [`ToolDescriptor`]
//! trait and observes progress through the [`Notifier`] trait.
//!
//! # Example
//!
//! ```ignore
//! use benchkit_core::{
//!     CancelToken, InstallLayout, InstallationOrchestrator, Platform, TracingNotifier,
//! };
//! use std::sync::Arc;
//!
//! let platform = Platform::detect().expect("unsupported platform");
//! let orchestrator = InstallationOrchestrator::new(
//!     InstallLayout::default_dirs(),
//!     platform,
//!     Arc::new(TracingNotifier),
//! )?;
//!
//! orchestrator
//!     .install(&my_tool, &|p| println!("{} ({}%)", p.status, p.percent), &CancelToken::new())
//!     .await?;
//! orchestrator.launch(&my_tool)?;
//! ```

pub mod error;
pub mod provision;
pub mod runtime;

// Re-exports for convenience
pub use error::{ProvisionError, Result};

pub use provision::{
    ArchiveFormat, CancelToken, ConfigFile, DownloadOutcome, DownloadProgress, DownloadSource,
    HashAlgorithm, InstallLayout, InstallManifest, InstallState, InstallationOrchestrator,
    MetadataCache, MultiSourceDownloader, Notifier, NullNotifier, Platform, ProgressFn,
    ToolDescriptor, ToolInfo, ToolInstallationRecord, ToolMetadata, TracingNotifier,
    UninstallOutcome, PROGRESS_FAILED,
};

pub use runtime::{
    DependencyChangeReport, DependencyPlan, DependencyResolver, EnvironmentManager,
    EnvironmentStatus, InstallationStep, IsolationLevel, IsolationStrategy, JavaProvisioner,
    ProvisionReport, PythonProvisioner, ResolutionStrategy, RuntimeKind, RuntimeProvisioner,
    RuntimeRecord, RuntimeRequirement, RuntimeSource, RuntimeStatus, VersionRequirement,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
