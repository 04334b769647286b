//! Filesystem layout for installed tools and managed runtimes.
//!
//! Two configurable roots: one subdirectory per tool under the install
//! root, one `<kind>-<version>` subdirectory per managed runtime under the
//! runtime-cache root. Downloads land in a shared scratch directory under
//! the install root.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::runtime::version::RuntimeKind;

/// Name of the scratch directory for in-flight downloads.
const DOWNLOADS_DIR: &str = "downloads";

/// Name of the install bookkeeping file.
const MANIFEST_FILE: &str = "records.json";

/// Resolved directory layout, cheap to clone.
#[derive(Debug, Clone)]
pub struct InstallLayout {
    install_root: PathBuf,
    runtime_root: PathBuf,
}

impl InstallLayout {
    pub fn new(install_root: impl Into<PathBuf>, runtime_root: impl Into<PathBuf>) -> Self {
        Self {
            install_root: install_root.into(),
            runtime_root: runtime_root.into(),
        }
    }

    /// Default layout under the platform data directory:
    /// `{data_local}/benchkit/tools` and `{data_local}/benchkit/runtimes`.
    pub fn default_dirs() -> Self {
        let base = dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("benchkit");
        Self::new(base.join("tools"), base.join("runtimes"))
    }

    pub fn install_root(&self) -> &Path {
        &self.install_root
    }

    pub fn runtime_root(&self) -> &Path {
        &self.runtime_root
    }

    /// Canonical install directory for a tool.
    pub fn tool_dir(&self, dir_name: &str) -> PathBuf {
        self.install_root.join(dir_name)
    }

    /// Staging directory a tool is extracted into before the final rename.
    pub fn staging_dir(&self, dir_name: &str) -> PathBuf {
        self.install_root.join(format!("{}.partial", dir_name))
    }

    /// Scratch directory for archives being downloaded.
    pub fn downloads_dir(&self) -> PathBuf {
        self.install_root.join(DOWNLOADS_DIR)
    }

    /// Managed runtime home, e.g. `{runtime_root}/java-17`.
    pub fn runtime_dir(&self, kind: RuntimeKind, version: &str) -> PathBuf {
        self.runtime_root.join(format!("{}-{}", kind, version))
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.install_root.join(MANIFEST_FILE)
    }

    /// Creates every root and scratch directory.
    pub fn ensure_dirs_exist(&self) -> Result<()> {
        for dir in [
            self.install_root.clone(),
            self.downloads_dir(),
            self.runtime_root.clone(),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }
        Ok(())
    }
}
