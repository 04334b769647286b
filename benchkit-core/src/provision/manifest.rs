//! Persistence for installed-tool bookkeeping.
//!
//! `records.json` under the install root tracks which tools are installed,
//! their versions, disk usage and executable paths. A missing or corrupt
//! file degrades to an empty manifest rather than an error.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Current schema version of the manifest file.
const SCHEMA_VERSION: u32 = 1;

// ============================================================================
// Data Structures
// ============================================================================

/// Durable facts about one installed tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstalledToolInfo {
    pub version: String,
    pub installed_at: DateTime<Utc>,
    pub disk_usage_bytes: u64,
    /// Executable path relative to the tool's install directory.
    pub executable: PathBuf,
}

/// Root structure of `records.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallManifest {
    pub schema_version: u32,
    #[serde(default)]
    pub tools: HashMap<String, InstalledToolInfo>,
}

impl Default for InstallManifest {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            tools: HashMap::new(),
        }
    }
}

impl InstallManifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_installed(&self, tool: &str) -> bool {
        self.tools.contains_key(tool)
    }

    pub fn get(&self, tool: &str) -> Option<&InstalledToolInfo> {
        self.tools.get(tool)
    }

    pub fn mark_installed(
        &mut self,
        tool: &str,
        version: String,
        disk_usage_bytes: u64,
        executable: PathBuf,
    ) {
        self.tools.insert(
            tool.to_string(),
            InstalledToolInfo {
                version,
                installed_at: Utc::now(),
                disk_usage_bytes,
                executable,
            },
        );
    }

    pub fn mark_uninstalled(&mut self, tool: &str) {
        self.tools.remove(tool);
    }

    pub fn installed_tools(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn total_disk_usage_bytes(&self) -> u64 {
        self.tools.values().map(|t| t.disk_usage_bytes).sum()
    }
}

// ============================================================================
// Persistence
// ============================================================================

/// Loads the manifest, tolerating a missing or unparsable file.
pub fn load_manifest(path: &Path) -> Result<InstallManifest> {
    if !path.exists() {
        debug!("Manifest not found at {}, starting empty", path.display());
        return Ok(InstallManifest::new());
    }

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read manifest from {}", path.display()))?;

    match serde_json::from_str::<InstallManifest>(&content) {
        Ok(mut manifest) => {
            if manifest.schema_version != SCHEMA_VERSION {
                info!(
                    "Manifest schema version {} differs from current {}, migrating",
                    manifest.schema_version, SCHEMA_VERSION
                );
                manifest.schema_version = SCHEMA_VERSION;
            }
            Ok(manifest)
        }
        Err(e) => {
            warn!(
                "Failed to parse manifest at {}: {}. Starting fresh.",
                path.display(),
                e
            );
            Ok(InstallManifest::new())
        }
    }
}

/// Writes the manifest, creating parent directories as needed.
pub fn save_manifest(manifest: &InstallManifest, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create manifest directory: {}", parent.display()))?;
    }

    let content = serde_json::to_string_pretty(manifest).context("Failed to serialize manifest")?;
    fs::write(path, content)
        .with_context(|| format!("Failed to write manifest to {}", path.display()))?;

    debug!("Manifest saved to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_manifest_roundtrip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("records.json");

        let mut manifest = InstallManifest::new();
        manifest.mark_installed("ugene", "52.1".to_string(), 150_000_000, "ugene".into());
        save_manifest(&manifest, &path).unwrap();

        let loaded = load_manifest(&path).unwrap();
        assert_eq!(loaded.schema_version, SCHEMA_VERSION);
        assert!(loaded.is_installed("ugene"));
        let info = loaded.get("ugene").unwrap();
        assert_eq!(info.version, "52.1");
        assert_eq!(info.disk_usage_bytes, 150_000_000);
        assert_eq!(info.executable, PathBuf::from("ugene"));
    }

    #[test]
    fn test_missing_manifest_is_empty() {
        let temp = TempDir::new().unwrap();
        let manifest = load_manifest(&temp.path().join("nope/records.json")).unwrap();
        assert!(manifest.tools.is_empty());
    }

    #[test]
    fn test_corrupt_manifest_starts_fresh() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("records.json");
        fs::write(&path, "{ not json ]").unwrap();

        let manifest = load_manifest(&path).unwrap();
        assert!(manifest.tools.is_empty());
        assert_eq!(manifest.schema_version, SCHEMA_VERSION);
    }

    #[test]
    fn test_mark_and_unmark() {
        let mut manifest = InstallManifest::new();
        assert!(!manifest.is_installed("fastqc"));

        manifest.mark_installed("fastqc", "0.12.1".to_string(), 12_000_000, "fastqc".into());
        assert!(manifest.is_installed("fastqc"));

        manifest.mark_uninstalled("fastqc");
        assert!(!manifest.is_installed("fastqc"));
    }

    #[test]
    fn test_totals_and_listing() {
        let mut manifest = InstallManifest::new();
        manifest.mark_installed("b-tool", "1".to_string(), 100, "b".into());
        manifest.mark_installed("a-tool", "2".to_string(), 50, "a".into());

        assert_eq!(manifest.total_disk_usage_bytes(), 150);
        assert_eq!(manifest.installed_tools(), vec!["a-tool", "b-tool"]);
    }
}
