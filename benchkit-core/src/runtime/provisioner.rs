//! Runtime provisioner interface and shared discovery helpers.
//!
//! A provisioner satisfies one runtime version requirement: it searches
//! managed runtimes first, then the system installation, and can install a
//! missing version from the upstream release index.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use super::version::{RuntimeKind, RuntimeRecord, RuntimeSource, VersionRequirement};
use crate::error::Result;
use crate::provision::cancel::CancelToken;
use crate::provision::platform::Platform;
use crate::provision::types::ProgressFn;

/// How long a system runtime probe may run.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of a requirement check.
#[derive(Debug, Clone)]
pub enum RuntimeStatus {
    /// A runtime satisfying the requirement is available.
    Satisfied(RuntimeRecord),
    /// Nothing satisfies the requirement; `recommended` is the concrete
    /// version an install would provision.
    Missing { recommended: String },
}

impl RuntimeStatus {
    pub fn is_satisfied(&self) -> bool {
        matches!(self, Self::Satisfied(_))
    }

    pub fn record(&self) -> Option<&RuntimeRecord> {
        match self {
            Self::Satisfied(record) => Some(record),
            Self::Missing { .. } => None,
        }
    }
}

/// One provisionable runtime kind.
#[async_trait]
pub trait RuntimeProvisioner: Send + Sync {
    fn kind(&self) -> RuntimeKind;

    /// Checks managed runtimes first, then the system runtime; the first
    /// satisfying match wins.
    async fn check_requirements(&self, requirement: &VersionRequirement) -> RuntimeStatus;

    /// Installs the given concrete version. Safe to call repeatedly: an
    /// already-verified install returns immediately without network
    /// activity.
    async fn install(
        &self,
        version: &str,
        progress: ProgressFn<'_>,
        cancel: &CancelToken,
    ) -> Result<RuntimeRecord>;
}

// ============================================================================
// Shared Discovery Helpers
// ============================================================================

/// Scans the runtime-cache root for `<kind>-<version>` directories whose
/// runtime binary verifies. Versions come from the directory name: that is
/// the managed naming contract.
pub(crate) fn scan_managed_runtimes<F>(
    runtime_root: &Path,
    kind: RuntimeKind,
    verify_home: F,
) -> Vec<RuntimeRecord>
where
    F: Fn(&Path) -> bool,
{
    let prefix = format!("{}-", kind);
    let mut records = Vec::new();

    let entries = match std::fs::read_dir(runtime_root) {
        Ok(entries) => entries,
        Err(_) => return records,
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(version) = name.to_string_lossy().strip_prefix(&prefix).map(String::from) else {
            continue;
        };
        if verify_home(&path) {
            records.push(RuntimeRecord {
                version,
                install_home: path,
                source: RuntimeSource::Managed,
            });
        } else {
            debug!("Ignoring unverifiable runtime dir: {}", path.display());
        }
    }

    // Prefer the newest managed version when several satisfy.
    records.sort_by(|a, b| compare_version_strings(&b.version, &a.version));
    records
}

pub(crate) fn compare_version_strings(a: &str, b: &str) -> std::cmp::Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.split('.')
            .map(|p| {
                p.chars()
                    .take_while(|c| c.is_ascii_digit())
                    .collect::<String>()
                    .parse()
                    .unwrap_or(0)
            })
            .collect()
    };
    parse(a).cmp(&parse(b))
}

/// Runs a probe command and returns its combined output when it exits
/// successfully within the timeout.
pub(crate) async fn probe_command(program: &str, args: &[&str]) -> Option<String> {
    let result = tokio::time::timeout(
        PROBE_TIMEOUT,
        Command::new(program).args(args).output(),
    )
    .await;

    match result {
        Ok(Ok(output)) if output.status.success() => {
            let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
            text.push_str(&String::from_utf8_lossy(&output.stderr));
            Some(text)
        }
        Ok(Ok(output)) => {
            debug!("{} probe exited with {}", program, output.status);
            None
        }
        Ok(Err(e)) => {
            debug!("{} probe failed to start: {}", program, e);
            None
        }
        Err(_) => {
            debug!("{} probe timed out", program);
            None
        }
    }
}

/// Relative path of a runtime binary inside its home directory.
pub(crate) fn runtime_binary_path(home: &Path, platform: Platform, base: &str) -> PathBuf {
    home.join("bin").join(platform.executable_name(base))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch_runtime(root: &Path, name: &str, binary: &str) {
        let bin = root.join(name).join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::write(bin.join(binary), b"stub").unwrap();
    }

    #[test]
    fn test_scan_finds_verified_homes_only() {
        let temp = TempDir::new().unwrap();
        touch_runtime(temp.path(), "java-17", "java");
        touch_runtime(temp.path(), "java-11", "java");
        // Unverifiable home: directory exists, binary missing.
        std::fs::create_dir_all(temp.path().join("java-8")).unwrap();
        // Different kind is ignored.
        touch_runtime(temp.path(), "python-3.10", "python3");

        let records = scan_managed_runtimes(temp.path(), RuntimeKind::Java, |home| {
            home.join("bin/java").exists()
        });

        let versions: Vec<&str> = records.iter().map(|r| r.version.as_str()).collect();
        assert_eq!(versions, vec!["17", "11"]);
        assert!(records.iter().all(|r| r.source == RuntimeSource::Managed));
    }

    #[test]
    fn test_scan_missing_root_is_empty() {
        let records = scan_managed_runtimes(Path::new("/nonexistent-root"), RuntimeKind::Java, |_| {
            true
        });
        assert!(records.is_empty());
    }

    #[test]
    fn test_compare_version_strings() {
        use std::cmp::Ordering;
        assert_eq!(compare_version_strings("11", "8"), Ordering::Greater);
        assert_eq!(compare_version_strings("3.10", "3.9"), Ordering::Greater);
        assert_eq!(compare_version_strings("17.0.1", "17.0.1"), Ordering::Equal);
    }

    #[test]
    fn test_runtime_binary_path() {
        let path = runtime_binary_path(Path::new("/cache/java-17"), Platform::LinuxX64, "java");
        assert_eq!(path, PathBuf::from("/cache/java-17/bin/java"));

        let win = runtime_binary_path(Path::new("/cache/java-17"), Platform::WindowsX64, "java");
        assert!(win.to_string_lossy().ends_with("java.exe"));
    }

    #[tokio::test]
    async fn test_probe_command_missing_binary() {
        let output = probe_command("definitely-not-a-real-binary-xyz", &["--version"]).await;
        assert!(output.is_none());
    }
}
