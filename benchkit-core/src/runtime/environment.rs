//! Environment manager: the single entry point tools use to get their
//! runtime requirements satisfied.
//!
//! Resolves a dependency plan, then drives the per-kind provisioners in
//! step priority order. A failed step is recorded and skipped, never fatal:
//! the tool may still work against a system runtime at launch time.
//! Provisioning the same `(kind, version)` from two tools concurrently is
//! serialized by a keyed lock.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use super::provisioner::{RuntimeProvisioner, RuntimeStatus};
use super::resolver::{DependencyChangeReport, DependencyPlan, DependencyResolver};
use super::version::{RuntimeKind, RuntimeRecord, RuntimeRequirement, VersionRequirement};
use crate::error::{ProvisionError, Result};
use crate::provision::cancel::CancelToken;
use crate::provision::downloader::MultiSourceDownloader;
use crate::provision::notifier::Notifier;
use crate::provision::paths::InstallLayout;
use crate::provision::platform::Platform;
use crate::provision::types::{DownloadProgress, ProgressFn};

use super::java::JavaProvisioner;
use super::python::PythonProvisioner;

// ============================================================================
// Reports
// ============================================================================

/// One unsatisfied requirement in an environment check.
#[derive(Debug, Clone)]
pub struct MissingRequirement {
    pub kind: RuntimeKind,
    pub requirement: VersionRequirement,
    /// Concrete version an install would provision.
    pub recommended: String,
}

/// Result of checking a tool's declared requirements.
#[derive(Debug, Clone)]
pub struct EnvironmentStatus {
    pub tool_name: String,
    pub satisfied: bool,
    pub available: Vec<RuntimeRecord>,
    pub missing: Vec<MissingRequirement>,
}

/// One failed provisioning step.
#[derive(Debug, Clone)]
pub struct ProvisionFailure {
    pub kind: RuntimeKind,
    pub version: String,
    pub error: String,
}

/// Outcome of driving a dependency plan.
#[derive(Debug, Clone)]
pub struct ProvisionReport {
    pub plan: DependencyPlan,
    pub provisioned: Vec<RuntimeRecord>,
    pub failures: Vec<ProvisionFailure>,
}

impl ProvisionReport {
    pub fn fully_satisfied(&self) -> bool {
        self.failures.is_empty()
    }
}

// ============================================================================
// Environment Manager
// ============================================================================

type ProvisionLockMap = StdMutex<HashMap<(RuntimeKind, String), Arc<AsyncMutex<()>>>>;

/// Coordinates the dependency resolver and runtime provisioners for tools.
pub struct EnvironmentManager {
    resolver: DependencyResolver,
    java: JavaProvisioner,
    python: PythonProvisioner,
    notifier: Arc<dyn Notifier>,
    provision_locks: ProvisionLockMap,
}

impl EnvironmentManager {
    pub fn new(
        layout: InstallLayout,
        platform: Platform,
        downloader: Arc<MultiSourceDownloader>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            resolver: DependencyResolver::new(),
            java: JavaProvisioner::new(
                layout.clone(),
                platform,
                downloader.clone(),
                notifier.clone(),
            ),
            python: PythonProvisioner::new(layout, platform, downloader, notifier.clone()),
            notifier,
            provision_locks: StdMutex::new(HashMap::new()),
        }
    }

    pub fn resolver(&self) -> &DependencyResolver {
        &self.resolver
    }

    /// Every runtime currently managed by this engine.
    pub fn managed_runtimes(&self) -> Vec<RuntimeRecord> {
        let mut records = self.java.managed_runtimes();
        records.extend(self.python.managed_runtimes());
        records
    }

    /// Checks a tool's declared requirements without installing anything.
    pub async fn check_tool_environment(
        &self,
        tool_name: &str,
        requirements: &[RuntimeRequirement],
    ) -> EnvironmentStatus {
        let mut status = EnvironmentStatus {
            tool_name: tool_name.to_string(),
            satisfied: true,
            available: Vec::new(),
            missing: Vec::new(),
        };

        for requirement in requirements {
            match self.check_requirement(requirement).await {
                RuntimeStatus::Satisfied(record) => status.available.push(record),
                RuntimeStatus::Missing { recommended } => {
                    status.satisfied = false;
                    status.missing.push(MissingRequirement {
                        kind: requirement.kind,
                        requirement: requirement.version.clone(),
                        recommended,
                    });
                }
            }
        }

        status
    }

    async fn check_requirement(&self, requirement: &RuntimeRequirement) -> RuntimeStatus {
        match requirement.kind {
            RuntimeKind::Java => self.java.check_requirements(&requirement.version).await,
            RuntimeKind::Python => self.python.check_requirements(&requirement.version).await,
        }
    }

    /// Resolves and drives the dependency plan for one tool.
    ///
    /// Steps run in priority order. A failed step is reported and skipped;
    /// only cancellation aborts the remaining steps.
    pub async fn provision_for_tool(
        &self,
        tool_name: &str,
        requirements: &[RuntimeRequirement],
        progress: ProgressFn<'_>,
        cancel: &CancelToken,
    ) -> Result<ProvisionReport> {
        let managed = self.managed_runtimes();
        let plan = self.resolver.resolve(tool_name, requirements, &managed);
        info!(
            "Provisioning {} runtime step(s) for {} (isolation: {:?})",
            plan.steps.len(),
            tool_name,
            plan.isolation_level
        );

        let mut provisioned = Vec::new();
        let mut failures = Vec::new();
        let total = plan.steps.len().max(1) as i32;

        for (index, step) in plan.steps.iter().enumerate() {
            cancel.check()?;

            let base = index as i32 * 100;
            let step_progress = |report: DownloadProgress| {
                if report.is_failure() {
                    progress(report);
                } else {
                    progress(DownloadProgress::at(
                        report.status,
                        (base + report.percent) / total,
                    ));
                }
            };

            // Cross-tool dedup: one provisioning of a given (kind, version)
            // at a time; install() re-checks the directory after the lock
            // is acquired, so the loser of the race skips the download.
            let lock = self.provision_lock(step.kind, &step.version);
            let _guard = lock.lock().await;

            let result = match step.kind {
                RuntimeKind::Java => {
                    self.java
                        .install(&step.version, &step_progress, cancel)
                        .await
                }
                RuntimeKind::Python => {
                    self.python
                        .install_with_packages(&step.version, &step.packages, &step_progress, cancel)
                        .await
                }
            };

            match result {
                Ok(record) => provisioned.push(record),
                Err(ProvisionError::Cancelled) => return Err(ProvisionError::Cancelled),
                Err(e) => {
                    warn!(
                        "Runtime step {}-{} failed for {}: {}",
                        step.kind, step.version, tool_name, e
                    );
                    self.notifier.log_error(
                        "runtime_unsatisfied",
                        &format!("{}-{}: {}", step.kind, step.version, e),
                        Some(&serde_json::json!({ "tool": tool_name })),
                    );
                    failures.push(ProvisionFailure {
                        kind: step.kind,
                        version: step.version.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        Ok(ProvisionReport {
            plan,
            provisioned,
            failures,
        })
    }

    /// Flags whether a tool upgrade needs a fresh isolated runtime.
    pub fn analyze_dependency_changes(
        &self,
        old: &[RuntimeRequirement],
        new: &[RuntimeRequirement],
    ) -> DependencyChangeReport {
        self.resolver.analyze_dependency_changes(old, new)
    }

    /// Managed `bin` directories satisfying the given requirements, for
    /// launch PATH construction. Requirements only a system runtime
    /// satisfies contribute nothing: the system PATH already covers them.
    pub fn runtime_bin_dirs(&self, requirements: &[RuntimeRequirement]) -> Vec<PathBuf> {
        let managed = self.managed_runtimes();
        let mut dirs = Vec::new();

        for requirement in requirements {
            let satisfying = managed.iter().find(|record| {
                record.satisfies(&requirement.version)
                    && record_kind(record) == Some(requirement.kind)
            });
            if let Some(record) = satisfying {
                let bin = record.bin_dir();
                let dir = if bin.is_dir() {
                    bin
                } else {
                    // Windows standalone interpreters keep the executable
                    // at the home root.
                    record.install_home.clone()
                };
                if !dirs.contains(&dir) {
                    dirs.push(dir);
                }
            }
        }

        dirs
    }

    fn provision_lock(&self, kind: RuntimeKind, version: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self
            .provision_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry((kind, version.to_string()))
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

/// Kind of a managed record, derived from its directory naming contract.
fn record_kind(record: &RuntimeRecord) -> Option<RuntimeKind> {
    let name = record.install_home.file_name()?.to_string_lossy();
    if name.starts_with("java-") {
        Some(RuntimeKind::Java)
    } else if name.starts_with("python-") {
        Some(RuntimeKind::Python)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provision::notifier::NullNotifier;
    use tempfile::TempDir;

    fn manager() -> (TempDir, EnvironmentManager) {
        let temp = TempDir::new().unwrap();
        let layout = InstallLayout::new(temp.path().join("tools"), temp.path().join("runtimes"));
        layout.ensure_dirs_exist().unwrap();
        let notifier: Arc<dyn Notifier> = Arc::new(NullNotifier);
        let downloader = Arc::new(MultiSourceDownloader::new(notifier.clone()));
        let manager = EnvironmentManager::new(
            layout,
            Platform::detect().unwrap_or(Platform::LinuxX64),
            downloader,
            notifier,
        );
        (temp, manager)
    }

    fn seed_managed_java(temp: &TempDir, version: &str) {
        let bin = temp
            .path()
            .join("runtimes")
            .join(format!("java-{}", version))
            .join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let name = if cfg!(windows) { "java.exe" } else { "java" };
        std::fs::write(bin.join(name), b"stub").unwrap();
    }

    #[tokio::test]
    async fn test_check_environment_with_managed_java() {
        let (temp, manager) = manager();
        seed_managed_java(&temp, "17");

        let requirements = vec![RuntimeRequirement::new(RuntimeKind::Java, "11+")];
        let status = manager.check_tool_environment("igv", &requirements).await;

        assert!(status.satisfied);
        assert_eq!(status.available.len(), 1);
        assert_eq!(status.available[0].version, "17");
    }

    #[tokio::test]
    async fn test_check_environment_reports_missing() {
        let (_temp, manager) = manager();

        // An impossible version guarantees neither managed nor system
        // runtimes satisfy it.
        let requirements = vec![RuntimeRequirement::new(RuntimeKind::Java, "9999")];
        let status = manager.check_tool_environment("igv", &requirements).await;

        assert!(!status.satisfied);
        assert_eq!(status.missing.len(), 1);
        assert_eq!(status.missing[0].recommended, "9999");
    }

    #[test]
    fn test_runtime_bin_dirs_prefers_managed() {
        let (temp, manager) = manager();
        seed_managed_java(&temp, "17");

        let requirements = vec![RuntimeRequirement::new(RuntimeKind::Java, "11+")];
        let dirs = manager.runtime_bin_dirs(&requirements);

        assert_eq!(dirs.len(), 1);
        assert!(dirs[0].ends_with("java-17/bin"));
    }

    #[test]
    fn test_runtime_bin_dirs_empty_without_match() {
        let (_temp, manager) = manager();
        let requirements = vec![RuntimeRequirement::new(RuntimeKind::Java, "11+")];
        assert!(manager.runtime_bin_dirs(&requirements).is_empty());
    }

    #[test]
    fn test_provision_lock_is_shared_per_key() {
        let (_temp, manager) = manager();
        let a = manager.provision_lock(RuntimeKind::Java, "17");
        let b = manager.provision_lock(RuntimeKind::Java, "17");
        let c = manager.provision_lock(RuntimeKind::Java, "11");

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_record_kind_from_layout_contract() {
        let java = RuntimeRecord {
            version: "17".into(),
            install_home: PathBuf::from("/cache/java-17"),
            source: super::super::version::RuntimeSource::Managed,
        };
        assert_eq!(record_kind(&java), Some(RuntimeKind::Java));

        let odd = RuntimeRecord {
            version: "1".into(),
            install_home: PathBuf::from("/cache/other-1"),
            source: super::super::version::RuntimeSource::Managed,
        };
        assert_eq!(record_kind(&odd), None);
    }
}
