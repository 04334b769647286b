//! Per-tool installation state machine.
//!
//! Sequences dependency resolution, download, verification, extraction,
//! executable location, configuration and final verification, plus
//! uninstall with locked-file tolerance and detached launch. Mutating
//! operations hold a per-tool mutex (fail-fast) and run under a bounded
//! worker pool.

use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tracing::{debug, info, warn};

use super::cache::MetadataCache;
use super::cancel::CancelToken;
use super::descriptor::ToolDescriptor;
use super::downloader::{HashAlgorithm, MultiSourceDownloader};
use super::extractor;
use super::manifest::{load_manifest, save_manifest, InstallManifest};
use super::notifier::Notifier;
use super::paths::InstallLayout;
use super::platform::Platform;
use super::types::{
    DownloadProgress, InstallState, ProgressFn, ToolInstallationRecord, ToolMetadata,
};
use crate::error::{ProvisionError, Result};
use crate::runtime::environment::EnvironmentManager;

/// Concurrent mutating operations across all tools.
const WORKER_POOL_SIZE: usize = 3;

/// Whole-directory removal attempts before falling back to the per-file
/// sweep.
const UNINSTALL_ATTEMPTS: u32 = 4;

/// Base delay of the uninstall retry backoff (doubles per attempt).
const UNINSTALL_BACKOFF: Duration = Duration::from_millis(100);

// ============================================================================
// Query Results
// ============================================================================

/// Snapshot of one tool for the host application.
#[derive(Debug, Clone)]
pub struct ToolInfo {
    pub metadata: ToolMetadata,
    pub record: ToolInstallationRecord,
}

/// Outcome of an uninstall. `skipped` lists files left behind because they
/// stayed locked through the retry budget.
#[derive(Debug, Clone, Default)]
pub struct UninstallOutcome {
    pub skipped: Vec<PathBuf>,
}

impl UninstallOutcome {
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty()
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Drives the install/uninstall/launch lifecycle for tools.
pub struct InstallationOrchestrator {
    layout: InstallLayout,
    platform: Platform,
    downloader: Arc<MultiSourceDownloader>,
    environment: Arc<EnvironmentManager>,
    notifier: Arc<dyn Notifier>,
    manifest: StdMutex<InstallManifest>,
    records: StdMutex<HashMap<String, ToolInstallationRecord>>,
    metadata_cache: StdMutex<MetadataCache>,
    tool_locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    children: StdMutex<HashMap<String, Vec<Child>>>,
    workers: Arc<Semaphore>,
}

impl InstallationOrchestrator {
    /// Creates an orchestrator over the given layout. Loads existing
    /// install bookkeeping and creates the directory skeleton.
    pub fn new(
        layout: InstallLayout,
        platform: Platform,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        layout
            .ensure_dirs_exist()
            .map_err(|e| ProvisionError::Io(std::io::Error::other(e.to_string())))?;
        let manifest = load_manifest(&layout.manifest_path())
            .map_err(|e| ProvisionError::Io(std::io::Error::other(e.to_string())))?;

        let downloader = Arc::new(MultiSourceDownloader::new(notifier.clone()));
        let environment = Arc::new(EnvironmentManager::new(
            layout.clone(),
            platform,
            downloader.clone(),
            notifier.clone(),
        ));

        info!(
            "Installation orchestrator ready. Install root: {}, platform: {}",
            layout.install_root().display(),
            platform
        );

        Ok(Self {
            layout,
            platform,
            downloader,
            environment,
            notifier,
            manifest: StdMutex::new(manifest),
            records: StdMutex::new(HashMap::new()),
            metadata_cache: StdMutex::new(MetadataCache::default()),
            tool_locks: StdMutex::new(HashMap::new()),
            children: StdMutex::new(HashMap::new()),
            workers: Arc::new(Semaphore::new(WORKER_POOL_SIZE)),
        })
    }

    pub fn environment(&self) -> &Arc<EnvironmentManager> {
        &self.environment
    }

    pub fn layout(&self) -> &InstallLayout {
        &self.layout
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Current lifecycle state of a tool.
    pub fn state(&self, tool: &str) -> InstallState {
        self.records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(tool)
            .map(|r| r.state)
            .unwrap_or(InstallState::Available)
    }

    /// Combined metadata and installation record. Creates the record on
    /// first query; metadata goes through the orchestrator-owned TTL cache.
    pub fn tool_info(&self, descriptor: &dyn ToolDescriptor) -> ToolInfo {
        let metadata = self.cached_metadata(descriptor);
        let record = self.record_snapshot(descriptor, &metadata);
        ToolInfo { metadata, record }
    }

    /// Absolute executable path of an installed, verified tool.
    pub fn executable_path(&self, descriptor: &dyn ToolDescriptor) -> Option<PathBuf> {
        let name = descriptor.metadata().name;
        let install_dir = self.layout.tool_dir(&descriptor.install_dir_name());
        let manifest = self.manifest.lock().unwrap_or_else(|p| p.into_inner());
        let info = manifest.get(&name)?;
        let exe = install_dir.join(&info.executable);
        exe.is_file().then_some(exe)
    }

    /// Names of all installed tools, sorted.
    pub fn installed_tools(&self) -> Vec<String> {
        self.manifest
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .installed_tools()
    }

    /// Drops a tool's cached metadata entry.
    pub fn invalidate_metadata(&self, tool: &str) {
        self.metadata_cache
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .invalidate(tool);
    }

    fn cached_metadata(&self, descriptor: &dyn ToolDescriptor) -> ToolMetadata {
        // The descriptor's name is needed before the cache can be keyed;
        // metadata() must stay cheap for that first call.
        let metadata = descriptor.metadata();
        let mut cache = self
            .metadata_cache
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        if let Some(cached) = cache.get(&metadata.name) {
            return cached.clone();
        }
        cache.insert(&metadata.name, metadata.clone());
        metadata
    }

    fn record_snapshot(
        &self,
        descriptor: &dyn ToolDescriptor,
        metadata: &ToolMetadata,
    ) -> ToolInstallationRecord {
        let install_dir = self.layout.tool_dir(&descriptor.install_dir_name());
        let mut records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        let record = records.entry(metadata.name.clone()).or_insert_with(|| {
            ToolInstallationRecord::new(&metadata.name, &metadata.version, install_dir.clone())
        });

        // Reconcile idle records with the durable manifest.
        if !record.state.is_busy() {
            let manifest = self.manifest.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(info) = manifest.get(&metadata.name) {
                let exe = install_dir.join(&info.executable);
                if exe.is_file() {
                    record.state = InstallState::Installed;
                    record.version = info.version.clone();
                    record.executable_path = Some(exe);
                    record.disk_usage_bytes = info.disk_usage_bytes;
                }
            }
        }
        record.clone()
    }

    // ========================================================================
    // Install
    // ========================================================================

    /// Installs a tool. Rejects immediately with `ConcurrentOperation` when
    /// another mutating operation for the same tool is in flight. An
    /// already-verified install returns without re-downloading.
    pub async fn install(
        &self,
        descriptor: &dyn ToolDescriptor,
        progress: ProgressFn<'_>,
        cancel: &CancelToken,
    ) -> Result<()> {
        let metadata = descriptor.metadata();
        let name = metadata.name.clone();

        let lock = self.tool_lock(&name);
        let _guard = lock
            .try_lock_owned()
            .map_err(|_| ProvisionError::ConcurrentOperation { tool: name.clone() })?;
        let _permit = self
            .workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ProvisionError::Cancelled)?;

        self.record_snapshot(descriptor, &metadata);
        if let Some(exe) = self.verified_install(descriptor, &name) {
            info!("{} already installed and verified at {}", name, exe.display());
            self.notifier.log_step(&name, "install", "already_installed", None);
            progress(DownloadProgress::at("Already installed", 100));
            return Ok(());
        }

        self.notifier.log_step(&name, "install", "started", None);
        let result = self
            .run_install(descriptor, &metadata, progress, cancel)
            .await;

        match &result {
            Ok(()) => {
                self.set_state(&name, InstallState::Installed);
                self.invalidate_metadata(&name);
                self.notifier.log_step(&name, "install", "completed", None);
            }
            Err(e) => {
                let stage = self.state(&name);
                self.set_state(&name, InstallState::Failed);
                self.notifier.log_error(
                    e.kind(),
                    &e.to_string(),
                    Some(&json!({ "tool": name, "stage": stage.as_str() })),
                );
                progress(DownloadProgress::failed(format!(
                    "Installation failed during {}: {}",
                    stage, e
                )));
                self.cleanup_failed_install(descriptor).await;
                // A failed attempt leaves the record ready for a retry.
                self.reset_record(&name);
            }
        }
        result
    }

    async fn run_install(
        &self,
        descriptor: &dyn ToolDescriptor,
        metadata: &ToolMetadata,
        progress: ProgressFn<'_>,
        cancel: &CancelToken,
    ) -> Result<()> {
        let name = &metadata.name;
        let dir_name = descriptor.install_dir_name();
        let tool_dir = self.layout.tool_dir(&dir_name);

        // Dependency resolution is advisory: a failed runtime step never
        // aborts the tool install.
        cancel.check()?;
        self.transition(name, InstallState::ResolvingDeps, progress, 5);
        if !metadata.required_runtimes.is_empty() {
            let runtime_progress = scale_progress(progress, 5, 10);
            let report = self
                .environment
                .provision_for_tool(name, &metadata.required_runtimes, &runtime_progress, cancel)
                .await?;
            if !report.fully_satisfied() {
                warn!(
                    "{} runtime step(s) unsatisfied for {}; continuing installation",
                    report.failures.len(),
                    name
                );
            }
        }

        cancel.check()?;
        self.transition(name, InstallState::Downloading, progress, 15);
        let sources = descriptor.download_sources();
        let archive_path = self.layout.downloads_dir().join(format!("{}.archive", dir_name));
        let download_progress = scale_progress(progress, 15, 55);
        let outcome = self
            .downloader
            .download_with_fallback(&sources, &archive_path, &download_progress, cancel)
            .await?;

        cancel.check()?;
        self.transition(name, InstallState::Verifying, progress, 72);
        if let Some(expected) = outcome.source.expected_size {
            let actual = std::fs::metadata(&archive_path)?.len();
            if actual != expected {
                let _ = std::fs::remove_file(&archive_path);
                return Err(ProvisionError::Integrity {
                    path: archive_path,
                    detail: format!("expected {} bytes, got {}", expected, actual),
                });
            }
        }
        if let Some(sha256) = &outcome.source.sha256 {
            let intact =
                self.downloader
                    .verify_file_integrity(&archive_path, sha256, HashAlgorithm::Sha256)?;
            if !intact {
                let _ = std::fs::remove_file(&archive_path);
                return Err(ProvisionError::Integrity {
                    path: archive_path,
                    detail: "sha256 mismatch".to_string(),
                });
            }
        }

        cancel.check()?;
        self.transition(name, InstallState::Extracting, progress, 78);
        let staging = self.layout.staging_dir(&dir_name);
        {
            let archive = archive_path.clone();
            let staging = staging.clone();
            tokio::task::spawn_blocking(move || -> Result<()> {
                extractor::extract(&archive, &staging)?;
                extractor::collapse_nested_dir(&staging)?;
                Ok(())
            })
            .await
            .map_err(|e| ProvisionError::Archive(format!("extraction task failed: {}", e)))??;
        }
        // Promote the staging tree to the canonical directory name.
        if tool_dir.exists() {
            std::fs::remove_dir_all(&tool_dir)?;
        }
        std::fs::rename(&staging, &tool_dir)?;

        cancel.check()?;
        self.transition(name, InstallState::Locating, progress, 85);
        let exe_name = self
            .platform
            .executable_name(&descriptor.executable_base_name());
        let exe_path = find_executable(&tool_dir, &exe_name).ok_or_else(|| {
            ProvisionError::Layout(format!("executable {} not found after extraction", exe_name))
        })?;
        extractor::make_executable(&exe_path)?;
        debug!("Located {} at {}", name, exe_path.display());

        cancel.check()?;
        self.transition(name, InstallState::Configuring, progress, 90);
        for file in descriptor.config_files(self.platform) {
            let path = tool_dir.join(&file.relative_path);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, &file.contents)?;
            if file.executable {
                extractor::make_executable(&path)?;
            }
        }

        self.transition(name, InstallState::VerifyingInstall, progress, 95);
        if !exe_path.is_file() {
            return Err(ProvisionError::Layout(format!(
                "executable disappeared: {}",
                exe_path.display()
            )));
        }
        for auxiliary in descriptor.auxiliary_files() {
            let path = tool_dir.join(&auxiliary);
            if !path.exists() {
                return Err(ProvisionError::Layout(format!(
                    "required file missing after install: {}",
                    auxiliary
                )));
            }
        }

        let disk_usage = directory_size(&tool_dir);
        let exe_rel = exe_path
            .strip_prefix(&tool_dir)
            .unwrap_or(&exe_path)
            .to_path_buf();
        {
            let mut manifest = self.manifest.lock().unwrap_or_else(|p| p.into_inner());
            manifest.mark_installed(name, metadata.version.clone(), disk_usage, exe_rel);
            save_manifest(&manifest, &self.layout.manifest_path())
                .map_err(|e| ProvisionError::Io(std::io::Error::other(e.to_string())))?;
        }
        {
            let mut records = self.records.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(record) = records.get_mut(name) {
                record.version = metadata.version.clone();
                record.executable_path = Some(exe_path);
                record.disk_usage_bytes = disk_usage;
            }
        }

        if let Err(e) = std::fs::remove_file(&archive_path) {
            warn!("Failed to clean up archive: {}", e);
        }

        progress(DownloadProgress::at("Installation complete", 100));
        Ok(())
    }

    /// Returns the executable when the tool is already installed and its
    /// on-disk layout still verifies.
    fn verified_install(&self, descriptor: &dyn ToolDescriptor, name: &str) -> Option<PathBuf> {
        let exe = self.executable_path(descriptor)?;
        let tool_dir = self.layout.tool_dir(&descriptor.install_dir_name());
        for auxiliary in descriptor.auxiliary_files() {
            if !tool_dir.join(&auxiliary).exists() {
                debug!("{} installed but {} is missing; reinstalling", name, auxiliary);
                return None;
            }
        }
        self.set_state(name, InstallState::Installed);
        Some(exe)
    }

    async fn cleanup_failed_install(&self, descriptor: &dyn ToolDescriptor) {
        let dir_name = descriptor.install_dir_name();
        let staging = self.layout.staging_dir(&dir_name);
        if staging.exists() {
            let _ = tokio::fs::remove_dir_all(&staging).await;
        }
        let archive = self.layout.downloads_dir().join(format!("{}.archive", dir_name));
        let _ = tokio::fs::remove_file(&archive).await;
    }

    // ========================================================================
    // Uninstall
    // ========================================================================

    /// Uninstalls a tool, tolerating locked files: related processes are
    /// terminated, removal is retried with backoff, and a file that stays
    /// locked is skipped while everything else is removed.
    pub async fn uninstall(&self, descriptor: &dyn ToolDescriptor) -> Result<UninstallOutcome> {
        let name = descriptor.metadata().name;
        let lock = self.tool_lock(&name);
        let _guard = lock
            .try_lock_owned()
            .map_err(|_| ProvisionError::ConcurrentOperation { tool: name.clone() })?;
        let _permit = self
            .workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ProvisionError::Cancelled)?;

        let install_dir = self.layout.tool_dir(&descriptor.install_dir_name());
        self.set_state(&name, InstallState::Uninstalling);
        self.notifier.log_step(&name, "uninstall", "started", None);

        let outcome = if install_dir.exists() {
            // Processes this orchestrator launched may hold files open.
            self.terminate_children(&name);

            let dir = install_dir.clone();
            let outcome = tokio::task::spawn_blocking(move || remove_dir_resilient(&dir))
                .await
                .map_err(|e| ProvisionError::Io(std::io::Error::other(e.to_string())))??;

            if !outcome.is_complete() {
                warn!(
                    "{} uninstalled with {} locked file(s) left behind",
                    name,
                    outcome.skipped.len()
                );
                self.notifier.log_step(
                    &name,
                    "uninstall",
                    "partial",
                    Some(&json!({
                        "skipped": outcome
                            .skipped
                            .iter()
                            .map(|p| p.display().to_string())
                            .collect::<Vec<_>>()
                    })),
                );
            }
            outcome
        } else {
            debug!("{} has no install directory, nothing to remove", name);
            UninstallOutcome::default()
        };

        {
            let mut manifest = self.manifest.lock().unwrap_or_else(|p| p.into_inner());
            manifest.mark_uninstalled(&name);
            save_manifest(&manifest, &self.layout.manifest_path())
                .map_err(|e| ProvisionError::Io(std::io::Error::other(e.to_string())))?;
        }
        self.reset_record(&name);
        self.invalidate_metadata(&name);
        self.notifier.log_step(&name, "uninstall", "completed", None);
        Ok(outcome)
    }

    // ========================================================================
    // Launch
    // ========================================================================

    /// Launches an installed tool as a detached process and returns its
    /// PID. Valid only from a verified `Installed` state; does not change
    /// installation state.
    pub fn launch(&self, descriptor: &dyn ToolDescriptor) -> Result<u32> {
        let metadata = descriptor.metadata();
        let name = metadata.name.clone();
        let exe = self.executable_path(descriptor).ok_or_else(|| {
            ProvisionError::Layout(format!("{} is not installed or failed verification", name))
        })?;
        let install_dir = self.layout.tool_dir(&descriptor.install_dir_name());

        // Managed runtimes satisfying the tool's requirements go first on
        // PATH; otherwise the system runtime is the fallback.
        let runtime_bins = self
            .environment
            .runtime_bin_dirs(&metadata.required_runtimes);
        let env = self
            .platform
            .build_launch_environment(&runtime_bins, &descriptor.launch_env());

        let child = Command::new(&exe)
            .args(descriptor.launch_args())
            .current_dir(&install_dir)
            .env_clear()
            .envs(&env)
            .spawn()?;
        let pid = child.id();

        info!("Launched {} (pid {}) from {}", name, pid, install_dir.display());
        self.notifier.log_step(
            &name,
            "launch",
            "started",
            Some(&json!({ "pid": pid, "executable": exe.display().to_string() })),
        );

        self.children
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(name)
            .or_default()
            .push(child);
        Ok(pid)
    }

    fn terminate_children(&self, name: &str) {
        let children = self
            .children
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(name);
        if let Some(children) = children {
            for mut child in children {
                debug!("Terminating process {} of {}", child.id(), name);
                let _ = child.kill();
                let _ = child.wait();
            }
        }
    }

    // ========================================================================
    // Record Helpers
    // ========================================================================

    fn tool_lock(&self, name: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.tool_locks.lock().unwrap_or_else(|p| p.into_inner());
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn set_state(&self, name: &str, state: InstallState) {
        let mut records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(record) = records.get_mut(name) {
            record.state = state;
        }
    }

    fn reset_record(&self, name: &str) {
        let mut records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(record) = records.get_mut(name) {
            record.state = InstallState::Available;
            record.executable_path = None;
            record.disk_usage_bytes = 0;
        }
    }

    fn transition(&self, name: &str, state: InstallState, progress: ProgressFn<'_>, percent: i32) {
        self.set_state(name, state);
        self.notifier.log_step(name, state.as_str(), "started", None);
        progress(DownloadProgress::at(stage_label(state), percent));
    }
}

fn stage_label(state: InstallState) -> &'static str {
    match state {
        InstallState::ResolvingDeps => "Resolving runtime dependencies...",
        InstallState::Downloading => "Downloading...",
        InstallState::Verifying => "Verifying download...",
        InstallState::Extracting => "Extracting...",
        InstallState::Locating => "Locating executable...",
        InstallState::Configuring => "Writing configuration...",
        InstallState::VerifyingInstall => "Verifying installation...",
        _ => "Working...",
    }
}

/// Maps a sub-operation's 0..=100 progress into `base..base+span`,
/// passing failure reports through unchanged.
fn scale_progress<'a>(
    progress: ProgressFn<'a>,
    base: i32,
    span: i32,
) -> impl Fn(DownloadProgress) + Send + Sync + 'a {
    move |report: DownloadProgress| {
        if report.is_failure() {
            progress(report);
        } else {
            progress(DownloadProgress::at(
                report.status,
                base + report.percent * span / 100,
            ));
        }
    }
}

// ============================================================================
// Filesystem Helpers
// ============================================================================

/// Depth-first search for a file by exact name. Packaging layouts vary, so
/// the executable may sit anywhere in the extracted tree.
fn find_executable(dir: &Path, name: &str) -> Option<PathBuf> {
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let entries = match std::fs::read_dir(&current) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if entry.file_name().to_string_lossy() == name {
                return Some(path);
            }
        }
    }
    None
}

fn directory_size(dir: &Path) -> u64 {
    let mut total = 0;
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let entries = match std::fs::read_dir(&current) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if let Ok(meta) = entry.metadata() {
                total += meta.len();
            }
        }
    }
    total
}

/// Removes a directory, tolerating locked files: whole-tree removal with
/// bounded exponential backoff first, then a per-entry sweep that skips
/// whatever stays locked.
fn remove_dir_resilient(dir: &Path) -> Result<UninstallOutcome> {
    for attempt in 0..UNINSTALL_ATTEMPTS {
        match std::fs::remove_dir_all(dir) {
            Ok(()) => return Ok(UninstallOutcome::default()),
            Err(e) => {
                debug!(
                    "Removal attempt {}/{} for {} failed: {}",
                    attempt + 1,
                    UNINSTALL_ATTEMPTS,
                    dir.display(),
                    e
                );
                std::thread::sleep(UNINSTALL_BACKOFF * 2u32.pow(attempt));
            }
        }
    }

    // Retry budget exhausted: remove everything removable, skip the rest.
    let mut skipped = Vec::new();
    sweep_dir(dir, &mut skipped);

    if dir.exists() && skipped.is_empty() {
        // Nothing identifiable blocked us, yet the directory survived.
        return Err(ProvisionError::ResourceLocked {
            path: dir.to_path_buf(),
        });
    }
    Ok(UninstallOutcome { skipped })
}

fn sweep_dir(dir: &Path, skipped: &mut Vec<PathBuf>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => {
            skipped.push(dir.to_path_buf());
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            sweep_dir(&path, skipped);
        } else if std::fs::remove_file(&path).is_err() {
            skipped.push(path);
        }
    }

    // The directory itself goes last; it only falls if it emptied out.
    let _ = std::fs::remove_dir(dir);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provision::notifier::NullNotifier;
    use crate::provision::types::DownloadSource;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct TestTool {
        name: String,
        sources: Vec<DownloadSource>,
    }

    impl TestTool {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                sources: Vec::new(),
            }
        }
    }

    impl ToolDescriptor for TestTool {
        fn metadata(&self) -> ToolMetadata {
            ToolMetadata {
                name: self.name.clone(),
                version: "1.0".to_string(),
                required_runtimes: Vec::new(),
            }
        }

        fn download_sources(&self) -> Vec<DownloadSource> {
            self.sources.clone()
        }

        fn install_dir_name(&self) -> String {
            self.name.clone()
        }

        fn executable_base_name(&self) -> String {
            self.name.clone()
        }
    }

    fn orchestrator() -> (TempDir, InstallationOrchestrator) {
        let temp = TempDir::new().unwrap();
        let layout = InstallLayout::new(temp.path().join("tools"), temp.path().join("runtimes"));
        let orchestrator = InstallationOrchestrator::new(
            layout,
            Platform::detect().unwrap_or(Platform::LinuxX64),
            Arc::new(NullNotifier),
        )
        .unwrap();
        (temp, orchestrator)
    }

    /// Seeds a tool on disk and in the manifest as if installed earlier.
    fn seed_installed(orchestrator: &InstallationOrchestrator, tool: &TestTool) {
        let dir = orchestrator.layout.tool_dir(&tool.install_dir_name());
        std::fs::create_dir_all(&dir).unwrap();
        let exe_name = orchestrator
            .platform
            .executable_name(&tool.executable_base_name());
        std::fs::write(dir.join(&exe_name), b"#!/bin/sh\nexit 0\n").unwrap();
        extractor::make_executable(&dir.join(&exe_name)).unwrap();

        let mut manifest = orchestrator.manifest.lock().unwrap();
        manifest.mark_installed(&tool.name, "1.0".to_string(), 16, PathBuf::from(&exe_name));
        save_manifest(&manifest, &orchestrator.layout.manifest_path()).unwrap();
    }

    #[tokio::test]
    async fn test_install_fails_when_all_sources_fail() {
        let (_temp, orchestrator) = orchestrator();
        let mut tool = TestTool::new("ugene");
        tool.sources = vec![DownloadSource {
            name: "dead".to_string(),
            url: None,
            priority: 1,
            timeout_secs: 1,
            expected_size: None,
            sha256: None,
            location: None,
        }];

        let result = orchestrator
            .install(&tool, &|_| {}, &CancelToken::new())
            .await;
        assert!(matches!(
            result,
            Err(ProvisionError::SourceUnavailable { .. })
        ));
        // A failed attempt resets the record for retry.
        assert_eq!(orchestrator.state("ugene"), InstallState::Available);
    }

    #[tokio::test]
    async fn test_concurrent_install_is_rejected() {
        let (_temp, orchestrator) = orchestrator();
        let tool = TestTool::new("ugene");

        // Simulate an in-flight operation by holding the tool lock.
        let lock = orchestrator.tool_lock("ugene");
        let _held = lock.clone().try_lock_owned().unwrap();

        let result = orchestrator
            .install(&tool, &|_| {}, &CancelToken::new())
            .await;
        assert!(matches!(
            result,
            Err(ProvisionError::ConcurrentOperation { tool }) if tool == "ugene"
        ));
    }

    #[tokio::test]
    async fn test_install_is_idempotent_for_verified_install() {
        let (_temp, orchestrator) = orchestrator();
        let tool = TestTool::new("fastqc");
        seed_installed(&orchestrator, &tool);

        // No download sources: reaching the download stage would fail, so
        // success proves the short-circuit took effect.
        let reports: Mutex<Vec<DownloadProgress>> = Mutex::new(Vec::new());
        let result = orchestrator
            .install(
                &tool,
                &|p| reports.lock().unwrap().push(p),
                &CancelToken::new(),
            )
            .await;

        assert!(result.is_ok());
        assert_eq!(orchestrator.state("fastqc"), InstallState::Installed);
        assert_eq!(reports.lock().unwrap().last().unwrap().percent, 100);
    }

    #[tokio::test]
    async fn test_cancelled_install_reports_cancellation() {
        let (_temp, orchestrator) = orchestrator();
        let tool = TestTool::new("igv");
        let token = CancelToken::new();
        token.cancel();

        let result = orchestrator.install(&tool, &|_| {}, &token).await;
        assert!(matches!(result, Err(ProvisionError::Cancelled)));
        assert_eq!(orchestrator.state("igv"), InstallState::Available);
    }

    #[tokio::test]
    async fn test_uninstall_removes_tool() {
        let (_temp, orchestrator) = orchestrator();
        let tool = TestTool::new("fastqc");
        seed_installed(&orchestrator, &tool);

        let outcome = orchestrator.uninstall(&tool).await.unwrap();
        assert!(outcome.is_complete());
        assert!(!orchestrator.layout.tool_dir("fastqc").exists());
        assert!(!orchestrator.installed_tools().contains(&"fastqc".to_string()));
        assert_eq!(orchestrator.state("fastqc"), InstallState::Available);
    }

    #[tokio::test]
    async fn test_uninstall_without_install_dir_succeeds() {
        let (_temp, orchestrator) = orchestrator();
        let tool = TestTool::new("ghost");
        let outcome = orchestrator.uninstall(&tool).await.unwrap();
        assert!(outcome.is_complete());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_uninstall_skips_locked_files() {
        use std::os::unix::fs::PermissionsExt;

        let (_temp, orchestrator) = orchestrator();
        let tool = TestTool::new("cyto");
        seed_installed(&orchestrator, &tool);

        // A read-only directory makes its children undeletable, standing in
        // for a file held open by another process.
        let dir = orchestrator.layout.tool_dir("cyto");
        let locked_dir = dir.join("logs");
        std::fs::create_dir_all(&locked_dir).unwrap();
        std::fs::write(locked_dir.join("launch.log"), b"held open").unwrap();
        std::fs::set_permissions(&locked_dir, std::fs::Permissions::from_mode(0o555)).unwrap();

        let outcome = orchestrator.uninstall(&tool).await.unwrap();

        // Partial cleanup: the locked file is skipped, everything else is
        // gone, and the uninstall still reports success.
        assert!(!outcome.is_complete());
        assert!(outcome
            .skipped
            .iter()
            .any(|p| p.ends_with("logs/launch.log")));
        assert!(!dir.join(orchestrator.platform.executable_name("cyto")).exists());
        assert_eq!(orchestrator.state("cyto"), InstallState::Available);

        // Restore permissions so the tempdir can be dropped.
        std::fs::set_permissions(&locked_dir, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_launch_spawns_detached_process() {
        let (_temp, orchestrator) = orchestrator();
        let tool = TestTool::new("echoer");
        seed_installed(&orchestrator, &tool);

        let pid = orchestrator.launch(&tool).unwrap();
        assert!(pid > 0);
        // State is untouched by launch.
        assert_ne!(orchestrator.state("echoer"), InstallState::Uninstalling);
    }

    #[test]
    fn test_launch_rejected_when_not_installed() {
        let (_temp, orchestrator) = orchestrator();
        let tool = TestTool::new("missing");
        let result = orchestrator.launch(&tool);
        assert!(matches!(result, Err(ProvisionError::Layout(_))));
    }

    #[test]
    fn test_tool_info_creates_record_on_first_query() {
        let (_temp, orchestrator) = orchestrator();
        let tool = TestTool::new("ugene");

        let info = orchestrator.tool_info(&tool);
        assert_eq!(info.record.state, InstallState::Available);
        assert_eq!(info.metadata.version, "1.0");
        assert!(orchestrator.records.lock().unwrap().contains_key("ugene"));
    }

    #[test]
    fn test_tool_info_reflects_manifest() {
        let (_temp, orchestrator) = orchestrator();
        let tool = TestTool::new("fastqc");
        seed_installed(&orchestrator, &tool);

        let info = orchestrator.tool_info(&tool);
        assert_eq!(info.record.state, InstallState::Installed);
        assert!(info.record.executable_path.is_some());
    }

    #[test]
    fn test_find_executable_in_nested_layout() {
        let temp = TempDir::new().unwrap();
        let nested = temp.path().join("a/b/bin");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("tool"), b"x").unwrap();
        std::fs::write(temp.path().join("readme"), b"x").unwrap();

        let found = find_executable(temp.path(), "tool").unwrap();
        assert!(found.ends_with("a/b/bin/tool"));
        assert!(find_executable(temp.path(), "other").is_none());
    }

    #[test]
    fn test_directory_size() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("a"), vec![0u8; 100]).unwrap();
        std::fs::create_dir_all(temp.path().join("sub")).unwrap();
        std::fs::write(temp.path().join("sub/b"), vec![0u8; 50]).unwrap();

        assert_eq!(directory_size(temp.path()), 150);
    }
}
