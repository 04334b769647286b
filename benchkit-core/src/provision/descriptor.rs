//! Tool descriptor collaborator interface.
//!
//! Per-tool knowledge (mirrors, version, runtime needs, packaging quirks)
//! lives outside this crate; the orchestrator consumes it through this
//! trait. Descriptive metadata such as display names and categories stays
//! with the host application.

use std::collections::HashMap;

use super::platform::Platform;
use super::types::{DownloadSource, ToolMetadata};

/// A config or launcher file written into the install directory during the
/// configuring stage.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    /// Path relative to the install directory.
    pub relative_path: String,
    pub contents: String,
    /// Whether the file needs the executable bit on Unix.
    pub executable: bool,
}

impl ConfigFile {
    pub fn new(relative_path: impl Into<String>, contents: impl Into<String>) -> Self {
        Self {
            relative_path: relative_path.into(),
            contents: contents.into(),
            executable: false,
        }
    }

    pub fn executable(mut self) -> Self {
        self.executable = true;
        self
    }
}

/// Everything the engine needs to know about one tool.
pub trait ToolDescriptor: Send + Sync {
    /// Name, version and runtime requirements.
    fn metadata(&self) -> ToolMetadata;

    /// Candidate download origins. Order is irrelevant; the downloader
    /// sorts by priority.
    fn download_sources(&self) -> Vec<DownloadSource>;

    /// Canonical install subdirectory name under the install root.
    fn install_dir_name(&self) -> String;

    /// Base name of the main executable, without platform suffix. The
    /// locating stage searches the extracted tree for
    /// `platform.executable_name(base)` because packaging layouts vary.
    fn executable_base_name(&self) -> String;

    /// Files (relative to the install dir) that must exist for the install
    /// to verify, beyond the executable itself.
    fn auxiliary_files(&self) -> Vec<String> {
        Vec::new()
    }

    /// Launcher wrappers and environment files to write during the
    /// configuring stage.
    fn config_files(&self, _platform: Platform) -> Vec<ConfigFile> {
        Vec::new()
    }

    /// Arguments passed to the executable at launch.
    fn launch_args(&self) -> Vec<String> {
        Vec::new()
    }

    /// Extra environment variables for launched processes.
    fn launch_env(&self) -> HashMap<String, String> {
        HashMap::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_file_builder() {
        let file = ConfigFile::new("bin/run.sh", "#!/bin/sh\nexec tool \"$@\"\n").executable();
        assert_eq!(file.relative_path, "bin/run.sh");
        assert!(file.executable);

        let plain = ConfigFile::new("tool.vmoptions", "-Xmx2048M\n");
        assert!(!plain.executable);
    }
}
