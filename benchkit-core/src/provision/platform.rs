//! Platform capability interface.
//!
//! OS-specific behavior (executable naming, PATH construction, release
//! artifact selection) lives behind one enum selected at startup instead of
//! `cfg` branches scattered through install and launch code.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

/// A supported platform (OS + architecture).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Platform {
    LinuxX64,
    LinuxArm64,
    MacosX64,
    MacosArm64,
    WindowsX64,
}

impl Platform {
    /// Detects the current platform at compile target granularity.
    ///
    /// Returns `None` on unsupported targets.
    pub fn detect() -> Option<Self> {
        #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
        {
            Some(Platform::LinuxX64)
        }
        #[cfg(all(target_os = "linux", target_arch = "aarch64"))]
        {
            Some(Platform::LinuxArm64)
        }
        #[cfg(all(target_os = "macos", target_arch = "x86_64"))]
        {
            Some(Platform::MacosX64)
        }
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        {
            Some(Platform::MacosArm64)
        }
        #[cfg(all(target_os = "windows", target_arch = "x86_64"))]
        {
            Some(Platform::WindowsX64)
        }
        #[cfg(not(any(
            all(target_os = "linux", target_arch = "x86_64"),
            all(target_os = "linux", target_arch = "aarch64"),
            all(target_os = "macos", target_arch = "x86_64"),
            all(target_os = "macos", target_arch = "aarch64"),
            all(target_os = "windows", target_arch = "x86_64"),
        )))]
        {
            None
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::LinuxX64 => "Linux (x86_64)",
            Self::LinuxArm64 => "Linux (ARM64)",
            Self::MacosX64 => "macOS (Intel)",
            Self::MacosArm64 => "macOS (Apple Silicon)",
            Self::WindowsX64 => "Windows (x86_64)",
        }
    }

    pub fn is_windows(&self) -> bool {
        matches!(self, Self::WindowsX64)
    }

    /// Resolves an executable's file name for this platform.
    pub fn executable_name(&self, base: &str) -> String {
        if self.is_windows() {
            format!("{}.exe", base)
        } else {
            base.to_string()
        }
    }

    /// Separator used when joining PATH entries.
    pub fn path_separator(&self) -> &'static str {
        if self.is_windows() {
            ";"
        } else {
            ":"
        }
    }

    /// Preferred archive extension for release artifacts.
    pub fn archive_ext(&self) -> &'static str {
        if self.is_windows() {
            "zip"
        } else {
            "tar.gz"
        }
    }

    /// OS token used in upstream release artifact names.
    pub fn os_token(&self) -> &'static str {
        match self {
            Self::LinuxX64 | Self::LinuxArm64 => "linux",
            Self::MacosX64 | Self::MacosArm64 => "mac",
            Self::WindowsX64 => "windows",
        }
    }

    /// Architecture token used in upstream release artifact names.
    pub fn arch_token(&self) -> &'static str {
        match self {
            Self::LinuxX64 | Self::MacosX64 | Self::WindowsX64 => "x64",
            Self::LinuxArm64 | Self::MacosArm64 => "aarch64",
        }
    }

    /// Builds the environment for a launched tool: PATH is the given
    /// runtime `bin` directories prepended to the inherited PATH, plus any
    /// descriptor-provided overrides.
    pub fn build_launch_environment(
        &self,
        runtime_bins: &[PathBuf],
        extra: &HashMap<String, String>,
    ) -> HashMap<String, String> {
        let mut env: HashMap<String, String> = std::env::vars().collect();

        if !runtime_bins.is_empty() {
            let sep = self.path_separator();
            let prefix: Vec<String> = runtime_bins
                .iter()
                .filter_map(|p| p.to_str().map(str::to_string))
                .collect();
            let base = env.get("PATH").cloned().unwrap_or_default();
            let path = if base.is_empty() {
                prefix.join(sep)
            } else {
                format!("{}{}{}", prefix.join(sep), sep, base)
            };
            env.insert("PATH".to_string(), path);
        }

        for (key, value) in extra {
            env.insert(key.clone(), value.clone());
        }

        env
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_on_supported_targets() {
        #[cfg(any(
            all(target_os = "linux", target_arch = "x86_64"),
            all(target_os = "linux", target_arch = "aarch64"),
            all(target_os = "macos", target_arch = "x86_64"),
            all(target_os = "macos", target_arch = "aarch64"),
            all(target_os = "windows", target_arch = "x86_64"),
        ))]
        assert!(Platform::detect().is_some());
    }

    #[test]
    fn test_executable_name() {
        assert_eq!(Platform::LinuxX64.executable_name("java"), "java");
        assert_eq!(Platform::WindowsX64.executable_name("java"), "java.exe");
    }

    #[test]
    fn test_tokens() {
        assert_eq!(Platform::LinuxArm64.os_token(), "linux");
        assert_eq!(Platform::LinuxArm64.arch_token(), "aarch64");
        assert_eq!(Platform::MacosX64.os_token(), "mac");
        assert_eq!(Platform::WindowsX64.archive_ext(), "zip");
        assert_eq!(Platform::LinuxX64.archive_ext(), "tar.gz");
    }

    #[test]
    fn test_launch_environment_prepends_path() {
        let platform = Platform::LinuxX64;
        let bins = vec![PathBuf::from("/cache/java-17/bin")];
        let env = platform.build_launch_environment(&bins, &HashMap::new());

        let path = env.get("PATH").expect("PATH must be present");
        assert!(path.starts_with("/cache/java-17/bin"));
    }

    #[test]
    fn test_launch_environment_extra_overrides() {
        let platform = Platform::LinuxX64;
        let mut extra = HashMap::new();
        extra.insert("TOOL_HOME".to_string(), "/opt/tool".to_string());

        let env = platform.build_launch_environment(&[], &extra);
        assert_eq!(env.get("TOOL_HOME").map(String::as_str), Some("/opt/tool"));
    }
}
