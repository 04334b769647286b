//! Dependency resolution: turns declared runtime requirements into an
//! ordered installation plan.
//!
//! Range and minimum requirements map to a recommended concrete version
//! (the nearest supported LTS-equivalent); isolation escalates when a
//! conflicting runtime version is already managed.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use super::version::{
    IsolationStrategy, RuntimeKind, RuntimeRecord, RuntimeRequirement, VersionRequirement,
};

/// Java versions the engine can provision, ascending.
pub const SUPPORTED_JAVA_VERSIONS: &[&str] = &["8", "11", "17"];

/// Python minor versions the engine can provision, ascending.
pub const SUPPORTED_PYTHON_VERSIONS: &[&str] = &["3.8", "3.9", "3.10", "3.11", "3.12"];

// ============================================================================
// Plan Types
// ============================================================================

/// Aggregated isolation of a dependency plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationLevel {
    None,
    Partial,
    Full,
}

impl IsolationLevel {
    /// Contribution of one step's strategy to the plan level.
    fn of_strategy(strategy: IsolationStrategy) -> Self {
        match strategy {
            IsolationStrategy::Shared => Self::None,
            IsolationStrategy::Portable => Self::Partial,
            IsolationStrategy::Isolated => Self::Full,
        }
    }
}

/// One provisioning action in a dependency plan.
#[derive(Debug, Clone)]
pub struct InstallationStep {
    pub kind: RuntimeKind,
    /// Concrete version to provision.
    pub version: String,
    pub packages: Vec<String>,
    pub isolation: IsolationStrategy,
    pub estimated_size_mb: u32,
    pub estimated_time_minutes: u32,
    /// Ascending execution order.
    pub priority: u32,
}

/// A conflict the resolver worked around.
#[derive(Debug, Clone)]
pub struct ResolvedConflict {
    pub kind: RuntimeKind,
    pub requirement: VersionRequirement,
    pub existing_versions: Vec<String>,
    pub resolution: String,
}

/// Ordered provisioning plan for one tool.
#[derive(Debug, Clone)]
pub struct DependencyPlan {
    pub tool_name: String,
    pub steps: Vec<InstallationStep>,
    pub conflicts_resolved: Vec<ResolvedConflict>,
    pub estimated_time_minutes: u32,
    pub estimated_size_mb: u32,
    pub isolation_level: IsolationLevel,
}

/// How a requirement change between tool versions should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionStrategy {
    CompatibleUpdate,
    CreateIsolatedRuntime,
    CreateNewEnvironment,
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::CompatibleUpdate => "compatible_update",
            Self::CreateIsolatedRuntime => "create_isolated_runtime",
            Self::CreateNewEnvironment => "create_new_environment",
        };
        write!(f, "{}", s)
    }
}

/// Result of comparing a tool's old and new runtime requirements.
#[derive(Debug, Clone)]
pub struct DependencyChangeReport {
    pub has_breaking_changes: bool,
    pub resolution_strategy: ResolutionStrategy,
}

// ============================================================================
// Recommended Versions
// ============================================================================

/// Maps a requirement to the concrete version an install would provision.
pub fn recommended_version(kind: RuntimeKind, requirement: &VersionRequirement) -> String {
    let supported: &[&str] = match kind {
        RuntimeKind::Java => SUPPORTED_JAVA_VERSIONS,
        RuntimeKind::Python => SUPPORTED_PYTHON_VERSIONS,
    };
    let default_lts = match kind {
        RuntimeKind::Java => "11",
        RuntimeKind::Python => "3.10",
    };

    match requirement {
        VersionRequirement::Exact(version) => version.clone(),
        VersionRequirement::Minimum(_) => {
            // The default LTS when it is new enough, else the lowest
            // supported version that meets the minimum.
            if requirement.satisfies(default_lts) {
                default_lts.to_string()
            } else {
                supported
                    .iter()
                    .find(|v| requirement.satisfies(v))
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| supported[supported.len() - 1].to_string())
            }
        }
        VersionRequirement::Range(_, high) => {
            // Highest supported version inside the range.
            supported
                .iter()
                .rev()
                .find(|v| requirement.satisfies(v))
                .map(|v| v.to_string())
                .unwrap_or_else(|| high.clone())
        }
    }
}

// ============================================================================
// Resolver
// ============================================================================

/// Stateless dependency resolver.
#[derive(Debug, Default)]
pub struct DependencyResolver;

impl DependencyResolver {
    pub fn new() -> Self {
        Self
    }

    /// Default isolation per runtime kind: Java runtimes are shared, Python
    /// environments are isolated.
    fn default_isolation(kind: RuntimeKind) -> IsolationStrategy {
        match kind {
            RuntimeKind::Java => IsolationStrategy::Shared,
            RuntimeKind::Python => IsolationStrategy::Isolated,
        }
    }

    /// Resolves a tool's requirements into an ordered plan. `managed` is
    /// the set of runtimes already installed by this engine, used for
    /// conflict detection.
    pub fn resolve(
        &self,
        tool_name: &str,
        requirements: &[RuntimeRequirement],
        managed: &[RuntimeRecord],
    ) -> DependencyPlan {
        debug!("Resolving dependencies for {}", tool_name);

        let mut steps = Vec::new();
        let mut conflicts = Vec::new();

        for requirement in requirements {
            let version = recommended_version(requirement.kind, &requirement.version);
            let mut isolation = requirement
                .isolation
                .unwrap_or_else(|| Self::default_isolation(requirement.kind));

            let same_kind: Vec<&RuntimeRecord> = managed
                .iter()
                .filter(|r| managed_kind_matches(r, requirement.kind))
                .collect();
            let conflicting = !same_kind.is_empty()
                && !same_kind.iter().any(|r| r.satisfies(&requirement.version));
            if conflicting && isolation == IsolationStrategy::Shared {
                isolation = IsolationStrategy::Isolated;
                conflicts.push(ResolvedConflict {
                    kind: requirement.kind,
                    requirement: requirement.version.clone(),
                    existing_versions: same_kind.iter().map(|r| r.version.clone()).collect(),
                    resolution: "provision isolated runtime".to_string(),
                });
            }

            steps.push(match requirement.kind {
                RuntimeKind::Java => InstallationStep {
                    kind: RuntimeKind::Java,
                    version,
                    packages: Vec::new(),
                    isolation,
                    estimated_size_mb: 45,
                    estimated_time_minutes: 2,
                    priority: 1,
                },
                RuntimeKind::Python => {
                    let packages = requirement.packages.clone();
                    InstallationStep {
                        kind: RuntimeKind::Python,
                        version,
                        estimated_size_mb: 15 + 5 * packages.len() as u32,
                        estimated_time_minutes: 1 + packages.len() as u32 / 3,
                        packages,
                        isolation,
                        priority: 2,
                    }
                }
            });
        }

        steps.sort_by_key(|s| s.priority);

        let isolation_level = steps
            .iter()
            .map(|s| IsolationLevel::of_strategy(s.isolation))
            .max()
            .unwrap_or(IsolationLevel::None);

        DependencyPlan {
            tool_name: tool_name.to_string(),
            estimated_time_minutes: steps.iter().map(|s| s.estimated_time_minutes).sum(),
            estimated_size_mb: steps.iter().map(|s| s.estimated_size_mb).sum(),
            steps,
            conflicts_resolved: conflicts,
            isolation_level,
        }
    }

    /// Flags whether a tool upgrade's requirement change needs a fresh
    /// isolated runtime.
    pub fn analyze_dependency_changes(
        &self,
        old: &[RuntimeRequirement],
        new: &[RuntimeRequirement],
    ) -> DependencyChangeReport {
        let old_java = requirement_version(old, RuntimeKind::Java);
        let new_java = requirement_version(new, RuntimeKind::Java);
        let old_python = requirement_version(old, RuntimeKind::Python);
        let new_python = requirement_version(new, RuntimeKind::Python);

        // Python version changes always rebuild the environment.
        if old_python != new_python && old_python.is_some() && new_python.is_some() {
            return DependencyChangeReport {
                has_breaking_changes: true,
                resolution_strategy: ResolutionStrategy::CreateNewEnvironment,
            };
        }

        if let (Some(old_java), Some(new_java)) = (&old_java, &new_java) {
            if old_java != new_java && !java_backward_compatible(old_java, new_java) {
                return DependencyChangeReport {
                    has_breaking_changes: true,
                    resolution_strategy: ResolutionStrategy::CreateIsolatedRuntime,
                };
            }
        }

        DependencyChangeReport {
            has_breaking_changes: false,
            resolution_strategy: ResolutionStrategy::CompatibleUpdate,
        }
    }
}

fn managed_kind_matches(record: &RuntimeRecord, kind: RuntimeKind) -> bool {
    record
        .install_home
        .file_name()
        .map(|n| n.to_string_lossy().starts_with(&format!("{}-", kind)))
        .unwrap_or(false)
}

fn requirement_version(requirements: &[RuntimeRequirement], kind: RuntimeKind) -> Option<String> {
    requirements
        .iter()
        .find(|r| r.kind == kind)
        .map(|r| recommended_version(kind, &r.version))
}

/// Whether code built for `old` major still runs on `new` major.
fn java_backward_compatible(old: &str, new: &str) -> bool {
    let major = |v: &str| -> u32 {
        v.split('.')
            .next()
            .and_then(|p| p.parse().ok())
            .unwrap_or(0)
    };
    let (old, new) = (major(old), major(new));
    match new {
        17 => (11..=17).contains(&old),
        11 => (8..=11).contains(&old),
        8 => old == 8,
        _ => false,
    }
}
