//! Runtime kinds, version requirement grammar and runtime records.
//!
//! Requirement grammar: exact (`"11"`, `"3.10"`), minimum (`"8+"`,
//! `"3.8+"`) and range (`"8..11"`). Versions compare component-wise on
//! their dotted numeric parts, so `"3.10"` satisfies `"3.8+"` and
//! `"17.0.12"` satisfies `"11+"`.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

// ============================================================================
// Runtime Kinds
// ============================================================================

/// Language runtimes the engine can provision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Java,
    Python,
}

impl RuntimeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Java => "java",
            Self::Python => "python",
        }
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Version Comparison
// ============================================================================

fn parse_parts(version: &str) -> Vec<u64> {
    version
        .split('.')
        .map(|part| {
            // Tolerate suffixes like "8u392" or "17.0.12+7".
            let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse().unwrap_or(0)
        })
        .collect()
}

fn compare_versions(a: &str, b: &str) -> Ordering {
    let (pa, pb) = (parse_parts(a), parse_parts(b));
    let len = pa.len().max(pb.len());
    for i in 0..len {
        let (va, vb) = (
            pa.get(i).copied().unwrap_or(0),
            pb.get(i).copied().unwrap_or(0),
        );
        match va.cmp(&vb) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Compares only as many components as the requirement specifies, so an
/// available `"11.0.28"` matches an exact requirement of `"11"`.
fn matches_prefix(available: &str, required: &str) -> bool {
    let req = parse_parts(required);
    let avail = parse_parts(available);
    req.iter()
        .enumerate()
        .all(|(i, r)| avail.get(i).copied().unwrap_or(0) == *r)
}

// ============================================================================
// Version Requirements
// ============================================================================

/// Parsed version requirement for a runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionRequirement {
    /// `"11"` — this version exactly (prefix match on dotted components).
    Exact(String),
    /// `"8+"` — this version or newer.
    Minimum(String),
    /// `"8..11"` — inclusive range.
    Range(String, String),
}

impl VersionRequirement {
    /// Parses the requirement grammar. Never fails: an unadorned string is
    /// an exact requirement.
    pub fn parse(requirement: &str) -> Self {
        let trimmed = requirement.trim();
        if let Some((low, high)) = trimmed.split_once("..") {
            Self::Range(low.trim().to_string(), high.trim().to_string())
        } else if let Some(min) = trimmed.strip_suffix('+') {
            Self::Minimum(min.trim().to_string())
        } else {
            Self::Exact(trimmed.to_string())
        }
    }

    /// Whether an available version satisfies this requirement.
    pub fn satisfies(&self, available: &str) -> bool {
        match self {
            Self::Exact(required) => matches_prefix(available, required),
            Self::Minimum(min) => compare_versions(available, min) != Ordering::Less,
            Self::Range(low, high) => {
                compare_versions(available, low) != Ordering::Less
                    && !greater_than_prefix(available, high)
            }
        }
    }
}

/// True when `available` is strictly above the range's upper bound,
/// comparing only the bound's components (`"11.0.2"` is inside `"8..11"`).
fn greater_than_prefix(available: &str, high: &str) -> bool {
    let bound = parse_parts(high);
    let avail = parse_parts(available);
    for (i, b) in bound.iter().enumerate() {
        let a = avail.get(i).copied().unwrap_or(0);
        match a.cmp(b) {
            Ordering::Greater => return true,
            Ordering::Less => return false,
            Ordering::Equal => continue,
        }
    }
    false
}

impl FromStr for VersionRequirement {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl fmt::Display for VersionRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(v) => write!(f, "{}", v),
            Self::Minimum(v) => write!(f, "{}+", v),
            Self::Range(low, high) => write!(f, "{}..{}", low, high),
        }
    }
}

// ============================================================================
// Runtime Requirements
// ============================================================================

/// How a provisioned runtime is shared between tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationStrategy {
    /// One managed runtime serves every tool that accepts the version.
    Shared,
    /// The tool gets its own runtime copy.
    Isolated,
    /// Self-contained install relocatable with the tool directory.
    Portable,
}

/// One declared runtime dependency of a tool.
#[derive(Debug, Clone)]
pub struct RuntimeRequirement {
    pub kind: RuntimeKind,
    pub version: VersionRequirement,
    /// Extra packages to install into the runtime (Python only today).
    pub packages: Vec<String>,
    /// Descriptor override; `None` uses the resolver default for the kind.
    pub isolation: Option<IsolationStrategy>,
}

impl RuntimeRequirement {
    pub fn new(kind: RuntimeKind, requirement: &str) -> Self {
        Self {
            kind,
            version: VersionRequirement::parse(requirement),
            packages: Vec::new(),
            isolation: None,
        }
    }

    pub fn with_packages(mut self, packages: Vec<String>) -> Self {
        self.packages = packages;
        self
    }

    pub fn with_isolation(mut self, isolation: IsolationStrategy) -> Self {
        self.isolation = Some(isolation);
        self
    }
}

// ============================================================================
// Runtime Records
// ============================================================================

/// Where a discovered runtime came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeSource {
    /// Pre-existing runtime found on the machine.
    System,
    /// Runtime installed and tracked by this engine.
    Managed,
}

/// A concrete runtime available on this machine. Shared read-only across
/// all tools once created.
#[derive(Debug, Clone)]
pub struct RuntimeRecord {
    pub version: String,
    pub install_home: PathBuf,
    pub source: RuntimeSource,
}

impl RuntimeRecord {
    pub fn satisfies(&self, requirement: &VersionRequirement) -> bool {
        requirement.satisfies(&self.version)
    }

    /// Directory holding the runtime executables.
    pub fn bin_dir(&self) -> PathBuf {
        self.install_home.join("bin")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_grammar() {
        assert_eq!(
            VersionRequirement::parse("11"),
            VersionRequirement::Exact("11".to_string())
        );
        assert_eq!(
            VersionRequirement::parse("8+"),
            VersionRequirement::Minimum("8".to_string())
        );
        assert_eq!(
            VersionRequirement::parse("8..11"),
            VersionRequirement::Range("8".to_string(), "11".to_string())
        );
    }

    #[test]
    fn test_exact_matches_prefix() {
        let req = VersionRequirement::parse("11");
        assert!(req.satisfies("11"));
        assert!(req.satisfies("11.0.28"));
        assert!(!req.satisfies("17"));
        assert!(!req.satisfies("8"));
    }

    #[test]
    fn test_minimum() {
        let req = VersionRequirement::parse("11+");
        assert!(req.satisfies("11"));
        assert!(req.satisfies("17.0.12"));
        assert!(!req.satisfies("8"));
    }

    #[test]
    fn test_minimum_with_minor_components() {
        let req = VersionRequirement::parse("3.8+");
        assert!(req.satisfies("3.8"));
        assert!(req.satisfies("3.10"));
        assert!(req.satisfies("3.10.14"));
        assert!(!req.satisfies("3.7"));
        assert!(!req.satisfies("2.7.18"));
    }

    #[test]
    fn test_range_inclusive() {
        let req = VersionRequirement::parse("8..11");
        assert!(req.satisfies("8"));
        assert!(req.satisfies("9"));
        assert!(req.satisfies("11"));
        assert!(req.satisfies("11.0.2"));
        assert!(!req.satisfies("7"));
        assert!(!req.satisfies("17"));
    }

    #[test]
    fn test_managed_java_17_satisfies_11_plus() {
        let record = RuntimeRecord {
            version: "17".to_string(),
            install_home: PathBuf::from("/cache/java-17"),
            source: RuntimeSource::Managed,
        };
        assert!(record.satisfies(&VersionRequirement::parse("11+")));
        assert!(!record.satisfies(&VersionRequirement::parse("8..11")));
    }

    #[test]
    fn test_version_suffix_tolerance() {
        // Adoptium-style versions carry build suffixes.
        let req = VersionRequirement::parse("17+");
        assert!(req.satisfies("17.0.12+7"));
    }

    #[test]
    fn test_requirement_display_roundtrip() {
        for raw in ["11", "8+", "8..11", "3.10"] {
            assert_eq!(VersionRequirement::parse(raw).to_string(), raw);
        }
    }

    #[test]
    fn test_runtime_requirement_builder() {
        let req = RuntimeRequirement::new(RuntimeKind::Python, "3.10+")
            .with_packages(vec!["numpy".to_string()])
            .with_isolation(IsolationStrategy::Isolated);
        assert_eq!(req.kind, RuntimeKind::Python);
        assert_eq!(req.packages, vec!["numpy".to_string()]);
        assert_eq!(req.isolation, Some(IsolationStrategy::Isolated));
    }
}
