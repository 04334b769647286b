//! Error taxonomy for the provisioning engine.
//!
//! Recovery semantics differ per variant: `SourceUnavailable`, `Network` and
//! `Integrity` are recovered inside the downloader by advancing to the next
//! source and only surface once every source is exhausted; `Archive` and
//! `Layout` abort the current install attempt; `RuntimeUnsatisfied` is
//! logged but never fatal to a tool install; `ResourceLocked` is retried
//! with partial cleanup before surfacing; `ConcurrentOperation` is rejected
//! immediately.

use std::path::PathBuf;
use thiserror::Error;

/// Errors produced by downloads, extraction, runtime provisioning and the
/// installation lifecycle.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Every configured download source failed for the artifact.
    #[error("all download sources failed for {artifact}")]
    SourceUnavailable { artifact: String },

    /// A network request failed outside the per-source fallback loop.
    #[error("network error: {0}")]
    Network(String),

    /// Size or hash mismatch on a downloaded file.
    #[error("integrity check failed for {}: {}", path.display(), detail)]
    Integrity { path: PathBuf, detail: String },

    /// Corrupt or unsupported archive; all extraction methods failed.
    #[error("archive error: {0}")]
    Archive(String),

    /// An expected artifact is missing after extraction.
    #[error("unexpected layout: {0}")]
    Layout(String),

    /// A declared runtime requirement could not be satisfied.
    #[error("runtime requirement not satisfied: {0}")]
    RuntimeUnsatisfied(String),

    /// A file or directory stayed locked through the retry budget.
    #[error("resource locked: {}", path.display())]
    ResourceLocked { path: PathBuf },

    /// A mutating operation is already in flight for the tool.
    #[error("an operation is already in progress for {tool}")]
    ConcurrentOperation { tool: String },

    /// The operation was cancelled cooperatively.
    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProvisionError>;

impl ProvisionError {
    /// Short machine-readable kind, used as the error category in notifier
    /// reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SourceUnavailable { .. } => "source_unavailable",
            Self::Network(_) => "network",
            Self::Integrity { .. } => "integrity",
            Self::Archive(_) => "archive",
            Self::Layout(_) => "layout",
            Self::RuntimeUnsatisfied(_) => "runtime_unsatisfied",
            Self::ResourceLocked { .. } => "resource_locked",
            Self::ConcurrentOperation { .. } => "concurrent_operation",
            Self::Cancelled => "cancelled",
            Self::Io(_) => "io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let err = ProvisionError::SourceUnavailable {
            artifact: "ugene.zip".to_string(),
        };
        assert_eq!(err.kind(), "source_unavailable");

        let err = ProvisionError::ConcurrentOperation {
            tool: "ugene".to_string(),
        };
        assert_eq!(err.kind(), "concurrent_operation");
        assert!(err.to_string().contains("ugene"));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: ProvisionError = io.into();
        assert_eq!(err.kind(), "io");
    }
}
