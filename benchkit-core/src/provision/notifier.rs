//! Push interface for install/runtime events.
//!
//! The engine reports every stage transition, error and network round-trip
//! through this narrow trait; the surrounding application decides what to
//! do with them (status panels, log files, ...). [`TracingNotifier`]
//! bridges onto `tracing` and is the default.

use serde_json::Value;
use tracing::{info, warn};

/// Observer for engine events. Implementations must be cheap: calls come
/// from worker tasks in the middle of downloads.
pub trait Notifier: Send + Sync {
    /// One lifecycle step of one tool: `(tool, stage, status, details)`.
    fn log_step(&self, tool: &str, stage: &str, status: &str, details: Option<&Value>);

    /// An error with a category and free-form context.
    fn log_error(&self, kind: &str, message: &str, context: Option<&Value>);

    /// One HTTP round-trip.
    fn log_network(&self, url: &str, method: &str, status_code: Option<u16>, duration_ms: u64);
}

/// Default notifier that forwards everything to `tracing`.
#[derive(Debug, Default, Clone)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn log_step(&self, tool: &str, stage: &str, status: &str, details: Option<&Value>) {
        match details {
            Some(details) => info!(tool, stage, status, %details, "install step"),
            None => info!(tool, stage, status, "install step"),
        }
    }

    fn log_error(&self, kind: &str, message: &str, context: Option<&Value>) {
        match context {
            Some(context) => warn!(kind, message, %context, "provisioning error"),
            None => warn!(kind, message, "provisioning error"),
        }
    }

    fn log_network(&self, url: &str, method: &str, status_code: Option<u16>, duration_ms: u64) {
        info!(url, method, status_code, duration_ms, "network request");
    }
}

/// Notifier that discards everything. Useful in tests.
#[derive(Debug, Default, Clone)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn log_step(&self, _tool: &str, _stage: &str, _status: &str, _details: Option<&Value>) {}
    fn log_error(&self, _kind: &str, _message: &str, _context: Option<&Value>) {}
    fn log_network(&self, _url: &str, _method: &str, _status_code: Option<u16>, _duration_ms: u64) {
    }
}
