//! TTL cache for tool metadata.
//!
//! Owned by one orchestrator instance and invalidated explicitly; never a
//! shared mutable default across instances.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::types::ToolMetadata;

/// Default lifetime of a cached metadata entry.
pub const DEFAULT_METADATA_TTL: Duration = Duration::from_secs(300);

struct CacheEntry {
    stored_at: Instant,
    metadata: ToolMetadata,
}

/// Per-orchestrator metadata cache with explicit invalidation.
pub struct MetadataCache {
    ttl: Duration,
    entries: HashMap<String, CacheEntry>,
}

impl MetadataCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// Returns a live entry, or `None` when absent or expired.
    pub fn get(&self, tool: &str) -> Option<&ToolMetadata> {
        self.entries
            .get(tool)
            .filter(|entry| entry.stored_at.elapsed() < self.ttl)
            .map(|entry| &entry.metadata)
    }

    pub fn insert(&mut self, tool: &str, metadata: ToolMetadata) {
        self.entries.insert(
            tool.to_string(),
            CacheEntry {
                stored_at: Instant::now(),
                metadata,
            },
        );
    }

    /// Drops one tool's entry (e.g. after install or uninstall).
    pub fn invalidate(&mut self, tool: &str) {
        self.entries.remove(tool);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Default for MetadataCache {
    fn default() -> Self {
        Self::new(DEFAULT_METADATA_TTL)
    }
}
