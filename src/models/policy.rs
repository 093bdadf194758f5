//! Capacity and batching policy shared by every shard component.

use std::time::Duration;

/// Maximum files placed in one shard container before it is considered full.
/// The backend accepts roughly 300; the remainder is headroom for manifests.
pub const FILE_LIMIT: u32 = 250;

/// Maximum payload bytes per shard container.
pub const SIZE_LIMIT: u64 = 500 * 1024 * 1024;

/// Days a soft-deleted file stays recoverable before physical cleanup.
pub const TOMBSTONE_RETENTION_DAYS: i64 = 30;

/// Items handled per batch by upload/download/migration loops.
pub const BATCH_SIZE: usize = 20;

/// Maximum in-flight backend requests within one batch.
pub const CONCURRENCY: usize = 3;

/// Lifetime of cached master index and manifest entries.
pub const CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// Legacy media count at which a single-container store should be migrated.
pub const MIGRATION_THRESHOLD: usize = 200;

/// Policy knobs handed to each component at construction.
///
/// `ShardPolicy::default()` is the production policy; tests build a custom
/// one to exercise spillover with tiny limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardPolicy {
    pub file_limit: u32,
    pub size_limit: u64,
    pub tombstone_retention_days: i64,
    pub batch_size: usize,
    pub concurrency: usize,
    pub cache_ttl: Duration,
}

impl Default for ShardPolicy {
    fn default() -> Self {
        Self {
            file_limit: FILE_LIMIT,
            size_limit: SIZE_LIMIT,
            tombstone_retention_days: TOMBSTONE_RETENTION_DAYS,
            batch_size: BATCH_SIZE,
            concurrency: CONCURRENCY,
            cache_ttl: CACHE_TTL,
        }
    }
}

impl ShardPolicy {
    /// Retention window in epoch milliseconds.
    pub fn tombstone_retention_millis(&self) -> i64 {
        self.tombstone_retention_days * 24 * 60 * 60 * 1000
    }

    /// Cache lifetime in epoch milliseconds.
    pub fn cache_ttl_millis(&self) -> i64 {
        self.cache_ttl.as_millis() as i64
    }

    /// Batch size clamped to at least one item.
    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.max(1)
    }

    /// Concurrency clamped to at least one in-flight request.
    pub fn effective_concurrency(&self) -> usize {
        self.concurrency.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_matches_constants() {
        let policy = ShardPolicy::default();
        assert_eq!(policy.file_limit, 250);
        assert_eq!(policy.size_limit, 524_288_000);
        assert_eq!(policy.batch_size, 20);
        assert_eq!(policy.concurrency, 3);
        assert_eq!(policy.cache_ttl_millis(), 300_000);
        assert_eq!(policy.tombstone_retention_millis(), 2_592_000_000);
    }

    #[test]
    fn zero_sizes_are_clamped() {
        let policy = ShardPolicy {
            batch_size: 0,
            concurrency: 0,
            ..ShardPolicy::default()
        };
        assert_eq!(policy.effective_batch_size(), 1);
        assert_eq!(policy.effective_concurrency(), 1);
    }
}
