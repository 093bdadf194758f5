//! Represents one quota-limited backend container ("shard") and the pure
//! first-fit allocation policy over a set of shards.

use super::{now_millis, policy::ShardPolicy};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a shard container.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ShardStatus {
    /// Accepts new files.
    Active,
    /// Reached a capacity limit; still readable.
    Full,
    /// Retired by an explicit lifecycle action. Terminal.
    Archived,
}

impl fmt::Display for ShardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ShardStatus::Active => "active",
            ShardStatus::Full => "full",
            ShardStatus::Archived => "archived",
        };
        f.write_str(label)
    }
}

/// Kind of media stored in the store.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    #[default]
    Image,
    Video,
}

/// One backend container registered in the master index.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShardInfo {
    /// Backend container identifier.
    pub gist_id: String,

    /// Human-readable identifier, derived from `order` (e.g. `media-3`).
    pub alias: String,

    pub description: String,

    /// Creation sequence, 1-based and never reused.
    pub order: u32,

    pub created_at: i64,
    pub updated_at: i64,

    /// Live (non-tombstoned) files routed to this shard.
    pub file_count: u32,

    /// Live bytes routed to this shard.
    pub total_size: u64,

    /// Soft-deleted files still physically present, awaiting cleanup.
    #[serde(default)]
    pub pending_purge_count: u32,

    /// Bytes held by soft-deleted files awaiting cleanup.
    #[serde(default)]
    pub pending_purge_size: u64,

    pub status: ShardStatus,
}

impl ShardInfo {
    /// Fraction of the file limit in use, as a percentage.
    pub fn usage_percent(&self, policy: &ShardPolicy) -> f64 {
        if policy.file_limit == 0 {
            return 100.0;
        }
        f64::from(self.file_count) / f64::from(policy.file_limit) * 100.0
    }

    /// Account one more live file.
    pub fn record_file(&mut self, size: u64) {
        self.file_count = self.file_count.saturating_add(1);
        self.total_size = self.total_size.saturating_add(size);
        self.updated_at = now_millis();
    }

    /// Remove one live file from the counters.
    pub fn forget_file(&mut self, size: u64) {
        self.file_count = self.file_count.saturating_sub(1);
        self.total_size = self.total_size.saturating_sub(size);
        self.updated_at = now_millis();
    }

    /// Move one file from the live counters to the pending-purge counters.
    pub fn tombstone_file(&mut self, size: u64) {
        self.forget_file(size);
        self.pending_purge_count = self.pending_purge_count.saturating_add(1);
        self.pending_purge_size = self.pending_purge_size.saturating_add(size);
    }

    /// Move one file from the pending-purge counters back to the live counters.
    pub fn untombstone_file(&mut self, size: u64) {
        self.purge_file(size);
        self.record_file(size);
    }

    /// Drop a physically removed file from the pending-purge counters.
    pub fn purge_file(&mut self, size: u64) {
        self.pending_purge_count = self.pending_purge_count.saturating_sub(1);
        self.pending_purge_size = self.pending_purge_size.saturating_sub(size);
        self.updated_at = now_millis();
    }

    /// Flip an active shard to `full` once its file count hits the limit.
    pub fn refresh_status(&mut self, policy: &ShardPolicy) {
        if self.status == ShardStatus::Active && self.file_count >= policy.file_limit {
            self.status = ShardStatus::Full;
            self.updated_at = now_millis();
        }
    }
}

/// Build a fresh, empty, active shard record.
pub fn create_shard_info(gist_id: impl Into<String>, alias: impl Into<String>, order: u32) -> ShardInfo {
    let now = now_millis();
    let alias = alias.into();
    ShardInfo {
        gist_id: gist_id.into(),
        description: format!("Media shard {}", alias),
        alias,
        order,
        created_at: now,
        updated_at: now,
        file_count: 0,
        total_size: 0,
        pending_purge_count: 0,
        pending_purge_size: 0,
        status: ShardStatus::Active,
    }
}

/// True when `shard` is active and can take `incoming_file_size` more bytes
/// without crossing either limit.
pub fn shard_has_capacity(shard: &ShardInfo, incoming_file_size: u64, policy: &ShardPolicy) -> bool {
    shard.status == ShardStatus::Active
        && shard.file_count < policy.file_limit
        && shard.total_size.saturating_add(incoming_file_size) <= policy.size_limit
}

/// Deterministic alias for the shard created at position `order`.
pub fn generate_shard_alias(order: u32) -> String {
    format!("media-{}", order)
}

/// Where a new file should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocationTarget {
    /// Place the file into an already registered shard.
    Existing(String),
    /// No shard fits; open a new one with this order and alias.
    Open { order: u32, alias: String },
}

/// Outcome of [`plan_allocation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationPlan {
    pub target: AllocationTarget,

    /// Active shards passed over because they cannot take the file; the
    /// caller marks them `full`.
    pub saturated: Vec<String>,
}

/// First-fit allocation by creation order.
///
/// Pure: performs no I/O and mutates nothing. Earlier shards are filled
/// before later ones, which bounds how many containers stay open.
pub fn plan_allocation<'a, I>(shards: I, incoming_size: u64, policy: &ShardPolicy) -> AllocationPlan
where
    I: IntoIterator<Item = &'a ShardInfo>,
{
    let mut ordered: Vec<&ShardInfo> = shards.into_iter().collect();
    ordered.sort_by_key(|shard| shard.order);

    let mut saturated = Vec::new();
    for shard in &ordered {
        if shard_has_capacity(shard, incoming_size, policy) {
            return AllocationPlan {
                target: AllocationTarget::Existing(shard.alias.clone()),
                saturated,
            };
        }
        if shard.status == ShardStatus::Active {
            saturated.push(shard.alias.clone());
        }
    }

    let order = ordered.last().map(|shard| shard.order).unwrap_or(0) + 1;
    AllocationPlan {
        target: AllocationTarget::Open {
            order,
            alias: generate_shard_alias(order),
        },
        saturated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard(order: u32, files: u32, size: u64) -> ShardInfo {
        let mut info = create_shard_info(format!("gist-{}", order), generate_shard_alias(order), order);
        info.file_count = files;
        info.total_size = size;
        info
    }

    #[test]
    fn capacity_respects_both_limits() {
        let policy = ShardPolicy {
            file_limit: 2,
            size_limit: 10,
            ..ShardPolicy::default()
        };
        assert!(shard_has_capacity(&shard(1, 1, 5), 5, &policy));
        assert!(!shard_has_capacity(&shard(1, 2, 0), 1, &policy));
        assert!(!shard_has_capacity(&shard(1, 1, 6), 5, &policy));

        let mut archived = shard(1, 0, 0);
        archived.status = ShardStatus::Archived;
        assert!(!shard_has_capacity(&archived, 1, &policy));
    }

    #[test]
    fn first_fit_prefers_earliest_order() {
        let policy = ShardPolicy::default();
        let shards = vec![shard(3, 0, 0), shard(1, 10, 0), shard(2, 0, 0)];
        let plan = plan_allocation(&shards, 1, &policy);
        assert_eq!(plan.target, AllocationTarget::Existing("media-1".into()));
        assert!(plan.saturated.is_empty());
    }

    #[test]
    fn opens_next_order_when_everything_is_full() {
        let policy = ShardPolicy {
            file_limit: 2,
            ..ShardPolicy::default()
        };
        let mut full = shard(1, 2, 2);
        full.status = ShardStatus::Full;
        let shards = vec![full, shard(2, 2, 2)];
        let plan = plan_allocation(&shards, 1, &policy);
        assert_eq!(
            plan.target,
            AllocationTarget::Open {
                order: 3,
                alias: "media-3".into()
            }
        );
        assert_eq!(plan.saturated, vec!["media-2".to_string()]);
    }

    #[test]
    fn ordering_is_numeric_not_lexical() {
        let policy = ShardPolicy::default();
        let mut ten = shard(10, 0, 0);
        ten.alias = generate_shard_alias(10);
        let mut two = shard(2, 0, 0);
        two.alias = generate_shard_alias(2);
        let plan = plan_allocation([&ten, &two], 1, &policy);
        assert_eq!(plan.target, AllocationTarget::Existing("media-2".into()));
    }

    #[test]
    fn empty_registry_opens_media_one() {
        let plan = plan_allocation(std::iter::empty(), 1, &ShardPolicy::default());
        assert_eq!(
            plan.target,
            AllocationTarget::Open {
                order: 1,
                alias: "media-1".into()
            }
        );
    }

    #[test]
    fn tombstone_counters_move_between_buckets() {
        let mut info = shard(1, 1, 100);
        info.tombstone_file(100);
        assert_eq!((info.file_count, info.total_size), (0, 0));
        assert_eq!((info.pending_purge_count, info.pending_purge_size), (1, 100));
        info.untombstone_file(100);
        assert_eq!((info.file_count, info.total_size), (1, 100));
        assert_eq!(info.pending_purge_count, 0);
    }
}
