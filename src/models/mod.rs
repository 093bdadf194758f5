//! Core data model for the sharded media store.
//!
//! These are plain value types and pure helpers with no I/O. They
//! serialize as camelCase JSON via `serde`, which is the on-container layout
//! of `master-index.json`, `shard-manifest.json` and the legacy manifest.

pub mod encoding;
pub mod legacy;
pub mod manifest;
pub mod master_index;
pub mod policy;
pub mod shard;
pub mod tombstone;

pub use legacy::{LEGACY_MANIFEST_FILE, LegacyManifest, LegacyMediaEntry};
pub use manifest::{SHARD_MANIFEST_FILE, ShardFileInfo, ShardManifest, create_shard_manifest};
pub use master_index::{
    FileIndexEntry, IndexStats, MASTER_INDEX_FILE, MasterIndex, create_empty_master_index,
    update_master_index_stats,
};
pub use policy::ShardPolicy;
pub use shard::{
    AllocationPlan, AllocationTarget, MediaType, ShardInfo, ShardStatus, create_shard_info,
    generate_shard_alias, plan_allocation, shard_has_capacity,
};
pub use tombstone::{MediaTombstone, create_media_tombstone, is_tombstone_expired};

use chrono::Utc;

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
