//! The master index: global routing table for every live object URL.

use super::{
    now_millis,
    shard::{MediaType, ShardInfo, ShardStatus},
    tombstone::{MediaTombstone, is_tombstone_expired_at},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Well-known filename of the index inside the master container.
pub const MASTER_INDEX_FILE: &str = "master-index.json";

/// Master index schema version.
pub const MASTER_INDEX_VERSION: u32 = 2;

/// Routing record for one logical object.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileIndexEntry {
    /// Alias of the owning shard.
    pub shard_id: String,

    /// Encoded filename inside the shard container.
    pub filename: String,

    pub size: u64,

    #[serde(rename = "type")]
    pub media_type: MediaType,

    pub synced_at: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

/// Aggregates derived from `shards` and `file_index`.
///
/// Not recomputed on read; call [`update_master_index_stats`] after any
/// mutation.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IndexStats {
    pub total_files: u64,
    pub total_size: u64,
    pub active_shards: u32,
    pub full_shards: u32,
    pub archived_shards: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MasterIndex {
    pub version: u32,
    pub app_version: String,
    pub created_at: i64,
    pub updated_at: i64,

    /// Shard alias -> shard record.
    #[serde(default)]
    pub shards: BTreeMap<String, ShardInfo>,

    /// Object URL -> routing record.
    #[serde(default)]
    pub file_index: BTreeMap<String, FileIndexEntry>,

    #[serde(default)]
    pub tombstones: Vec<MediaTombstone>,

    #[serde(default)]
    pub stats: IndexStats,
}

impl MasterIndex {
    /// Shards sorted by creation order.
    pub fn ordered_shards(&self) -> Vec<&ShardInfo> {
        let mut shards: Vec<&ShardInfo> = self.shards.values().collect();
        shards.sort_by_key(|shard| shard.order);
        shards
    }

    /// Shard registered for the given backend container, if any.
    pub fn shard_by_gist(&self, gist_id: &str) -> Option<&ShardInfo> {
        self.shards.values().find(|shard| shard.gist_id == gist_id)
    }

    /// Live (non-expired) tombstone for `url`.
    pub fn live_tombstone(&self, url: &str) -> Option<&MediaTombstone> {
        let now = now_millis();
        self.tombstones
            .iter()
            .find(|tombstone| tombstone.url == url && !is_tombstone_expired_at(tombstone, now))
    }

    /// Remove and return every tombstone for `url`.
    pub fn take_tombstones(&mut self, url: &str) -> Vec<MediaTombstone> {
        let (taken, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.tombstones)
            .into_iter()
            .partition(|tombstone| tombstone.url == url);
        self.tombstones = kept;
        taken
    }

    /// Sum of live file counts across all shards.
    pub fn shard_file_count(&self) -> u64 {
        self.shards.values().map(|shard| u64::from(shard.file_count)).sum()
    }
}

pub fn create_empty_master_index(app_version: impl Into<String>) -> MasterIndex {
    let now = now_millis();
    MasterIndex {
        version: MASTER_INDEX_VERSION,
        app_version: app_version.into(),
        created_at: now,
        updated_at: now,
        shards: BTreeMap::new(),
        file_index: BTreeMap::new(),
        tombstones: Vec::new(),
        stats: IndexStats::default(),
    }
}

/// Recompute `stats` from `shards` and `file_index`, and bump `updated_at`.
pub fn update_master_index_stats(index: &mut MasterIndex) {
    let mut stats = IndexStats {
        total_files: index.file_index.len() as u64,
        total_size: index.shards.values().map(|shard| shard.total_size).sum(),
        ..IndexStats::default()
    };
    for shard in index.shards.values() {
        match shard.status {
            ShardStatus::Active => stats.active_shards += 1,
            ShardStatus::Full => stats.full_shards += 1,
            ShardStatus::Archived => stats.archived_shards += 1,
        }
    }
    index.stats = stats;
    index.updated_at = now_millis();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        policy::ShardPolicy,
        shard::create_shard_info,
        tombstone::create_media_tombstone,
    };

    fn entry(shard: &str, size: u64) -> FileIndexEntry {
        FileIndexEntry {
            shard_id: shard.into(),
            filename: "f".into(),
            size,
            media_type: MediaType::Image,
            synced_at: 0,
            checksum: None,
        }
    }

    #[test]
    fn empty_index_has_zeroed_stats() {
        let index = create_empty_master_index("1.2.3");
        assert_eq!(index.version, 2);
        assert_eq!(index.app_version, "1.2.3");
        assert!(index.shards.is_empty());
        assert_eq!(index.stats, IndexStats::default());
    }

    #[test]
    fn stats_follow_file_index_and_shards() {
        let mut index = create_empty_master_index("1");
        let mut first = create_shard_info("g1", "media-1", 1);
        first.record_file(10);
        first.record_file(20);
        first.status = ShardStatus::Full;
        let mut second = create_shard_info("g2", "media-2", 2);
        second.record_file(5);
        index.shards.insert(first.alias.clone(), first);
        index.shards.insert(second.alias.clone(), second);
        index.file_index.insert("a".into(), entry("media-1", 10));
        index.file_index.insert("b".into(), entry("media-1", 20));
        index.file_index.insert("c".into(), entry("media-2", 5));

        update_master_index_stats(&mut index);

        assert_eq!(index.stats.total_files, 3);
        assert_eq!(index.stats.total_size, 35);
        assert_eq!(index.stats.active_shards, 1);
        assert_eq!(index.stats.full_shards, 1);
        assert_eq!(index.shard_file_count(), index.stats.total_files);
    }

    #[test]
    fn serializes_with_camel_case_keys() {
        let mut index = create_empty_master_index("1");
        index.file_index.insert("u".into(), entry("media-1", 1));
        let json = serde_json::to_value(&index).unwrap();
        assert!(json.get("fileIndex").is_some());
        assert!(json.get("appVersion").is_some());
        assert_eq!(json["fileIndex"]["u"]["shardId"], "media-1");
        assert_eq!(json["fileIndex"]["u"]["type"], "image");
    }

    #[test]
    fn live_tombstone_ignores_expired_records() {
        let policy = ShardPolicy::default();
        let mut index = create_empty_master_index("1");
        let mut expired = create_media_tombstone("u", "media-1", "f", 1, "d", &policy);
        expired.expires_at = expired.deleted_at - 1;
        index.tombstones.push(expired);
        assert!(index.live_tombstone("u").is_none());

        index
            .tombstones
            .push(create_media_tombstone("u", "media-1", "f", 1, "d", &policy));
        assert!(index.live_tombstone("u").is_some());
        assert_eq!(index.take_tombstones("u").len(), 2);
        assert!(index.tombstones.is_empty());
    }
}
