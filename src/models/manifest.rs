//! Per-shard manifest stored inside each shard container.

use super::{now_millis, shard::MediaType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Well-known manifest filename inside every shard container.
pub const SHARD_MANIFEST_FILE: &str = "shard-manifest.json";

/// Manifest schema version.
pub const SHARD_MANIFEST_VERSION: u32 = 1;

/// One physical file held by a shard.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShardFileInfo {
    pub url: String,
    #[serde(rename = "type")]
    pub media_type: MediaType,
    pub size: u64,
    pub mime_type: String,
    pub synced_at: i64,
    pub synced_from_device: String,
}

/// Mirror of what a shard container physically holds, keyed by encoded
/// filename. Lets a shard be verified or rebuilt without the master index.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShardManifest {
    pub version: u32,
    pub shard_id: String,

    /// Back-reference used to verify which store owns this shard.
    pub master_gist_id: String,

    pub created_at: i64,
    pub updated_at: i64,

    #[serde(default)]
    pub files: BTreeMap<String, ShardFileInfo>,
}

impl ShardManifest {
    pub fn upsert(&mut self, filename: impl Into<String>, info: ShardFileInfo) {
        self.files.insert(filename.into(), info);
        self.updated_at = now_millis();
    }

    pub fn remove(&mut self, filename: &str) -> Option<ShardFileInfo> {
        let removed = self.files.remove(filename);
        if removed.is_some() {
            self.updated_at = now_millis();
        }
        removed
    }
}

pub fn create_shard_manifest(shard_id: impl Into<String>, master_gist_id: impl Into<String>) -> ShardManifest {
    let now = now_millis();
    ShardManifest {
        version: SHARD_MANIFEST_VERSION,
        shard_id: shard_id.into(),
        master_gist_id: master_gist_id.into(),
        created_at: now,
        updated_at: now,
        files: BTreeMap::new(),
    }
}
