//! Pre-sharding manifest kept in the single (master) container.

use super::{now_millis, shard::MediaType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Filename of the legacy manifest inside the master container.
pub const LEGACY_MANIFEST_FILE: &str = "media-manifest.json";

pub const LEGACY_MANIFEST_VERSION: u32 = 1;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LegacyMediaEntry {
    pub filename: String,
    #[serde(rename = "type")]
    pub media_type: MediaType,
    pub size: u64,
    #[serde(default)]
    pub mime_type: String,
    pub synced_at: i64,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<i64>,
}

/// URL -> entry map describing every media file in the master container.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LegacyManifest {
    pub version: u32,
    pub updated_at: i64,
    #[serde(default)]
    pub files: BTreeMap<String, LegacyMediaEntry>,
}

impl Default for LegacyManifest {
    fn default() -> Self {
        Self {
            version: LEGACY_MANIFEST_VERSION,
            updated_at: now_millis(),
            files: BTreeMap::new(),
        }
    }
}

impl LegacyManifest {
    /// Entries that have not been soft-deleted.
    pub fn live_entries(&self) -> impl Iterator<Item = (&String, &LegacyMediaEntry)> {
        self.files.iter().filter(|(_, entry)| !entry.deleted)
    }

    pub fn touch(&mut self) {
        self.updated_at = now_millis();
    }
}
