//! Soft-delete markers.

use super::{now_millis, policy::ShardPolicy, shard::MediaType};
use serde::{Deserialize, Serialize};

/// Hides a URL from the file index until its retention window passes and
/// the physical file is purged from its shard.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MediaTombstone {
    pub url: String,
    pub shard_id: String,
    pub filename: String,
    pub size: u64,
    pub deleted_at: i64,

    /// Device or user that issued the delete.
    pub deleted_by: String,

    pub expires_at: i64,

    /// Media kind of the deleted entry, used to rebuild it on restore.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<MediaType>,
}

impl MediaTombstone {
    /// Carry the media kind over from the removed index entry.
    pub fn with_media_type(mut self, media_type: MediaType) -> Self {
        self.media_type = Some(media_type);
        self
    }
}

pub fn create_media_tombstone(
    url: impl Into<String>,
    shard_id: impl Into<String>,
    filename: impl Into<String>,
    size: u64,
    deleted_by: impl Into<String>,
    policy: &ShardPolicy,
) -> MediaTombstone {
    let deleted_at = now_millis();
    MediaTombstone {
        url: url.into(),
        shard_id: shard_id.into(),
        filename: filename.into(),
        size,
        deleted_at,
        deleted_by: deleted_by.into(),
        expires_at: deleted_at + policy.tombstone_retention_millis(),
        media_type: None,
    }
}

pub fn is_tombstone_expired(tombstone: &MediaTombstone) -> bool {
    is_tombstone_expired_at(tombstone, now_millis())
}

/// Expiry check against an explicit clock reading.
pub fn is_tombstone_expired_at(tombstone: &MediaTombstone, now: i64) -> bool {
    tombstone.expires_at <= now
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_is_deleted_at_plus_retention() {
        let policy = ShardPolicy::default();
        let tombstone = create_media_tombstone("https://x/a.png", "media-1", "f", 3, "dev-1", &policy);
        assert_eq!(
            tombstone.expires_at - tombstone.deleted_at,
            30 * 24 * 60 * 60 * 1000
        );
        assert!(!is_tombstone_expired(&tombstone));
        assert!(is_tombstone_expired_at(&tombstone, tombstone.expires_at));
    }
}
