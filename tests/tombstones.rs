mod common;

use common::{policy_with_file_limit, sharded_fixture, upload};
use gist_shard_store::models::{ShardPolicy, encoding::encode_media_filename};

const URL: &str = "https://cdn.example/photos/cat.png";

#[tokio::test]
async fn soft_delete_then_restore_round_trip() {
    let fixture = sharded_fixture(policy_with_file_limit(10)).await;
    fixture.store.upload_media(vec![upload(URL, b"meow")], None).await;

    let deleted = fixture.store.soft_delete_media(&[URL.to_string()], "device-a").await;
    assert_eq!(deleted.deleted, 1);
    assert!(!fixture.store.get_synced_urls().await.contains(URL));

    let index = fixture.index().await;
    assert!(!index.file_index.contains_key(URL));
    assert_eq!(index.tombstones.len(), 1);
    assert_eq!(index.tombstones[0].deleted_by, "device-a");
    let shard = fixture.shard("media-1").await;
    assert_eq!((shard.file_count, shard.total_size), (0, 0));
    assert_eq!((shard.pending_purge_count, shard.pending_purge_size), (1, 4));
    assert_eq!(index.stats.total_files, 0);

    // The file itself stays until retention expires.
    let filename = encode_media_filename(URL);
    assert!(fixture.backend.file(&shard.gist_id, &filename).is_some());

    assert!(fixture.store.restore_media(URL).await);
    assert!(fixture.store.get_synced_urls().await.contains(URL));
    let index = fixture.index().await;
    assert!(index.tombstones.is_empty());
    assert_eq!(index.file_index[URL].shard_id, "media-1");
    let shard = fixture.shard("media-1").await;
    assert_eq!((shard.file_count, shard.pending_purge_count), (1, 0));

    assert!(!fixture.store.restore_media(URL).await);
    assert!(!fixture.store.restore_media("https://cdn.example/never.png").await);
}

#[tokio::test]
async fn cleanup_keeps_live_tombstones() {
    let fixture = sharded_fixture(policy_with_file_limit(10)).await;
    fixture.store.upload_media(vec![upload(URL, b"meow")], None).await;
    fixture.store.soft_delete_media(&[URL.to_string()], "device-a").await;

    assert_eq!(fixture.store.cleanup_expired_tombstones().await, 0);
    assert_eq!(fixture.index().await.tombstones.len(), 1);
    assert!(fixture.store.restore_media(URL).await);
}

#[tokio::test]
async fn expired_tombstones_are_purged_and_cannot_be_restored() {
    let policy = ShardPolicy {
        tombstone_retention_days: 0,
        ..ShardPolicy::default()
    };
    let fixture = sharded_fixture(policy).await;
    let other = "https://cdn.example/photos/dog.png";
    fixture
        .store
        .upload_media(vec![upload(URL, b"meow"), upload(other, b"woof")], None)
        .await;
    fixture.store.soft_delete_media(&[URL.to_string()], "device-a").await;

    assert!(!fixture.store.restore_media(URL).await);
    assert_eq!(fixture.store.cleanup_expired_tombstones().await, 1);

    let index = fixture.index().await;
    assert!(index.tombstones.is_empty());
    let shard = fixture.shard("media-1").await;
    assert_eq!((shard.file_count, shard.pending_purge_count, shard.pending_purge_size), (1, 0, 0));
    assert!(fixture.backend.file(&shard.gist_id, &encode_media_filename(URL)).is_none());
    assert!(fixture.backend.file(&shard.gist_id, &encode_media_filename(other)).is_some());

    let urls = fixture.store.get_synced_urls().await;
    assert_eq!(urls.into_iter().collect::<Vec<_>>(), vec![other.to_string()]);
}

#[tokio::test]
async fn reupload_of_a_deleted_url_returns_to_its_shard() {
    let fixture = sharded_fixture(policy_with_file_limit(1)).await;
    fixture.store.upload_media(vec![upload(URL, b"meow")], None).await;
    fixture.store.soft_delete_media(&[URL.to_string()], "device-a").await;

    fixture.store.upload_media(vec![upload(URL, b"meow-2")], None).await;

    let index = fixture.index().await;
    assert_eq!(index.shards.len(), 1);
    assert!(index.tombstones.is_empty());
    assert_eq!(index.file_index[URL].shard_id, "media-1");
    let shard = fixture.shard("media-1").await;
    assert_eq!((shard.file_count, shard.total_size, shard.pending_purge_count), (1, 6, 0));
}

#[tokio::test]
async fn deleting_untracked_urls_is_a_skip() {
    let fixture = sharded_fixture(policy_with_file_limit(10)).await;
    let result = fixture
        .store
        .soft_delete_media(&["https://cdn.example/ghost.png".to_string()], "device-a")
        .await;
    assert!(result.success);
    assert_eq!((result.deleted, result.skipped), (0, 1));
}

#[tokio::test]
async fn reupload_skips_a_tombstoned_shard_that_filled_up() {
    let fixture = sharded_fixture(policy_with_file_limit(2)).await;
    let first = "https://cdn.example/photos/a.png";
    fixture.store.upload_media(vec![upload(first, b"a")], None).await;
    fixture.store.soft_delete_media(&[first.to_string()], "device-a").await;
    fixture
        .store
        .upload_media(
            vec![
                upload("https://cdn.example/photos/b.png", b"b"),
                upload("https://cdn.example/photos/c.png", b"c"),
            ],
            None,
        )
        .await;

    let result = fixture.store.upload_media(vec![upload(first, b"a2")], None).await;
    assert_eq!(result.uploaded, 1);

    let index = fixture.index().await;
    for shard in index.shards.values() {
        assert!(shard.file_count <= 2, "{} holds {} files", shard.alias, shard.file_count);
    }
    assert_eq!(index.file_index[first].shard_id, "media-2");
    assert!(fixture.store.get_synced_urls().await.contains(first));

    // The old copy on media-1 no longer blocks anything and is purged right away.
    assert_eq!(fixture.store.cleanup_expired_tombstones().await, 1);
    let filename = encode_media_filename(first);
    let old = fixture.shard("media-1").await;
    assert_eq!((old.file_count, old.pending_purge_count), (2, 0));
    assert!(fixture.backend.file(&old.gist_id, &filename).is_none());
    let new = fixture.shard("media-2").await;
    assert!(fixture.backend.file(&new.gist_id, &filename).is_some());
}
