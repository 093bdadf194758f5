mod common;

use common::{MASTER, numbered_uploads, policy_with_file_limit, sharded_fixture, upload};
use futures::future::join_all;
use gist_shard_store::{
    ShardError,
    models::{MediaType, ShardPolicy, ShardStatus},
};

#[tokio::test]
async fn uploads_spill_into_new_shards_in_creation_order() {
    let fixture = sharded_fixture(policy_with_file_limit(2)).await;

    let result = fixture
        .store
        .upload_media(numbered_uploads("spill", 5, b"x"), None)
        .await;
    assert!(result.success, "{:?}", result.details);
    assert_eq!(result.uploaded, 5);

    let index = fixture.index().await;
    let shards = index.ordered_shards();
    let layout: Vec<(&str, u32, ShardStatus)> = shards
        .iter()
        .map(|shard| (shard.alias.as_str(), shard.file_count, shard.status))
        .collect();
    assert_eq!(
        layout,
        vec![
            ("media-1", 2, ShardStatus::Full),
            ("media-2", 2, ShardStatus::Full),
            ("media-3", 1, ShardStatus::Active),
        ]
    );
    assert_eq!(index.stats.total_files, 5);
    assert_eq!(index.stats.total_size, 5);

    // Every shard holds its manifest plus its media files.
    for shard in shards {
        let names = fixture.backend.file_names(&shard.gist_id);
        assert_eq!(names.len(), shard.file_count as usize + 1, "{}", shard.alias);
    }
}

#[tokio::test]
async fn size_limit_opens_a_new_shard_before_overflowing() {
    let policy = ShardPolicy {
        file_limit: 100,
        size_limit: 10,
        ..ShardPolicy::default()
    };
    let fixture = sharded_fixture(policy).await;

    let items = vec![
        upload("https://cdn.example/a.png", b"aaaa"),
        upload("https://cdn.example/b.png", b"bbbb"),
        upload("https://cdn.example/c.png", b"cccc"),
    ];
    let result = fixture.store.upload_media(items, None).await;
    assert!(result.success);

    let index = fixture.index().await;
    for shard in index.shards.values() {
        assert!(shard.total_size <= 10, "{} holds {} bytes", shard.alias, shard.total_size);
    }
    assert_eq!(fixture.shard("media-1").await.status, ShardStatus::Full);
    assert_eq!(fixture.shard("media-2").await.total_size, 4);
}

#[tokio::test]
async fn concurrent_uploads_never_overfill_a_shard() {
    let fixture = sharded_fixture(policy_with_file_limit(3)).await;

    let uploads = numbered_uploads("race", 10, b"payload")
        .into_iter()
        .map(|item| {
            let store = fixture.store.clone();
            async move { store.upload_media(vec![item], None).await }
        });
    let results = join_all(uploads).await;
    assert!(results.iter().all(|result| result.uploaded == 1));

    let index = fixture.index().await;
    assert_eq!(index.file_index.len(), 10);
    assert_eq!(index.shards.len(), 4);
    for shard in index.shards.values() {
        assert!(shard.file_count <= 3, "{} holds {} files", shard.alias, shard.file_count);
    }
    assert_eq!(index.shard_file_count(), 10);
}

#[tokio::test]
async fn failed_content_write_releases_the_reservation() {
    let fixture = sharded_fixture(policy_with_file_limit(2)).await;
    fixture
        .store
        .upload_media(vec![upload("https://cdn.example/ok.png", b"ok")], None)
        .await;

    let shard = fixture.shard("media-1").await;
    fixture.backend.fail_container(&shard.gist_id);
    let result = fixture
        .store
        .upload_media(vec![upload("https://cdn.example/broken.png", b"no")], None)
        .await;
    assert_eq!(result.failed, 1);
    fixture.backend.heal_container(&shard.gist_id);

    let index = fixture.index().await;
    assert!(!index.file_index.contains_key("https://cdn.example/broken.png"));
    let shard = fixture.shard("media-1").await;
    assert_eq!(shard.file_count, 1);
    assert_eq!(shard.status, ShardStatus::Active);
    assert!(fixture.backend.container_exists(MASTER));
}

#[tokio::test]
async fn resync_of_a_tracked_url_keeps_its_shard() {
    let fixture = sharded_fixture(policy_with_file_limit(5)).await;
    let url = "https://cdn.example/same.png";
    fixture.store.upload_media(vec![upload(url, b"v1")], None).await;
    fixture.store.upload_media(vec![upload(url, b"version-2")], None).await;

    let index = fixture.index().await;
    assert_eq!(index.file_index.len(), 1);
    let shard = fixture.shard("media-1").await;
    assert_eq!(shard.file_count, 1);
    assert_eq!(shard.total_size, 9);

    let download = fixture.store.download_media(&[url.to_string()], None).await;
    assert_eq!(download.media[0].content.as_ref(), b"version-2");
}

#[tokio::test]
async fn allocation_is_first_fit_and_resolves_tracked_urls() {
    let fixture = sharded_fixture(ShardPolicy::default()).await;
    let router = fixture.store.router();

    let first = router.allocate_shard_for(10, MediaType::Image).await.unwrap();
    let again = router.allocate_shard_for(10, MediaType::Video).await.unwrap();
    assert_eq!((first.alias.as_str(), again.alias.as_str()), ("media-1", "media-1"));
    assert_eq!(fixture.backend.create_count(), 1);

    fixture
        .store
        .upload_media(vec![upload("https://cdn.example/tracked.png", b"t")], None)
        .await;
    let resolved = router
        .resolve_shard_for("https://cdn.example/tracked.png")
        .await
        .unwrap();
    assert_eq!(resolved.map(|shard| shard.alias), Some("media-1".to_string()));
    assert!(router.resolve_shard_for("https://cdn.example/unknown.png").await.unwrap().is_none());
}

#[tokio::test]
async fn container_creation_failure_fails_the_item() {
    let fixture = sharded_fixture(ShardPolicy::default()).await;
    fixture.backend.set_fail_creates(true);

    let result = fixture
        .store
        .upload_media(vec![upload("https://cdn.example/nowhere.png", b"n")], None)
        .await;
    assert!(!result.success);
    assert_eq!(result.failed, 1);

    let index = fixture.index().await;
    assert!(index.shards.is_empty());
    assert!(index.file_index.is_empty());
}

#[tokio::test]
async fn files_above_the_size_limit_are_rejected_before_allocation() {
    let policy = ShardPolicy {
        size_limit: 4,
        ..ShardPolicy::default()
    };
    let fixture = sharded_fixture(policy).await;

    let result = fixture
        .store
        .upload_media(vec![upload("https://cdn.example/huge.png", b"0123456789")], None)
        .await;
    assert!(!result.success);
    assert_eq!((result.uploaded, result.failed), (0, 1));
    assert!(result.details[0].error.as_deref().unwrap().contains("exceeds"));
    assert_eq!(fixture.backend.create_count(), 0);
    assert!(fixture.index().await.shards.is_empty());

    let err = fixture
        .store
        .router()
        .allocate_shard_for(10, MediaType::Image)
        .await
        .unwrap_err();
    assert!(matches!(err, ShardError::FileTooLarge { size: 10, limit: 4 }));

    // A file right at the limit still fits.
    let fits = fixture
        .store
        .upload_media(vec![upload("https://cdn.example/small.png", b"0123")], None)
        .await;
    assert_eq!(fits.uploaded, 1);
}
