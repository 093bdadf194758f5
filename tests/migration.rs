mod common;

use common::{Fixture, MASTER};
use gist_shard_store::{
    backend::{ContainerBackend, FileMap},
    models::{
        LEGACY_MANIFEST_FILE, LegacyManifest, MASTER_INDEX_FILE, SHARD_MANIFEST_FILE, ShardPolicy, ShardStatus,
    },
    services::shard_migration::MigrationPhase,
};
use std::sync::Mutex;

fn legacy_manifest(fixture: &Fixture) -> LegacyManifest {
    let raw = fixture
        .backend
        .file(MASTER, LEGACY_MANIFEST_FILE)
        .expect("legacy manifest present");
    serde_json::from_str(&raw).expect("legacy manifest parses")
}

#[tokio::test]
async fn empty_store_migrates_to_a_single_shard() {
    let fixture = Fixture::new(ShardPolicy::default());

    let result = fixture.store.migrate(MASTER, None).await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.migrated_files, 0);
    assert_eq!(result.created_shards, 1);
    assert!(result.warnings.is_empty(), "{:?}", result.warnings);

    assert!(fixture.store.is_sharding_active().await);
    let shard = fixture.shard("media-1").await;
    assert_eq!(shard.gist_id, MASTER);
    assert!(fixture.backend.file(MASTER, MASTER_INDEX_FILE).is_some());
    assert!(fixture.backend.file(MASTER, SHARD_MANIFEST_FILE).is_some());
    assert_eq!(fixture.store.migration_state().await.phase, MigrationPhase::Completed);
}

#[tokio::test]
async fn analysis_counts_live_legacy_media() {
    let fixture = Fixture::new(ShardPolicy::default());
    let urls = fixture.seed_legacy(210).await;
    fixture.store.bind_master_container(MASTER).await.unwrap();
    fixture.store.soft_delete_media(&urls[..5], "device-a").await;

    let analysis = fixture.store.analyze_migration(MASTER).await.unwrap();
    assert_eq!(analysis.current_media_count, 205);
    assert!(analysis.needs_migration);
    assert_eq!(analysis.estimated_shards, 1);
    assert_eq!(analysis.media_files.len(), 205);
    assert!(fixture.store.should_migrate_to_sharding(None).await);
}

#[tokio::test]
async fn migrate_and_rollback_round_trip() {
    let fixture = Fixture::new(ShardPolicy::default());
    let urls = fixture.seed_legacy(260).await;

    let phases = Mutex::new(Vec::new());
    let on_progress = |state: &gist_shard_store::services::shard_migration::MigrationState| {
        let mut phases = phases.lock().unwrap();
        if phases.last() != Some(&state.phase) {
            phases.push(state.phase);
        }
    };
    let result = fixture.store.migrate(MASTER, Some(&on_progress)).await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.migrated_files, 260);
    assert_eq!(result.created_shards, 2);
    assert!(result.warnings.is_empty(), "{:?}", result.warnings);
    assert_eq!(
        *phases.lock().unwrap(),
        vec![
            MigrationPhase::Analyzing,
            MigrationPhase::CreatingIndex,
            MigrationPhase::Migrating,
            MigrationPhase::Verifying,
            MigrationPhase::Completed,
        ]
    );

    let master_shard = fixture.shard("media-1").await;
    assert_eq!(master_shard.gist_id, MASTER);
    assert_eq!(master_shard.file_count, 250);
    assert_eq!(master_shard.status, ShardStatus::Full);
    let spill = fixture.shard("media-2").await;
    assert_eq!(spill.file_count, 10);
    // Ten media files plus the shard manifest.
    assert_eq!(fixture.backend.file_names(&spill.gist_id).len(), 11);

    let synced = fixture.store.get_synced_urls().await;
    assert_eq!(synced.len(), 260);
    let download = fixture.store.download_media(&urls[255..], None).await;
    assert_eq!(download.result.downloaded, 5);
    assert!(download.media.iter().all(|media| media.shard_id == "media-2"));

    let report = fixture.store.verify_migration(MASTER).await;
    assert!(report.valid, "{:?}", report.issues);

    // Deleted while sharded, on the master shard.
    let removed = fixture.store.soft_delete_media(&urls[..1], "device-a").await;
    assert_eq!(removed.deleted, 1);

    let rollback = fixture.store.rollback(MASTER).await;
    assert!(rollback.success, "{:?}", rollback.warnings);
    assert_eq!(rollback.restored_files, 10);
    assert_eq!(rollback.removed_shards, 1);

    assert!(fixture.store.router().shards().await.is_empty());
    assert!(!fixture.store.is_sharding_active().await);
    assert!(!fixture.backend.container_exists(&spill.gist_id));
    assert!(fixture.backend.file(MASTER, MASTER_INDEX_FILE).is_none());
    assert!(fixture.backend.file(MASTER, SHARD_MANIFEST_FILE).is_none());

    let legacy = legacy_manifest(&fixture);
    assert_eq!(legacy.live_entries().count(), 259);
    assert!(legacy.files[&urls[0]].deleted);
    assert!(legacy.files[&urls[0]].deleted_at.is_some());
    assert!(!fixture.store.get_synced_urls().await.contains(&urls[0]));
    for url in &urls {
        let entry = &legacy.files[url];
        assert!(fixture.backend.file(MASTER, &entry.filename).is_some(), "{} not back in master", url);
    }

    // Back on the legacy store, reads still work.
    let download = fixture.store.download_media(&urls[255..], None).await;
    assert_eq!(download.result.downloaded, 5);
}

#[tokio::test]
async fn rerunning_migration_skips_indexed_files() {
    let fixture = Fixture::new(ShardPolicy::default());
    fixture.seed_legacy(260).await;

    assert!(fixture.store.migrate(MASTER, None).await.success);
    let containers = fixture.backend.container_ids().len();

    let again = fixture.store.migrate(MASTER, None).await;
    assert!(again.success, "{:?}", again.error);
    assert_eq!(again.migrated_files, 0);
    assert_eq!(again.created_shards, 2);
    assert_eq!(fixture.backend.container_ids().len(), containers);
    assert_eq!(fixture.index().await.file_index.len(), 260);
}

#[tokio::test]
async fn verify_reports_a_deleted_shard_container() {
    let fixture = Fixture::new(ShardPolicy::default());
    fixture.seed_legacy(260).await;
    assert!(fixture.store.migrate(MASTER, None).await.success);

    let spill = fixture.shard("media-2").await;
    fixture.backend.remove_container(&spill.gist_id);

    let report = fixture.store.verify_migration(MASTER).await;
    assert!(!report.valid);
    assert!(report.issues.iter().any(|issue| issue.contains("media-2")), "{:?}", report.issues);
}

#[tokio::test]
async fn reconcile_finishes_interrupted_moves() {
    let fixture = Fixture::new(ShardPolicy::default());
    fixture.seed_legacy(260).await;
    assert!(fixture.store.migrate(MASTER, None).await.success);

    let index = fixture.index().await;
    let spill = fixture.shard("media-2").await;
    let mut on_spill = index
        .file_index
        .values()
        .filter(|entry| entry.shard_id == "media-2")
        .map(|entry| entry.filename.clone());
    let duplicated = on_spill.next().unwrap();
    let stranded = on_spill.next().unwrap();

    // One copy whose delete from the master failed, one copy that never arrived.
    let backend = &fixture.backend;
    let files = FileMap::from([
        (duplicated.clone(), backend.file(&spill.gist_id, &duplicated).unwrap()),
        (stranded.clone(), backend.file(&spill.gist_id, &stranded).unwrap()),
    ]);
    backend.update_files(files, MASTER).await.unwrap();
    backend.delete_files(&[stranded.clone()], &spill.gist_id).await.unwrap();

    let report = fixture.store.reconcile_migration(MASTER).await;
    assert_eq!((report.moved, report.deduplicated, report.missing), (1, 1, 0), "{:?}", report.issues);
    assert!(report.issues.is_empty(), "{:?}", report.issues);

    assert!(backend.file(&spill.gist_id, &stranded).is_some());
    assert!(backend.file(MASTER, &stranded).is_none());
    assert!(backend.file(MASTER, &duplicated).is_none());
}

#[tokio::test]
async fn rollback_keeps_a_shard_it_cannot_read() {
    let fixture = Fixture::new(ShardPolicy::default());
    fixture.seed_legacy(260).await;
    assert!(fixture.store.migrate(MASTER, None).await.success);

    let spill = fixture.shard("media-2").await;
    fixture.backend.fail_container(&spill.gist_id);

    let rollback = fixture.store.rollback(MASTER).await;
    assert!(!rollback.success);
    assert_eq!(rollback.removed_shards, 0);
    assert!(fixture.backend.container_exists(&spill.gist_id));
    assert!(fixture.backend.file(MASTER, MASTER_INDEX_FILE).is_some());
    assert!(!fixture.store.is_sharding_active().await);
}

#[tokio::test]
async fn rollback_revives_urls_uploaded_again_after_migration() {
    let fixture = Fixture::new(ShardPolicy::default());
    let urls = fixture.seed_legacy(3).await;
    fixture.store.bind_master_container(MASTER).await.unwrap();
    fixture.store.soft_delete_media(&urls[..1], "device-a").await;
    assert!(legacy_manifest(&fixture).files[&urls[0]].deleted);

    let result = fixture.store.migrate(MASTER, None).await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.migrated_files, 2);

    let uploaded = fixture
        .store
        .upload_media(vec![common::upload(&urls[0], b"again")], None)
        .await;
    assert_eq!(uploaded.uploaded, 1);
    assert_eq!(fixture.index().await.file_index[&urls[0]].shard_id, "media-1");

    let rollback = fixture.store.rollback(MASTER).await;
    assert!(rollback.success, "{:?}", rollback.warnings);

    let legacy = legacy_manifest(&fixture);
    let entry = &legacy.files[&urls[0]];
    assert!(!entry.deleted);
    assert_eq!(entry.deleted_at, None);
    assert_eq!(entry.mime_type, "image/png");
    assert_eq!(legacy.live_entries().count(), 3);

    let download = fixture.store.download_media(&urls[..1], None).await;
    assert_eq!(download.media[0].content.as_ref(), b"again");
}
