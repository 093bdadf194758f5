pub mod feature_flags;
pub mod legacy_store;
pub mod persist_queue;
pub mod shard_cache;
pub mod shard_manager;
pub mod shard_migration;
pub mod shard_router;
pub mod shard_sync;
pub mod sharded_store;
