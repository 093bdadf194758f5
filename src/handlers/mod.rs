pub mod health_handlers;
pub mod media_handlers;
pub mod migration_handlers;
pub mod shard_handlers;
