//! Sharded media store over quota-limited remote containers.
//!
//! One logical, URL-addressed store spread across many Gist-like containers
//! ("shards"), with a master index for routing, a two-tier cache, soft delete
//! with retention, and migration from a single-container layout.

pub mod backend;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod kv;
pub mod models;
pub mod routes;
pub mod services;

pub use errors::{ShardError, ShardResult};
pub use services::sharded_store::{ShardedMediaStore, StoreOptions};
