use crate::{
    errors::ShardResult,
    kv::{KeyValueStore, get_json, set_json},
};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tracing::{info, warn};

const SHARDING_ENABLED_KEY: &str = "sharded-store:enabled";

/// Persisted switch between the legacy single-container store and the
/// sharded stack. One instance per logical store.
pub struct FeatureFlags {
    kv: Arc<dyn KeyValueStore>,
    sharding_enabled: AtomicBool,
}

impl FeatureFlags {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            kv,
            sharding_enabled: AtomicBool::new(false),
        }
    }

    /// Reload the flag from the durable store; unreadable means disabled.
    pub async fn load(&self) -> bool {
        let enabled = match get_json::<bool>(self.kv.as_ref(), SHARDING_ENABLED_KEY).await {
            Ok(value) => value.unwrap_or(false),
            Err(err) => {
                warn!("failed to read sharding flag, assuming disabled: {}", err);
                false
            }
        };
        self.sharding_enabled.store(enabled, Ordering::SeqCst);
        enabled
    }

    pub fn sharding_enabled(&self) -> bool {
        self.sharding_enabled.load(Ordering::SeqCst)
    }

    pub async fn set_sharding_enabled(&self, enabled: bool) -> ShardResult<()> {
        set_json(self.kv.as_ref(), SHARDING_ENABLED_KEY, &enabled).await?;
        self.sharding_enabled.store(enabled, Ordering::SeqCst);
        info!("sharding {}", if enabled { "enabled" } else { "disabled" });
        Ok(())
    }
}
