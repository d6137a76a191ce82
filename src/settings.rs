//! Membership protocol settings
use std::net::SocketAddr;
use std::time::Duration;

use crate::config_error;
use crate::error::Result;

pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const DEFAULT_SYNC_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_SYNC_TIMEOUT_MS: u64 = 3_000;
pub const DEFAULT_SYNC_GROUP: &str = "default";
pub const DEFAULT_SUSPICION_MULT: u32 = 5;
pub const DEFAULT_PING_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_REMOVED_HISTORY_SIZE: usize = 42;

#[derive(Clone, Debug)]
pub struct MembershipSettings {
    // Addresses contacted for the bootstrap sync and mixed into periodic sync targets
    pub seed_members: Vec<SocketAddr>,

    // Period of the one-way anti-entropy SYNC (default: 30s)
    pub sync_interval_ms: u64,

    // How long the bootstrap sync waits for the first SYNC_ACK (default: 3s)
    pub sync_timeout_ms: u64,

    // SYNC/SYNC_ACK from a different group are dropped
    pub sync_group: String,

    // Suspicion grace period multiplier (default: 5)
    pub suspicion_mult: u32,

    // Failure detector probe interval, feeds the suspicion timeout (default: 1s)
    pub ping_interval_ms: u64,

    // Number of REMOVED events kept for metrics
    pub removed_history_size: usize,
}

impl Default for MembershipSettings {
    fn default() -> Self {
        Self {
            seed_members: Vec::new(),
            sync_interval_ms: DEFAULT_SYNC_INTERVAL_MS,
            sync_timeout_ms: DEFAULT_SYNC_TIMEOUT_MS,
            sync_group: DEFAULT_SYNC_GROUP.to_string(),
            suspicion_mult: DEFAULT_SUSPICION_MULT,
            ping_interval_ms: DEFAULT_PING_INTERVAL_MS,
            removed_history_size: DEFAULT_REMOVED_HISTORY_SIZE,
        }
    }
}

impl MembershipSettings {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn with_seeds(mut self, seeds: impl IntoIterator<Item = SocketAddr>) -> Self {
        self.seed_members = seeds.into_iter().collect();
        self
    }

    pub fn with_sync_group(mut self, sync_group: impl Into<String>) -> Self {
        self.sync_group = sync_group.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.sync_interval_ms == 0 {
            return Err(config_error!("sync interval must be positive"));
        }
        if self.sync_timeout_ms == 0 {
            return Err(config_error!("sync timeout must be positive"));
        }
        if self.ping_interval_ms == 0 {
            return Err(config_error!("ping interval must be positive"));
        }
        if self.suspicion_mult == 0 {
            return Err(config_error!("suspicion multiplier must be positive"));
        }
        if self.sync_group.trim().is_empty() {
            return Err(config_error!("sync group must not be empty"));
        }
        Ok(())
    }
}
