//! CLI for the in-process cluster simulation
//!
use std::net::SocketAddr;

use crate::config_error;
use crate::error::Result;
use crate::settings;

#[derive(Clone, Debug, clap::Parser)]
#[clap(version, about = "Boot an in-process murmur cluster and watch it converge")]
pub struct Cli {
    // Simulation: cluster size
    #[clap(
        long,
        default_value = "5",
        env("MURMUR_NODES"),
        help = "Number of members to boot"
    )]
    pub nodes: usize,

    // Simulation: member i listens on base_port + i
    #[clap(
        long,
        default_value = "4801",
        env("MURMUR_BASE_PORT"),
        help = "Port of the first member, the others count up from it"
    )]
    pub base_port: u16,

    // Simulation: minimum time to let each phase settle
    #[clap(
        long,
        default_value = "3",
        env("MURMUR_RUN_SECONDS"),
        help = "Seconds to wait for convergence after each phase"
    )]
    pub run_seconds: u64,

    // Extra seeds on top of the first member
    #[clap(
        long,
        env("MURMUR_SEED_MEMBERS"),
        value_delimiter = ',',
        help = "Additional seed addresses (e.g., 127.0.0.1:4801,127.0.0.1:4802)"
    )]
    pub seed_members: Vec<SocketAddr>,

    #[clap(
        long,
        default_value_t = settings::DEFAULT_SYNC_INTERVAL_MS,
        env("MURMUR_SYNC_INTERVAL_MS"),
        help = "Periodic sync interval in milliseconds"
    )]
    pub sync_interval_ms: u64,

    #[clap(
        long,
        default_value_t = settings::DEFAULT_SYNC_TIMEOUT_MS,
        env("MURMUR_SYNC_TIMEOUT_MS"),
        help = "Initial sync timeout in milliseconds"
    )]
    pub sync_timeout_ms: u64,

    #[clap(
        long,
        default_value = settings::DEFAULT_SYNC_GROUP,
        env("MURMUR_SYNC_GROUP"),
        help = "Members only sync with members of the same group"
    )]
    pub sync_group: String,

    #[clap(
        long,
        default_value_t = settings::DEFAULT_SUSPICION_MULT,
        env("MURMUR_SUSPICION_MULT"),
        help = "Suspicion timeout multiplier"
    )]
    pub suspicion_mult: u32,

    #[clap(
        long,
        default_value_t = settings::DEFAULT_PING_INTERVAL_MS,
        env("MURMUR_PING_INTERVAL_MS"),
        help = "Failure detector ping interval in milliseconds"
    )]
    pub ping_interval_ms: u64,

    #[clap(
        long,
        default_value_t = settings::DEFAULT_REMOVED_HISTORY_SIZE,
        env("MURMUR_REMOVED_HISTORY_SIZE"),
        help = "Number of removed members kept in metrics"
    )]
    pub removed_history_size: usize,
}

impl Cli {
    pub fn into_settings(self) -> settings::MembershipSettings {
        settings::MembershipSettings {
            seed_members: self.seed_members,
            sync_interval_ms: self.sync_interval_ms,
            sync_timeout_ms: self.sync_timeout_ms,
            sync_group: self.sync_group,
            suspicion_mult: self.suspicion_mult,
            ping_interval_ms: self.ping_interval_ms,
            removed_history_size: self.removed_history_size,
        }
    }

    /// Loopback address of the simulated member at `index`
    pub fn member_address(&self, index: usize) -> Result<SocketAddr> {
        u16::try_from(index)
            .ok()
            .and_then(|offset| self.base_port.checked_add(offset))
            .map(|port| SocketAddr::from(([127, 0, 0, 1], port)))
            .ok_or_else(|| {
                config_error!("member {} does not fit above port {}", index, self.base_port)
            })
    }
}
