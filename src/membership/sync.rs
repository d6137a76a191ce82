//! Sync Engine
//!
//! Anti-entropy exchange of the full membership table:
//!
//! - **Bootstrap**: request/response SYNC to every seed at once, first matching
//!   SYNC_ACK within the sync timeout wins, the rest are aborted
//! - **Periodic**: one-way SYNC to a single random address drawn from seeds and
//!   known members
//! - **Passive**: every inbound SYNC is merged and answered with a SYNC_ACK
//!
//! Messages from a different sync group are never merged.
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::task::JoinSet;
use tracing::debug;

use super::table::MembershipTable;
use crate::error::{MembershipError, Result};
use crate::member::Member;
use crate::settings::MembershipSettings;
use crate::transport::{Message, MembershipMessage, SyncData, Transport};
use crate::transport_error;

#[derive(Debug)]
pub struct SyncEngine {
    local_member: Member,
    local_address: SocketAddr,
    sync_group: String,
    seed_members: Vec<SocketAddr>,
    sync_interval: Duration,
    sync_timeout: Duration,
    cid_counter: u64,
}

impl SyncEngine {
    pub fn new(
        local_member: Member,
        transport_address: SocketAddr,
        settings: &MembershipSettings,
    ) -> Self {
        let seed_members = clean_up_seed_members(
            &settings.seed_members,
            local_member.address(),
            transport_address,
        );
        Self {
            local_member,
            local_address: transport_address,
            sync_group: settings.sync_group.clone(),
            seed_members,
            sync_interval: settings.sync_interval(),
            sync_timeout: settings.sync_timeout(),
            cid_counter: 0,
        }
    }

    pub fn seed_members(&self) -> &[SocketAddr] {
        &self.seed_members
    }

    pub fn sync_group(&self) -> &str {
        &self.sync_group
    }

    pub fn sync_interval(&self) -> Duration {
        self.sync_interval
    }

    pub fn sync_timeout(&self) -> Duration {
        self.sync_timeout
    }

    /// SYNC/SYNC_ACK from other groups are dropped without a reply
    pub fn accepts(&self, message: &Message) -> bool {
        message.in_sync_group(&self.sync_group)
    }

    pub fn next_correlation_id(&mut self) -> String {
        self.cid_counter += 1;
        format!("{}-{}", self.local_member.id(), self.cid_counter)
    }

    pub fn sync_data(&self, table: &MembershipTable) -> SyncData {
        SyncData {
            membership: table.records().cloned().collect(),
            sync_group: self.sync_group.clone(),
        }
    }

    pub fn sync_message(&self, table: &MembershipTable, correlation_id: Option<String>) -> Message {
        Message::new(
            self.local_address,
            MembershipMessage::Sync(self.sync_data(table)),
        )
        .with_correlation_id(correlation_id)
    }

    pub fn sync_ack_message(
        &self,
        table: &MembershipTable,
        correlation_id: Option<String>,
    ) -> Message {
        Message::new(
            self.local_address,
            MembershipMessage::SyncAck(self.sync_data(table)),
        )
        .with_correlation_id(correlation_id)
    }

    /// Correlated SYNC requests, one per seed
    pub fn bootstrap_requests(&mut self, table: &MembershipTable) -> Vec<(SocketAddr, Message)> {
        let seeds = self.seed_members.clone();
        seeds
            .into_iter()
            .map(|address| {
                let cid = self.next_correlation_id();
                (address, self.sync_message(table, Some(cid)))
            })
            .collect()
    }

    /// Random target for the periodic sync: seeds plus every other known member
    pub fn select_sync_address(&self, table: &MembershipTable) -> Option<SocketAddr> {
        let local = self.local_member.address();
        let addresses: HashSet<SocketAddr> = self
            .seed_members
            .iter()
            .copied()
            .chain(table.members().map(|m| m.address()))
            .filter(|address| *address != local && *address != self.local_address)
            .collect();
        let addresses: Vec<SocketAddr> = addresses.into_iter().collect();
        addresses.choose(&mut rand::thread_rng()).copied()
    }

    /// Send every request concurrently and return the first SYNC_ACK of our group.
    /// Outstanding requests are aborted once a winner is found or the timeout hits.
    pub async fn first_sync_ack(
        transport: Arc<dyn Transport>,
        requests: Vec<(SocketAddr, Message)>,
        sync_group: String,
        sync_timeout: Duration,
    ) -> Result<Message> {
        let mut pending = JoinSet::new();
        for (address, request) in requests {
            let transport = Arc::clone(&transport);
            pending.spawn(async move {
                let response = transport.request_response(address, request).await;
                (address, response)
            });
        }

        let first = async {
            while let Some(joined) = pending.join_next().await {
                match joined {
                    Ok((address, Ok(response))) => {
                        let is_ack = matches!(response.payload, MembershipMessage::SyncAck(_));
                        if is_ack && response.in_sync_group(&sync_group) {
                            return Some(response);
                        }
                        debug!("Ignoring initial sync response {} from {}", response, address);
                    }
                    Ok((address, Err(e))) => {
                        debug!("Initial sync with {} failed: {}", address, e);
                    }
                    Err(e) => {
                        debug!("Initial sync request task failed: {}", e);
                    }
                }
            }
            None
        };

        match tokio::time::timeout(sync_timeout, first).await {
            Ok(Some(response)) => Ok(response),
            Ok(None) => Err(transport_error!("no seed answered the initial sync")),
            Err(_) => Err(MembershipError::Timeout(format!(
                "initial sync got no answer within {}ms",
                sync_timeout.as_millis()
            ))),
        }
    }
}

/// De-duplicate seeds keeping their order, and drop our own addresses
pub fn clean_up_seed_members(
    seeds: &[SocketAddr],
    local_member_address: SocketAddr,
    transport_address: SocketAddr,
) -> Vec<SocketAddr> {
    let mut seen = HashSet::new();
    seeds
        .iter()
        .copied()
        .filter(|address| *address != local_member_address && *address != transport_address)
        .filter(|address| seen.insert(*address))
        .collect()
}
