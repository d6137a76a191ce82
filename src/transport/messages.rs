//! Membership Wire Messages
//!
//! The three message kinds exchanged by the membership protocol:
//!
//! - `Sync`: full membership table, either a correlated request (bootstrap) or an
//!   uncorrelated periodic push
//! - `SyncAck`: full membership table sent back in reply to a `Sync`
//! - `Gossip`: a single record handed to the gossip protocol for epidemic spread
//!
//! Messages are encoded with bincode for INTERNAL cluster communication.
use std::net::SocketAddr;

use bincode::{Decode, Encode};

use crate::error::Result;
use crate::member::MembershipRecord;

pub const SYNC: &str = "membership/sync";
pub const SYNC_ACK: &str = "membership/syncAck";
pub const MEMBERSHIP_GOSSIP: &str = "membership/gossip";

/// Full-table payload of SYNC and SYNC_ACK, tagged with the sender's sync group
#[derive(Clone, Debug, PartialEq, Eq, Decode, Encode)]
pub struct SyncData {
    pub membership: Vec<MembershipRecord>,
    pub sync_group: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Decode, Encode)]
pub enum MembershipMessage {
    Sync(SyncData),
    SyncAck(SyncData),
    Gossip(MembershipRecord),
}

impl MembershipMessage {
    pub fn qualifier(&self) -> &'static str {
        match self {
            MembershipMessage::Sync(_) => SYNC,
            MembershipMessage::SyncAck(_) => SYNC_ACK,
            MembershipMessage::Gossip(_) => MEMBERSHIP_GOSSIP,
        }
    }
}

/// Envelope carried by the transport and gossip protocol
#[derive(Clone, Debug, PartialEq, Eq, Decode, Encode)]
pub struct Message {
    pub sender: SocketAddr,
    pub correlation_id: Option<String>,
    pub payload: MembershipMessage,
}

impl Message {
    pub fn new(sender: SocketAddr, payload: MembershipMessage) -> Self {
        Self {
            sender,
            correlation_id: None,
            payload,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn qualifier(&self) -> &'static str {
        self.payload.qualifier()
    }

    /// Sync payload of a SYNC or SYNC_ACK message
    pub fn sync_data(&self) -> Option<&SyncData> {
        match &self.payload {
            MembershipMessage::Sync(data) | MembershipMessage::SyncAck(data) => Some(data),
            MembershipMessage::Gossip(_) => None,
        }
    }

    /// True for SYNC/SYNC_ACK messages tagged with `sync_group`
    pub fn in_sync_group(&self, sync_group: &str) -> bool {
        self.sync_data()
            .map(|data| data.sync_group == sync_group)
            .unwrap_or(false)
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        let config = bincode::config::standard().with_big_endian();
        Ok(bincode::encode_to_vec(self, config)?)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let config = bincode::config::standard().with_big_endian();
        let (message, _) = bincode::decode_from_slice(data, config)?;
        Ok(message)
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[from {}", self.qualifier(), self.sender)?;
        if let Some(cid) = &self.correlation_id {
            write!(f, ", cid {}", cid)?;
        }
        match &self.payload {
            MembershipMessage::Sync(data) | MembershipMessage::SyncAck(data) => write!(
                f,
                ", group {}, {} records]",
                data.sync_group,
                data.membership.len()
            ),
            MembershipMessage::Gossip(record) => write!(f, ", {}]", record),
        }
    }
}
