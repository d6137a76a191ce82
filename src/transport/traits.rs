//! Collaborator traits consumed by the membership engine
//!
//! The engine never talks to the network directly: point-to-point delivery,
//! epidemic broadcast, liveness probing, and metadata lookups are all provided
//! through these seams.

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use super::messages::Message;
use crate::error::Result;
use crate::member::{Member, MemberStatus};

/// Reliable point-to-point messaging between members
#[async_trait]
pub trait Transport: Send + Sync {
    /// Address this transport is bound to
    fn address(&self) -> SocketAddr;

    /// Send a message without waiting for a reply
    async fn send(&self, address: SocketAddr, message: Message) -> Result<()>;

    /// Send a correlated request and wait for the reply carrying the same correlation id
    async fn request_response(&self, address: SocketAddr, message: Message) -> Result<Message>;

    /// Stream of inbound messages
    fn listen(&self) -> mpsc::Receiver<Message>;
}

/// Advisory liveness signal about one member
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FailureDetectorEvent {
    pub member: Member,
    pub status: MemberStatus,
}

impl FailureDetectorEvent {
    pub fn new(member: Member, status: MemberStatus) -> Self {
        Self { member, status }
    }
}

/// Local liveness probing
pub trait FailureDetector: Send + Sync {
    fn listen(&self) -> mpsc::Receiver<FailureDetectorEvent>;
}

/// Epidemic broadcast of single messages to a live subset of the cluster
#[async_trait]
pub trait GossipProtocol: Send + Sync {
    async fn spread(&self, message: Message) -> Result<()>;

    fn listen(&self) -> mpsc::Receiver<Message>;
}

/// Byte-blob metadata attached to each member
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Fetch the member's current metadata, possibly from the member itself.
    /// The engine gives up on a fetch after the sync timeout.
    async fn fetch_metadata(&self, member: &Member) -> Result<Bytes>;

    /// Cache metadata for a member, returning what was cached before
    fn update_metadata(&self, member: &Member, metadata: Bytes) -> Option<Bytes>;

    /// Drop cached metadata for a member, returning what was cached
    fn remove_metadata(&self, member: &Member) -> Option<Bytes>;
}
