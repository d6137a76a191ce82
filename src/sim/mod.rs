//! In-process cluster
//!
//! Implementations of every collaborator the membership engine needs, wired
//! over a shared `LocalNetwork` instead of sockets. All traffic still goes
//! through the bincode codec. Endpoints can be disconnected and reconnected
//! to simulate crashes and partitions.
pub mod detector;
pub mod gossip;
pub mod metadata;
pub mod transport;

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::member::Member;
use crate::membership::MembershipProtocol;
use crate::settings::MembershipSettings;
use crate::transport::{Message, LISTENER_CHANNEL_CAPACITY};
pub use detector::ManualFailureDetector;
pub use gossip::LocalGossip;
pub use metadata::{InMemoryMetadataStore, MetadataDirectory};
pub use transport::LocalTransport;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

/// Fan-out of inbound messages to every listener of one endpoint
#[derive(Debug, Default)]
pub(crate) struct Mailbox {
    listeners: Mutex<Vec<mpsc::Sender<Message>>>,
}

impl Mailbox {
    pub(crate) fn listen(&self) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(LISTENER_CHANNEL_CAPACITY);
        self.listeners.lock().push(tx);
        rx
    }

    pub(crate) async fn deliver(&self, message: Message) {
        let listeners: Vec<mpsc::Sender<Message>> = {
            let mut listeners = self.listeners.lock();
            listeners.retain(|tx| !tx.is_closed());
            listeners.clone()
        };
        for tx in listeners {
            // listener went away between the snapshot and the send
            let _ = tx.send(message.clone()).await;
        }
    }
}

#[derive(Debug, Default)]
struct NetworkState {
    transports: HashMap<SocketAddr, Arc<transport::TransportEndpoint>>,
    gossipers: HashMap<SocketAddr, Arc<Mailbox>>,
    disconnected: HashSet<SocketAddr>,
}

/// Shared registry of in-process endpoints
#[derive(Clone, Debug, Default)]
pub struct LocalNetwork {
    state: Arc<RwLock<NetworkState>>,
    directory: MetadataDirectory,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metadata_directory(&self) -> &MetadataDirectory {
        &self.directory
    }

    /// Drop all traffic to and from `address`
    pub fn disconnect(&self, address: SocketAddr) {
        self.state.write().disconnected.insert(address);
    }

    pub fn reconnect(&self, address: SocketAddr) {
        self.state.write().disconnected.remove(&address);
    }

    pub fn is_reachable(&self, address: SocketAddr) -> bool {
        !self.state.read().disconnected.contains(&address)
    }

    pub(crate) fn register_transport(
        &self,
        address: SocketAddr,
        endpoint: Arc<transport::TransportEndpoint>,
    ) {
        self.state.write().transports.insert(address, endpoint);
    }

    pub(crate) fn register_gossip(&self, address: SocketAddr, mailbox: Arc<Mailbox>) {
        self.state.write().gossipers.insert(address, mailbox);
    }

    pub(crate) fn transport_endpoint(
        &self,
        address: SocketAddr,
    ) -> Option<Arc<transport::TransportEndpoint>> {
        self.state.read().transports.get(&address).cloned()
    }

    /// Connected gossip endpoints other than `origin`
    pub(crate) fn gossip_peers(&self, origin: SocketAddr) -> Vec<Arc<Mailbox>> {
        let state = self.state.read();
        state
            .gossipers
            .iter()
            .filter(|(address, _)| **address != origin && !state.disconnected.contains(address))
            .map(|(_, mailbox)| Arc::clone(mailbox))
            .collect()
    }

    /// Pass a message through the wire codec, as a socket would
    pub(crate) fn over_the_wire(message: Message) -> Result<Message> {
        let data = message.serialize()?;
        Message::deserialize(&data)
    }

    /// Build every collaborator for `member`, publish its metadata, and create its protocol
    pub fn spawn_node(
        &self,
        member: Member,
        metadata: Bytes,
        settings: MembershipSettings,
    ) -> Result<SimNode> {
        let transport = Arc::new(LocalTransport::bind(
            self.clone(),
            member.address(),
            DEFAULT_REQUEST_TIMEOUT,
        ));
        let gossip = Arc::new(LocalGossip::join(self.clone(), member.address()));
        let failure_detector = Arc::new(ManualFailureDetector::new());
        let metadata_store = Arc::new(InMemoryMetadataStore::new(self.clone()));
        self.directory.publish(member.id(), metadata);

        let protocol = MembershipProtocol::new(
            member,
            settings,
            transport.clone(),
            failure_detector.clone(),
            gossip.clone(),
            metadata_store.clone(),
        )?;

        Ok(SimNode {
            protocol,
            transport,
            gossip,
            failure_detector,
            metadata_store,
        })
    }
}

/// One member of an in-process cluster together with its collaborators
pub struct SimNode {
    pub protocol: MembershipProtocol,
    pub transport: Arc<LocalTransport>,
    pub gossip: Arc<LocalGossip>,
    pub failure_detector: Arc<ManualFailureDetector>,
    pub metadata_store: Arc<InMemoryMetadataStore>,
}

impl SimNode {
    pub fn member(&self) -> &Member {
        self.protocol.member()
    }

    pub fn address(&self) -> SocketAddr {
        self.protocol.member().address()
    }
}
