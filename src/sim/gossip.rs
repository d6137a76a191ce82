//! In-process gossip: every spread reaches all other connected endpoints
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{LocalNetwork, Mailbox};
use crate::error::{MembershipError, Result};
use crate::transport::{GossipProtocol, Message};

pub struct LocalGossip {
    address: SocketAddr,
    network: LocalNetwork,
    mailbox: Arc<Mailbox>,
}

impl LocalGossip {
    pub fn join(network: LocalNetwork, address: SocketAddr) -> Self {
        let mailbox = Arc::new(Mailbox::default());
        network.register_gossip(address, Arc::clone(&mailbox));
        Self {
            address,
            network,
            mailbox,
        }
    }
}

#[async_trait]
impl GossipProtocol for LocalGossip {
    async fn spread(&self, message: Message) -> Result<()> {
        if !self.network.is_reachable(self.address) {
            return Err(MembershipError::Gossip(format!(
                "{} is disconnected, cannot spread {}",
                self.address,
                message.qualifier()
            )));
        }
        for peer in self.network.gossip_peers(self.address) {
            let message = LocalNetwork::over_the_wire(message.clone())?;
            peer.deliver(message).await;
        }
        Ok(())
    }

    fn listen(&self) -> mpsc::Receiver<Message> {
        self.mailbox.listen()
    }
}
