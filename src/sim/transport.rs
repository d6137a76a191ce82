//! In-process point-to-point transport with correlated request/response
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::debug;

use super::{LocalNetwork, Mailbox};
use crate::error::{MembershipError, Result};
use crate::transport::{Message, Transport};
use crate::transport_error;

/// Receiving side of a transport: waiters for correlated replies, then listeners
#[derive(Debug, Default)]
pub(crate) struct TransportEndpoint {
    mailbox: Mailbox,
    pending_responses: Mutex<HashMap<String, oneshot::Sender<Message>>>,
}

impl TransportEndpoint {
    async fn deliver(&self, message: Message) {
        if let Some(cid) = message.correlation_id.clone() {
            let waiter = self.pending_responses.lock().remove(&cid);
            if let Some(waiter) = waiter {
                if waiter.send(message).is_err() {
                    debug!("Requester for {} went away before the reply arrived", cid);
                }
                return;
            }
        }
        self.mailbox.deliver(message).await;
    }
}

pub struct LocalTransport {
    address: SocketAddr,
    network: LocalNetwork,
    endpoint: Arc<TransportEndpoint>,
    request_timeout: Duration,
}

impl LocalTransport {
    /// Register a transport for `address` on the network
    pub fn bind(network: LocalNetwork, address: SocketAddr, request_timeout: Duration) -> Self {
        let endpoint = Arc::new(TransportEndpoint::default());
        network.register_transport(address, Arc::clone(&endpoint));
        Self {
            address,
            network,
            endpoint,
            request_timeout,
        }
    }

    fn forget_request(&self, cid: &str) {
        self.endpoint.pending_responses.lock().remove(cid);
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn address(&self) -> SocketAddr {
        self.address
    }

    async fn send(&self, address: SocketAddr, message: Message) -> Result<()> {
        if !self.network.is_reachable(self.address) || !self.network.is_reachable(address) {
            return Err(transport_error!("{} is unreachable from {}", address, self.address));
        }
        let target = self
            .network
            .transport_endpoint(address)
            .ok_or_else(|| transport_error!("nothing is listening on {}", address))?;
        let message = LocalNetwork::over_the_wire(message)?;
        target.deliver(message).await;
        Ok(())
    }

    async fn request_response(&self, address: SocketAddr, message: Message) -> Result<Message> {
        let cid = message
            .correlation_id
            .clone()
            .ok_or_else(|| transport_error!("request to {} has no correlation id", address))?;

        let (tx, rx) = oneshot::channel();
        self.endpoint
            .pending_responses
            .lock()
            .insert(cid.clone(), tx);

        if let Err(e) = self.send(address, message).await {
            self.forget_request(&cid);
            return Err(e);
        }

        match timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(transport_error!("request {} to {} was dropped", cid, address)),
            Err(_) => {
                self.forget_request(&cid);
                Err(MembershipError::Timeout(format!(
                    "no reply from {} to request {} within {}ms",
                    address,
                    cid,
                    self.request_timeout.as_millis()
                )))
            }
        }
    }

    fn listen(&self) -> mpsc::Receiver<Message> {
        self.endpoint.mailbox.listen()
    }
}
