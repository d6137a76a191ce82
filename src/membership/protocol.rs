//! Public handle of the membership protocol
//!
//! `MembershipProtocol` spawns the engine task and talks to it over a command
//! channel. Queries never go through the engine: they read the snapshot the
//! engine publishes after every mutation.
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, info_span, warn};
use tracing_futures::Instrument;

use super::commands::{MembershipCommand, UpdateReason};
use super::engine::{EngineInputs, MembershipEngine};
use super::events::{EventHub, MembershipEvent};
use super::metrics::{MembershipMetrics, MembershipSnapshot};
use crate::error::Result;
use crate::member::{Member, MembershipRecord};
use crate::settings::MembershipSettings;
use crate::transport::{FailureDetector, GossipProtocol, MetadataStore, Transport};

const COMMAND_CHANNEL_CAPACITY: usize = 256;

pub struct MembershipProtocol {
    local_member: Member,
    commands: mpsc::Sender<MembershipCommand>,
    snapshot: watch::Receiver<MembershipSnapshot>,
    events: EventHub,
    engine_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for MembershipProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MembershipProtocol")
            .field("local_member", &self.local_member)
            .field("running", &self.engine_task.lock().is_some())
            .finish()
    }
}

impl MembershipProtocol {
    /// Validate settings, subscribe to every collaborator and spawn the engine.
    /// Must be called from within a tokio runtime.
    pub fn new(
        local_member: Member,
        settings: MembershipSettings,
        transport: Arc<dyn Transport>,
        failure_detector: Arc<dyn FailureDetector>,
        gossip: Arc<dyn GossipProtocol>,
        metadata_store: Arc<dyn MetadataStore>,
    ) -> Result<Self> {
        settings.validate()?;

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let inputs = EngineInputs {
            commands: commands_rx,
            transport: transport.listen(),
            failure_detector: failure_detector.listen(),
            gossip: gossip.listen(),
        };

        let events = EventHub::new();
        let (engine, snapshot, receivers) = MembershipEngine::new(
            local_member.clone(),
            &settings,
            transport,
            gossip,
            metadata_store,
            events.clone(),
        );

        let span = info_span!("membership", member = %local_member);
        let engine_task = tokio::spawn(engine.run(inputs, receivers).instrument(span));
        info!("Created membership protocol for {}", local_member);

        Ok(Self {
            local_member,
            commands: commands_tx,
            snapshot,
            events,
            engine_task: Mutex::new(Some(engine_task)),
        })
    }

    /// Bootstrap sync with the seeds and schedule the periodic sync.
    /// Seed failures are logged; the node then starts with its own view.
    pub async fn start(&self) -> Result<()> {
        let (resp_chan, rx) = oneshot::channel();
        self.commands
            .send(MembershipCommand::Start { resp_chan })
            .await?;
        rx.await?
    }

    /// Stop timers and listeners and complete the event stream. Idempotent.
    pub async fn stop(&self) {
        let engine_task = self.engine_task.lock().take();
        let engine_task = match engine_task {
            Some(engine_task) => engine_task,
            None => return,
        };

        let (resp_chan, rx) = oneshot::channel();
        if self
            .commands
            .send(MembershipCommand::Stop { resp_chan })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
        if let Err(e) = engine_task.await {
            warn!("[{}] Membership engine ended abnormally: {}", self.local_member, e);
        }
        self.events.close();
    }

    pub fn is_stopped(&self) -> bool {
        self.engine_task.lock().is_none() || self.commands.is_closed()
    }

    /// Bump the local incarnation and gossip it
    pub async fn update_incarnation(&self) -> Result<()> {
        let (resp_chan, rx) = oneshot::channel();
        self.commands
            .send(MembershipCommand::UpdateIncarnation { resp_chan })
            .await?;
        rx.await?
    }

    /// Gossip a DEAD record for the local member
    pub async fn leave_cluster(&self) -> Result<()> {
        let (resp_chan, rx) = oneshot::channel();
        self.commands
            .send(MembershipCommand::LeaveCluster { resp_chan })
            .await?;
        rx.await?
    }

    /// Feed a candidate record to the engine. Returns whether it was accepted.
    pub async fn update_membership(
        &self,
        record: MembershipRecord,
        reason: UpdateReason,
    ) -> Result<bool> {
        let (resp_chan, rx) = oneshot::channel();
        self.commands
            .send(MembershipCommand::UpdateMembership {
                record,
                reason,
                resp_chan,
            })
            .await?;
        Ok(rx.await?)
    }

    /// Local member
    pub fn member(&self) -> &Member {
        &self.local_member
    }

    /// Every known member, the local one included
    pub fn members(&self) -> Vec<Member> {
        self.snapshot.borrow().members.values().cloned().collect()
    }

    pub fn other_members(&self) -> Vec<Member> {
        self.snapshot
            .borrow()
            .members
            .values()
            .filter(|member| **member != self.local_member)
            .cloned()
            .collect()
    }

    pub fn member_by_id(&self, id: &str) -> Option<Member> {
        self.snapshot.borrow().members.get(id).cloned()
    }

    pub fn member_by_address(&self, address: SocketAddr) -> Option<Member> {
        self.snapshot
            .borrow()
            .members
            .values()
            .find(|member| member.address() == address)
            .cloned()
    }

    /// Every record in the table, including members not yet admitted
    pub fn records(&self) -> Vec<MembershipRecord> {
        self.snapshot.borrow().records.values().cloned().collect()
    }

    pub fn record(&self, id: &str) -> Option<MembershipRecord> {
        self.snapshot.borrow().records.get(id).cloned()
    }

    pub fn incarnation(&self) -> u64 {
        self.snapshot.borrow().metrics.incarnation
    }

    pub fn metrics(&self) -> MembershipMetrics {
        self.snapshot.borrow().metrics.clone()
    }

    /// Membership events emitted from now on
    pub fn listen(&self) -> mpsc::UnboundedReceiver<MembershipEvent> {
        self.events.subscribe()
    }
}
