//! Membership Engine
//!
//! One task owns the membership table, the suspicion timers and the sync state.
//! Commands from the protocol handle, the transport / failure detector / gossip
//! streams, metadata fetch completions, timer expiries and the periodic sync
//! tick are all consumed by a single `select!` loop, so every mutation of the
//! table is serialized without locks.
//!
//! Anything that has to wait on the network (sends, gossip, metadata fetches,
//! the bootstrap fan-out) is spawned and reports back through a channel.
use std::collections::HashMap;
use std::future::pending;
use std::mem;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval};
use tracing::{debug, info, warn};
use tracing_futures::Instrument;

use super::commands::{MembershipCommand, UpdateReason};
use super::events::{EventHub, MembershipEvent};
use super::metrics::{MembershipSnapshot, RemovedHistory};
use super::suspicion::{suspicion_timeout, SuspicionExpired, SuspicionScheduler};
use super::sync::SyncEngine;
use super::table::MembershipTable;
use crate::error::{MembershipError, Result};
use crate::member::{Member, MemberStatus, MembershipRecord};
use crate::settings::MembershipSettings;
use crate::transport::{
    FailureDetectorEvent, GossipProtocol, Message, MembershipMessage, MetadataStore, Transport,
};
use crate::transport_error;

/// Result of a spawned metadata fetch for an ALIVE candidate
#[derive(Debug)]
pub(crate) struct MetadataFetched {
    record: MembershipRecord,
    reason: UpdateReason,
    epoch: u64,
    result: Result<Bytes>,
}

/// Streams the engine consumes from the outside world
pub(crate) struct EngineInputs {
    pub commands: mpsc::Receiver<MembershipCommand>,
    pub transport: mpsc::Receiver<Message>,
    pub failure_detector: mpsc::Receiver<FailureDetectorEvent>,
    pub gossip: mpsc::Receiver<Message>,
}

/// Channels fed by tasks the engine spawns itself
pub(crate) struct EngineReceivers {
    fetched: mpsc::UnboundedReceiver<MetadataFetched>,
    expired: mpsc::UnboundedReceiver<SuspicionExpired>,
    bootstrap: mpsc::UnboundedReceiver<Result<Message>>,
}

/// Outstanding fetches for one member and the removals seen meanwhile
#[derive(Debug, Default)]
struct InFlightFetches {
    count: usize,
    epoch: u64,
}

#[derive(Debug)]
enum StartState {
    Idle,
    Starting {
        waiters: Vec<oneshot::Sender<Result<()>>>,
        bootstrapped: bool,
    },
    Started,
}

pub(crate) struct MembershipEngine {
    local_member: Member,
    suspicion_mult: u32,
    ping_interval: Duration,
    table: MembershipTable,
    suspicion: SuspicionScheduler,
    sync: SyncEngine,
    removed: RemovedHistory,
    /// Members with metadata fetches in flight; only these need a removal epoch
    in_flight: HashMap<String, InFlightFetches>,
    metadata_timeout: Duration,
    events: EventHub,
    snapshot_tx: watch::Sender<MembershipSnapshot>,
    transport: Arc<dyn Transport>,
    gossip: Arc<dyn GossipProtocol>,
    metadata_store: Arc<dyn MetadataStore>,
    fetched_tx: mpsc::UnboundedSender<MetadataFetched>,
    bootstrap_tx: mpsc::UnboundedSender<Result<Message>>,
    bootstrap_task: Option<JoinHandle<()>>,
    start_state: StartState,
    pending_initial_fetches: usize,
    periodic_sync: bool,
}

impl MembershipEngine {
    pub(crate) fn new(
        local_member: Member,
        settings: &MembershipSettings,
        transport: Arc<dyn Transport>,
        gossip: Arc<dyn GossipProtocol>,
        metadata_store: Arc<dyn MetadataStore>,
        events: EventHub,
    ) -> (Self, watch::Receiver<MembershipSnapshot>, EngineReceivers) {
        let (fetched_tx, fetched) = mpsc::unbounded_channel();
        let (expired_tx, expired) = mpsc::unbounded_channel();
        let (bootstrap_tx, bootstrap) = mpsc::unbounded_channel();

        let table = MembershipTable::new(&local_member);
        let removed = RemovedHistory::new(settings.removed_history_size);
        let (snapshot_tx, snapshot_rx) = watch::channel(MembershipSnapshot::capture(
            &table,
            &local_member,
            &removed,
        ));
        let sync = SyncEngine::new(local_member.clone(), transport.address(), settings);

        let engine = Self {
            local_member,
            suspicion_mult: settings.suspicion_mult,
            ping_interval: settings.ping_interval(),
            table,
            suspicion: SuspicionScheduler::new(expired_tx),
            sync,
            removed,
            in_flight: HashMap::new(),
            metadata_timeout: settings.sync_timeout(),
            events,
            snapshot_tx,
            transport,
            gossip,
            metadata_store,
            fetched_tx,
            bootstrap_tx,
            bootstrap_task: None,
            start_state: StartState::Idle,
            pending_initial_fetches: 0,
            periodic_sync: false,
        };
        let receivers = EngineReceivers {
            fetched,
            expired,
            bootstrap,
        };
        (engine, snapshot_rx, receivers)
    }

    /// Central loop. Returns after a Stop command or once the handle is dropped.
    pub(crate) async fn run(mut self, inputs: EngineInputs, mut receivers: EngineReceivers) {
        let EngineInputs {
            mut commands,
            transport,
            failure_detector,
            gossip,
        } = inputs;
        let mut transport = Some(transport);
        let mut failure_detector = Some(failure_detector);
        let mut gossip = Some(gossip);
        let mut sync_timer: Option<Interval> = None;

        info!(
            "[{}] Membership engine running in sync group '{}' with {} seed(s)",
            self.local_member,
            self.sync.sync_group(),
            self.sync.seed_members().len()
        );

        loop {
            if self.periodic_sync && sync_timer.is_none() {
                let period = self.sync.sync_interval();
                debug!(
                    "[{}] Scheduling periodic sync every {}ms",
                    self.local_member,
                    period.as_millis()
                );
                sync_timer = Some(time::interval_at(Instant::now() + period, period));
            }

            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(command) => {
                            if !self.handle_command(command) {
                                break;
                            }
                        }
                        None => {
                            info!("[{}] Protocol handle dropped, stopping", self.local_member);
                            self.shutdown();
                            break;
                        }
                    }
                }
                message = recv_from(&mut transport) => {
                    if let Err(e) = self.on_transport_message(message) {
                        warn!("[{}] Error processing transport message: {}", self.local_member, e);
                    }
                }
                event = recv_from(&mut failure_detector) => {
                    self.on_failure_detector_event(event);
                }
                message = recv_from(&mut gossip) => {
                    if let Err(e) = self.on_gossip_message(message) {
                        warn!("[{}] Error processing gossip message: {}", self.local_member, e);
                    }
                }
                Some(fetched) = receivers.fetched.recv() => {
                    self.on_metadata_fetched(fetched);
                }
                Some(expired) = receivers.expired.recv() => {
                    self.on_suspicion_expired(expired);
                }
                Some(outcome) = receivers.bootstrap.recv() => {
                    self.on_bootstrap_complete(outcome);
                }
                _ = tick(&mut sync_timer) => {
                    self.on_sync_tick();
                }
            }
        }

        info!("[{}] Membership engine stopped", self.local_member);
    }

    /// Returns false once the engine has to stop
    fn handle_command(&mut self, command: MembershipCommand) -> bool {
        match command {
            MembershipCommand::Start { resp_chan } => self.on_start(resp_chan),
            MembershipCommand::UpdateIncarnation { resp_chan } => {
                self.update_incarnation(resp_chan)
            }
            MembershipCommand::LeaveCluster { resp_chan } => self.leave_cluster(resp_chan),
            MembershipCommand::UpdateMembership {
                record,
                reason,
                resp_chan,
            } => {
                let applied = self.update_membership(record, reason);
                let _ = resp_chan.send(applied);
            }
            MembershipCommand::Stop { resp_chan } => {
                self.shutdown();
                let _ = resp_chan.send(());
                return false;
            }
        }
        true
    }

    /// Run a candidate record through conflict resolution and apply it.
    /// Returns true if the candidate was accepted. For ALIVE candidates the
    /// commit itself waits on the metadata fetch.
    pub(crate) fn update_membership(&mut self, r1: MembershipRecord, reason: UpdateReason) -> bool {
        let r0 = self.table.get(r1.id()).cloned();

        if r0.as_ref() == Some(&r1) || !r1.overrides(r0.as_ref()) {
            debug!(
                "[{}] ({}) skipping update, can't override r0: {} with received r1: {}",
                self.local_member,
                reason,
                describe(r0.as_ref()),
                r1
            );
            return false;
        }

        if r1.address() == self.local_member.address() || r1.id() == self.local_member.id() {
            return self.on_self_record(r0, r1, reason);
        }

        match r1.status {
            MemberStatus::Dead => self.on_dead_record(r1, reason),
            MemberStatus::Suspect => self.on_suspect_record(r1, reason),
            MemberStatus::Alive => {
                self.fetch_metadata(r1, reason);
                true
            }
        }
    }

    fn on_self_record(
        &mut self,
        r0: Option<MembershipRecord>,
        r1: MembershipRecord,
        reason: UpdateReason,
    ) -> bool {
        if r1.member != self.local_member {
            debug!(
                "[{}] ({}) ignoring {}: conflicts with the local identity",
                self.local_member, reason, r1
            );
            return false;
        }

        let r0 = r0.unwrap_or_else(|| MembershipRecord::alive(self.local_member.clone(), 0));
        let r2 = MembershipRecord::new(
            self.local_member.clone(),
            r0.status,
            r0.incarnation.max(r1.incarnation) + 1,
        );
        debug!(
            "[{}] ({}) updating incarnation, local record r0: {} to received r1: {}, \
             spreading r2: {}",
            self.local_member,
            reason,
            r0,
            r1,
            r2
        );

        self.table.put(r2.clone());
        self.publish_snapshot();
        self.spread(r2, None);
        true
    }

    fn on_dead_record(&mut self, r1: MembershipRecord, reason: UpdateReason) -> bool {
        self.suspicion.cancel(r1.id());
        if let Some(fetches) = self.in_flight.get_mut(r1.id()) {
            fetches.epoch += 1;
        }

        let removed = self.table.remove(r1.id());
        let metadata = self.metadata_store.remove_metadata(&r1.member);
        if let Some(member) = &removed {
            self.removed.push(member.clone(), Utc::now());
        }
        self.publish_snapshot();

        match removed {
            Some(member) => {
                info!("[{}] ({}) Member {} removed", self.local_member, reason, member);
                self.emit(MembershipEvent::removed(member, metadata));
            }
            None => debug!(
                "[{}] ({}) Dropped record of never admitted member {}",
                self.local_member, reason, r1.member
            ),
        }

        if reason.spreads_gossip() {
            self.spread(r1, None);
        }
        true
    }

    fn on_suspect_record(&mut self, r1: MembershipRecord, reason: UpdateReason) -> bool {
        self.table.put(r1.clone());
        let timeout = suspicion_timeout(self.suspicion_mult, self.table.len(), self.ping_interval);
        self.suspicion.schedule(r1.id(), timeout);
        self.publish_snapshot();

        debug!("[{}] ({}) Member {} is suspected", self.local_member, reason, r1);
        if reason.spreads_gossip() {
            self.spread(r1, None);
        }
        true
    }

    fn fetch_metadata(&mut self, record: MembershipRecord, reason: UpdateReason) {
        if reason == UpdateReason::InitialSync {
            self.pending_initial_fetches += 1;
        }
        let fetches = self.in_flight.entry(record.id().to_string()).or_default();
        fetches.count += 1;
        let epoch = fetches.epoch;
        let store = Arc::clone(&self.metadata_store);
        let fetched_tx = self.fetched_tx.clone();
        let metadata_timeout = self.metadata_timeout;
        tokio::spawn(
            async move {
                let fetch = store.fetch_metadata(&record.member);
                let result = match time::timeout(metadata_timeout, fetch).await {
                    Ok(result) => result,
                    Err(_) => Err(MembershipError::Timeout(format!(
                        "metadata of {} not fetched within {}ms",
                        record.member,
                        metadata_timeout.as_millis()
                    ))),
                };
                // results arriving after shutdown are dropped with the channel
                let _ = fetched_tx.send(MetadataFetched {
                    record,
                    reason,
                    epoch,
                    result,
                });
            }
            .in_current_span(),
        );
    }

    fn on_metadata_fetched(&mut self, fetched: MetadataFetched) {
        let MetadataFetched {
            record,
            reason,
            epoch,
            result,
        } = fetched;
        let id = record.id().to_string();
        self.commit_alive(record, reason, epoch, result);
        self.finish_fetch(&id);

        if reason == UpdateReason::InitialSync {
            self.pending_initial_fetches = self.pending_initial_fetches.saturating_sub(1);
            self.maybe_complete_start();
        }
    }

    fn commit_alive(
        &mut self,
        r1: MembershipRecord,
        reason: UpdateReason,
        epoch: u64,
        result: Result<Bytes>,
    ) {
        let metadata = match result {
            Ok(metadata) => metadata,
            Err(e) => {
                debug!(
                    "[{}] ({}) skipping to add/update member {}, metadata fetch failed: {}",
                    self.local_member, reason, r1, e
                );
                return;
            }
        };
        if epoch != self.removal_epoch(r1.id()) {
            debug!(
                "[{}] ({}) dropping {}: member was removed while fetching metadata",
                self.local_member, reason, r1
            );
            return;
        }
        if !r1.overrides(self.table.get(r1.id())) {
            debug!(
                "[{}] ({}) dropping {}: overtaken by {} while fetching metadata",
                self.local_member,
                reason,
                r1,
                describe(self.table.get(r1.id()))
            );
            return;
        }

        self.suspicion.cancel(r1.id());
        if reason.spreads_gossip() {
            self.spread(r1.clone(), None);
        }

        let old_metadata = self.metadata_store.update_metadata(&r1.member, metadata.clone());
        let member = r1.member.clone();
        let known = self.table.admit(r1);
        self.publish_snapshot();

        if !known {
            info!("[{}] ({}) Member {} added", self.local_member, reason, member);
            self.emit(MembershipEvent::added(member, metadata));
        } else if old_metadata.as_ref() != Some(&metadata) {
            self.emit(MembershipEvent::updated(member, old_metadata, metadata));
        }
    }

    fn on_suspicion_expired(&mut self, expired: SuspicionExpired) {
        if !self.suspicion.expire(&expired) {
            debug!(
                "[{}] Ignoring stale suspicion timeout for {}",
                self.local_member, expired.member_id
            );
            return;
        }
        let dead = match self.table.get(&expired.member_id) {
            Some(record) if record.is_suspect() => record.with_status(MemberStatus::Dead),
            _ => {
                debug!(
                    "[{}] Suspicion of {} already resolved",
                    self.local_member, expired.member_id
                );
                return;
            }
        };
        info!(
            "[{}] Declaring suspected member {} DEAD by timeout",
            self.local_member, dead.member
        );
        self.update_membership(dead, UpdateReason::SuspicionTimeout);
    }

    fn on_failure_detector_event(&mut self, event: FailureDetectorEvent) {
        let r0 = match self.table.get(event.member.id()) {
            Some(r0) => r0.clone(),
            None => {
                debug!(
                    "[{}] Ignoring failure detector event for unknown member {}",
                    self.local_member, event.member
                );
                return;
            }
        };
        if r0.status == event.status {
            return;
        }
        debug!(
            "[{}] Failure detector reports {} as {}",
            self.local_member, event.member, event.status
        );

        if event.status == MemberStatus::Alive {
            // ALIVE can't override SUSPECT at the same incarnation: sync with the
            // member so it refutes with a bumped incarnation
            let message = self.sync.sync_message(&self.table, None);
            self.send_message(event.member.address(), message);
        } else {
            self.update_membership(r0.with_status(event.status), UpdateReason::FailureDetector);
        }
    }

    fn on_transport_message(&mut self, message: Message) -> Result<()> {
        if message.sync_data().is_some() && !self.sync.accepts(&message) {
            debug!(
                "[{}] Dropping {} from {}: different sync group",
                self.local_member,
                message.qualifier(),
                message.sender
            );
            return Ok(());
        }

        let Message {
            sender,
            correlation_id,
            payload,
        } = message;
        match payload {
            MembershipMessage::Sync(data) => {
                debug!(
                    "[{}] Received SYNC from {} with {} record(s)",
                    self.local_member,
                    sender,
                    data.membership.len()
                );
                self.sync_membership(data.membership, UpdateReason::Sync);
                let ack = self.sync.sync_ack_message(&self.table, correlation_id);
                self.send_message(sender, ack);
                Ok(())
            }
            MembershipMessage::SyncAck(data) => {
                if let Some(cid) = correlation_id {
                    debug!(
                        "[{}] Ignoring SYNC_ACK {} from {}: reply to a request",
                        self.local_member, cid, sender
                    );
                    return Ok(());
                }
                debug!(
                    "[{}] Received SYNC_ACK from {} with {} record(s)",
                    self.local_member,
                    sender,
                    data.membership.len()
                );
                self.sync_membership(data.membership, UpdateReason::Sync);
                Ok(())
            }
            MembershipMessage::Gossip(record) => Err(transport_error!(
                "unexpected membership gossip {} from {}",
                record,
                sender
            )),
        }
    }

    fn on_gossip_message(&mut self, message: Message) -> Result<()> {
        match message.payload {
            MembershipMessage::Gossip(record) => {
                debug!("[{}] Received membership gossip {}", self.local_member, record);
                self.update_membership(record, UpdateReason::Gossip);
                Ok(())
            }
            other => Err(MembershipError::Gossip(format!(
                "unexpected {} from {}",
                other.qualifier(),
                message.sender
            ))),
        }
    }

    fn sync_membership(&mut self, records: Vec<MembershipRecord>, reason: UpdateReason) {
        for record in records {
            self.update_membership(record, reason);
        }
    }

    fn on_start(&mut self, resp_chan: oneshot::Sender<Result<()>>) {
        if let StartState::Starting { waiters, .. } = &mut self.start_state {
            waiters.push(resp_chan);
            return;
        }
        if matches!(self.start_state, StartState::Started) {
            let _ = resp_chan.send(Ok(()));
            return;
        }

        self.start_state = StartState::Starting {
            waiters: vec![resp_chan],
            bootstrapped: false,
        };

        if self.sync.seed_members().is_empty() {
            info!("[{}] No seed members, starting alone", self.local_member);
            self.mark_bootstrapped();
            return;
        }

        let requests = self.sync.bootstrap_requests(&self.table);
        info!(
            "[{}] Initial sync with seeds {:?}",
            self.local_member,
            self.sync.seed_members()
        );
        let transport = Arc::clone(&self.transport);
        let sync_group = self.sync.sync_group().to_string();
        let sync_timeout = self.sync.sync_timeout();
        let bootstrap_tx = self.bootstrap_tx.clone();
        self.bootstrap_task = Some(tokio::spawn(
            async move {
                let outcome =
                    SyncEngine::first_sync_ack(transport, requests, sync_group, sync_timeout).await;
                let _ = bootstrap_tx.send(outcome);
            }
            .in_current_span(),
        ));
    }

    fn on_bootstrap_complete(&mut self, outcome: Result<Message>) {
        self.bootstrap_task = None;
        match outcome {
            Ok(message) => {
                info!(
                    "[{}] Initial sync with {} succeeded",
                    self.local_member, message.sender
                );
                if let MembershipMessage::SyncAck(data) = message.payload {
                    self.sync_membership(data.membership, UpdateReason::InitialSync);
                }
            }
            Err(e) => {
                info!(
                    "[{}] Initial sync failed ({}), continuing with the local view",
                    self.local_member, e
                );
            }
        }
        self.mark_bootstrapped();
    }

    fn mark_bootstrapped(&mut self) {
        self.periodic_sync = true;
        if let StartState::Starting { bootstrapped, .. } = &mut self.start_state {
            *bootstrapped = true;
        }
        self.maybe_complete_start();
    }

    fn maybe_complete_start(&mut self) {
        let ready = matches!(
            self.start_state,
            StartState::Starting {
                bootstrapped: true,
                ..
            }
        ) && self.pending_initial_fetches == 0;
        if !ready {
            return;
        }
        if let StartState::Starting { waiters, .. } =
            mem::replace(&mut self.start_state, StartState::Started)
        {
            info!(
                "[{}] Membership started with {} member(s)",
                self.local_member,
                self.table.members().count()
            );
            for waiter in waiters {
                let _ = waiter.send(Ok(()));
            }
        }
    }

    fn on_sync_tick(&mut self) {
        match self.sync.select_sync_address(&self.table) {
            Some(address) => {
                debug!("[{}] Periodic SYNC to {}", self.local_member, address);
                let message = self.sync.sync_message(&self.table, None);
                self.send_message(address, message);
            }
            None => debug!("[{}] No member to sync with", self.local_member),
        }
    }

    fn update_incarnation(&mut self, resp_chan: oneshot::Sender<Result<()>>) {
        let r0 = self.local_record();
        let r1 = MembershipRecord::new(self.local_member.clone(), r0.status, r0.incarnation + 1);
        info!(
            "[{}] Updating incarnation to {}",
            self.local_member, r1.incarnation
        );
        self.table.put(r1.clone());
        self.publish_snapshot();
        self.spread(r1, Some(resp_chan));
    }

    fn leave_cluster(&mut self, resp_chan: oneshot::Sender<Result<()>>) {
        let r0 = self.local_record();
        let r1 = MembershipRecord::dead(self.local_member.clone(), r0.incarnation + 1);
        info!("[{}] Leaving cluster with {}", self.local_member, r1);
        self.table.put(r1.clone());
        self.publish_snapshot();
        self.spread(r1, Some(resp_chan));
    }

    fn shutdown(&mut self) {
        self.suspicion.cancel_all();
        if let Some(task) = self.bootstrap_task.take() {
            task.abort();
        }
        self.periodic_sync = false;
        if let StartState::Starting { waiters, .. } =
            mem::replace(&mut self.start_state, StartState::Idle)
        {
            for waiter in waiters {
                let _ = waiter.send(Err(MembershipError::Stopped));
            }
        }
        if self.events.close() {
            debug!("[{}] Membership event stream closed", self.local_member);
        }
    }

    fn local_record(&self) -> MembershipRecord {
        self.table
            .get(self.local_member.id())
            .cloned()
            .unwrap_or_else(|| MembershipRecord::alive(self.local_member.clone(), 0))
    }

    fn removal_epoch(&self, member_id: &str) -> u64 {
        self.in_flight
            .get(member_id)
            .map(|fetches| fetches.epoch)
            .unwrap_or(0)
    }

    fn finish_fetch(&mut self, member_id: &str) {
        if let Some(fetches) = self.in_flight.get_mut(member_id) {
            fetches.count = fetches.count.saturating_sub(1);
            if fetches.count == 0 {
                self.in_flight.remove(member_id);
            }
        }
    }

    fn publish_snapshot(&self) {
        self.snapshot_tx.send_replace(MembershipSnapshot::capture(
            &self.table,
            &self.local_member,
            &self.removed,
        ));
    }

    fn emit(&self, event: MembershipEvent) {
        debug!("[{}] Emitting membership event {}", self.local_member, event);
        self.events.publish(event);
    }

    fn spread(&self, record: MembershipRecord, resp_chan: Option<oneshot::Sender<Result<()>>>) {
        let gossip = Arc::clone(&self.gossip);
        let local = self.local_member.clone();
        let message = Message::new(self.transport.address(), MembershipMessage::Gossip(record));
        tokio::spawn(
            async move {
                debug!("[{}] Spreading membership gossip {}", local, message);
                let result = gossip.spread(message).await;
                if let Err(e) = &result {
                    debug!("[{}] Failed to spread membership gossip: {}", local, e);
                }
                if let Some(resp_chan) = resp_chan {
                    let _ = resp_chan.send(result);
                }
            }
            .in_current_span(),
        );
    }

    fn send_message(&self, address: SocketAddr, message: Message) {
        let transport = Arc::clone(&self.transport);
        let local = self.local_member.clone();
        tokio::spawn(
            async move {
                let qualifier = message.qualifier();
                if let Err(e) = transport.send(address, message).await {
                    debug!("[{}] Failed to send {} to {}: {}", local, qualifier, address, e);
                }
            }
            .in_current_span(),
        );
    }
}

fn describe(record: Option<&MembershipRecord>) -> String {
    record
        .map(ToString::to_string)
        .unwrap_or_else(|| "none".to_string())
}

/// Next item of an input stream; a closed stream stays pending forever
async fn recv_from<T>(source: &mut Option<mpsc::Receiver<T>>) -> T {
    if let Some(rx) = source.as_mut() {
        if let Some(value) = rx.recv().await {
            return value;
        }
        *source = None;
    }
    pending().await
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::events::MembershipEventKind;
    use crate::sim::{InMemoryMetadataStore, LocalGossip, LocalNetwork, LocalTransport};

    struct Fixture {
        engine: MembershipEngine,
        receivers: EngineReceivers,
        network: LocalNetwork,
        snapshot: watch::Receiver<MembershipSnapshot>,
        events: mpsc::UnboundedReceiver<MembershipEvent>,
        spread: mpsc::Receiver<Message>,
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn local() -> Member {
        Member::with_id("local", addr(5000))
    }

    fn peer(id: &str, port: u16) -> Member {
        Member::with_id(id, addr(port))
    }

    /// Metadata store whose fetches never resolve
    struct StalledStore;

    #[async_trait::async_trait]
    impl MetadataStore for StalledStore {
        async fn fetch_metadata(&self, _member: &Member) -> Result<Bytes> {
            pending().await
        }

        fn update_metadata(&self, _member: &Member, _metadata: Bytes) -> Option<Bytes> {
            None
        }

        fn remove_metadata(&self, _member: &Member) -> Option<Bytes> {
            None
        }
    }

    fn fixture_with(settings: MembershipSettings) -> Fixture {
        let network = LocalNetwork::new();
        let store = Arc::new(InMemoryMetadataStore::new(network.clone()));
        fixture_on(network, settings, store)
    }

    fn fixture_on(
        network: LocalNetwork,
        settings: MembershipSettings,
        store: Arc<dyn MetadataStore>,
    ) -> Fixture {
        let transport = Arc::new(LocalTransport::bind(
            network.clone(),
            local().address(),
            Duration::from_millis(200),
        ));
        let gossip = Arc::new(LocalGossip::join(network.clone(), local().address()));
        let observer = LocalGossip::join(network.clone(), addr(5999));
        let spread = observer.listen();

        let hub = EventHub::new();
        let events = hub.subscribe();
        let (engine, snapshot, receivers) =
            MembershipEngine::new(local(), &settings, transport, gossip, store, hub);
        Fixture {
            engine,
            receivers,
            network,
            snapshot,
            events,
            spread,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(MembershipSettings::default())
    }

    async fn complete_fetch(f: &mut Fixture) {
        let fetched = f.receivers.fetched.recv().await.unwrap();
        f.engine.on_metadata_fetched(fetched);
    }

    async fn admit(f: &mut Fixture, member: &Member, incarnation: u64, metadata: &'static [u8]) {
        f.network
            .metadata_directory()
            .publish(member.id(), Bytes::from_static(metadata));
        assert!(f.engine.update_membership(
            MembershipRecord::alive(member.clone(), incarnation),
            UpdateReason::Gossip
        ));
        complete_fetch(f).await;
    }

    async fn next_spread(f: &mut Fixture) -> MembershipRecord {
        match f.spread.recv().await.unwrap().payload {
            MembershipMessage::Gossip(record) => record,
            other => panic!("unexpected payload {:?}", other),
        }
    }

    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_suspect_first_sight_emits_nothing() {
        let mut f = fixture();
        let b = peer("b", 5001);

        assert!(f
            .engine
            .update_membership(MembershipRecord::suspect(b.clone(), 0), UpdateReason::Gossip));

        assert!(f.engine.table.get("b").unwrap().is_suspect());
        assert!(!f.engine.table.is_member("b"));
        assert!(f.engine.suspicion.is_scheduled("b"));
        assert!(f.snapshot.borrow().records.contains_key("b"));
        assert!(f.events.try_recv().is_err());

        settle().await;
        assert!(f.spread.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_alive_admission_waits_for_metadata() {
        let mut f = fixture();
        let b = peer("b", 5001);
        f.network
            .metadata_directory()
            .publish("b", Bytes::from_static(b"zone=a"));

        assert!(f
            .engine
            .update_membership(MembershipRecord::alive(b.clone(), 1), UpdateReason::Gossip));
        assert!(!f.engine.table.is_member("b"));

        complete_fetch(&mut f).await;
        let event = f.events.try_recv().unwrap();
        assert_eq!(event.kind, MembershipEventKind::Added);
        assert_eq!(event.member, b);
        assert_eq!(event.new_metadata, Some(Bytes::from_static(b"zone=a")));
        assert!(f.engine.table.is_member("b"));
        assert!(f.snapshot.borrow().members.contains_key("b"));
    }

    #[tokio::test]
    async fn test_failed_metadata_fetch_leaves_no_trace() {
        let mut f = fixture();
        let b = peer("b", 5001);

        assert!(f
            .engine
            .update_membership(MembershipRecord::alive(b.clone(), 1), UpdateReason::Sync));
        complete_fetch(&mut f).await;

        assert!(f.engine.table.get("b").is_none());
        assert!(f.events.try_recv().is_err());
        assert!(f.engine.in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_failed_metadata_fetch_is_retried_by_next_update() {
        let mut f = fixture();
        let b = peer("b", 5001);

        assert!(f
            .engine
            .update_membership(MembershipRecord::alive(b.clone(), 1), UpdateReason::Sync));
        complete_fetch(&mut f).await;
        assert!(f.events.try_recv().is_err());

        f.network
            .metadata_directory()
            .publish("b", Bytes::from_static(b"zone=a"));
        assert!(f
            .engine
            .update_membership(MembershipRecord::alive(b.clone(), 1), UpdateReason::Gossip));
        complete_fetch(&mut f).await;

        let event = f.events.try_recv().unwrap();
        assert!(event.is_added());
        assert_eq!(event.member, b);
        assert!(f.events.try_recv().is_err());
        assert_eq!(f.engine.table.get("b"), Some(&MembershipRecord::alive(b, 1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_metadata_fetch_times_out() {
        let network = LocalNetwork::new();
        let mut f = fixture_on(network, MembershipSettings::default(), Arc::new(StalledStore));
        let b = peer("b", 5001);

        assert!(f
            .engine
            .update_membership(MembershipRecord::alive(b, 1), UpdateReason::Gossip));
        let fetched = f.receivers.fetched.recv().await.unwrap();
        assert!(matches!(fetched.result, Err(MembershipError::Timeout(_))));
        f.engine.on_metadata_fetched(fetched);

        assert!(f.engine.table.get("b").is_none());
        assert!(f.engine.in_flight.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_initial_fetch_does_not_block_start() {
        let network = LocalNetwork::new();
        let mut f = fixture_on(network, MembershipSettings::default(), Arc::new(StalledStore));
        let b = peer("b", 5001);
        let (tx, mut rx) = oneshot::channel();
        f.engine.start_state = StartState::Starting {
            waiters: vec![tx],
            bootstrapped: false,
        };

        let ack = Message::new(
            b.address(),
            MembershipMessage::SyncAck(crate::transport::SyncData {
                membership: vec![MembershipRecord::alive(b, 1)],
                sync_group: "default".to_string(),
            }),
        );
        f.engine.on_bootstrap_complete(Ok(ack));
        assert_eq!(f.engine.pending_initial_fetches, 1);
        assert!(rx.try_recv().is_err());

        complete_fetch(&mut f).await;
        assert_eq!(f.engine.pending_initial_fetches, 0);
        assert!(matches!(rx.try_recv(), Ok(Ok(()))));
        assert!(matches!(f.engine.start_state, StartState::Started));
    }

    #[tokio::test]
    async fn test_metadata_change_emits_updated_once() {
        let mut f = fixture();
        let b = peer("b", 5001);
        admit(&mut f, &b, 1, b"v1").await;
        assert!(f.events.try_recv().unwrap().is_added());

        admit(&mut f, &b, 2, b"v2").await;
        let event = f.events.try_recv().unwrap();
        assert!(event.is_updated());
        assert_eq!(event.old_metadata, Some(Bytes::from_static(b"v1")));
        assert_eq!(event.new_metadata, Some(Bytes::from_static(b"v2")));

        admit(&mut f, &b, 3, b"v2").await;
        assert!(f.events.try_recv().is_err());
        assert_eq!(f.engine.table.get("b").unwrap().incarnation, 3);
    }

    #[tokio::test]
    async fn test_duplicate_alive_during_fetch_commits_once() {
        let mut f = fixture();
        let b = peer("b", 5001);
        f.network
            .metadata_directory()
            .publish("b", Bytes::from_static(b"v1"));

        let record = MembershipRecord::alive(b, 1);
        assert!(f.engine.update_membership(record.clone(), UpdateReason::Gossip));
        assert!(f.engine.update_membership(record, UpdateReason::Sync));
        complete_fetch(&mut f).await;
        complete_fetch(&mut f).await;

        assert!(f.events.try_recv().unwrap().is_added());
        assert!(f.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_self_refutation_bumps_past_candidate() {
        let mut f = fixture();
        f.engine.table.put(MembershipRecord::alive(local(), 5));

        assert!(f
            .engine
            .update_membership(MembershipRecord::suspect(local(), 5), UpdateReason::Gossip));

        let record = f.engine.table.get("local").unwrap().clone();
        assert_eq!(record, MembershipRecord::alive(local(), 6));
        assert_eq!(f.snapshot.borrow().metrics.incarnation, 6);
        assert_eq!(next_spread(&mut f).await, record);
    }

    #[tokio::test]
    async fn test_stale_record_about_self_is_rejected() {
        let mut f = fixture();
        f.engine.table.put(MembershipRecord::alive(local(), 5));

        assert!(!f
            .engine
            .update_membership(MembershipRecord::suspect(local(), 4), UpdateReason::Sync));
        assert_eq!(f.engine.table.get("local").unwrap().incarnation, 5);
    }

    #[tokio::test]
    async fn test_address_collision_is_ignored() {
        let mut f = fixture();
        let imposter = Member::with_id("imposter", local().address());

        assert!(!f
            .engine
            .update_membership(MembershipRecord::alive(imposter, 3), UpdateReason::Gossip));
        assert!(f.engine.table.get("imposter").is_none());
        assert_eq!(f.engine.table.get("local").unwrap().incarnation, 0);
    }

    #[tokio::test]
    async fn test_dead_removes_admitted_member() {
        let mut f = fixture();
        let b = peer("b", 5001);
        admit(&mut f, &b, 1, b"zone=a").await;
        assert!(f.events.try_recv().unwrap().is_added());

        assert!(f
            .engine
            .update_membership(MembershipRecord::dead(b.clone(), 0), UpdateReason::Gossip));

        let event = f.events.try_recv().unwrap();
        assert!(event.is_removed());
        assert_eq!(event.old_metadata, Some(Bytes::from_static(b"zone=a")));
        assert!(f.engine.table.get("b").is_none());
        assert_eq!(f.engine.removed.len(), 1);
        assert_eq!(f.snapshot.borrow().metrics.removed_members[0].member, b);

        settle().await;
        assert!(f.spread.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dead_for_never_admitted_member_is_silent() {
        let mut f = fixture();
        let b = peer("b", 5001);
        f.engine
            .update_membership(MembershipRecord::suspect(b.clone(), 0), UpdateReason::Gossip);

        assert!(f
            .engine
            .update_membership(MembershipRecord::dead(b, 0), UpdateReason::Gossip));
        assert!(f.engine.table.get("b").is_none());
        assert!(!f.engine.suspicion.is_scheduled("b"));
        assert!(f.events.try_recv().is_err());
        assert!(f.engine.removed.is_empty());
    }

    #[tokio::test]
    async fn test_removal_while_fetching_drops_commit() {
        let mut f = fixture();
        let b = peer("b", 5001);
        f.network
            .metadata_directory()
            .publish("b", Bytes::from_static(b"v1"));

        assert!(f
            .engine
            .update_membership(MembershipRecord::alive(b.clone(), 1), UpdateReason::Gossip));
        assert!(f
            .engine
            .update_membership(MembershipRecord::dead(b, 1), UpdateReason::Gossip));
        complete_fetch(&mut f).await;

        assert!(f.engine.table.get("b").is_none());
        assert!(f.events.try_recv().is_err());
        assert!(f.engine.in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_dead_records_without_fetches_leave_no_bookkeeping() {
        let mut f = fixture();
        for i in 0..1000 {
            let gone = peer(&format!("gone-{}", i), 6000);
            assert!(f
                .engine
                .update_membership(MembershipRecord::dead(gone, 0), UpdateReason::Sync));
        }

        assert_eq!(f.engine.table.len(), 1);
        assert!(f.engine.in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_failure_detector_suspicion_is_spread() {
        let mut f = fixture();
        let b = peer("b", 5001);
        admit(&mut f, &b, 2, b"zone=a").await;

        f.engine
            .on_failure_detector_event(FailureDetectorEvent::new(b.clone(), MemberStatus::Suspect));

        let expected = MembershipRecord::suspect(b, 2);
        assert_eq!(f.engine.table.get("b"), Some(&expected));
        assert_eq!(next_spread(&mut f).await, expected);
    }

    #[tokio::test]
    async fn test_failure_detector_alive_triggers_sync() {
        let mut f = fixture();
        let b = peer("b", 5001);
        let b_transport =
            LocalTransport::bind(f.network.clone(), b.address(), Duration::from_millis(200));
        let mut b_inbox = b_transport.listen();
        admit(&mut f, &b, 1, b"zone=a").await;
        f.engine
            .update_membership(MembershipRecord::suspect(b.clone(), 1), UpdateReason::Gossip);

        f.engine
            .on_failure_detector_event(FailureDetectorEvent::new(b, MemberStatus::Alive));

        let message = b_inbox.recv().await.unwrap();
        assert!(matches!(message.payload, MembershipMessage::Sync(_)));
        assert_eq!(message.correlation_id, None);
        assert!(f.engine.table.get("b").unwrap().is_suspect());
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspicion_timeout_promotes_to_dead() {
        let mut f = fixture();
        let b = peer("b", 5001);
        admit(&mut f, &b, 1, b"zone=a").await;
        assert!(f.events.try_recv().unwrap().is_added());

        f.engine
            .update_membership(MembershipRecord::suspect(b.clone(), 1), UpdateReason::Gossip);
        assert_eq!(
            f.engine.suspicion.timeout_for("b"),
            Some(Duration::from_secs(5))
        );

        let expired = f.receivers.expired.recv().await.unwrap();
        f.engine.on_suspicion_expired(expired);

        assert!(f.events.try_recv().unwrap().is_removed());
        assert!(f.events.try_recv().is_err());
        assert!(f.engine.table.get("b").is_none());
        assert_eq!(next_spread(&mut f).await, MembershipRecord::dead(b, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refutation_cancels_suspicion() {
        let mut f = fixture();
        let b = peer("b", 5001);
        admit(&mut f, &b, 1, b"zone=a").await;
        assert!(f.events.try_recv().unwrap().is_added());

        f.engine
            .update_membership(MembershipRecord::suspect(b.clone(), 1), UpdateReason::Gossip);
        assert!(f.engine.suspicion.is_scheduled("b"));

        admit(&mut f, &b, 2, b"zone=a").await;
        assert!(!f.engine.suspicion.is_scheduled("b"));
        assert!(f.engine.table.get("b").unwrap().is_alive());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(f.receivers.expired.try_recv().is_err());
        assert!(f.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_sync_from_other_group_is_dropped() {
        let mut f = fixture();
        let b = peer("b", 5001);
        let b_transport =
            LocalTransport::bind(f.network.clone(), b.address(), Duration::from_millis(200));
        let mut b_inbox = b_transport.listen();

        let message = Message::new(
            b.address(),
            MembershipMessage::Sync(crate::transport::SyncData {
                membership: vec![MembershipRecord::suspect(b, 0)],
                sync_group: "clusterY".to_string(),
            }),
        );
        f.engine.on_transport_message(message).unwrap();

        assert!(f.engine.table.get("b").is_none());
        settle().await;
        assert!(b_inbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_sync_is_answered_with_correlated_ack() {
        let mut f = fixture();
        let b = peer("b", 5001);
        let b_transport =
            LocalTransport::bind(f.network.clone(), b.address(), Duration::from_millis(200));
        let mut b_inbox = b_transport.listen();

        let message = Message::new(
            b.address(),
            MembershipMessage::Sync(crate::transport::SyncData {
                membership: vec![MembershipRecord::suspect(b, 0)],
                sync_group: "default".to_string(),
            }),
        )
        .with_correlation_id(Some("b-1".to_string()));
        f.engine.on_transport_message(message).unwrap();
        assert!(f.engine.table.get("b").unwrap().is_suspect());

        let ack = b_inbox.recv().await.unwrap();
        assert_eq!(ack.correlation_id.as_deref(), Some("b-1"));
        match ack.payload {
            MembershipMessage::SyncAck(data) => {
                assert_eq!(data.sync_group, "default");
                assert_eq!(data.membership.len(), 2);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_correlated_sync_ack_on_listener_is_ignored() {
        let mut f = fixture();
        let b = peer("b", 5001);
        let ack = Message::new(
            b.address(),
            MembershipMessage::SyncAck(crate::transport::SyncData {
                membership: vec![MembershipRecord::suspect(b, 0)],
                sync_group: "default".to_string(),
            }),
        );

        f.engine
            .on_transport_message(ack.clone().with_correlation_id(Some("local-9".into())))
            .unwrap();
        assert!(f.engine.table.get("b").is_none());

        f.engine.on_transport_message(ack).unwrap();
        assert!(f.engine.table.get("b").is_some());
    }

    #[tokio::test]
    async fn test_gossip_on_transport_is_an_error() {
        let mut f = fixture();
        let record = MembershipRecord::alive(peer("b", 5001), 0);
        let message = Message::new(addr(5001), MembershipMessage::Gossip(record));
        assert!(f.engine.on_transport_message(message).is_err());
    }

    #[tokio::test]
    async fn test_start_without_seeds_completes_immediately() {
        let mut f = fixture();
        let (tx, mut rx) = oneshot::channel();
        f.engine.on_start(tx);

        assert!(matches!(rx.try_recv(), Ok(Ok(()))));
        assert!(f.engine.periodic_sync);

        let (tx, mut rx) = oneshot::channel();
        f.engine.on_start(tx);
        assert!(matches!(rx.try_recv(), Ok(Ok(()))));
    }

    #[tokio::test]
    async fn test_shutdown_fails_pending_start_and_closes_events() {
        let settings = MembershipSettings::default().with_seeds([addr(5001)]);
        let mut f = fixture_with(settings);
        let (tx, rx) = oneshot::channel();
        f.engine.on_start(tx);
        assert!(f.engine.bootstrap_task.is_some());

        f.engine.shutdown();

        assert!(matches!(rx.await, Ok(Err(MembershipError::Stopped))));
        assert!(f.events.recv().await.is_none());
        assert!(!f.engine.periodic_sync);
    }
}
