//! Membership events and the multi-subscriber event stream
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::member::Member;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MembershipEventKind {
    Added,
    Removed,
    Updated,
}

impl std::fmt::Display for MembershipEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MembershipEventKind::Added => write!(f, "ADDED"),
            MembershipEventKind::Removed => write!(f, "REMOVED"),
            MembershipEventKind::Updated => write!(f, "UPDATED"),
        }
    }
}

/// Externally visible membership change: join, leave, or metadata update
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MembershipEvent {
    pub kind: MembershipEventKind,
    pub member: Member,
    pub old_metadata: Option<Bytes>,
    pub new_metadata: Option<Bytes>,
    pub timestamp: DateTime<Utc>,
}

impl MembershipEvent {
    pub fn added(member: Member, metadata: Bytes) -> Self {
        Self::new(MembershipEventKind::Added, member, None, Some(metadata))
    }

    pub fn removed(member: Member, metadata: Option<Bytes>) -> Self {
        Self::new(MembershipEventKind::Removed, member, metadata, None)
    }

    pub fn updated(member: Member, old_metadata: Option<Bytes>, new_metadata: Bytes) -> Self {
        Self::new(
            MembershipEventKind::Updated,
            member,
            old_metadata,
            Some(new_metadata),
        )
    }

    fn new(
        kind: MembershipEventKind,
        member: Member,
        old_metadata: Option<Bytes>,
        new_metadata: Option<Bytes>,
    ) -> Self {
        Self {
            kind,
            member,
            old_metadata,
            new_metadata,
            timestamp: Utc::now(),
        }
    }

    pub fn is_added(&self) -> bool {
        self.kind == MembershipEventKind::Added
    }

    pub fn is_removed(&self) -> bool {
        self.kind == MembershipEventKind::Removed
    }

    pub fn is_updated(&self) -> bool {
        self.kind == MembershipEventKind::Updated
    }
}

impl std::fmt::Display for MembershipEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "MembershipEvent{{{} {} at {}}}",
            self.kind,
            self.member,
            self.timestamp.to_rfc3339()
        )
    }
}

#[derive(Debug, Default)]
struct HubState {
    subscribers: Vec<mpsc::UnboundedSender<MembershipEvent>>,
    closed: bool,
}

/// Ordered fan-out of membership events.
///
/// Each subscriber gets its own unbounded queue, so a slow consumer buffers
/// instead of losing events. Closing drops every sender, ending all streams.
#[derive(Clone, Debug, Default)]
pub struct EventHub {
    state: Arc<Mutex<HubState>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events emitted from now on. After close the stream ends immediately.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<MembershipEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        if !state.closed {
            state.subscribers.push(tx);
        }
        rx
    }

    pub fn publish(&self, event: MembershipEvent) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state
            .subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    /// Complete every stream; later calls are no-ops
    pub fn close(&self) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.closed = true;
        state.subscribers.clear();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }
}
