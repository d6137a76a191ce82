/// Commands sent from the protocol handle to the membership engine.
use tokio::sync::oneshot;

use crate::error::Result;
use crate::member::MembershipRecord;

/// Where a candidate record came from. Decides whether an accepted update is
/// spread further through gossip.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UpdateReason {
    FailureDetector,
    Gossip,
    Sync,
    InitialSync,
    SuspicionTimeout,
}

impl UpdateReason {
    /// Gossip and sync senders already know the record
    pub fn spreads_gossip(&self) -> bool {
        match self {
            UpdateReason::FailureDetector | UpdateReason::SuspicionTimeout => true,
            UpdateReason::Gossip | UpdateReason::Sync | UpdateReason::InitialSync => false,
        }
    }
}

impl std::fmt::Display for UpdateReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateReason::FailureDetector => write!(f, "FAILURE_DETECTOR_EVENT"),
            UpdateReason::Gossip => write!(f, "MEMBERSHIP_GOSSIP"),
            UpdateReason::Sync => write!(f, "SYNC"),
            UpdateReason::InitialSync => write!(f, "INITIAL_SYNC"),
            UpdateReason::SuspicionTimeout => write!(f, "SUSPICION_TIMEOUT"),
        }
    }
}

#[derive(Debug)]
pub enum MembershipCommand {
    /// Bootstrap sync with the seeds, then schedule the periodic sync
    Start {
        resp_chan: oneshot::Sender<Result<()>>,
    },
    /// Bump the local incarnation and gossip the new local record
    UpdateIncarnation {
        resp_chan: oneshot::Sender<Result<()>>,
    },
    /// Gossip a DEAD record for the local member
    LeaveCluster {
        resp_chan: oneshot::Sender<Result<()>>,
    },
    /// Run a candidate record through conflict resolution
    UpdateMembership {
        record: MembershipRecord,
        reason: UpdateReason,
        resp_chan: oneshot::Sender<bool>,
    },
    /// Dispose timers and listeners, close the event stream
    Stop { resp_chan: oneshot::Sender<()> },
}
