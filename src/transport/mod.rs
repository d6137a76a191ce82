//! Transport Module
//!
//! Wire messages for membership traffic and the collaborator traits the
//! membership engine consumes (transport, failure detector, gossip, metadata).

pub mod messages;
pub mod traits;

pub use messages::{Message, MembershipMessage, SyncData};
pub use traits::{FailureDetector, FailureDetectorEvent, GossipProtocol, MetadataStore, Transport};

/// Buffer size of listener channels handed out by transports and detectors
pub const LISTENER_CHANNEL_CAPACITY: usize = 1024;
