//! Membership Module
//!
//! SWIM-style cluster membership: the versioned membership table, suspicion
//! timers, anti-entropy sync, and the engine that serializes every update.

pub mod commands;
mod engine;
pub mod events;
pub mod metrics;
pub mod protocol;
pub mod suspicion;
pub mod sync;
pub mod table;

pub use commands::UpdateReason;
pub use events::{EventHub, MembershipEvent, MembershipEventKind};
pub use metrics::{MembershipMetrics, RemovedMember};
pub use protocol::MembershipProtocol;
pub use table::MembershipTable;
