//! SWIM-style cluster membership
//!
//! Every member keeps a versioned record per known member and converges with
//! the rest of the cluster through gossip, anti-entropy sync and suspicion
//! timeouts. Network access, failure detection, broadcast and metadata are
//! pluggable through the traits in [`transport`]; [`sim`] wires them together
//! in-process.
pub mod cli;
pub mod error;
pub mod member;
pub mod membership;
pub mod settings;
pub mod sim;
pub mod transport;

pub use error::{MembershipError, Result};
pub use member::{Member, MemberStatus, MembershipRecord};
pub use membership::{MembershipEvent, MembershipProtocol, UpdateReason};
pub use settings::MembershipSettings;
