//! Member identity and versioned membership records
use std::net::SocketAddr;

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// Immutable identity of a cluster member
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq, Hash, Decode, Encode)]
pub struct Member {
    id: String,
    address: SocketAddr,
}

impl Member {
    /// Create a member with a freshly generated id
    pub fn new(address: SocketAddr) -> Self {
        Self::with_id(generate_member_id(), address)
    }

    pub fn with_id(id: impl Into<String>, address: SocketAddr) -> Self {
        Self {
            id: id.into(),
            address,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }
}

impl std::fmt::Display for Member {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.id, self.address)
    }
}

/// Random 63-bit id rendered as hex
pub fn generate_member_id() -> String {
    format!("{:x}", rand::random::<u64>() & (i64::MAX as u64))
}

/// Member status in the membership lifecycle
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash, Decode, Encode)]
pub enum MemberStatus {
    Alive,
    Suspect,
    Dead,
}

impl std::fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemberStatus::Alive => write!(f, "ALIVE"),
            MemberStatus::Suspect => write!(f, "SUSPECT"),
            MemberStatus::Dead => write!(f, "DEAD"),
        }
    }
}

/// Versioned membership fact about one member
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq, Decode, Encode)]
pub struct MembershipRecord {
    pub member: Member,
    pub status: MemberStatus,
    pub incarnation: u64,
}

impl MembershipRecord {
    pub fn new(member: Member, status: MemberStatus, incarnation: u64) -> Self {
        Self {
            member,
            status,
            incarnation,
        }
    }

    pub fn alive(member: Member, incarnation: u64) -> Self {
        Self::new(member, MemberStatus::Alive, incarnation)
    }

    pub fn suspect(member: Member, incarnation: u64) -> Self {
        Self::new(member, MemberStatus::Suspect, incarnation)
    }

    pub fn dead(member: Member, incarnation: u64) -> Self {
        Self::new(member, MemberStatus::Dead, incarnation)
    }

    pub fn id(&self) -> &str {
        self.member.id()
    }

    pub fn address(&self) -> SocketAddr {
        self.member.address()
    }

    pub fn is_alive(&self) -> bool {
        self.status == MemberStatus::Alive
    }

    pub fn is_suspect(&self) -> bool {
        self.status == MemberStatus::Suspect
    }

    pub fn is_dead(&self) -> bool {
        self.status == MemberStatus::Dead
    }

    /// Same fact about another status: keeps member and incarnation
    pub fn with_status(&self, status: MemberStatus) -> Self {
        Self::new(self.member.clone(), status, self.incarnation)
    }

    /// Whether this candidate record replaces `current`.
    ///
    /// DEAD beats any live status regardless of incarnation. Otherwise the higher
    /// incarnation wins, and at equal incarnation only SUSPECT over ALIVE is
    /// accepted: clearing a suspicion requires the member to bump its own
    /// incarnation.
    pub fn overrides(&self, current: Option<&MembershipRecord>) -> bool {
        let current = match current {
            None => return true,
            Some(current) => current,
        };
        if self.is_dead() {
            return !current.is_dead();
        }
        if current.is_dead() {
            return false;
        }
        if self.incarnation != current.incarnation {
            return self.incarnation > current.incarnation;
        }
        self.is_suspect() && current.is_alive()
    }
}

impl std::fmt::Display for MembershipRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{{m: {}, s: {}, inc: {}}}",
            self.member, self.status, self.incarnation
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member() -> Member {
        Member::with_id("a1", "127.0.0.1:4801".parse().unwrap())
    }

    #[test]
    fn test_unknown_member_is_always_overridden() {
        let r1 = MembershipRecord::suspect(member(), 0);
        assert!(r1.overrides(None));
        assert!(MembershipRecord::dead(member(), 0).overrides(None));
    }

    #[test]
    fn test_dead_dominates_higher_incarnation() {
        let r0 = MembershipRecord::alive(member(), 10);
        let r1 = MembershipRecord::dead(member(), 2);
        assert!(r1.overrides(Some(&r0)));
        assert!(!r0.overrides(Some(&r1)));
    }

    #[test]
    fn test_dead_does_not_override_dead() {
        let r0 = MembershipRecord::dead(member(), 1);
        let r1 = MembershipRecord::dead(member(), 7);
        assert!(!r1.overrides(Some(&r0)));
        assert!(!r0.overrides(Some(&r1)));
    }

    #[test]
    fn test_incarnation_ordering() {
        let r0 = MembershipRecord::suspect(member(), 3);
        let r1 = MembershipRecord::alive(member(), 4);
        assert!(r1.overrides(Some(&r0)));
        assert!(!r0.overrides(Some(&r1)));
    }

    #[test]
    fn test_equal_incarnation_suspect_beats_alive_only() {
        let alive = MembershipRecord::alive(member(), 5);
        let suspect = MembershipRecord::suspect(member(), 5);
        assert!(suspect.overrides(Some(&alive)));
        assert!(!alive.overrides(Some(&suspect)));
        assert!(!alive.overrides(Some(&alive.clone())));
        assert!(!suspect.overrides(Some(&suspect.clone())));
    }

    #[test]
    fn test_generated_ids_are_hex_and_distinct() {
        let addr: SocketAddr = "127.0.0.1:4801".parse().unwrap();
        let a = Member::new(addr);
        let b = Member::new(addr);
        assert_ne!(a, b);
        assert!(a.id().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(format!("{}", member()), "a1@127.0.0.1:4801");
    }
}
