//! Membership table: one record per member id, plus the members view
use std::collections::HashMap;
use std::net::SocketAddr;

use crate::member::{Member, MembershipRecord};

/// Latest accepted record for every known member.
///
/// The members view only holds members admitted through an ALIVE record with
/// resolved metadata; a member first seen as SUSPECT has a record but no view
/// entry until it is admitted.
#[derive(Clone, Debug, Default)]
pub struct MembershipTable {
    records: HashMap<String, MembershipRecord>,
    members: HashMap<String, Member>,
}

impl MembershipTable {
    /// Table seeded with the local member, ALIVE at incarnation 0
    pub fn new(local_member: &Member) -> Self {
        let mut table = Self::default();
        table.admit(MembershipRecord::alive(local_member.clone(), 0));
        table
    }

    pub fn get(&self, id: &str) -> Option<&MembershipRecord> {
        self.records.get(id)
    }

    /// Store a record without touching the members view
    pub fn put(&mut self, record: MembershipRecord) -> Option<MembershipRecord> {
        self.records.insert(record.id().to_string(), record)
    }

    /// Store a record and add its member to the view.
    /// Returns true if the member was already in the view.
    pub fn admit(&mut self, record: MembershipRecord) -> bool {
        let id = record.id().to_string();
        let known = self
            .members
            .insert(id.clone(), record.member.clone())
            .is_some();
        self.records.insert(id, record);
        known
    }

    /// Drop the record and the view entry; returns the member if it had been admitted
    pub fn remove(&mut self, id: &str) -> Option<Member> {
        self.records.remove(id);
        self.members.remove(id)
    }

    pub fn is_member(&self, id: &str) -> bool {
        self.members.contains_key(id)
    }

    pub fn member(&self, id: &str) -> Option<&Member> {
        self.members.get(id)
    }

    pub fn member_by_address(&self, address: SocketAddr) -> Option<&Member> {
        self.members.values().find(|m| m.address() == address)
    }

    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    pub fn records(&self) -> impl Iterator<Item = &MembershipRecord> {
        self.records.values()
    }

    /// Number of records, SUSPECT-only entries included
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn members_map(&self) -> HashMap<String, Member> {
        self.members.clone()
    }

    pub fn records_map(&self) -> HashMap<String, MembershipRecord> {
        self.records.clone()
    }
}
