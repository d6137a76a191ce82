//! Read-only membership metrics and the snapshot published after every mutation
use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::table::MembershipTable;
use crate::member::{Member, MembershipRecord};

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct RemovedMember {
    pub member: Member,
    pub removed_at: DateTime<Utc>,
}

/// Bounded FIFO of the most recent removals
#[derive(Clone, Debug)]
pub struct RemovedHistory {
    capacity: usize,
    entries: VecDeque<RemovedMember>,
}

impl RemovedHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, member: Member, removed_at: DateTime<Utc>) {
        if self.capacity == 0 {
            return;
        }
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(RemovedMember { member, removed_at });
    }

    pub fn to_vec(&self) -> Vec<RemovedMember> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct MembershipMetrics {
    pub incarnation: u64,
    pub alive_members: Vec<String>,
    pub suspected_members: Vec<String>,
    pub removed_members: Vec<RemovedMember>,
}

impl MembershipMetrics {
    pub fn collect(
        table: &MembershipTable,
        local_member: &Member,
        removed: &RemovedHistory,
    ) -> Self {
        let mut alive_members = Vec::new();
        let mut suspected_members = Vec::new();
        for record in table.records() {
            if record.is_alive() {
                alive_members.push(record.member.to_string());
            } else if record.is_suspect() {
                suspected_members.push(record.member.to_string());
            }
        }
        alive_members.sort();
        suspected_members.sort();

        Self {
            incarnation: table
                .get(local_member.id())
                .map(|r| r.incarnation)
                .unwrap_or_default(),
            alive_members,
            suspected_members,
            removed_members: removed.to_vec(),
        }
    }

    pub fn alive_count(&self) -> usize {
        self.alive_members.len()
    }

    pub fn suspected_count(&self) -> usize {
        self.suspected_members.len()
    }

    pub fn removed_count(&self) -> usize {
        self.removed_members.len()
    }
}

/// Copy of the engine state readable without going through the engine loop
#[derive(Clone, Debug, Default)]
pub struct MembershipSnapshot {
    pub members: HashMap<String, Member>,
    pub records: HashMap<String, MembershipRecord>,
    pub metrics: MembershipMetrics,
}

impl MembershipSnapshot {
    pub fn capture(
        table: &MembershipTable,
        local_member: &Member,
        removed: &RemovedHistory,
    ) -> Self {
        Self {
            members: table.members_map(),
            records: table.records_map(),
            metrics: MembershipMetrics::collect(table, local_member, removed),
        }
    }
}
