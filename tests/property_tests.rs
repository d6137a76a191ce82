use std::time::Duration;

use murmur::member::{Member, MemberStatus, MembershipRecord};
use murmur::membership::suspicion::suspicion_timeout;
use proptest::prelude::*;

fn member() -> Member {
    Member::with_id("m1", "127.0.0.1:4801".parse().unwrap())
}

fn status() -> impl Strategy<Value = MemberStatus> {
    prop_oneof![
        Just(MemberStatus::Alive),
        Just(MemberStatus::Suspect),
        Just(MemberStatus::Dead),
    ]
}

fn record() -> impl Strategy<Value = MembershipRecord> {
    (status(), 0u64..16).prop_map(|(status, incarnation)| {
        MembershipRecord::new(member(), status, incarnation)
    })
}

proptest! {
    #[test]
    fn test_conflict_rule_is_antisymmetric(r0 in record(), r1 in record()) {
        // at most one direction wins; ties reject both
        prop_assert!(!(r1.overrides(Some(&r0)) && r0.overrides(Some(&r1))));
    }

    #[test]
    fn test_conflict_rule_matches_ordering(r0 in record(), r1 in record()) {
        let expected = if r1.is_dead() {
            !r0.is_dead()
        } else if r0.is_dead() {
            false
        } else if r1.incarnation != r0.incarnation {
            r1.incarnation > r0.incarnation
        } else {
            r1.is_suspect() && r0.is_alive()
        };
        prop_assert_eq!(r1.overrides(Some(&r0)), expected);
    }

    #[test]
    fn test_dead_dominates_live_records(r0 in record(), incarnation in 0u64..16) {
        prop_assume!(!r0.is_dead());
        let r1 = MembershipRecord::dead(member(), incarnation);
        prop_assert!(r1.overrides(Some(&r0)));
        prop_assert!(!r0.overrides(Some(&r1)));
    }

    #[test]
    fn test_unknown_member_accepts_anything(r1 in record()) {
        prop_assert!(r1.overrides(None));
    }

    #[test]
    fn test_record_never_overrides_itself(r0 in record()) {
        prop_assert!(!r0.overrides(Some(&r0.clone())));
    }

    #[test]
    fn test_suspicion_timeout_grows_with_cluster(
        mult in 1u32..10,
        size in 1usize..10_000,
        ping_ms in 1u64..5_000
    ) {
        let ping = Duration::from_millis(ping_ms);
        let smaller = suspicion_timeout(mult, size, ping);
        let larger = suspicion_timeout(mult, size * 2, ping);
        prop_assert!(smaller <= larger);
        prop_assert!(smaller >= ping * mult);
        prop_assert!(suspicion_timeout(mult + 1, size, ping) > smaller);
    }
}
