//! Grace coordinator scenarios against a seeded cluster store.

use std::sync::Arc;

use harborfs_grace::member::{ENFORCING, NEED_GRACE};
use harborfs_grace::{
    GraceConfig, GraceCoordinator, GraceError, GraceStore, MemberFlags, MemoryGraceStore,
};

/// Seeds a grace object with explicit epochs and member flag bytes.
fn seeded_store(current: u64, reclaim: u64, members: &[(&str, u8)]) -> Arc<MemoryGraceStore> {
    let store = Arc::new(MemoryGraceStore::new());
    let mut blob = Vec::with_capacity(16);
    blob.extend_from_slice(&current.to_le_bytes());
    blob.extend_from_slice(&reclaim.to_le_bytes());
    store.create_if_absent("grace", &blob).unwrap();
    let set: Vec<(String, u8)> = members
        .iter()
        .map(|(id, flags)| ((*id).to_string(), *flags))
        .collect();
    store.update_members("grace", &set, &[], 1).unwrap();
    store
}

fn coordinator(store: Arc<MemoryGraceStore>) -> GraceCoordinator {
    GraceCoordinator::new(store, &GraceConfig::default())
}

fn flags_of(store: &MemoryGraceStore, member: &str) -> MemberFlags {
    let (_, members, _) = store.read_with_members("grace").unwrap();
    MemberFlags(members[member])
}

mod join_lift_round_trip {
    use super::*;

    #[test]
    fn test_join_advances_epochs_and_lift_restores() {
        let store = seeded_store(5, 0, &[("A", ENFORCING), ("B", ENFORCING)]);
        let grace = coordinator(store.clone());

        let joined = grace.join(&["A", "B"], true).unwrap();
        assert_eq!(joined.current, 6);
        assert_eq!(joined.reclaim, 5);
        assert_eq!(flags_of(&store, "A"), MemberFlags(NEED_GRACE | ENFORCING));
        assert_eq!(flags_of(&store, "B"), MemberFlags(NEED_GRACE | ENFORCING));

        let lifted = grace.lift(&["A", "B"], false).unwrap();
        assert_eq!(lifted.current, 6);
        assert_eq!(lifted.reclaim, 0);
        assert_eq!(flags_of(&store, "A"), MemberFlags(ENFORCING));
        assert_eq!(flags_of(&store, "B"), MemberFlags(ENFORCING));
    }

    #[test]
    fn test_repeat_join_is_epoch_noop() {
        let store = seeded_store(5, 0, &[("A", ENFORCING), ("B", ENFORCING)]);
        let grace = coordinator(store);

        grace.join(&["A", "B"], true).unwrap();
        let again = grace.join(&["A"], true).unwrap();
        assert_eq!(again.current, 6);
        assert_eq!(again.reclaim, 5);
    }
}

mod lift_refusal {
    use super::*;

    #[test]
    fn test_lift_refused_while_member_not_enforcing() {
        // B never started enforcing the active grace period.
        let store = seeded_store(6, 5, &[("A", NEED_GRACE | ENFORCING), ("B", NEED_GRACE)]);
        let grace = coordinator(store.clone());

        assert!(matches!(
            grace.lift(&["A", "B"], false),
            Err(GraceError::NotEnforcing)
        ));

        // The object is untouched.
        let epochs = grace.epochs().unwrap();
        assert_eq!(epochs.current, 6);
        assert_eq!(epochs.reclaim, 5);
        assert_eq!(flags_of(&store, "A"), MemberFlags(NEED_GRACE | ENFORCING));
        assert_eq!(flags_of(&store, "B"), MemberFlags(NEED_GRACE));
        assert_eq!(store.notify_count(), 0);
    }

    #[test]
    fn test_lift_allowed_once_straggler_enforces() {
        let store = seeded_store(6, 5, &[("A", NEED_GRACE | ENFORCING), ("B", NEED_GRACE)]);
        let grace = coordinator(store);

        grace.enforcing_toggle(&["B"], true).unwrap();
        let lifted = grace.lift(&["A", "B"], false).unwrap();
        assert_eq!(lifted.reclaim, 0);
    }
}

mod membership {
    use super::*;

    #[test]
    fn test_cluster_bootstrap_round_trip() {
        let store: Arc<MemoryGraceStore> = Arc::new(MemoryGraceStore::new());
        let grace = coordinator(store);

        grace.create().unwrap();
        grace.add(&["replica-a", "replica-b", "replica-c"]).unwrap();
        grace
            .member_check(&["replica-a", "replica-b", "replica-c"])
            .unwrap();
        grace.enforcing_check("replica-a").unwrap();

        // A decommissioned replica leaves through a removing lift.
        grace.join(&["replica-c"], true).unwrap();
        let epochs = grace.lift(&["replica-c"], true).unwrap();
        assert_eq!(epochs.reclaim, 0);
        assert!(matches!(
            grace.member_check(&["replica-c"]),
            Err(GraceError::NoSuchMember { .. })
        ));
        grace.member_check(&["replica-a", "replica-b"]).unwrap();
    }

    #[test]
    fn test_dump_lists_members_with_flags() {
        let store = seeded_store(6, 5, &[("A", NEED_GRACE | ENFORCING), ("B", ENFORCING)]);
        let grace = coordinator(store);

        let mut out = Vec::new();
        grace.dump(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("cur=6 rec=5\n"));
        assert!(text.contains("A\tNE\n"));
        assert!(text.contains("B\t E\n"));
    }
}
