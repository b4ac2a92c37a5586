//! Snapshot lock races.
//!
//! The locked flag is checked inside the table's write lock, so a write that
//! races a lock either lands entirely before it or is rejected. These tests
//! hammer that window with real threads.

use std::sync::Barrier;

use lock_tests::{descriptor, TenantWorld};
use mrv_audit::error::AuditError;
use mrv_audit::snapshot::{LockOutcome, Snapshot, SnapshotRequest};
use serde_json::json;

const ROUNDS: usize = 200;

fn fresh(world: &TenantWorld) -> Snapshot {
    world
        .snapshots
        .create_snapshot(
            &world.consultant,
            SnapshotRequest {
                facility_id: Some(world.f1),
                engine_version: "cbam-engine/1.0.0".into(),
                replay: descriptor(),
                input: json!({"qty": 1}),
                result: json!({"tco2": 0.002}),
                previous_snapshot_hash: None,
                lock_after_create: false,
            },
        )
        .unwrap()
}

#[test]
fn concurrent_locks_agree_on_one_winner() {
    let world = TenantWorld::default();
    for _ in 0..ROUNDS / 10 {
        let snapshot = fresh(&world);
        let barrier = Barrier::new(8);
        let (barrier, world, id) = (&barrier, &world, snapshot.id);
        let outcomes: Vec<LockOutcome> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(move || {
                        barrier.wait();
                        world.snapshots.lock(&world.consultant, id).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(
            outcomes.iter().filter(|o| **o == LockOutcome::Locked).count(),
            1,
            "{outcomes:?}"
        );
        let stored = world.snapshots.get(&world.consultant, snapshot.id).unwrap();
        assert!(stored.locked);
        assert_eq!(stored.locked_by, Some(world.consultant.user_id));
    }
}

#[test]
fn update_racing_lock_never_lands_after_it() {
    let world = TenantWorld::default();
    let mut landed = 0;
    let mut rejected = 0;
    for round in 0..ROUNDS {
        let snapshot = fresh(&world);
        let version = format!("cbam-engine/1.0.{round}");
        let barrier = Barrier::new(2);
        let update = std::thread::scope(|s| {
            let locker = s.spawn(|| {
                barrier.wait();
                world.snapshots.lock(&world.admin, snapshot.id).unwrap()
            });
            let writer = s.spawn(|| {
                barrier.wait();
                world
                    .snapshots
                    .update_engine_version(&world.consultant, snapshot.id, &version)
            });
            assert_eq!(locker.join().unwrap(), LockOutcome::Locked);
            writer.join().unwrap()
        });

        let stored = world.snapshots.get(&world.consultant, snapshot.id).unwrap();
        assert!(stored.locked);
        match update {
            Ok(written) => {
                landed += 1;
                assert!(!written.locked, "write landed on a locked row");
                assert_eq!(stored.engine_version, version);
            }
            Err(AuditError::ImmutableViolation { .. }) => {
                rejected += 1;
                assert_eq!(stored.engine_version, "cbam-engine/1.0.0");
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
        assert_eq!(stored.input_hash(), snapshot.input_hash());
        assert_eq!(stored.record_hash().unwrap(), {
            let mut expected = snapshot.clone();
            expected.engine_version.clone_from(&stored.engine_version);
            expected.record_hash().unwrap()
        });
    }
    assert_eq!(landed + rejected, ROUNDS);
}

#[test]
fn delete_racing_lock_is_all_or_nothing() {
    let world = TenantWorld::default();
    for _ in 0..ROUNDS {
        let snapshot = fresh(&world);
        let barrier = Barrier::new(2);
        let (locked, deleted) = std::thread::scope(|s| {
            let locker = s.spawn(|| {
                barrier.wait();
                world.snapshots.lock(&world.consultant, snapshot.id)
            });
            let deleter = s.spawn(|| {
                barrier.wait();
                world.snapshots.delete(&world.consultant, snapshot.id)
            });
            (locker.join().unwrap(), deleter.join().unwrap())
        });
        match (locked, deleted) {
            // Delete won: the lock found nothing.
            (Err(AuditError::NotFound { .. }), Ok(())) => {
                assert!(world.snapshots.get(&world.consultant, snapshot.id).is_err());
            }
            // Lock won: the delete was refused and the row survives locked.
            (Ok(LockOutcome::Locked), Err(AuditError::ImmutableViolation { .. })) => {
                assert!(world.snapshots.get(&world.consultant, snapshot.id).unwrap().locked);
            }
            other => panic!("torn outcome: {other:?}"),
        }
    }
}

#[test]
fn locked_snapshot_cannot_be_unlocked_through_any_path() {
    let world = TenantWorld::default();
    let snapshot = fresh(&world);
    world.snapshots.lock(&world.consultant, snapshot.id).unwrap();
    for ctx in [&world.consultant, &world.admin] {
        let err = world
            .snapshots
            .replace(ctx, snapshot.id, |s| {
                s.locked = false;
                s.locked_by = None;
            })
            .unwrap_err();
        assert!(matches!(err, AuditError::ImmutableViolation { .. }));
        assert!(world
            .snapshots
            .set_shared_with_client(ctx, snapshot.id, true)
            .is_err());
    }
    let stored = world.snapshots.get(&world.admin, snapshot.id).unwrap();
    assert!(stored.locked);
    assert!(!stored.shared_with_client);
}
