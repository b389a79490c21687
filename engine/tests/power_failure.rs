//! Power-failure simulation.
//!
//! A single data directory is crashed over and over. Every round boots a
//! store from whatever the previous crash left on disk, checks that the
//! recovered state is exactly one of the two legal outcomes, arms a random
//! crash point and dies in the middle of a random transfer.
//!
//! Legal outcomes: a crash before the rename leaves the state as it was, a
//! crash after it leaves the full transfer. Anything in between is a bug.

use std::collections::BTreeMap;
use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use verity_engine::config::is_temp_file_name;
use verity_engine::{
    Conserved, CrashPoint, EngineConfig, EngineError, MerkleTree, StateStore, StateTransition,
    Value, WalOptions,
};

const INJECTIONS: usize = 1_000;
const ACCOUNTS: [&str; 4] = ["alice", "bob", "carol", "dave"];
const TOTAL: i64 = 4_000;

fn genesis() -> BTreeMap<String, Value> {
    ACCOUNTS
        .iter()
        .map(|a| (a.to_string(), Value::account(TOTAL / ACCOUNTS.len() as i64)))
        .collect()
}

fn random_transfer(rng: &mut StdRng, state: &BTreeMap<String, Value>) -> StateTransition {
    let from = ACCOUNTS[rng.gen_range(0..ACCOUNTS.len())];
    let to = loop {
        let candidate = ACCOUNTS[rng.gen_range(0..ACCOUNTS.len())];
        if candidate != from {
            break candidate;
        }
    };
    let from_balance = state.get(from).conserved_amount() as i64;
    let to_balance = state.get(to).conserved_amount() as i64;
    let amount = rng.gen_range(0..=from_balance);
    StateTransition::new()
        .with(from, Value::account(from_balance - amount))
        .with(to, Value::account(to_balance + amount))
}

fn leftover_temp_files(state_dir: &Path) -> usize {
    std::fs::read_dir(state_dir)
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_str().is_some_and(is_temp_file_name))
        .count()
}

fn crash_repeatedly(config: EngineConfig, injections: usize, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut expected = genesis();
    {
        let mut store = StateStore::open(config.clone()).unwrap();
        let root = MerkleTree::from_entries(expected.clone()).get_root_hash();
        assert!(store.sync_from_peer(&root, expected.clone()).unwrap());
    }

    let mut hits = [0usize; CrashPoint::ALL.len()];
    for round in 0..injections {
        let mut store = StateStore::open(config.clone()).unwrap();

        let report = store.recovery_report().clone();
        assert!(report.recovered, "round {round}: {:?}", report.errors);
        assert!(report.merkle_root_verified, "round {round}");
        assert_eq!(leftover_temp_files(&config.state_dir), 0, "round {round}");
        assert_eq!(store.get_state_snapshot(), expected, "round {round}: partial state");
        assert_eq!(store.total_value(), TOTAL as i128, "round {round}");

        // some rounds commit cleanly so the state keeps moving
        if rng.gen_bool(0.25) {
            let transfer = random_transfer(&mut rng, &expected);
            store.apply_state_transition(&transfer).unwrap();
            expected.extend(transfer.into_changes());
        }

        let which = rng.gen_range(0..CrashPoint::ALL.len());
        let point = CrashPoint::ALL[which];
        let transfer = random_transfer(&mut rng, &expected);

        store.commit_layer_mut().set_crash_point(Some(point));
        let err = store.apply_state_transition(&transfer).unwrap_err();
        assert!(
            matches!(err, EngineError::SimulatedCrash(p) if p == point),
            "round {round}: {err}"
        );
        hits[which] += 1;

        if point.is_past_rename() {
            expected.extend(transfer.into_changes());
        }
        // power is gone: nothing after this point runs
        drop(store);
    }

    for (point, count) in CrashPoint::ALL.iter().zip(hits) {
        assert!(count > 0, "{point:?} was never exercised");
    }

    let store = StateStore::open(config).unwrap();
    assert!(store.is_operational());
    assert_eq!(store.get_state_snapshot(), expected);
}

#[test]
fn thousand_random_crashes_never_leave_partial_state() {
    let dir = tempfile::tempdir().unwrap();
    crash_repeatedly(EngineConfig::in_dir(dir.path()), INJECTIONS, 0x00c0_ffee);
}

#[test]
fn batched_wal_is_equally_crash_safe() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        wal: WalOptions {
            batch_size: 8,
            async_fsync: false,
        },
        ..EngineConfig::in_dir(dir.path())
    };
    crash_repeatedly(config, 200, 42);
}

#[test]
fn async_fsync_keeps_state_file_all_or_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        wal: WalOptions {
            batch_size: 1,
            async_fsync: true,
        },
        ..EngineConfig::in_dir(dir.path())
    };
    crash_repeatedly(config, 200, 7);
}

#[test]
fn crash_during_first_commit_recovers_to_empty_genesis() {
    for point in CrashPoint::ALL {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::in_dir(dir.path());
        {
            let mut store = StateStore::open(config.clone()).unwrap();
            store.commit_layer_mut().set_crash_point(Some(point));
            let t = StateTransition::new().with("memo", Value::Number(0));
            assert!(store.apply_state_transition(&t).is_err());
        }

        let store = StateStore::open(config).unwrap();
        assert!(store.is_operational(), "{point:?}");
        let snapshot = store.get_state_snapshot();
        if point.is_past_rename() {
            assert_eq!(snapshot.len(), 1, "{point:?}");
            assert_eq!(store.recovery_report().completed_transactions, 1);
        } else {
            assert!(snapshot.is_empty(), "{point:?}");
            assert_eq!(store.transition_count(), 0);
        }
    }
}
