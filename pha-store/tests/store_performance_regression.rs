// Allow expect/unwrap in test code
#![allow(clippy::expect_used, clippy::unwrap_used)]

//! Performance regression tests for the change-log store.
//!
//! These are coarse wall-clock sanity checks, not micro-benchmarks --
//! `cargo bench --bench store_performance` (in this crate) is the
//! authoritative benchmark. This suite exists to catch a store change
//! that makes a bulk Apply session or a history page pathologically
//! slow (e.g. an accidental full-table scan) before it reaches review.

use chrono::Utc;
use pha_protocol::change::{ChangeOperation, ChangeRecord};
use pha_protocol::sysinfo::SystemInfo;
use pha_store::Store;
use std::time::Instant;
use tempfile::TempDir;
use uuid::Uuid;

fn system_info() -> SystemInfo {
    SystemInfo {
        build_number: 22621,
        version_string: "10.0.22621".to_string(),
        sku_name: "Professional".to_string(),
        domain_joined: false,
        mdm_managed: false,
        tamper_protection_enabled: true,
    }
}

fn change(snapshot_id: Uuid, policy_id: &str) -> ChangeRecord {
    ChangeRecord {
        change_id: Uuid::new_v4(),
        policy_id: policy_id.to_string(),
        snapshot_id,
        operation: ChangeOperation::Apply,
        applied_at: Utc::now(),
        mechanism_tag: "registry".to_string(),
        description: "regression test change".to_string(),
        previous_state: "{\"value\":0}".to_string(),
        new_state: "{\"value\":1}".to_string(),
        success: true,
        error_message: None,
    }
}

#[test]
fn bulk_apply_session_completes_within_budget() {
    let dir = TempDir::new().expect("tempdir");
    let store = Store::open(&dir.path().join("store.db")).expect("open store");
    let snapshot = store
        .create_snapshot(Some("regression".to_string()), &system_info(), None)
        .expect("create snapshot");

    let start = Instant::now();
    for i in 0..200 {
        store
            .record_change(&change(snapshot.snapshot_id, &format!("tel-{i:03}")))
            .expect("record change");
    }
    let elapsed = start.elapsed();

    assert!(
        elapsed.as_millis() < 5_000,
        "journaling 200 changes in one snapshot took {elapsed:?}, expected < 5s"
    );
}

#[test]
fn history_paging_stays_fast_with_thousands_of_rows() {
    let dir = TempDir::new().expect("tempdir");
    let store = Store::open(&dir.path().join("store.db")).expect("open store");
    let snapshot = store
        .create_snapshot(None, &system_info(), None)
        .expect("create snapshot");

    for i in 0..2_000 {
        store
            .record_change(&change(snapshot.snapshot_id, &format!("tel-{:04}", i % 50)))
            .expect("record change");
    }

    let start = Instant::now();
    let history = store.history(None).expect("history");
    let elapsed = start.elapsed();

    assert_eq!(history.len(), 2_000);
    assert!(
        elapsed.as_millis() < 2_000,
        "querying 2000-row history took {elapsed:?}, expected < 2s"
    );
}

#[test]
fn per_policy_history_uses_the_policy_id_index() {
    let dir = TempDir::new().expect("tempdir");
    let store = Store::open(&dir.path().join("store.db")).expect("open store");
    let snapshot = store
        .create_snapshot(None, &system_info(), None)
        .expect("create snapshot");

    for i in 0..1_000 {
        store
            .record_change(&change(snapshot.snapshot_id, &format!("tel-{:04}", i % 20)))
            .expect("record change");
    }

    let start = Instant::now();
    let history = store
        .history(Some(&"tel-0007".to_string()))
        .expect("history");
    let elapsed = start.elapsed();

    assert_eq!(history.len(), 50);
    assert!(
        elapsed.as_millis() < 500,
        "per-policy history lookup took {elapsed:?}, expected < 500ms"
    );
}
