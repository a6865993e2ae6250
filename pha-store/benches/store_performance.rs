// Benchmarks use expect/unwrap for simplicity - test code, not production
#![allow(clippy::expect_used, clippy::unwrap_used)]

//! Change-log store performance benchmarks.
//!
//! Validates that the pooled, WAL-mode store (spec §4.4, §5) sustains
//! concurrent single-writer/multi-reader access at the throughput this
//! agent needs: Apply sessions that journal tens of policies per snapshot,
//! and Audit/GetState calls that page through history while an Apply may
//! be in flight on another connection.
//!
//! ## Running
//! ```bash
//! cargo bench --bench store_performance
//! ```

use chrono::Utc;
use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use pha_protocol::change::{ChangeOperation, ChangeRecord};
use pha_protocol::sysinfo::SystemInfo;
use pha_store::Store;
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
        description: "benchmark change".to_string(),
        previous_state: "{\"value\":0}".to_string(),
        new_state: "{\"value\":1}".to_string(),
        success: true,
        error_message: None,
    }
}

fn setup_populated_store(rows: usize) -> (TempDir, Store) {
    let dir = TempDir::new().expect("tempdir");
    let store = Store::open(&dir.path().join("store.db")).expect("open store");
    let snapshot = store
        .create_snapshot(Some("bench seed".to_string()), &system_info(), None)
        .expect("create snapshot");
    for i in 0..rows {
        store
            .record_change(&change(snapshot.snapshot_id, &format!("tel-{i:03}")))
            .expect("record change");
    }
    (dir, store)
}

fn bench_record_change(c: &mut Criterion) {
    let mut group = c.benchmark_group("record_change");
    group.throughput(Throughput::Elements(1));
    group.bench_function("single_writer", |b| {
        let dir = TempDir::new().expect("tempdir");
        let store = Store::open(&dir.path().join("store.db")).expect("open store");
        let snapshot = store
            .create_snapshot(None, &system_info(), None)
            .expect("create snapshot");
        b.iter(|| {
            store
                .record_change(black_box(&change(snapshot.snapshot_id, "tel-001")))
                .expect("record change");
        });
    });
    group.finish();
}

fn bench_history_query(c: &mut Criterion) {
    let mut group = c.benchmark_group("history");
    for &rows in &[100usize, 1_000] {
        let (_dir, store) = setup_populated_store(rows);
        group.throughput(Throughput::Elements(rows as u64));
        group.bench_function(format!("paged_{rows}"), |b| {
            b.iter(|| {
                let history = store.history(None).expect("history");
                black_box(history.len());
            });
        });
    }
    group.finish();
}

fn bench_applied_policy_ids(c: &mut Criterion) {
    let (_dir, store) = setup_populated_store(500);
    c.bench_function("applied_policy_ids_500_rows", |b| {
        b.iter(|| {
            let ids = store.applied_policy_ids().expect("applied ids");
            black_box(ids.len());
        });
    });
}

criterion_group!(
    benches,
    bench_record_change,
    bench_history_query,
    bench_applied_policy_ids
);
criterion_main!(benches);
