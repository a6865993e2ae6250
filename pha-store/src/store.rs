//! Durable change log and snapshot store (spec §4.4): a thin, transactional
//! wrapper over the pooled SQLite connection. All writes go through
//! `write_lock` so the store behaves as a single writer even though readers
//! use the pool concurrently.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use pha_protocol::change::{ChangeOperation, ChangeRecord, Snapshot, SnapshotPolicyState};
use pha_protocol::policy::PolicyId;
use pha_protocol::sysinfo::SystemInfo;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{OptionalExtension, params};
use uuid::Uuid;

use crate::connection::initialize_pool;
use crate::error::{Result, StoreError};
use crate::migrations::migrate_to_latest;

fn operation_tag(op: ChangeOperation) -> &'static str {
    match op {
        ChangeOperation::Apply => "apply",
        ChangeOperation::Revert => "revert",
    }
}

fn operation_from_tag(tag: &str) -> Result<ChangeOperation> {
    match tag {
        "apply" => Ok(ChangeOperation::Apply),
        "revert" => Ok(ChangeOperation::Revert),
        other => Err(StoreError::Migration(format!(
            "unknown change operation tag '{other}'"
        ))),
    }
}

fn change_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChangeRecord> {
    let change_id: String = row.get("change_id")?;
    let snapshot_id: String = row.get("snapshot_id")?;
    let operation: String = row.get("operation")?;
    let applied_at: String = row.get("applied_at")?;

    Ok(ChangeRecord {
        change_id: change_id.parse().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?,
        policy_id: row.get("policy_id")?,
        snapshot_id: snapshot_id.parse().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?,
        operation: operation_from_tag(&operation)
            .map_err(|e| rusqlite::Error::InvalidParameterName(e.to_string()))?,
        applied_at: DateTime::parse_from_rfc3339(&applied_at)
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
            })?
            .with_timezone(&Utc),
        mechanism_tag: row.get("mechanism_tag")?,
        description: row.get("description")?,
        previous_state: row.get("previous_state")?,
        new_state: row.get("new_state")?,
        success: row.get::<_, i64>("success")? != 0,
        error_message: row.get("error_message")?,
    })
}

fn snapshot_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Snapshot> {
    let snapshot_id: String = row.get("snapshot_id")?;
    let created_at: String = row.get("created_at")?;
    let system_info: String = row.get("system_info")?;
    let restore_point_id: Option<String> = row.get("restore_point_id")?;

    Ok(Snapshot {
        snapshot_id: snapshot_id.parse().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
            })?
            .with_timezone(&Utc),
        description: row.get("description")?,
        system_info: serde_json::from_str(&system_info)
            .map_err(|e| rusqlite::Error::InvalidParameterName(e.to_string()))?,
        restore_point_id,
    })
}

pub struct Store {
    pool: Pool<SqliteConnectionManager>,
    write_lock: Mutex<()>,
}

impl Store {
    pub fn open(db_path: &Path) -> Result<Self> {
        let pool = initialize_pool(db_path, 10)?;
        {
            let mut conn = pool
                .get()
                .map_err(|e| StoreError::Pool(format!("failed to get connection: {e}")))?;
            migrate_to_latest(&mut conn)?;
        }
        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| StoreError::Pool(e.to_string()))?;
        {
            let mut conn = pool
                .get()
                .map_err(|e| StoreError::Pool(format!("failed to get connection: {e}")))?;
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            migrate_to_latest(&mut conn)?;
        }
        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
        })
    }

    fn conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| StoreError::Pool(format!("failed to get connection: {e}")))
    }

    /// Creates a new snapshot row. Callers typically do this once per
    /// Apply/Revert session before recording the session's changes.
    pub fn create_snapshot(
        &self,
        description: Option<String>,
        system_info: &SystemInfo,
        restore_point_id: Option<String>,
    ) -> Result<Snapshot> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let snapshot = Snapshot {
            snapshot_id: Uuid::new_v4(),
            created_at: Utc::now(),
            description,
            system_info: system_info.clone(),
            restore_point_id,
        };
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO snapshots (snapshot_id, created_at, description, system_info, restore_point_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                snapshot.snapshot_id.to_string(),
                snapshot.created_at.to_rfc3339(),
                snapshot.description,
                serde_json::to_string(&snapshot.system_info)?,
                snapshot.restore_point_id,
            ],
        )?;
        Ok(snapshot)
    }

    pub fn get_snapshot(&self, snapshot_id: Uuid) -> Result<Option<Snapshot>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT * FROM snapshots WHERE snapshot_id = ?1",
            params![snapshot_id.to_string()],
            snapshot_from_row,
        )
        .optional()
        .map_err(StoreError::from)
    }

    /// Reverse-chronological, most recent first.
    pub fn list_snapshots(&self, limit: u32, offset: u32) -> Result<Vec<Snapshot>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM snapshots ORDER BY created_at DESC LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt
            .query_map(params![limit, offset], snapshot_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Deletes snapshots (and their changes, via cascade-by-hand since
    /// SQLite foreign keys here don't cascade) created before `cutoff`.
    /// Returns the number of snapshots removed.
    pub fn prune_snapshots_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let ids: Vec<String> = tx
            .prepare("SELECT snapshot_id FROM snapshots WHERE created_at < ?1")?
            .query_map(params![cutoff.to_rfc3339()], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        for id in &ids {
            tx.execute("DELETE FROM changes WHERE snapshot_id = ?1", params![id])?;
            tx.execute(
                "DELETE FROM snapshot_policies WHERE snapshot_id = ?1",
                params![id],
            )?;
            tx.execute("DELETE FROM snapshots WHERE snapshot_id = ?1", params![id])?;
        }
        tx.commit()?;
        Ok(ids.len())
    }

    /// Records one change row. The snapshot must already exist.
    pub fn record_change(&self, change: &ChangeRecord) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let conn = self.conn()?;
        if self
            .get_snapshot(change.snapshot_id)
            .map(|s| s.is_none())
            .unwrap_or(true)
        {
            return Err(StoreError::UnknownSnapshot(change.snapshot_id));
        }
        conn.execute(
            "INSERT INTO changes (
                change_id, policy_id, snapshot_id, operation, applied_at,
                mechanism_tag, description, previous_state, new_state, success, error_message
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                change.change_id.to_string(),
                change.policy_id,
                change.snapshot_id.to_string(),
                operation_tag(change.operation),
                change.applied_at.to_rfc3339(),
                change.mechanism_tag,
                change.description,
                change.previous_state,
                change.new_state,
                change.success as i64,
                change.error_message,
            ],
        )?;
        Ok(())
    }

    pub fn record_snapshot_policy_state(&self, state: &SnapshotPolicyState) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO snapshot_policies (snapshot_id, policy_id, is_applied, current_value)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(snapshot_id, policy_id) DO UPDATE SET
                is_applied = excluded.is_applied,
                current_value = excluded.current_value",
            params![
                state.snapshot_id.to_string(),
                state.policy_id,
                state.is_applied as i64,
                state.current_value,
            ],
        )?;
        Ok(())
    }

    /// The promised per-policy state captured when `snapshot_id` was taken
    /// (spec §3: Snapshot Policy State), used by the drift detector as the
    /// baseline to compare live probes against.
    pub fn snapshot_policy_states(&self, snapshot_id: Uuid) -> Result<Vec<SnapshotPolicyState>> {
        let conn = self.conn()?;
        let rows = conn
            .prepare(
                "SELECT snapshot_id, policy_id, is_applied, current_value
                 FROM snapshot_policies WHERE snapshot_id = ?1",
            )?
            .query_map(params![snapshot_id.to_string()], |row| {
                let snapshot_id: String = row.get(0)?;
                Ok(SnapshotPolicyState {
                    snapshot_id: snapshot_id.parse().map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(
                            0,
                            rusqlite::types::Type::Text,
                            Box::new(e),
                        )
                    })?,
                    policy_id: row.get(1)?,
                    is_applied: row.get::<_, i64>(2)? != 0,
                    current_value: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Most recently created snapshot, if any (spec §9 open question: what
    /// `DetectDrift` uses when the caller supplies no `snapshot_id`).
    pub fn most_recent_snapshot(&self) -> Result<Option<Snapshot>> {
        Ok(self.list_snapshots(1, 0)?.into_iter().next())
    }

    /// Full change history, newest first. Filters to one policy when given.
    pub fn history(&self, policy_id: Option<&PolicyId>) -> Result<Vec<ChangeRecord>> {
        let conn = self.conn()?;
        let rows = match policy_id {
            Some(id) => conn
                .prepare("SELECT * FROM changes WHERE policy_id = ?1 ORDER BY applied_at DESC")?
                .query_map(params![id], change_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?,
            None => conn
                .prepare("SELECT * FROM changes ORDER BY applied_at DESC")?
                .query_map([], change_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?,
        };
        Ok(rows)
    }

    /// All changes belonging to `snapshot_id`, in insertion order
    /// (oldest first) -- the order session revert replays in reverse.
    pub fn changes_for_snapshot(&self, snapshot_id: Uuid) -> Result<Vec<ChangeRecord>> {
        let conn = self.conn()?;
        let rows = conn
            .prepare("SELECT * FROM changes WHERE snapshot_id = ?1 ORDER BY applied_at ASC")?
            .query_map(params![snapshot_id.to_string()], change_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// The policy ids currently considered applied: the latest successful
    /// change per policy was an `Apply`, not a `Revert`.
    pub fn applied_policy_ids(&self) -> Result<Vec<PolicyId>> {
        let conn = self.conn()?;
        let rows: Vec<(String, String)> = conn
            .prepare(
                "SELECT policy_id, operation FROM changes c
                 WHERE success = 1 AND applied_at = (
                     SELECT MAX(applied_at) FROM changes
                     WHERE policy_id = c.policy_id AND success = 1
                 )
                 GROUP BY policy_id",
            )?
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rows
            .into_iter()
            .filter(|(_, op)| op == "apply")
            .map(|(policy_id, _)| policy_id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    /// Not a real snapshot id the engine would ever produce -- just a
    /// well-formed UUID guaranteed not to match a row in `snapshots`.
    const BOGUS_SNAPSHOT_ID: &str = "00000000-0000-0000-0000-000000000000";

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

    fn change(snapshot_id: Uuid, policy_id: &str, operation: ChangeOperation) -> ChangeRecord {
        ChangeRecord {
            change_id: Uuid::new_v4(),
            policy_id: policy_id.to_string(),
            snapshot_id,
            operation,
            applied_at: Utc::now(),
            mechanism_tag: "registry".to_string(),
            description: "test change".to_string(),
            previous_state: "{}".to_string(),
            new_state: "{}".to_string(),
            success: true,
            error_message: None,
        }
    }

    #[test]
    fn create_snapshot_and_record_change_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let snapshot = store.create_snapshot(Some("test run".to_string()), &system_info(), None).unwrap();
        let c = change(snapshot.snapshot_id, "tel-001", ChangeOperation::Apply);
        store.record_change(&c).unwrap();

        let history = store.history(None).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].policy_id, "tel-001");
    }

    #[test]
    fn record_change_against_unknown_snapshot_fails() {
        let store = Store::open_in_memory().unwrap();
        let bogus = BOGUS_SNAPSHOT_ID.parse().unwrap();
        let c = change(bogus, "tel-001", ChangeOperation::Apply);
        assert!(matches!(
            store.record_change(&c),
            Err(StoreError::UnknownSnapshot(_))
        ));
    }

    #[test]
    fn applied_policy_ids_excludes_reverted() {
        let store = Store::open_in_memory().unwrap();
        let snapshot = store.create_snapshot(None, &system_info(), None).unwrap();
        store
            .record_change(&change(snapshot.snapshot_id, "tel-001", ChangeOperation::Apply))
            .unwrap();
        store
            .record_change(&change(snapshot.snapshot_id, "tel-002", ChangeOperation::Apply))
            .unwrap();

        // tel-002 gets reverted a moment later.
        std::thread::sleep(std::time::Duration::from_millis(2));
        store
            .record_change(&change(snapshot.snapshot_id, "tel-002", ChangeOperation::Revert))
            .unwrap();

        let applied = store.applied_policy_ids().unwrap();
        assert_eq!(applied, vec!["tel-001".to_string()]);
    }

    #[test]
    fn changes_for_snapshot_orders_oldest_first() {
        let store = Store::open_in_memory().unwrap();
        let snapshot = store.create_snapshot(None, &system_info(), None).unwrap();
        store
            .record_change(&change(snapshot.snapshot_id, "a", ChangeOperation::Apply))
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        store
            .record_change(&change(snapshot.snapshot_id, "b", ChangeOperation::Apply))
            .unwrap();

        let changes = store.changes_for_snapshot(snapshot.snapshot_id).unwrap();
        assert_eq!(changes[0].policy_id, "a");
        assert_eq!(changes[1].policy_id, "b");
    }

    #[test]
    fn list_snapshots_is_reverse_chronological() {
        let store = Store::open_in_memory().unwrap();
        let first = store.create_snapshot(Some("first".to_string()), &system_info(), None).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = store.create_snapshot(Some("second".to_string()), &system_info(), None).unwrap();

        let listed = store.list_snapshots(10, 0).unwrap();
        assert_eq!(listed[0].snapshot_id, second.snapshot_id);
        assert_eq!(listed[1].snapshot_id, first.snapshot_id);
    }

    #[test]
    fn snapshot_policy_states_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let snapshot = store.create_snapshot(None, &system_info(), None).unwrap();
        store
            .record_snapshot_policy_state(&SnapshotPolicyState {
                snapshot_id: snapshot.snapshot_id,
                policy_id: "tel-001".to_string(),
                is_applied: true,
                current_value: "1".to_string(),
            })
            .unwrap();

        let states = store.snapshot_policy_states(snapshot.snapshot_id).unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].policy_id, "tel-001");
        assert!(states[0].is_applied);
    }

    #[test]
    fn most_recent_snapshot_is_the_latest_created() {
        let store = Store::open_in_memory().unwrap();
        store.create_snapshot(Some("first".to_string()), &system_info(), None).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = store.create_snapshot(Some("second".to_string()), &system_info(), None).unwrap();

        let latest = store.most_recent_snapshot().unwrap().unwrap();
        assert_eq!(latest.snapshot_id, second.snapshot_id);
    }

    #[test]
    fn prune_removes_old_snapshots_and_their_changes() {
        let store = Store::open_in_memory().unwrap();
        let snapshot = store.create_snapshot(None, &system_info(), None).unwrap();
        store
            .record_change(&change(snapshot.snapshot_id, "tel-001", ChangeOperation::Apply))
            .unwrap();

        let pruned = store.prune_snapshots_older_than(Utc::now() + chrono::Duration::seconds(1)).unwrap();
        assert_eq!(pruned, 1);
        assert!(store.get_snapshot(snapshot.snapshot_id).unwrap().is_none());
        assert!(store.history(None).unwrap().is_empty());
    }
}
