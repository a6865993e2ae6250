//! Schema versioning and migrations: forward-only, tracked via
//! `PRAGMA user_version`, idempotent (`IF NOT EXISTS`).

use rusqlite::Connection;

use crate::error::Result;

pub const SCHEMA_VERSION: i32 = 1;

pub fn migrate_to_latest(conn: &mut Connection) -> Result<()> {
    let current = get_schema_version(conn)?;
    if current < 1 {
        migration_v1(conn)?;
        set_schema_version(conn, 1)?;
    }
    Ok(())
}

fn get_schema_version(conn: &Connection) -> Result<i32> {
    Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute_batch(&format!("PRAGMA user_version = {version}"))?;
    Ok(())
}

fn migration_v1(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS snapshots (
            snapshot_id TEXT PRIMARY KEY,
            created_at TEXT NOT NULL,
            description TEXT,
            system_info TEXT NOT NULL,
            restore_point_id TEXT
        );

        CREATE TABLE IF NOT EXISTS changes (
            change_id TEXT PRIMARY KEY,
            policy_id TEXT NOT NULL,
            snapshot_id TEXT NOT NULL REFERENCES snapshots(snapshot_id),
            operation TEXT NOT NULL,
            applied_at TEXT NOT NULL,
            mechanism_tag TEXT NOT NULL,
            description TEXT NOT NULL,
            previous_state TEXT NOT NULL,
            new_state TEXT NOT NULL,
            success INTEGER NOT NULL,
            error_message TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_changes_policy_id ON changes(policy_id);
        CREATE INDEX IF NOT EXISTS idx_changes_applied_at ON changes(applied_at);
        CREATE INDEX IF NOT EXISTS idx_changes_snapshot_id ON changes(snapshot_id);

        CREATE TABLE IF NOT EXISTS snapshot_policies (
            snapshot_id TEXT NOT NULL REFERENCES snapshots(snapshot_id),
            policy_id TEXT NOT NULL,
            is_applied INTEGER NOT NULL,
            current_value TEXT NOT NULL,
            PRIMARY KEY (snapshot_id, policy_id)
        );",
    )?;
    tx.commit()?;
    Ok(())
}
