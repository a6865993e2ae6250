//! `phagentd doctor`: load everything the service needs and report the
//! first problem found, without starting the IPC listener or mutating any
//! system state.

use pha_catalog::{load_catalog_dir, resolve};
use pha_restore::RestorePointManager;

use crate::config::AgentConfig;

#[derive(Debug)]
pub struct DoctorReport {
    pub catalog_dir_ok: bool,
    pub policy_count: usize,
    pub dependency_graph_ok: bool,
    pub store_path_writable: bool,
    pub restore_points_available: bool,
}

impl DoctorReport {
    pub fn ok(&self) -> bool {
        self.catalog_dir_ok && self.dependency_graph_ok && self.store_path_writable
    }
}

/// Runs every check a fresh install should pass before `serve` is started
/// for real. Restore-point availability is informational only (spec §4.6:
/// its absence is a warning, never fatal).
pub async fn run(config: &AgentConfig) -> anyhow::Result<DoctorReport> {
    let policies = match load_catalog_dir(&config.catalog_dir) {
        Ok(policies) => policies,
        Err(e) => {
            tracing::error!(error = %e, dir = %config.catalog_dir.display(), "catalog failed to load");
            return Ok(DoctorReport {
                catalog_dir_ok: false,
                policy_count: 0,
                dependency_graph_ok: false,
                store_path_writable: false,
                restore_points_available: false,
            });
        }
    };
    let policy_count = policies.len();
    tracing::info!(policy_count, "catalog loaded");

    let all_ids: Vec<String> = policies.iter().map(|p| p.policy_id.clone()).collect();
    let dependency_graph_ok = match resolve(&all_ids, &policies) {
        Ok(plan) => {
            tracing::info!(order_len = plan.order.len(), "dependency graph is acyclic");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "dependency graph validation failed");
            false
        }
    };

    let store_path_writable = check_store_path(config);

    let restore_points_available = RestorePointManager::new()
        .list()
        .await
        .map(|points| !points.is_empty())
        .unwrap_or(false);

    Ok(DoctorReport {
        catalog_dir_ok: true,
        policy_count,
        dependency_graph_ok,
        store_path_writable,
        restore_points_available,
    })
}

fn check_store_path(config: &AgentConfig) -> bool {
    let Some(parent) = config.store_db_path.parent() else {
        return false;
    };
    if std::fs::create_dir_all(parent).is_err() {
        return false;
    }
    pha_store::Store::open(&config.store_db_path).is_ok()
}

impl std::fmt::Display for DoctorReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "catalog:            {} ({} polic{})",
            check_mark(self.catalog_dir_ok),
            self.policy_count,
            if self.policy_count == 1 { "y" } else { "ies" }
        )?;
        writeln!(f, "dependency graph:   {}", check_mark(self.dependency_graph_ok))?;
        writeln!(f, "store:              {}", check_mark(self.store_path_writable))?;
        writeln!(
            f,
            "restore points:     {}",
            if self.restore_points_available {
                "available"
            } else {
                "unavailable (non-fatal)"
            }
        )
    }
}

fn check_mark(ok: bool) -> &'static str {
    if ok { "ok" } else { "FAILED" }
}
