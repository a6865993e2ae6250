//! In-memory catalog handle: an atomically-swappable snapshot of the loaded,
//! validated policy set (spec §4.1, §5, §9 -- catalog reload must not block
//! or interleave with in-flight commands).

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use pha_protocol::policy::{Policy, PolicyId};

use crate::loader::{LoadError, load_catalog_dir};

/// An immutable point-in-time view of the catalog. Cheap to clone (an
/// `Arc` underneath); callers hold one for the duration of a command so a
/// concurrent reload never changes the catalog out from under them.
#[derive(Debug)]
pub struct CatalogSnapshot {
    policies: Vec<Policy>,
}

impl CatalogSnapshot {
    pub fn policies(&self) -> &[Policy] {
        &self.policies
    }

    pub fn get(&self, policy_id: &str) -> Option<&Policy> {
        self.policies.iter().find(|p| p.policy_id == policy_id)
    }

    pub fn by_category(&self, category: &str) -> impl Iterator<Item = &Policy> {
        self.policies.iter().filter(move |p| p.category == category)
    }

    pub fn by_tag<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a Policy> {
        self.policies
            .iter()
            .filter(move |p| p.tags.iter().any(|t| t == tag))
    }
}

/// Owns the catalog directory and hands out [`CatalogSnapshot`]s. Reload
/// (re)reads the directory, validates every policy, and only then swaps the
/// shared snapshot -- a bad reload leaves the previous snapshot in place
/// (spec §4.1, §10.1).
pub struct Catalog {
    dir: PathBuf,
    snapshot: RwLock<Arc<CatalogSnapshot>>,
}

impl Catalog {
    /// Load `dir` for the first time.
    pub fn load(dir: PathBuf) -> Result<Self, LoadError> {
        let policies = load_catalog_dir(&dir)?;
        Ok(Self {
            dir,
            snapshot: RwLock::new(Arc::new(CatalogSnapshot { policies })),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Current snapshot. Cheap: clones an `Arc`.
    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        // A poisoned lock means some earlier reader/writer panicked while
        // holding it; that is a bug elsewhere, not something reload() can
        // recover from, so propagating the panic here is correct.
        Arc::clone(&self.snapshot.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Re-read and re-validate the catalog directory, then atomically swap
    /// the live snapshot. Returns the number of policies in the new
    /// snapshot.
    pub fn reload(&self) -> Result<usize, LoadError> {
        let policies = load_catalog_dir(&self.dir)?;
        let count = policies.len();
        let new_snapshot = Arc::new(CatalogSnapshot { policies });
        let mut guard = self
            .snapshot
            .write()
            .unwrap_or_else(|e| e.into_inner());
        *guard = new_snapshot;
        Ok(count)
    }

    pub fn policy_ids(&self) -> Vec<PolicyId> {
        self.snapshot()
            .policies
            .iter()
            .map(|p| p.policy_id.clone())
            .collect()
    }
}
