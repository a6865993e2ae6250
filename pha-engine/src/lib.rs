//! Policy Engine: the orchestrator behind every IPC command (spec §4.5).
//!
//! This crate owns no transport and no OS mutation of its own -- it wires
//! together [`pha_catalog`]'s resolver, [`pha_executors`]' registry,
//! [`pha_store`]'s change log, and [`pha_restore`]'s checkpoint manager
//! behind the six public operations (`Audit`, `Apply`, `Revert`,
//! `GetState`, `DetectDrift`, `CreateSnapshot`) plus the supplemental
//! `GetPolicies` and `ReloadCatalog` (SPEC_FULL §4.5, §10.1, §10.2).

pub mod drift;
pub mod engine;
pub mod probe;

pub use drift::{DriftMonitor, DriftMonitorConfig};
pub use engine::PolicyEngine;
pub use probe::{LiveSystemProbe, SystemProbe};
