//! System State Probe seam (spec §4.5 component table): the one direct OS
//! call the engine makes outside the executor registry. Abstracted behind a
//! trait so the engine's own tests can supply a fixed [`SystemInfo`] instead
//! of depending on the live Windows registry probe in
//! [`pha_executors::sysinfo`].

use pha_executors::ExecutorError;
use pha_protocol::SystemInfo;

/// Captures the live system identity facts applicability gating and
/// snapshot/drift comparisons run against.
pub trait SystemProbe: Send + Sync {
    fn probe(&self) -> Result<SystemInfo, ExecutorError>;
}

/// The real probe, backed by [`pha_executors::sysinfo::probe`].
#[derive(Debug, Default)]
pub struct LiveSystemProbe;

impl SystemProbe for LiveSystemProbe {
    fn probe(&self) -> Result<SystemInfo, ExecutorError> {
        pha_executors::sysinfo::probe()
    }
}

#[cfg(test)]
pub(crate) struct FixedSystemProbe(pub SystemInfo);

#[cfg(test)]
impl SystemProbe for FixedSystemProbe {
    fn probe(&self) -> Result<SystemInfo, ExecutorError> {
        Ok(self.0.clone())
    }
}
