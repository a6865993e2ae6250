//! Mechanism-tag executor registry, built once at startup (spec §4.3: "the
//! same shape as the teacher's `CliExecutor` trait dispatched by provider
//! kind").

use std::collections::HashMap;
use std::sync::Arc;

use pha_protocol::policy::Policy;
use tokio_util::sync::CancellationToken;

use crate::error::ExecutorError;
use crate::executor::{ApplyOutcome, Executor, RevertOutcome};

#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<&'static str, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, executor: Arc<dyn Executor>) {
        self.executors.insert(executor.mechanism_tag(), executor);
    }

    /// The default registry: one executor per mechanism this engine
    /// supports. `GroupPolicy`/`Mdm`/`HostsFile`/`WfpDriver` are
    /// intentionally absent (spec §4.3).
    pub fn with_default_executors() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(crate::mechanisms::registry_value::RegistryExecutor));
        registry.register(Arc::new(crate::mechanisms::service::ServiceExecutor));
        registry.register(Arc::new(
            crate::mechanisms::scheduled_task::ScheduledTaskExecutor,
        ));
        registry.register(Arc::new(crate::mechanisms::firewall::FirewallExecutor));
        registry.register(Arc::new(crate::mechanisms::script::ScriptExecutor));
        registry
    }

    fn executor_for(&self, policy: &Policy) -> Result<&Arc<dyn Executor>, ExecutorError> {
        let tag = policy.mechanism.tag();
        self.executors
            .get(tag)
            .ok_or_else(|| ExecutorError::Unsupported(tag.to_string()))
    }

    pub async fn probe_applied(
        &self,
        policy: &Policy,
        cancel: &CancellationToken,
    ) -> Result<bool, ExecutorError> {
        self.executor_for(policy)?
            .probe_applied(policy, cancel)
            .await
    }

    pub async fn get_current_value(
        &self,
        policy: &Policy,
        cancel: &CancellationToken,
    ) -> Result<String, ExecutorError> {
        self.executor_for(policy)?
            .get_current_value(policy, cancel)
            .await
    }

    pub async fn apply(
        &self,
        policy: &Policy,
        cancel: &CancellationToken,
    ) -> Result<ApplyOutcome, ExecutorError> {
        self.executor_for(policy)?.apply(policy, cancel).await
    }

    pub async fn revert(
        &self,
        policy: &Policy,
        previous_state: &str,
        cancel: &CancellationToken,
    ) -> Result<RevertOutcome, ExecutorError> {
        self.executor_for(policy)?
            .revert(policy, previous_state, cancel)
            .await
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use pha_protocol::policy::{
        Applicability, ControlFlags, Mechanism, Reversibility, RiskLevel, SupportStatus,
    };

    fn mdm_policy() -> Policy {
        Policy {
            policy_id: "mdm-001".to_string(),
            version: "1.0.0".to_string(),
            name: "MDM-managed setting".to_string(),
            description: String::new(),
            category: "test".to_string(),
            tags: vec![],
            mechanism: Mechanism::Mdm(serde_json::json!({})),
            risk_level: RiskLevel::Low,
            support_status: SupportStatus::Experimental,
            applicability: Applicability {
                min_build: 0,
                max_build: None,
                supported_skus: vec!["Professional".to_string()],
                excluded_skus: vec![],
                requires_device: false,
                deprecated_as_of_build: None,
            },
            reversibility: Reversibility {
                reversible: false,
                how: "not reversible".to_string(),
            },
            known_breakage: vec![],
            dependencies: vec![],
            control_flags: ControlFlags::default(),
            help_text: None,
            allowed_values: vec![],
        }
    }

    #[tokio::test]
    async fn unregistered_mechanism_is_unsupported() {
        let registry = ExecutorRegistry::with_default_executors();
        let err = registry
            .probe_applied(&mdm_policy(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Unsupported(tag) if tag == "mdm"));
    }
}
