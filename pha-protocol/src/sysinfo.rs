//! System Info (spec §3): the OS identity facts applicability gating and
//! snapshots are evaluated against.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct SystemInfo {
    pub build_number: u32,
    pub version_string: String,
    pub sku_name: String,
    pub domain_joined: bool,
    pub mdm_managed: bool,
    pub tamper_protection_enabled: bool,
}

impl SystemInfo {
    /// Applicability gate from spec §4.5/§8: is `policy` meaningful on this
    /// system? Returns `Ok(())` or a human reason.
    pub fn check_applicability(
        &self,
        applicability: &crate::policy::Applicability,
    ) -> Result<(), String> {
        if self.build_number < applicability.min_build {
            return Err(format!(
                "current build {} is below the minimum required build {}",
                self.build_number, applicability.min_build
            ));
        }
        if let Some(max_build) = applicability.max_build
            && self.build_number > max_build
        {
            return Err(format!(
                "current build {} is above the maximum supported build {max_build}",
                self.build_number
            ));
        }
        if applicability
            .excluded_skus
            .iter()
            .any(|sku| sku == &self.sku_name)
        {
            return Err(format!("SKU '{}' is explicitly excluded", self.sku_name));
        }
        if !applicability
            .supported_skus
            .iter()
            .any(|sku| sku == &self.sku_name)
        {
            return Err(format!(
                "SKU '{}' is not in the supported SKU list",
                self.sku_name
            ));
        }
        if let Some(deprecated_as_of) = applicability.deprecated_as_of_build
            && self.build_number >= deprecated_as_of
        {
            return Err(format!(
                "policy is deprecated as of build {deprecated_as_of}"
            ));
        }
        Ok(())
    }
}
