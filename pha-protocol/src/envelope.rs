//! Command/response envelopes (spec §6).
//!
//! Framing is one JSON object per line. For non-streaming commands a single
//! [`ResponseEnvelope`] is the whole reply; for `apply`, zero or more
//! [`crate::commands::ProgressFrame`]s precede the terminal
//! [`ResponseEnvelope`].

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorDetail;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum CommandType {
    Audit,
    Apply,
    Revert,
    GetState,
    GetPolicies,
    DetectDrift,
    CreateSnapshot,
    ReloadCatalog,
}

/// The common header every command carries, with the command-specific
/// params flattened in beside it (spec §6: "command envelope ... plus
/// command-specific fields").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope<P> {
    pub command_id: Uuid,
    pub protocol_version: u32,
    pub timestamp: DateTime<Utc>,
    pub command_type: CommandType,
    #[serde(flatten)]
    pub params: P,
}

impl<P> CommandEnvelope<P> {
    pub fn new(command_type: CommandType, params: P) -> Self {
        Self {
            command_id: Uuid::new_v4(),
            protocol_version: crate::PROTOCOL_VERSION,
            timestamp: Utc::now(),
            command_type,
            params,
        }
    }
}

/// The common response shape (spec §6), with the command-specific result
/// flattened in on success. `result` is `None` when `errors` is non-empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope<R> {
    pub command_id: Uuid,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ErrorDetail>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(flatten, skip_serializing_if = "Option::is_none", default)]
    pub result: Option<R>,
}

impl<R> ResponseEnvelope<R> {
    pub fn ok(command_id: Uuid, result: R, warnings: Vec<String>) -> Self {
        Self {
            command_id,
            success: true,
            timestamp: Utc::now(),
            errors: Vec::new(),
            warnings,
            result: Some(result),
        }
    }

    pub fn err(command_id: Uuid, errors: Vec<ErrorDetail>) -> Self {
        Self {
            command_id,
            success: false,
            timestamp: Utc::now(),
            errors,
            warnings: Vec::new(),
            result: None,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Ping {
        nonce: u32,
    }

    #[test]
    fn command_envelope_flattens_params() {
        let env = CommandEnvelope::new(CommandType::Audit, Ping { nonce: 7 });
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["nonce"], 7);
        assert_eq!(value["commandType"], "audit");
    }

    #[test]
    fn response_envelope_omits_result_on_error() {
        let resp: ResponseEnvelope<Ping> = ResponseEnvelope::err(
            Uuid::nil(),
            vec![ErrorDetail {
                code: "Unauthorized".to_string(),
                message: "nope".to_string(),
                details: None,
                policy_id: None,
            }],
        );
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["success"], false);
        assert!(value.get("nonce").is_none());
    }
}
