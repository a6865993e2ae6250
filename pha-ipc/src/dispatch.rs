//! Per-connection command dispatch (spec §6).
//!
//! One call to [`dispatch_line`] handles exactly one inbound JSON line: it
//! determines the command type without fully deserializing (so a malformed
//! payload for an unrelated command doesn't prevent reporting the error
//! against the right `command_id`), validates the protocol version,
//! authorizes the caller, deserializes the command-specific params, calls
//! the matching [`PolicyEngine`] method, and pushes every outbound line
//! (progress frames, then the terminal response) onto `out`.

use std::sync::Arc;

use pha_engine::PolicyEngine;
use pha_protocol::commands::{
    ApplyParams, AuditParams, CreateSnapshotParams, DetectDriftParams, GetPoliciesParams, GetStateParams,
    ReloadCatalogParams, RevertParams,
};
use pha_protocol::envelope::{CommandEnvelope, CommandType, ResponseEnvelope};
use pha_protocol::error::AgentError;
use pha_protocol::PROTOCOL_VERSION;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::auth::{authorize, CallerIdentity};

/// Parse failures that happen before a `command_id` can be trusted fall
/// back to this nil id, same as the envelope tests in `pha-protocol` do for
/// error-path fixtures.
fn command_id_of(envelope: &Value) -> Uuid {
    envelope
        .get("commandId")
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
        .unwrap_or(Uuid::nil())
}

fn command_type_of(envelope: &Value) -> Option<CommandType> {
    let raw = envelope.get("commandType")?.as_str()?;
    serde_json::from_value(Value::String(raw.to_string())).ok()
}

fn protocol_version_of(envelope: &Value) -> Option<u32> {
    envelope.get("protocolVersion").and_then(Value::as_u64).map(|v| v as u32)
}

fn err_line<R: Serialize>(command_id: Uuid, err: AgentError) -> String {
    let resp: ResponseEnvelope<R> = ResponseEnvelope::err(command_id, vec![err.into_detail()]);
    // A `ResponseEnvelope` serializes unconditionally; the only failure mode
    // is a non-UTF8 string inside an error message, which `serde_json`
    // handles by escaping, so this never fails in practice.
    serde_json::to_string(&resp).unwrap_or_else(|e| format!("{{\"success\":false,\"error\":\"{e}\"}}"))
}

fn ok_line<R: Serialize>(command_id: Uuid, result: R, warnings: Vec<String>) -> String {
    let resp = ResponseEnvelope::ok(command_id, result, warnings);
    serde_json::to_string(&resp).unwrap_or_else(|e| format!("{{\"success\":false,\"error\":\"{e}\"}}"))
}

/// Handles one inbound line, pushing every outbound line it produces onto
/// `out` in order. Never returns an `Err` -- protocol and engine failures
/// alike become a `ResponseEnvelope` with `success: false` on the wire.
pub async fn dispatch_line(
    engine: &Arc<PolicyEngine>,
    identity: &CallerIdentity,
    line: &str,
    cancel: &CancellationToken,
    out: &mpsc::Sender<String>,
) {
    let envelope: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            let _ = out
                .send(err_line::<()>(Uuid::nil(), AgentError::InvalidCommand(e.to_string())))
                .await;
            return;
        }
    };

    let command_id = command_id_of(&envelope);

    let Some(command_type) = command_type_of(&envelope) else {
        let _ = out
            .send(err_line::<()>(
                command_id,
                AgentError::InvalidCommand("missing or unrecognized commandType".to_string()),
            ))
            .await;
        return;
    };

    match protocol_version_of(&envelope) {
        Some(v) if v == PROTOCOL_VERSION => {}
        other => {
            let _ = out
                .send(err_line::<()>(
                    command_id,
                    AgentError::VersionMismatch {
                        client: other.unwrap_or(0),
                        server: PROTOCOL_VERSION,
                    },
                ))
                .await;
            return;
        }
    }

    if let Err(e) = authorize(identity, command_type) {
        let _ = out.send(err_line::<()>(command_id, e)).await;
        return;
    }

    macro_rules! decode_params {
        ($ty:ty) => {
            match serde_json::from_value::<CommandEnvelope<$ty>>(envelope) {
                Ok(env) => env.params,
                Err(e) => {
                    let _ = out
                        .send(err_line::<()>(command_id, AgentError::InvalidCommand(e.to_string())))
                        .await;
                    return;
                }
            }
        };
    }

    match command_type {
        CommandType::Audit => {
            let params = decode_params!(AuditParams);
            match engine.audit(params, cancel).await {
                Ok((result, warnings)) => {
                    let _ = out.send(ok_line(command_id, result, warnings)).await;
                }
                Err(e) => {
                    let _ = out.send(err_line::<()>(command_id, e)).await;
                }
            }
        }
        CommandType::Apply => {
            let params = decode_params!(ApplyParams);
            let (progress_tx, mut progress_rx) = mpsc::channel(16);
            let out_clone = out.clone();
            let forwarder = tokio::spawn(async move {
                while let Some(frame) = progress_rx.recv().await {
                    if out_clone.send(ok_progress_line(&frame)).await.is_err() {
                        break;
                    }
                }
            });
            let result = engine.apply(command_id, params, progress_tx, cancel.clone()).await;
            let _ = forwarder.await;
            match result {
                Ok((result, warnings)) => {
                    let _ = out.send(ok_line(command_id, result, warnings)).await;
                }
                Err(e) => {
                    let _ = out.send(err_line::<()>(command_id, e)).await;
                }
            }
        }
        CommandType::Revert => {
            let params = decode_params!(RevertParams);
            match engine.revert(params, cancel.clone()).await {
                Ok((result, warnings)) => {
                    let _ = out.send(ok_line(command_id, result, warnings)).await;
                }
                Err(e) => {
                    let _ = out.send(err_line::<()>(command_id, e)).await;
                }
            }
        }
        CommandType::GetState => {
            let params = decode_params!(GetStateParams);
            match engine.get_state(params) {
                Ok(result) => {
                    let _ = out.send(ok_line(command_id, result, Vec::new())).await;
                }
                Err(e) => {
                    let _ = out.send(err_line::<()>(command_id, e)).await;
                }
            }
        }
        CommandType::GetPolicies => {
            let params = decode_params!(GetPoliciesParams);
            match engine.get_policies(params) {
                Ok(result) => {
                    let _ = out.send(ok_line(command_id, result, Vec::new())).await;
                }
                Err(e) => {
                    let _ = out.send(err_line::<()>(command_id, e)).await;
                }
            }
        }
        CommandType::DetectDrift => {
            let params = decode_params!(DetectDriftParams);
            match engine.detect_drift(params, cancel).await {
                Ok(result) => {
                    let _ = out.send(ok_line(command_id, result, Vec::new())).await;
                }
                Err(e) => {
                    let _ = out.send(err_line::<()>(command_id, e)).await;
                }
            }
        }
        CommandType::CreateSnapshot => {
            let params = decode_params!(CreateSnapshotParams);
            match engine.create_snapshot(params).await {
                Ok((result, warnings)) => {
                    let _ = out.send(ok_line(command_id, result, warnings)).await;
                }
                Err(e) => {
                    let _ = out.send(err_line::<()>(command_id, e)).await;
                }
            }
        }
        CommandType::ReloadCatalog => {
            let _params = decode_params!(ReloadCatalogParams);
            match engine.reload_catalog() {
                Ok(result) => {
                    let _ = out.send(ok_line(command_id, result, Vec::new())).await;
                }
                Err(e) => {
                    let _ = out.send(err_line::<()>(command_id, e)).await;
                }
            }
        }
    }
}

fn ok_progress_line(frame: &pha_protocol::commands::ProgressFrame) -> String {
    serde_json::to_string(frame).unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn command_type_of_recognizes_camel_case() {
        let v: Value = serde_json::json!({"commandType": "getState"});
        assert_eq!(command_type_of(&v), Some(CommandType::GetState));
    }

    #[test]
    fn command_type_of_rejects_garbage() {
        let v: Value = serde_json::json!({"commandType": "doTheThing"});
        assert_eq!(command_type_of(&v), None);
    }

    #[test]
    fn command_id_of_falls_back_to_nil() {
        let v: Value = serde_json::json!({});
        assert_eq!(command_id_of(&v), Uuid::nil());
    }

    #[test]
    fn protocol_version_of_reads_number() {
        let v: Value = serde_json::json!({"protocolVersion": 1});
        assert_eq!(protocol_version_of(&v), Some(1));
    }
}
