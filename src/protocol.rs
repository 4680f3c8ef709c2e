/// Control protocol: the JSON-RPC envelope exchanged between host and
/// sandbox, tagged with the job token it belongs to.
///
/// Wire shape (one envelope per message):
/// `{ "jobId": "...", "data": { "jsonrpc": "2.0", "method": "...", "id": "...", ... } }`
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::error::ProtocolViolation;

pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC error code for a failing provider hook.
pub const INTERNAL_ERROR: i64 = -32603;

/// JSON-RPC error code for a method nobody on the host handles.
pub const METHOD_NOT_FOUND: i64 = -32601;

/// Opaque, unguessable job token. Generated per job, never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What travels on the shared transport: a message plus its job tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub job_id: JobId,
    pub data: RpcMessage,
}

impl Envelope {
    pub fn new(job_id: JobId, data: RpcMessage) -> Self {
        Self { job_id, data }
    }
}

/// JSON-RPC error object.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{message} (code {code})")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// A JSON-RPC 2.0 request, notification or response.
///
/// Kept as one flat struct because that is how it arrives on the wire;
/// [`RpcMessage::classify`] turns it into something the host can match on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcMessage {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcMessage {
    fn empty() -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: None,
            id: None,
            params: None,
            result: None,
            error: None,
        }
    }

    /// Builds a request with a freshly generated correlation id.
    pub fn request(command: Command, params: Option<Value>) -> Self {
        Self {
            method: Some(command.as_str().to_string()),
            id: Some(correlation_id()),
            params,
            ..Self::empty()
        }
    }

    /// Builds a request without a correlation id (no response expected).
    pub fn notification(command: Command, params: Option<Value>) -> Self {
        Self {
            method: Some(command.as_str().to_string()),
            params,
            ..Self::empty()
        }
    }

    pub fn response(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: Some(id.into()),
            result: Some(result),
            ..Self::empty()
        }
    }

    pub fn error_response(id: impl Into<String>, error: RpcError) -> Self {
        Self {
            id: Some(id.into()),
            error: Some(error),
            ..Self::empty()
        }
    }

    /// Validates the message against the fixed command set and splits it
    /// into a request or a response.
    pub fn classify(&self) -> Result<Inbound, ProtocolViolation> {
        if self.jsonrpc != JSONRPC_VERSION {
            return Err(ProtocolViolation::UnsupportedVersion(self.jsonrpc.clone()));
        }

        if let Some(method) = &self.method {
            let command = method
                .parse::<Command>()
                .map_err(|_| ProtocolViolation::UnknownCommand(method.clone()))?;
            return Ok(Inbound::Request {
                id: self.id.clone(),
                command,
                params: self.params.clone(),
            });
        }

        let id = self
            .id
            .clone()
            .ok_or_else(|| ProtocolViolation::Malformed("response without id".into()))?;

        match (&self.result, &self.error) {
            (Some(result), None) => Ok(Inbound::Response {
                id,
                outcome: Ok(result.clone()),
            }),
            (None, Some(error)) => Ok(Inbound::Response {
                id,
                outcome: Err(error.clone()),
            }),
            (Some(_), Some(_)) => Err(ProtocolViolation::Malformed(
                "response carries both result and error".into(),
            )),
            (None, None) => Err(ProtocolViolation::Malformed(
                "message has neither method nor result".into(),
            )),
        }
    }
}

/// A classified message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// `id` is None for notifications
    Request {
        id: Option<String>,
        command: Command,
        params: Option<Value>,
    },
    Response {
        id: String,
        outcome: Result<Value, RpcError>,
    },
}

/// The fixed command set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Start a snap's code under this job
    ExecuteSnap,
    /// Application call into or out of the snap
    SnapRpc,
    /// Release everything held for this job
    TerminateJob,
    /// Liveness; the response is the pong
    Ping,
    /// The snap is about to make a network request
    OutboundRequest,
    /// The snap's network request completed
    OutboundResponse,
    /// The snap threw outside of any request handler
    UnhandledError,
}

impl Command {
    pub const ALL: [Command; 7] = [
        Command::ExecuteSnap,
        Command::SnapRpc,
        Command::TerminateJob,
        Command::Ping,
        Command::OutboundRequest,
        Command::OutboundResponse,
        Command::UnhandledError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Command::ExecuteSnap => "executeSnap",
            Command::SnapRpc => "snapRpc",
            Command::TerminateJob => "terminateJob",
            Command::Ping => "ping",
            Command::OutboundRequest => "outboundRequest",
            Command::OutboundResponse => "outboundResponse",
            Command::UnhandledError => "unhandledError",
        }
    }

    /// Whether the sandbox side is allowed to send this command to the host.
    pub fn sandbox_may_send(&self) -> bool {
        !matches!(self, Command::ExecuteSnap)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Command::ALL
            .iter()
            .copied()
            .find(|command| command.as_str() == s)
            .ok_or(())
    }
}

/// Fresh correlation id for a request.
pub fn correlation_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_wire_shape() {
        let envelope = Envelope::new(
            JobId::from("job-1"),
            RpcMessage {
                id: Some("c1".into()),
                ..RpcMessage::notification(Command::TerminateJob, None)
            },
        );
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            value,
            json!({
                "jobId": "job-1",
                "data": { "jsonrpc": "2.0", "method": "terminateJob", "id": "c1" }
            })
        );
    }

    #[test]
    fn test_envelope_parses_response_with_error() {
        let raw = r#"{"jobId":"j","data":{"jsonrpc":"2.0","id":"7","error":{"code":-1,"message":"boom"}}}"#;
        let envelope: Envelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.job_id.as_str(), "j");
        assert_eq!(
            envelope.data.classify().unwrap(),
            Inbound::Response {
                id: "7".into(),
                outcome: Err(RpcError::new(-1, "boom")),
            }
        );
    }

    #[test]
    fn test_requests_get_unique_correlation_ids() {
        let a = RpcMessage::request(Command::Ping, None);
        let b = RpcMessage::request(Command::Ping, None);
        assert!(a.id.is_some());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_job_ids_are_unique() {
        assert_ne!(JobId::generate(), JobId::generate());
    }

    #[test]
    fn test_classify_request() {
        let msg = RpcMessage::request(Command::SnapRpc, Some(json!({"method": "x"})));
        match msg.classify().unwrap() {
            Inbound::Request { id, command, params } => {
                assert_eq!(id, msg.id);
                assert_eq!(command, Command::SnapRpc);
                assert_eq!(params, Some(json!({"method": "x"})));
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_rejects_unknown_method() {
        let msg = RpcMessage {
            method: Some("eth_sendTransaction".into()),
            ..RpcMessage::response("1", json!(null))
        };
        assert_eq!(
            msg.classify(),
            Err(ProtocolViolation::UnknownCommand("eth_sendTransaction".into()))
        );
    }

    #[test]
    fn test_classify_rejects_wrong_version() {
        let mut msg = RpcMessage::request(Command::Ping, None);
        msg.jsonrpc = "1.0".into();
        assert!(matches!(
            msg.classify(),
            Err(ProtocolViolation::UnsupportedVersion(v)) if v == "1.0"
        ));
    }

    #[test]
    fn test_classify_rejects_empty_and_ambiguous_responses() {
        let mut msg = RpcMessage::response("1", json!("OK"));
        msg.error = Some(RpcError::new(1, "x"));
        assert!(matches!(msg.classify(), Err(ProtocolViolation::Malformed(_))));

        msg.result = None;
        msg.error = None;
        assert!(matches!(msg.classify(), Err(ProtocolViolation::Malformed(_))));

        msg.id = None;
        assert!(matches!(msg.classify(), Err(ProtocolViolation::Malformed(_))));
    }

    #[test]
    fn test_command_names_round_trip() {
        for command in Command::ALL {
            assert_eq!(command.as_str().parse::<Command>(), Ok(command));
        }
        assert!("pong".parse::<Command>().is_err());
    }

    #[test]
    fn test_sandbox_cannot_execute_snaps() {
        assert!(!Command::ExecuteSnap.sandbox_may_send());
        assert!(Command::TerminateJob.sandbox_may_send());
        assert!(Command::UnhandledError.sandbox_may_send());
    }
}
