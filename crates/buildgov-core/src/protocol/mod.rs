//! Shim–governor wire protocol.
//!
//! Transport is a local byte stream carrying one UTF-8 JSON object per
//! line. Every message has the shape `{"type": <string>, "data": <object>}`;
//! the governor replies with the corresponding `*_response` message, one
//! reply per request, in order. Unrecognized or malformed input produces a
//! one-shot `{"error": "..."}` object and the connection stays open.
//!
//! Payload fields are camelCase on the wire. Unknown fields are ignored by
//! both sides so either end can be upgraded first.

pub mod endpoint;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::classify::Classification;

/// Upper bound on one wire line. Longer lines are rejected as malformed
/// before any parsing happens.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// A client request, tagged by the `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Request {
    /// Ask for tokens before running a tool.
    Acquire(AcquireRequest),
    /// Report a finished tool and return its tokens.
    Release(ReleaseRequest),
    /// Query pool totals and pressure.
    Status(StatusRequest),
    /// Check whether a lease is still live.
    Heartbeat(HeartbeatRequest),
}

/// A governor reply, tagged by the `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Response {
    /// Reply to [`Request::Acquire`].
    AcquireResponse(AcquireResponse),
    /// Reply to [`Request::Release`].
    ReleaseResponse(ReleaseResponse),
    /// Reply to [`Request::Status`].
    StatusResponse(StatusResponse),
    /// Reply to [`Request::Heartbeat`].
    HeartbeatResponse(HeartbeatResponse),
}

/// `acquire` request payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcquireRequest {
    /// Free-form tool label, e.g. "cl" or "link".
    pub tool: String,
    /// Stable short hash of the full argument vector, for logging.
    pub args_hash: String,
    /// Tokens the shim estimates this invocation needs.
    pub requested_tokens: u32,
    /// How long the governor may spin waiting for tokens.
    pub timeout_ms: u64,
    /// Working directory of the invocation, if the shim knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    /// Primary source path, if one was identified.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    /// Whether link-time code generation is in effect. The wire name keeps
    /// the acronym fully capitalized, unlike the other camelCase fields.
    #[serde(default, rename = "isLTCG", skip_serializing_if = "Option::is_none")]
    pub is_ltcg: Option<bool>,
}

/// `acquire_response` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcquireResponse {
    /// Whether a lease was granted.
    pub granted: bool,
    /// The lease id, present iff granted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_id: Option<String>,
    /// Tokens actually granted (may be fewer than requested).
    pub granted_tokens: u32,
    /// Suggested build-driver parallelism under the current budget.
    pub recommended_parallelism: u32,
    /// Denial reason, present iff not granted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Commit ratio at decision time.
    pub commit_ratio: f64,
}

/// `release` request payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseRequest {
    /// The lease being returned.
    pub lease_id: String,
    /// Peak resident bytes observed for the child.
    pub peak_working_set_bytes: u64,
    /// Peak committed bytes observed for the child.
    pub peak_commit_bytes: u64,
    /// The tool's exit code.
    pub exit_code: i32,
    /// Wall-clock duration of the invocation.
    pub duration_ms: u64,
    /// Whether stderr matched the tool's diagnostic predicate.
    pub stderr_had_diagnostics: bool,
    /// Tail of the child's stderr, truncated for transport.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_digest: Option<String>,
}

/// `release_response` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseResponse {
    /// False when the lease id is unknown (already expired or never
    /// granted); the release then had no effect.
    pub acknowledged: bool,
    /// Outcome label for the invocation.
    pub classification: Classification,
    /// Human-facing diagnostic for OOM-adjacent verdicts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Whether a retry with fewer tokens is advised.
    pub should_retry: bool,
    /// Token count to retry with, present iff a retry is advised.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_with_tokens: Option<u32>,
}

/// `status` request payload (empty; present so every request has `data`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRequest {}

/// `status_response` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    /// Token capacity under the current budget.
    pub total_tokens: u32,
    /// Tokens not currently leased.
    pub available_tokens: u32,
    /// Number of active leases.
    pub active_leases: u32,
    /// Commit ratio from the latest snapshot.
    pub commit_ratio: f64,
    /// Commit charge from the latest snapshot, in bytes.
    pub commit_charge_bytes: u64,
    /// Commit limit from the latest snapshot, in bytes.
    pub commit_limit_bytes: u64,
    /// Available physical memory from the latest snapshot, in bytes.
    pub available_memory_bytes: u64,
    /// Suggested build-driver parallelism.
    pub recommended_parallelism: u32,
    /// Current throttle band, e.g. "Normal".
    #[serde(default)]
    pub throttle_level: String,
    /// Cumulative count of leases reclaimed by TTL expiry.
    #[serde(default)]
    pub expired_leases: u64,
    /// Up to ten most recently acquired active leases.
    #[serde(default)]
    pub recent_leases: Vec<LeaseSummary>,
}

/// One row of [`StatusResponse::recent_leases`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseSummary {
    /// The lease id.
    pub lease_id: String,
    /// Tool label the lease was acquired for.
    pub tool: String,
    /// Tokens held.
    pub tokens: u32,
    /// Seconds since the lease was acquired.
    pub duration_seconds: u64,
    /// Seconds until TTL reclamation.
    pub expires_in_seconds: u64,
}

/// `heartbeat` request payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    /// The lease being checked.
    pub lease_id: String,
}

/// `heartbeat_response` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    /// Whether the lease is still in the table. The TTL is absolute and is
    /// not extended by heartbeats.
    pub alive: bool,
    /// Milliseconds since the Unix epoch at the governor.
    pub timestamp: u64,
}

/// The one-shot error object sent for unrecognized or malformed input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    /// What was wrong with the input.
    pub error: String,
}

/// Errors from decoding a wire line.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// The line is not a JSON object of the expected shape.
    #[error("malformed message: {reason}")]
    Malformed {
        /// Description of the defect.
        reason: String,
    },

    /// The `type` field names no known message.
    #[error("unrecognized message type: {type_name}")]
    UnknownType {
        /// The offending type string.
        type_name: String,
    },

    /// The line exceeds [`MAX_LINE_BYTES`].
    #[error("message of {len} bytes exceeds the {MAX_LINE_BYTES}-byte line limit")]
    Oversized {
        /// Observed line length.
        len: usize,
    },
}

impl ProtocolError {
    /// Creates a [`ProtocolError::Malformed`] with the given reason.
    #[must_use]
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }
}

/// Known request type names, used to distinguish "unknown type" from
/// "known type, bad payload".
const REQUEST_TYPES: [&str; 4] = ["acquire", "release", "status", "heartbeat"];

/// Decodes one wire line into a [`Request`].
pub fn decode_request(line: &str) -> Result<Request, ProtocolError> {
    if line.len() > MAX_LINE_BYTES {
        return Err(ProtocolError::Oversized { len: line.len() });
    }
    let value: serde_json::Value = serde_json::from_str(line)
        .map_err(|e| ProtocolError::malformed(format!("invalid JSON: {e}")))?;
    let Some(type_name) = value
        .get("type")
        .and_then(serde_json::Value::as_str)
        .map(ToString::to_string)
    else {
        return Err(ProtocolError::malformed("missing string field 'type'"));
    };
    if !REQUEST_TYPES.contains(&type_name.as_str()) {
        return Err(ProtocolError::UnknownType { type_name });
    }
    serde_json::from_value(value)
        .map_err(|e| ProtocolError::malformed(format!("bad '{type_name}' payload: {e}")))
}

/// Decodes one wire line into a [`Response`].
pub fn decode_response(line: &str) -> Result<Response, ProtocolError> {
    if line.len() > MAX_LINE_BYTES {
        return Err(ProtocolError::Oversized { len: line.len() });
    }
    serde_json::from_str(line)
        .map_err(|e| ProtocolError::malformed(format!("invalid response: {e}")))
}

/// Encodes any wire message as a single line (no trailing newline).
///
/// Serialization of these types cannot fail; a failure would be a bug in
/// the message definitions themselves.
#[must_use]
pub fn encode_line<T: Serialize>(message: &T) -> String {
    serde_json::to_string(message).expect("wire messages serialize infallibly")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_round_trip() {
        let request = Request::Acquire(AcquireRequest {
            tool: "cl".to_string(),
            args_hash: "9f2c3a41d0be".to_string(),
            requested_tokens: 4,
            timeout_ms: 60_000,
            working_directory: Some("C:/src/app".to_string()),
            source_file: Some("widget.cpp".to_string()),
            is_ltcg: None,
        });
        let line = encode_line(&request);
        assert!(line.contains("\"type\":\"acquire\""));
        assert!(line.contains("\"argsHash\":\"9f2c3a41d0be\""));
        assert!(line.contains("\"requestedTokens\":4"));
        assert!(!line.contains("isLTCG"));

        let back = decode_request(&line).unwrap();
        assert_eq!(back, request);
    }

    #[test]
    fn ltcg_flag_round_trips_with_documented_capitalization() {
        let request = Request::Acquire(AcquireRequest {
            tool: "link".to_string(),
            args_hash: "00ff11ee22dd".to_string(),
            requested_tokens: 6,
            timeout_ms: 60_000,
            working_directory: None,
            source_file: None,
            is_ltcg: Some(true),
        });
        let line = encode_line(&request);
        // The acronym stays fully capitalized on the wire; blanket
        // camelCase renaming would have produced "isLtcg".
        assert!(line.contains(r#""isLTCG":true"#), "line was: {line}");
        assert!(!line.contains("isLtcg"), "line was: {line}");

        let back = decode_request(&line).unwrap();
        assert_eq!(back, request);
    }

    #[test]
    fn response_type_names_are_snake_case() {
        let response = Response::AcquireResponse(AcquireResponse {
            granted: true,
            lease_id: Some("a1b2c3d4e5f6".to_string()),
            granted_tokens: 2,
            recommended_parallelism: 6,
            reason: None,
            commit_ratio: 0.42,
        });
        let line = encode_line(&response);
        assert!(line.contains("\"type\":\"acquire_response\""));
        assert!(line.contains("\"leaseId\":\"a1b2c3d4e5f6\""));
        let back = decode_response(&line).unwrap();
        assert_eq!(back, response);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let line = r#"{"type":"acquire","data":{"tool":"link","argsHash":"00ff",
            "requestedTokens":2,"timeoutMs":1000,"futureKnob":true}}"#;
        let request = decode_request(line).unwrap();
        let Request::Acquire(acquire) = request else {
            panic!("expected acquire");
        };
        assert_eq!(acquire.tool, "link");
        assert_eq!(acquire.requested_tokens, 2);
    }

    #[test]
    fn unknown_type_is_distinguished_from_malformed() {
        let err = decode_request(r#"{"type":"defragment","data":{}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownType { .. }));

        let err = decode_request("not json at all").unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed { .. }));

        let err = decode_request(r#"{"data":{}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed { .. }));
    }

    #[test]
    fn known_type_with_bad_payload_is_malformed() {
        let err = decode_request(r#"{"type":"release","data":{"leaseId":7}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed { .. }));
    }

    #[test]
    fn oversized_line_is_rejected_before_parsing() {
        let line = format!(
            r#"{{"type":"acquire","data":{{"tool":"{}"}}}}"#,
            "x".repeat(MAX_LINE_BYTES)
        );
        let err = decode_request(&line).unwrap_err();
        assert!(matches!(err, ProtocolError::Oversized { .. }));
    }

    #[test]
    fn release_response_semantics_survive_reserialization() {
        let response = Response::ReleaseResponse(ReleaseResponse {
            acknowledged: true,
            classification: crate::classify::Classification::LikelyOom,
            message: Some("likely out-of-memory kill".to_string()),
            should_retry: true,
            retry_with_tokens: Some(2),
        });
        let once = encode_line(&response);
        let back = decode_response(&once).unwrap();
        let twice = encode_line(&back);
        assert_eq!(once, twice);
        assert!(once.contains("\"classification\":\"LikelyOOM\""));
    }

    #[test]
    fn status_request_is_an_empty_object() {
        let line = encode_line(&Request::Status(StatusRequest {}));
        assert_eq!(line, r#"{"type":"status","data":{}}"#);
        decode_request(&line).unwrap();
    }

    #[test]
    fn status_response_tolerates_missing_extension_fields() {
        // A v1 governor without the extension fields must still be readable.
        let line = r#"{"type":"status_response","data":{"totalTokens":8,
            "availableTokens":3,"activeLeases":2,"commitRatio":0.5,
            "commitChargeBytes":100,"commitLimitBytes":200,
            "availableMemoryBytes":50,"recommendedParallelism":4}}"#;
        let Response::StatusResponse(status) = decode_response(line).unwrap() else {
            panic!("expected status_response");
        };
        assert_eq!(status.total_tokens, 8);
        assert!(status.recent_leases.is_empty());
        assert_eq!(status.throttle_level, "");
    }

    #[test]
    fn wire_error_shape() {
        let line = encode_line(&WireError {
            error: "unrecognized message type: defragment".to_string(),
        });
        assert_eq!(
            line,
            r#"{"error":"unrecognized message type: defragment"}"#
        );
    }
}
