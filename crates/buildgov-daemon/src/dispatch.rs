//! Request dispatch: one wire line in, one wire line out.
//!
//! The governor never panics on client input. Malformed or unrecognized
//! lines become one-shot `{"error": ...}` objects and the connection stays
//! open; everything else is a normal response, including denials.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use buildgov_core::pool::{AcquireOutcome, PoolStatus, ReleaseReport, TokenPool};
use buildgov_core::protocol::{
    self, AcquireResponse, HeartbeatResponse, LeaseSummary, ReleaseResponse, Request, Response,
    StatusResponse, WireError,
};
use tracing::debug;

/// Upper bound on the acquire spin a single request may ask for. Keeps a
/// buggy client from parking a connection task for hours.
pub const MAX_ACQUIRE_TIMEOUT_MS: u64 = 5 * 60 * 1000;

/// Handles one wire line, producing the reply line (no trailing newline).
pub async fn handle_line(pool: &TokenPool, line: &str) -> String {
    match protocol::decode_request(line) {
        Ok(request) => protocol::encode_line(&handle_request(pool, request).await),
        Err(err) => {
            debug!(%err, "rejecting wire line");
            protocol::encode_line(&WireError {
                error: err.to_string(),
            })
        }
    }
}

/// Routes a decoded request to the pool.
pub async fn handle_request(pool: &TokenPool, request: Request) -> Response {
    match request {
        Request::Acquire(req) => {
            let timeout = Duration::from_millis(req.timeout_ms.min(MAX_ACQUIRE_TIMEOUT_MS));
            debug!(
                tool = %req.tool,
                args_hash = %req.args_hash,
                requested = req.requested_tokens,
                source_file = req.source_file.as_deref().unwrap_or(""),
                "acquire"
            );
            let outcome = pool
                .try_acquire(&req.tool, req.requested_tokens, timeout)
                .await;
            Response::AcquireResponse(match outcome {
                AcquireOutcome::Granted(grant) => AcquireResponse {
                    granted: true,
                    lease_id: Some(grant.lease_id),
                    granted_tokens: grant.granted_tokens,
                    recommended_parallelism: grant.recommended_parallelism,
                    reason: None,
                    commit_ratio: grant.commit_ratio,
                },
                AcquireOutcome::Denied {
                    reason,
                    recommended_parallelism,
                    commit_ratio,
                } => AcquireResponse {
                    granted: false,
                    lease_id: None,
                    granted_tokens: 0,
                    recommended_parallelism,
                    reason: Some(reason),
                    commit_ratio,
                },
            })
        }

        Request::Release(req) => {
            let report = ReleaseReport {
                peak_working_set_bytes: req.peak_working_set_bytes,
                peak_commit_bytes: req.peak_commit_bytes,
                exit_code: req.exit_code,
                duration_ms: req.duration_ms,
                stderr_had_diagnostics: req.stderr_had_diagnostics,
            };
            let outcome = pool.release(&req.lease_id, &report);
            Response::ReleaseResponse(ReleaseResponse {
                acknowledged: outcome.acknowledged,
                classification: outcome.classification,
                message: outcome.message,
                should_retry: outcome.should_retry,
                retry_with_tokens: outcome.retry_with_tokens,
            })
        }

        Request::Status(_) => Response::StatusResponse(status_to_wire(&pool.status())),

        Request::Heartbeat(req) => Response::HeartbeatResponse(HeartbeatResponse {
            alive: pool.heartbeat(&req.lease_id),
            timestamp: unix_millis(),
        }),
    }
}

fn status_to_wire(status: &PoolStatus) -> StatusResponse {
    StatusResponse {
        total_tokens: status.total_tokens,
        available_tokens: status.available_tokens,
        active_leases: status.active_leases,
        commit_ratio: status.snapshot.commit_ratio,
        commit_charge_bytes: status.snapshot.commit_charge,
        commit_limit_bytes: status.snapshot.commit_limit,
        available_memory_bytes: status.snapshot.available_physical,
        recommended_parallelism: status.recommended_parallelism,
        throttle_level: status.throttle_level.to_string(),
        expired_leases: status.expired_leases,
        recent_leases: status
            .recent_leases
            .iter()
            .map(|info| LeaseSummary {
                lease_id: info.lease_id.clone(),
                tool: info.tool.clone(),
                tokens: info.tokens,
                duration_seconds: info.running_for.as_secs(),
                expires_in_seconds: info.expires_in.as_secs(),
            })
            .collect(),
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use buildgov_core::classify::ClassifierConfig;
    use buildgov_core::memory::{MemorySnapshot, StaticProbe, BYTES_PER_GIB};
    use buildgov_core::pool::PoolConfig;

    use super::*;

    fn test_pool() -> TokenPool {
        let limit = 48 * BYTES_PER_GIB;
        let snapshot = MemorySnapshot::new(limit, limit / 2, 20 * BYTES_PER_GIB, limit);
        TokenPool::new(
            PoolConfig::default(),
            ClassifierConfig::default(),
            Arc::new(StaticProbe::new(snapshot)),
        )
    }

    #[tokio::test]
    async fn acquire_line_round_trips_through_dispatch() {
        let pool = test_pool();
        let line = r#"{"type":"acquire","data":{"tool":"cl","argsHash":"aa00",
            "requestedTokens":2,"timeoutMs":1000}}"#;
        let reply = handle_line(&pool, line).await;

        let Response::AcquireResponse(resp) = protocol::decode_response(&reply).unwrap() else {
            panic!("expected acquire_response, got: {reply}");
        };
        assert!(resp.granted);
        assert_eq!(resp.granted_tokens, 2);
        let lease_id = resp.lease_id.expect("granted response carries an id");

        let release = format!(
            r#"{{"type":"release","data":{{"leaseId":"{lease_id}",
               "peakWorkingSetBytes":1000,"peakCommitBytes":2000,
               "exitCode":0,"durationMs":3000,"stderrHadDiagnostics":false}}}}"#
        );
        let reply = handle_line(&pool, &release).await;
        let Response::ReleaseResponse(resp) = protocol::decode_response(&reply).unwrap() else {
            panic!("expected release_response, got: {reply}");
        };
        assert!(resp.acknowledged);
        assert!(!resp.should_retry);
    }

    #[tokio::test]
    async fn malformed_line_gets_error_object_not_a_crash() {
        let pool = test_pool();
        let reply = handle_line(&pool, "{{{{not json").await;
        assert!(reply.starts_with(r#"{"error":"#), "reply was: {reply}");

        let reply = handle_line(&pool, r#"{"type":"defragment","data":{}}"#).await;
        assert!(reply.contains("unrecognized message type"), "reply was: {reply}");
    }

    #[tokio::test]
    async fn status_reflects_outstanding_leases() {
        let pool = test_pool();
        let _ = handle_line(
            &pool,
            r#"{"type":"acquire","data":{"tool":"link","argsHash":"bb11",
               "requestedTokens":3,"timeoutMs":0}}"#,
        )
        .await;

        let reply = handle_line(&pool, r#"{"type":"status","data":{}}"#).await;
        let Response::StatusResponse(status) = protocol::decode_response(&reply).unwrap() else {
            panic!("expected status_response, got: {reply}");
        };
        assert_eq!(status.total_tokens, 10);
        assert_eq!(status.available_tokens, 7);
        assert_eq!(status.active_leases, 1);
        assert_eq!(status.throttle_level, "Normal");
        assert_eq!(status.recent_leases.len(), 1);
        assert_eq!(status.recent_leases[0].tool, "link");
    }

    #[tokio::test]
    async fn heartbeat_reports_liveness_and_a_timestamp() {
        let pool = test_pool();
        let reply = handle_line(
            &pool,
            r#"{"type":"heartbeat","data":{"leaseId":"000000000000"}}"#,
        )
        .await;
        let Response::HeartbeatResponse(hb) = protocol::decode_response(&reply).unwrap() else {
            panic!("expected heartbeat_response, got: {reply}");
        };
        assert!(!hb.alive);
        assert!(hb.timestamp > 1_600_000_000_000);
    }
}
