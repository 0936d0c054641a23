//! Governor client: connect, speak the wire protocol, auto-start.
//!
//! Every failure path here feeds fall-open: callers treat any
//! [`ClientError`] as "run ungoverned", never as a reason to block the
//! build. Timeouts are short and absolute.
//!
//! Auto-start election: several shims may find the endpoint absent at the
//! same moment. They contend on the launch lock ("BuildGovernorMutex") so
//! exactly one spawns `buildgovd --background`; the rest re-check the
//! endpoint and connect to whatever won.

use std::path::PathBuf;
use std::time::Duration;

use buildgov_core::lockfile;
use buildgov_core::protocol::{
    self, endpoint, AcquireRequest, AcquireResponse, HeartbeatRequest, HeartbeatResponse,
    ReleaseRequest, ReleaseResponse, Request, Response, StatusRequest, StatusResponse,
};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tracing::debug;

/// How long a connect attempt may take.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
/// Server-side spin budget requested in `acquire`.
pub const ACQUIRE_TIMEOUT_MS: u64 = 60_000;
/// Client-side ceiling on the acquire round trip (server budget + margin).
pub const ACQUIRE_REPLY_TIMEOUT: Duration = Duration::from_secs(65);
/// Ceiling on the release round trip.
pub const RELEASE_TIMEOUT: Duration = Duration::from_secs(5);
/// Ceiling on status and heartbeat round trips.
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a shim will wait to win the launch lock.
const LAUNCH_LOCK_WAIT: Duration = Duration::from_secs(5);
/// Poll cadence while waiting for a freshly started governor.
const READY_POLL: Duration = Duration::from_millis(200);
/// Total readiness budget after spawning the governor.
const READY_WAIT: Duration = Duration::from_secs(3);

/// Env var naming the governor executable for auto-start.
pub const SERVICE_PATH_ENV: &str = "GOV_SERVICE_PATH";
/// Default governor executable name.
const SERVICE_BINARY: &str = "buildgovd";

/// Client-side failures; every one of them means "fall open".
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClientError {
    /// Could not connect inside [`CONNECT_TIMEOUT`].
    #[error("governor endpoint not reachable")]
    Unreachable,

    /// The connection died mid-session.
    #[error("governor connection failed: {0}")]
    Io(#[from] std::io::Error),

    /// No reply inside the operation's timeout.
    #[error("governor did not reply to {operation} in time")]
    Timeout {
        /// The operation that timed out.
        operation: &'static str,
    },

    /// The reply did not parse or was the wrong message.
    #[error("unexpected reply to {operation}: {detail}")]
    Protocol {
        /// The operation whose reply was wrong.
        operation: &'static str,
        /// What was wrong with it.
        detail: String,
    },
}

/// One connected session with the governor.
pub struct GovernorClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl GovernorClient {
    /// Connects to the well-known endpoint within [`CONNECT_TIMEOUT`].
    pub async fn connect() -> Result<Self, ClientError> {
        let path = endpoint::socket_path();
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, UnixStream::connect(&path))
            .await
            .map_err(|_| ClientError::Unreachable)?
            .map_err(|_| ClientError::Unreachable)?;
        let (read_half, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer,
        })
    }

    /// Requests tokens.
    pub async fn acquire(
        &mut self,
        request: AcquireRequest,
    ) -> Result<AcquireResponse, ClientError> {
        let reply = self
            .round_trip(&Request::Acquire(request), ACQUIRE_REPLY_TIMEOUT, "acquire")
            .await?;
        match reply {
            Response::AcquireResponse(resp) => Ok(resp),
            other => Err(unexpected("acquire", &other)),
        }
    }

    /// Returns a lease with what the shim observed.
    pub async fn release(
        &mut self,
        request: ReleaseRequest,
    ) -> Result<ReleaseResponse, ClientError> {
        let reply = self
            .round_trip(&Request::Release(request), RELEASE_TIMEOUT, "release")
            .await?;
        match reply {
            Response::ReleaseResponse(resp) => Ok(resp),
            other => Err(unexpected("release", &other)),
        }
    }

    /// Checks whether a lease is still live.
    pub async fn heartbeat(
        &mut self,
        lease_id: &str,
    ) -> Result<HeartbeatResponse, ClientError> {
        let request = Request::Heartbeat(HeartbeatRequest {
            lease_id: lease_id.to_string(),
        });
        let reply = self
            .round_trip(&request, QUERY_TIMEOUT, "heartbeat")
            .await?;
        match reply {
            Response::HeartbeatResponse(resp) => Ok(resp),
            other => Err(unexpected("heartbeat", &other)),
        }
    }

    /// Queries pool totals and pressure.
    pub async fn status(&mut self) -> Result<StatusResponse, ClientError> {
        let reply = self
            .round_trip(&Request::Status(StatusRequest {}), QUERY_TIMEOUT, "status")
            .await?;
        match reply {
            Response::StatusResponse(resp) => Ok(resp),
            other => Err(unexpected("status", &other)),
        }
    }

    async fn round_trip(
        &mut self,
        request: &Request,
        reply_timeout: Duration,
        operation: &'static str,
    ) -> Result<Response, ClientError> {
        let line = protocol::encode_line(request);
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;

        let mut reply = String::new();
        let n = tokio::time::timeout(reply_timeout, self.reader.read_line(&mut reply))
            .await
            .map_err(|_| ClientError::Timeout { operation })??;
        if n == 0 {
            return Err(ClientError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "governor closed the connection",
            )));
        }
        protocol::decode_response(reply.trim_end()).map_err(|err| ClientError::Protocol {
            operation,
            detail: err.to_string(),
        })
    }
}

fn unexpected(operation: &'static str, reply: &Response) -> ClientError {
    ClientError::Protocol {
        operation,
        detail: format!("wrong response variant: {reply:?}"),
    }
}

/// Connects to the governor, auto-starting one if the endpoint is absent.
///
/// Returns `None` when no session could be established; the caller then
/// runs ungoverned. `debug` gates auto-start diagnostics on stderr
/// (`GOV_DEBUG=1`).
pub async fn connect_or_start(debug: bool) -> Option<GovernorClient> {
    if let Ok(client) = GovernorClient::connect().await {
        return Some(client);
    }

    if debug {
        eprintln!("gov: endpoint absent, attempting auto-start");
    }

    // Elect a launcher. Losing the lock race is fine: by the time we time
    // out, the winner has probably bound the endpoint, so re-check either
    // way.
    let lock_path = endpoint::launch_lock_path();
    let launch_lock = tokio::task::spawn_blocking(move || {
        lockfile::exclusive_within(&lock_path, LAUNCH_LOCK_WAIT)
    })
    .await
    .ok()
    .and_then(Result::ok)
    .flatten();

    if let Ok(client) = GovernorClient::connect().await {
        return Some(client);
    }

    if launch_lock.is_some() {
        match spawn_governor() {
            Ok(path) => {
                if debug {
                    eprintln!("gov: launched {} --background", path.display());
                }
            }
            Err(err) => {
                if debug {
                    eprintln!("gov: auto-start failed: {err}");
                }
                return None;
            }
        }
    }

    // Poll for readiness; the launch lock (if held) is released on drop
    // once we return.
    let deadline = std::time::Instant::now() + READY_WAIT;
    while std::time::Instant::now() < deadline {
        tokio::time::sleep(READY_POLL).await;
        if let Ok(client) = GovernorClient::connect().await {
            return Some(client);
        }
    }

    debug!("governor not reachable after auto-start");
    None
}

/// Spawns `buildgovd --background`, detached, and returns the path used.
///
/// Resolution order: `GOV_SERVICE_PATH`, the shim's own directory, PATH.
fn spawn_governor() -> std::io::Result<PathBuf> {
    let binary = governor_binary().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{SERVICE_BINARY} not found; set {SERVICE_PATH_ENV}"),
        )
    })?;

    std::process::Command::new(&binary)
        .arg("--background")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()?;
    Ok(binary)
}

fn governor_binary() -> Option<PathBuf> {
    if let Some(explicit) = std::env::var_os(SERVICE_PATH_ENV) {
        let path = PathBuf::from(explicit);
        return path.is_file().then_some(path);
    }
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let sibling = dir.join(SERVICE_BINARY);
            if sibling.is_file() {
                return Some(sibling);
            }
        }
    }
    which::which(SERVICE_BINARY).ok()
}
