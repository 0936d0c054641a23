//! The admission endpoint: a Unix-domain listener with one task per
//! accepted connection.
//!
//! Connections are independent sessions. Requests on one connection are
//! answered in arrival order; between connections no ordering is promised.
//! A connection dropping mid-session has no effect on outstanding leases:
//! they are keyed by id and belong to the TTL sweep, not the socket.

use std::io;
use std::path::Path;
use std::sync::Arc;

use buildgov_core::pool::TokenPool;
use buildgov_core::protocol::{self, WireError, MAX_LINE_BYTES};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// The bound endpoint, ready to accept shim connections.
pub struct GovernorServer {
    listener: UnixListener,
    pool: Arc<TokenPool>,
}

impl GovernorServer {
    /// Binds the endpoint socket, replacing any stale socket file.
    ///
    /// Callers hold the instance lock before binding, so an existing file
    /// can only be the remains of a dead governor.
    pub fn bind(path: &Path, pool: Arc<TokenPool>) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "removed stale socket"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        let listener = UnixListener::bind(path)?;
        info!(path = %path.display(), "endpoint bound");
        Ok(Self { listener, pool })
    }

    /// Accepts connections until the shutdown flag flips.
    ///
    /// Each connection runs in its own task; in-flight requests finish on
    /// their own timeouts after the accept loop stops.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            let pool = Arc::clone(&self.pool);
                            tokio::spawn(handle_connection(pool, stream));
                        }
                        Err(err) => {
                            warn!(%err, "accept failed");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!("stopping accept loop");
                    break;
                }
            }
        }
        Ok(())
    }
}

/// Serves one connection: read a line, dispatch, write the reply, repeat
/// until EOF. The pool lock is never held across socket I/O.
async fn handle_connection(pool: Arc<TokenPool>, stream: UnixStream) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = LineReader::new(read_half);

    loop {
        match reader.next_line().await {
            Ok(ReadOutcome::Line(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                let reply = crate::dispatch::handle_line(&pool, &line).await;
                if let Err(err) = write_line(&mut write_half, &reply).await {
                    debug!(%err, "connection write failed");
                    break;
                }
            }
            Ok(ReadOutcome::Oversized) => {
                // The stream cannot be resynchronized past an unbounded
                // line; report once and drop the connection.
                let reply = protocol::encode_line(&WireError {
                    error: format!("line exceeds {MAX_LINE_BYTES} bytes"),
                });
                let _ = write_line(&mut write_half, &reply).await;
                break;
            }
            Ok(ReadOutcome::Eof) => break,
            Err(err) => {
                debug!(%err, "connection read failed");
                break;
            }
        }
    }
}

async fn write_line<W: AsyncWriteExt + Unpin>(writer: &mut W, line: &str) -> io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

/// One read attempt's result.
enum ReadOutcome {
    /// A complete line, terminator stripped.
    Line(String),
    /// Clean end of stream.
    Eof,
    /// The peer sent more than [`MAX_LINE_BYTES`] without a newline.
    Oversized,
}

/// LF-delimited reader with a hard per-line byte bound.
///
/// `tokio`'s stock line reader has no length limit, which would let one
/// misbehaving client grow the daemon's heap without bound.
struct LineReader<R> {
    inner: R,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(1024),
        }
    }

    async fn next_line(&mut self) -> io::Result<ReadOutcome> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(ReadOutcome::Line(
                    String::from_utf8_lossy(&line).into_owned(),
                ));
            }
            if self.buf.len() > MAX_LINE_BYTES {
                return Ok(ReadOutcome::Oversized);
            }

            let mut chunk = [0u8; 4096];
            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                // A trailing partial line at EOF is discarded; a peer that
                // wanted a reply would have sent the terminator.
                return Ok(ReadOutcome::Eof);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}
