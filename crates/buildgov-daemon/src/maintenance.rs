//! The periodic maintenance task.
//!
//! Every sweep interval (500 ms in production) the pool refreshes its
//! snapshot, recomputes the budget, warns about long-running leases, and
//! reclaims expired ones. This task is the sole protection against crashed
//! shims holding tokens forever.
//!
//! In background mode the task also watches for idleness: once no lease has
//! been active for the idle limit, it flips the shared shutdown flag and
//! the accept loop exits cleanly.

use std::sync::Arc;
use std::time::{Duration, Instant};

use buildgov_core::pool::TokenPool;
use tokio::sync::watch;
use tracing::info;

/// Idle period after which a background-mode governor exits.
pub const BACKGROUND_IDLE_LIMIT: Duration = Duration::from_secs(30 * 60);

/// Runs sweeps until shutdown, optionally enforcing an idle limit.
pub async fn run(
    pool: Arc<TokenPool>,
    idle_limit: Option<Duration>,
    shutdown_tx: watch::Sender<bool>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(pool.config().sweep_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_busy = Instant::now();

    loop {
        tokio::select! {
            _ = tick.tick() => {
                pool.sweep();

                if pool.active_leases() > 0 {
                    last_busy = Instant::now();
                } else if let Some(limit) = idle_limit {
                    if last_busy.elapsed() >= limit {
                        info!(
                            idle_secs = last_busy.elapsed().as_secs(),
                            "idle limit reached; shutting down"
                        );
                        let _ = shutdown_tx.send(true);
                        break;
                    }
                }
            }
            _ = shutdown_rx.changed() => break,
        }
    }
}
