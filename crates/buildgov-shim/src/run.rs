//! The per-invocation shim lifecycle.
//!
//! Locate, estimate, connect, acquire, spawn, sample, wait, release, exit
//! with the child's code. Governor trouble at any step downgrades the
//! invocation to ungoverned after exactly one warning; only a missing or
//! unspawnable real tool is fatal.
//!
//! The shim never retries the tool. The classifier's advice is printed for
//! the build driver; re-running is the driver's decision.
//!
//! `GOV_ENABLED=1` may be set by an outer runner to mark a governed
//! session; it is informational only and the shim behaves the same either
//! way.

use std::process::Stdio;
use std::time::{Duration, Instant};

use buildgov_core::classify::Classification;
use buildgov_core::protocol::{AcquireRequest, ReleaseRequest};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::client::{self, GovernorClient, ACQUIRE_TIMEOUT_MS};
use crate::cmdline;
use crate::locate;
use crate::profile::ToolProfile;
use crate::sampler::Sampler;
use crate::stderr::StderrTail;

/// Exit code when the real tool cannot be located.
pub const EXIT_TOOL_NOT_FOUND: i32 = 127;
/// Exit code when the real tool cannot be spawned.
pub const EXIT_SPAWN_FAILED: i32 = 126;

/// Cadence of lease heartbeats while the child runs.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Env var gating auto-start and lifecycle diagnostics.
pub const DEBUG_ENV: &str = "GOV_DEBUG";

/// Runs the shim for the current process argv, returning the exit code to
/// propagate.
pub async fn run_shim(profile: &ToolProfile) -> i32 {
    let args: Vec<String> = std::env::args().skip(1).collect();
    run_with_args(profile, args).await
}

/// The full lifecycle with argv made explicit (tests drive this directly).
pub async fn run_with_args(profile: &ToolProfile, args: Vec<String>) -> i32 {
    let debug = gov_debug();

    // 1. Locate the real tool. The only fatal path in the shim.
    let real_tool = match locate::locate_real_tool(profile) {
        Ok(path) => path,
        Err(err) => {
            eprintln!("{}-shim: {err}", profile.tool);
            return EXIT_TOOL_NOT_FOUND;
        }
    };

    // 2. Cost, hash, primary source.
    let requested_tokens = profile.estimate_tokens(&args);
    let args_hash = cmdline::args_hash(&args);
    debug!(
        tool = profile.tool,
        real = %real_tool.display(),
        tokens = requested_tokens,
        args_hash = %args_hash,
        "invocation"
    );

    // 3. Connect, auto-starting if permitted. Failure means ungoverned.
    let mut warned = false;
    let mut session = client::connect_or_start(debug).await;
    if session.is_none() {
        warn_ungoverned(profile, &mut warned);
    }

    // 4. Acquire. A denial is advice, not an obstacle: the build must make
    // progress even when the governor would rather it did not.
    let mut lease: Option<(String, u32)> = None;
    if let Some(client) = session.as_mut() {
        let request = AcquireRequest {
            tool: profile.tool.to_string(),
            args_hash: args_hash.clone(),
            requested_tokens,
            timeout_ms: ACQUIRE_TIMEOUT_MS,
            working_directory: std::env::current_dir()
                .ok()
                .map(|dir| dir.display().to_string()),
            source_file: cmdline::primary_source(&args).map(ToString::to_string),
            is_ltcg: profile.ltcg(&args),
        };
        match client.acquire(request).await {
            Ok(resp) if resp.granted => {
                lease = resp.lease_id.map(|id| (id, resp.granted_tokens));
            }
            Ok(resp) => {
                if debug {
                    eprintln!(
                        "gov: acquire denied: {}",
                        resp.reason.as_deref().unwrap_or("no reason given")
                    );
                }
            }
            Err(err) => {
                debug!(%err, "acquire failed");
                warn_ungoverned(profile, &mut warned);
                session = None;
            }
        }
    }

    // 5. Spawn the real tool with the argv untouched.
    let started = Instant::now();
    let mut child = match tokio::process::Command::new(&real_tool)
        .args(&args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            eprintln!(
                "{}-shim: failed to start {}: {err}",
                profile.tool,
                real_tool.display()
            );
            // Give the tokens back; nothing ran.
            release_aborted(session.as_mut(), lease.as_ref()).await;
            return EXIT_SPAWN_FAILED;
        }
    };

    // 6. Sample the child at ~10 Hz while forwarding its output.
    let sampler = Sampler::start(child.id().unwrap_or(0));

    let stdout_task = child.stdout.take().map(|mut out| {
        tokio::spawn(async move {
            let _ = tokio::io::copy(&mut out, &mut tokio::io::stdout()).await;
        })
    });
    let stderr_task = child.stderr.take().map(|err_pipe| {
        let profile = *profile;
        tokio::spawn(tee_stderr(err_pipe, profile))
    });

    // 7. Wait, heartbeating the lease so early reclamation is observable.
    let mut heartbeat = tokio::time::interval_at(
        tokio::time::Instant::now() + HEARTBEAT_INTERVAL,
        HEARTBEAT_INTERVAL,
    );
    let wait_result = loop {
        tokio::select! {
            status = child.wait() => break status,
            _ = heartbeat.tick() => {
                if let (Some(client), Some((lease_id, _))) = (session.as_mut(), lease.as_ref()) {
                    match client.heartbeat(lease_id).await {
                        Ok(resp) if !resp.alive && debug => {
                            eprintln!("gov: lease {lease_id} was reclaimed while the tool ran");
                        }
                        _ => {}
                    }
                }
            }
        }
    };

    let (peak_working_set, peak_commit) = sampler.finish();
    if let Some(task) = stdout_task {
        let _ = task.await;
    }
    let (stderr_digest, stderr_had_diagnostics) = match stderr_task {
        Some(task) => task.await.unwrap_or_default(),
        None => (String::new(), false),
    };

    let duration_ms = started.elapsed().as_millis() as u64;
    let exit_code = match wait_result {
        Ok(status) => exit_code_of(status),
        Err(err) => {
            eprintln!("{}-shim: wait failed: {err}", profile.tool);
            1
        }
    };

    // 8. Release and surface the verdict for OOM-adjacent failures.
    if let (Some(client), Some((lease_id, _))) = (session.as_mut(), lease.as_ref()) {
        let request = ReleaseRequest {
            lease_id: lease_id.clone(),
            peak_working_set_bytes: peak_working_set,
            peak_commit_bytes: peak_commit,
            exit_code,
            duration_ms,
            stderr_had_diagnostics,
            stderr_digest: (!stderr_digest.is_empty()).then_some(stderr_digest),
        };
        match client.release(request).await {
            Ok(resp) => {
                let oom_adjacent = matches!(
                    resp.classification,
                    Classification::LikelyOom | Classification::LikelyPagingDeath
                );
                if oom_adjacent {
                    if let Some(message) = resp.message {
                        eprintln!("{message}");
                    }
                }
            }
            Err(err) => {
                // Too late to matter: the TTL sweep will reclaim the lease.
                debug!(%err, "release failed");
            }
        }
    }

    // 9. The child's exit code, always, regardless of classification.
    exit_code
}

/// Forwards child stderr unmodified while keeping a bounded tail and the
/// diagnostic verdict.
async fn tee_stderr(
    mut pipe: tokio::process::ChildStderr,
    profile: ToolProfile,
) -> (String, bool) {
    let mut tail = StderrTail::new();
    let mut had_diagnostics = false;
    let mut own_stderr = tokio::io::stderr();
    let mut buf = [0u8; 8192];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let _ = own_stderr.write_all(&buf[..n]).await;
                let _ = own_stderr.flush().await;
                tail.push(&buf[..n]);
                if !had_diagnostics {
                    had_diagnostics = profile.stderr_has_diagnostics(&tail.as_text());
                }
            }
        }
    }
    (tail.digest(), had_diagnostics)
}

/// Returns a lease whose tool never ran (spawn failure).
async fn release_aborted(
    session: Option<&mut GovernorClient>,
    lease: Option<&(String, u32)>,
) {
    if let (Some(client), Some((lease_id, _))) = (session, lease) {
        let request = ReleaseRequest {
            lease_id: lease_id.clone(),
            peak_working_set_bytes: 0,
            peak_commit_bytes: 0,
            exit_code: EXIT_SPAWN_FAILED,
            duration_ms: 0,
            stderr_had_diagnostics: false,
            stderr_digest: None,
        };
        let _ = client.release(request).await;
    }
}

fn warn_ungoverned(profile: &ToolProfile, warned: &mut bool) {
    if !*warned {
        eprintln!(
            "\x1b[33m{}-shim: governor unavailable; running ungoverned\x1b[0m",
            profile.tool
        );
        *warned = true;
    }
}

fn gov_debug() -> bool {
    std::env::var(DEBUG_ENV).is_ok_and(|v| v == "1")
}

#[cfg(unix)]
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(1))
}

#[cfg(not(unix))]
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}
