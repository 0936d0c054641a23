//! End-to-end shim lifecycle tests.
//!
//! One test function drives every phase sequentially because the phases
//! steer the shim through process environment variables (runtime
//! directory, real-tool override), and parallel test threads would race on
//! them.
//!
//! Phases: a governed invocation against an in-process governor, a
//! governed invocation of a failing tool, and fall-open runs with the
//! governor absent, including a signal-killed child.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use buildgov_core::classify::ClassifierConfig;
use buildgov_core::memory::{MemorySnapshot, StaticProbe, BYTES_PER_GIB};
use buildgov_core::pool::{PoolConfig, TokenPool};
use buildgov_core::protocol::endpoint;
use buildgov_daemon::server::GovernorServer;
use buildgov_shim::profile::ToolProfile;
use buildgov_shim::run::{run_with_args, EXIT_TOOL_NOT_FOUND};
use tokio::sync::watch;

/// A profile whose override variable no real shim uses, so this test
/// cannot collide with developer environments.
const TEST_PROFILE: ToolProfile = ToolProfile {
    tool: "cl",
    real_name: "cl",
    env_override: "SHIM_TEST_REAL_PATH",
};

#[cfg(unix)]
fn write_tool(dir: &Path, name: &str, script: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn ten_token_pool() -> Arc<TokenPool> {
    let limit = 48 * BYTES_PER_GIB;
    let snapshot = MemorySnapshot::new(limit, limit / 2, 20 * BYTES_PER_GIB, limit);
    Arc::new(TokenPool::new(
        PoolConfig::default(),
        ClassifierConfig::default(),
        Arc::new(StaticProbe::new(snapshot)),
    ))
}

fn argv(args: &[&str]) -> Vec<String> {
    args.iter().map(ToString::to_string).collect()
}

#[cfg(unix)]
#[tokio::test]
async fn shim_lifecycle_end_to_end() {
    let tools = tempfile::tempdir().unwrap();

    // ---- Phase 1: governed invocation, clean exit -----------------------
    let governed_dir = tempfile::tempdir().unwrap();
    std::env::set_var(endpoint::RUNTIME_DIR_ENV, governed_dir.path());

    let pool = ten_token_pool();
    let server = GovernorServer::bind(&endpoint::socket_path(), Arc::clone(&pool)).unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(server.serve(shutdown_rx));

    let ok_tool = write_tool(tools.path(), "ok-tool", "echo compiling; sleep 0.1; exit 0");
    std::env::set_var(TEST_PROFILE.env_override, &ok_tool);

    let code = run_with_args(&TEST_PROFILE, argv(&["/c", "demo.cpp"])).await;
    assert_eq!(code, 0);

    // The lease came and went: every token is back, nothing is active.
    let status = pool.status();
    assert_eq!(status.active_leases, 0);
    assert_eq!(status.available_tokens, status.total_tokens);

    // ---- Phase 2: governed invocation, ordinary compile error -----------
    let err_tool = write_tool(
        tools.path(),
        "err-tool",
        "echo 'demo.cpp(3): error C2065: undeclared identifier' >&2; exit 2",
    );
    std::env::set_var(TEST_PROFILE.env_override, &err_tool);

    let code = run_with_args(&TEST_PROFILE, argv(&["/c", "demo.cpp"])).await;
    assert_eq!(code, 2, "the child's exit code must pass through untouched");
    assert_eq!(pool.status().active_leases, 0);

    shutdown_tx.send(true).unwrap();

    // ---- Phase 3: fall open with the governor absent --------------------
    let cold_dir = tempfile::tempdir().unwrap();
    std::env::set_var(endpoint::RUNTIME_DIR_ENV, cold_dir.path());
    // Point auto-start at nothing so it fails fast instead of launching a
    // daemon from the developer's PATH.
    std::env::set_var(
        buildgov_shim::client::SERVICE_PATH_ENV,
        cold_dir.path().join("no-such-daemon"),
    );

    let fancy_tool = write_tool(tools.path(), "fancy-tool", "echo built; exit 42");
    std::env::set_var(TEST_PROFILE.env_override, &fancy_tool);

    let code = run_with_args(&TEST_PROFILE, argv(&["/c", "demo.cpp"])).await;
    assert_eq!(code, 42, "ungoverned runs still propagate the exit code");

    // ---- Phase 4: fall open with a signal-killed child ------------------
    let killed_tool = write_tool(tools.path(), "killed-tool", "kill -9 $$");
    std::env::set_var(TEST_PROFILE.env_override, &killed_tool);

    let code = run_with_args(&TEST_PROFILE, argv(&["/c", "demo.cpp"])).await;
    assert_eq!(code, 137, "signal kills surface as 128 + signal");

    // ---- Phase 5: the real tool cannot be located -----------------------
    std::env::set_var(
        TEST_PROFILE.env_override,
        tools.path().join("no-such-tool"),
    );
    let code = run_with_args(&TEST_PROFILE, argv(&["/c", "demo.cpp"])).await;
    assert_eq!(code, EXIT_TOOL_NOT_FOUND);

    std::env::remove_var(TEST_PROFILE.env_override);
    std::env::remove_var(endpoint::RUNTIME_DIR_ENV);
    std::env::remove_var(buildgov_shim::client::SERVICE_PATH_ENV);
}
