//! Compiler shim: impersonates `cl` on PATH and mediates admission
//! through the governor. All argv is forwarded verbatim; the exit code is
//! the real compiler's.

use buildgov_shim::profile::ToolProfile;
use buildgov_shim::run::run_shim;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let code = run_shim(&ToolProfile::cl()).await;
    std::process::exit(code);
}
