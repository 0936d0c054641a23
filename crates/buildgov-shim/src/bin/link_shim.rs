//! Linker shim: impersonates `link` on PATH and mediates admission
//! through the governor. All argv is forwarded verbatim; the exit code is
//! the real linker's.

use buildgov_shim::profile::ToolProfile;
use buildgov_shim::run::run_shim;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let code = run_shim(&ToolProfile::link()).await;
    std::process::exit(code);
}
