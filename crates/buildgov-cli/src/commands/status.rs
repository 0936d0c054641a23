//! `buildgov status`: query the running governor and print pool state.

use buildgov_core::memory::BYTES_PER_GIB;
use buildgov_core::protocol::{endpoint, StatusResponse};
use buildgov_shim::client::{ClientError, GovernorClient};
use clap::Args;

use crate::exit_codes::{codes, exit_code_for};

/// Arguments for `buildgov status`.
#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Print the raw status response as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Runs the status command; returns the process exit code.
///
/// Does not auto-start a governor: an operator asking for status wants to
/// know whether one is running, not to create one.
pub async fn run_status(args: &StatusArgs) -> u8 {
    let mut client = match GovernorClient::connect().await {
        Ok(client) => client,
        Err(err) => return fail(err, "cannot reach the governor"),
    };

    let status = match client.status().await {
        Ok(status) => status,
        Err(err) => return fail(err, "status query failed"),
    };

    if args.json {
        match serde_json::to_string_pretty(&status) {
            Ok(json) => println!("{json}"),
            Err(err) => {
                eprintln!("buildgov: cannot render status: {err}");
                return codes::GENERIC_ERROR;
            }
        }
    } else {
        print_table(&status);
    }
    codes::SUCCESS
}

/// Maps the error to its exit code, then prints the full context chain so
/// the operator sees which endpoint was involved, not just "unreachable".
fn fail(err: ClientError, what: &str) -> u8 {
    let code = exit_code_for(&err);
    let report = anyhow::Error::new(err)
        .context(format!("{what} at {}", endpoint::socket_path().display()));
    eprintln!("buildgov: {report:#}");
    code
}

fn print_table(status: &StatusResponse) {
    let charge_gb = status.commit_charge_bytes as f64 / BYTES_PER_GIB as f64;
    let limit_gb = status.commit_limit_bytes as f64 / BYTES_PER_GIB as f64;
    let available_gb = status.available_memory_bytes as f64 / BYTES_PER_GIB as f64;

    println!("build governor");
    println!(
        "  tokens:        {} available / {} total",
        status.available_tokens, status.total_tokens
    );
    println!(
        "  leases:        {} active, {} expired",
        status.active_leases, status.expired_leases
    );
    println!("  throttle:      {}", status.throttle_level);
    println!(
        "  commit:        {charge_gb:.1} GiB / {limit_gb:.1} GiB (ratio {:.2})",
        status.commit_ratio
    );
    println!("  free memory:   {available_gb:.1} GiB");
    println!(
        "  parallelism:   {} recommended",
        status.recommended_parallelism
    );

    if !status.recent_leases.is_empty() {
        println!("  recent leases:");
        for lease in &status.recent_leases {
            println!(
                "    {}  {:<6} {:>2} tokens  running {:>5}s  expires in {}s",
                lease.lease_id,
                lease.tool,
                lease.tokens,
                lease.duration_seconds,
                lease.expires_in_seconds
            );
        }
    }
}
