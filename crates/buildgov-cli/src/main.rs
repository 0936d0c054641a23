//! `buildgov`, the operator CLI for the build governor.

mod commands;
mod exit_codes;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "buildgov",
    version,
    about = "Inspect the build admission governor"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show pool totals, memory pressure, and recent leases.
    Status(commands::status::StatusArgs),
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    let code = match cli.command {
        Command::Status(args) => commands::status::run_status(&args).await,
    };
    std::process::exit(i32::from(code));
}
