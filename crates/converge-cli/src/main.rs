mod cmd;
mod output;

use clap::{Parser, Subcommand};
use cmd::run::RunArgs;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "converge",
    about = "Bootstrap a platform in dependency order, then probe its health",
    version,
    propagate_version = true
)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    /// Debug-level logging (RUST_LOG still takes priority)
    #[arg(long, global = true, short = 'v')]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a plan: actions in dependency order, then the probe suite
    Run(RunArgs),

    /// Validate a plan and print its execution order without running it
    Plan {
        /// Path to the plan file
        plan: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match (&cli.command, cli.verbose) {
        (_, true) => tracing::Level::DEBUG,
        (Commands::Run(_), false) => tracing::Level::INFO,
        (Commands::Plan { .. }, false) => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Run(args) => cmd::run::run(args, cli.json),
        Commands::Plan { plan } => cmd::plan::run(&plan, cli.json).map(|()| 0),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            // Print the full error chain (anyhow's alternate Display)
            eprintln!("error: {e:#}");
            std::process::exit(1);
        }
    }
}
