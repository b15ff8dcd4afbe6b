//! rdbg - an interactive debugger for simulated programs
//!
//! Runs a program under a debug session driven from the terminal, a remote
//! client, or an IDE speaking the Debug Adapter Protocol.

use std::path::PathBuf;

use clap::Parser;
use rdbg::commands::Commands;
use rdbg::common::logging;
use rdbg::cli;

#[derive(Parser)]
#[command(name = "rdbg", about = "Interactive debugger")]
#[command(version, long_about = None)]
struct Cli {
    /// Configuration file (default: config.toml in the config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Keep the appender guard alive until exit so buffered logs are flushed
    let _guard = if cli.command.is_server() {
        let (log_path, guard) = logging::init_server();
        if let Some(path) = log_path {
            tracing::info!(path = %path.display(), "logging to file");
        }
        guard
    } else {
        logging::init_console();
        None
    };

    match cli::dispatch(cli.command, cli.config).await {
        Ok(0) => {}
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}
