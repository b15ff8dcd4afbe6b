//! CLI command handling
//!
//! Sessions are blocking (they own native threads), so each one runs on
//! tokio's blocking pool while the async runtime serves `attach`.

use std::path::{Path, PathBuf};

use crate::commands::{apply_run_flags, load_config, Commands};
use crate::common::config::SessionConfig;
use crate::common::{Error, Result};
use crate::frontend::console::Console;
use crate::frontend::dap::DapFrontEnd;
use crate::frontend::remote::{client, RemoteFrontEnd};
use crate::frontend::FrontEnd;
use crate::runtime::sim::{SimProgram, SimRuntime};
use crate::testing;

/// Dispatch a CLI command; returns the process exit status
pub async fn dispatch(command: Commands, config_path: Option<PathBuf>) -> Result<i32> {
    let mut config = load_config(config_path.as_deref())?;

    match command {
        Commands::Run {
            program,
            commands,
            nonstop,
            postmortem,
            open,
            remote,
        } => {
            apply_run_flags(&mut config.session, commands, nonstop, postmortem);
            let runtime = SimRuntime::new(SimProgram::load(&program)?);

            let frontend: Box<dyn FrontEnd> = if open {
                remote.apply(&mut config.remote);
                let frontend = RemoteFrontEnd::listen(&config.remote)?;
                eprintln!("rdbg: waiting for a client at {}", frontend.endpoint());
                Box::new(frontend)
            } else {
                Box::new(Console::stdio())
            };

            let session = config.session;
            blocking(move || runtime.debug(frontend, session)).await
        }

        Commands::Attach { remote } => {
            remote.apply(&mut config.remote);
            client::attach(&config.remote).await?;
            Ok(0)
        }

        Commands::Dap { program } => {
            let session = config.session;
            blocking(move || debug_adapter(program.as_deref(), session)).await
        }

        Commands::Test { paths, verbose } => {
            let results = blocking(move || testing::run_all(&paths[..], verbose)).await?;
            let failed: Vec<_> = results.iter().filter(|r| !r.passed).collect();
            for result in &failed {
                tracing::debug!(
                    name = %result.name,
                    steps_run = result.steps_run,
                    steps_total = result.steps_total,
                    "scenario failed"
                );
            }
            Ok(if failed.is_empty() { 0 } else { 1 })
        }
    }
}

/// Run a blocking session off the async runtime
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Internal(format!("session task failed: {}", e)))?
}

/// Serve one DAP client over stdio
///
/// The session starts at `launch` so breakpoints sent during configuration
/// are answered; the program itself waits for `configurationDone`.
fn debug_adapter(program: Option<&Path>, mut session: SessionConfig) -> Result<i32> {
    let (frontend, startup) = DapFrontEnd::stdio()?;
    let launch = startup.launched()?;

    let path = program
        .map(Path::to_path_buf)
        .or_else(|| launch.program.as_ref().map(PathBuf::from))
        .ok_or_else(|| Error::Config("no program given on the command line or in launch".into()))?;
    tracing::info!(program = %path.display(), stop_on_entry = launch.stop_on_entry, "DAP launch");

    session.nonstop = !launch.stop_on_entry;
    let runtime = SimRuntime::new(SimProgram::load(&path)?);
    runtime.debug_when(Box::new(frontend), session, || startup.configured())
}
