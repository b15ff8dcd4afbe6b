//! CLI command definitions
//!
//! Defines the clap commands for the rdbg CLI.

use clap::{Args, Subcommand};
use std::path::PathBuf;

use crate::common::config::{Config, RemoteConfig, SessionConfig};

#[derive(Subcommand)]
pub enum Commands {
    /// Run a program under the debugger
    Run {
        /// Path to the program description (YAML)
        program: PathBuf,

        /// Command to run before the first prompt
        /// Can be specified multiple times: -x 'break main.rb:3' -x continue
        #[arg(short = 'x', long = "command")]
        commands: Vec<String>,

        /// Do not stop at the beginning of the program
        #[arg(long)]
        nonstop: bool,

        /// Enter postmortem mode on uncaught exceptions
        #[arg(long)]
        postmortem: bool,

        /// Wait for a remote client (`rdbg attach`) instead of using this terminal
        #[arg(short = 'O', long)]
        open: bool,

        #[command(flatten)]
        remote: RemoteArgs,
    },

    /// Attach this terminal to a session started with `run --open`
    Attach {
        #[command(flatten)]
        remote: RemoteArgs,
    },

    /// Serve the Debug Adapter Protocol over stdio
    Dap {
        /// Path to the program description; defaults to the launch request's `program`
        program: Option<PathBuf>,
    },

    /// Execute test scenarios defined in YAML files
    Test {
        /// Paths to the YAML test scenario files
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Verbose output
        #[arg(long, short)]
        verbose: bool,
    },
}

impl Commands {
    /// Whether the command's standard streams carry a protocol or are
    /// handed to a remote client, so logs must go to a file
    pub fn is_server(&self) -> bool {
        matches!(self, Commands::Run { open: true, .. } | Commands::Dap { .. })
    }
}

/// Where a remote session listens or is found
#[derive(Args, Debug, Clone, Default)]
pub struct RemoteArgs {
    /// TCP port (a local socket is used otherwise)
    #[arg(long, conflicts_with = "sock")]
    pub port: Option<u16>,

    /// Host for TCP sessions
    #[arg(long, requires = "port")]
    pub host: Option<String>,

    /// Local socket path
    #[arg(long)]
    pub sock: Option<PathBuf>,

    /// Shared secret clients must present
    #[arg(long)]
    pub cookie: Option<String>,
}

impl RemoteArgs {
    /// Override configured values with the flags that were given
    pub fn apply(self, config: &mut RemoteConfig) {
        if let Some(port) = self.port {
            config.port = Some(port);
            config.sock_path = None;
        }
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(sock) = self.sock {
            config.sock_path = Some(sock);
            config.port = None;
        }
        if self.cookie.is_some() {
            config.cookie = self.cookie;
        }
    }
}

/// Apply `run` flags to the session settings
pub fn apply_run_flags(
    session: &mut SessionConfig,
    commands: Vec<String>,
    nonstop: bool,
    postmortem: bool,
) {
    session.commands.extend(commands);
    session.nonstop |= nonstop;
    session.postmortem |= postmortem;
}

/// Configuration with an explicit file taking the place of the default one
pub fn load_config(path: Option<&std::path::Path>) -> crate::common::Result<Config> {
    match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_flags_override_config() {
        let mut config = RemoteConfig {
            port: Some(1),
            ..RemoteConfig::default()
        };
        RemoteArgs {
            sock: Some(PathBuf::from("/tmp/x.sock")),
            cookie: Some("c".into()),
            ..RemoteArgs::default()
        }
        .apply(&mut config);
        assert_eq!(config.port, None);
        assert_eq!(config.sock_path, Some(PathBuf::from("/tmp/x.sock")));
        assert_eq!(config.cookie.as_deref(), Some("c"));
    }

    #[test]
    fn test_run_flags_extend_presets() {
        let mut session = SessionConfig {
            commands: vec!["info".into()],
            ..SessionConfig::default()
        };
        apply_run_flags(&mut session, vec!["continue".into()], true, false);
        assert_eq!(session.commands, vec!["info".to_string(), "continue".to_string()]);
        assert!(session.nonstop);
        assert!(!session.postmortem);
    }
}
