//! Configuration file handling
//!
//! Settings come from `config.toml` in the config directory, then CLI flags
//! override individual fields. The `[session]` table also holds the subset
//! that the `config` REPL command can change while a session is running.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::paths::config_path;
use super::{Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Session behaviour
    #[serde(default)]
    pub session: SessionConfig,

    /// Remote (text protocol) front end
    #[serde(default)]
    pub remote: RemoteConfig,
}

/// Session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Enter postmortem mode on uncaught exceptions
    #[serde(default)]
    pub postmortem: bool,

    /// Source lines shown around the stop location
    #[serde(default = "default_show_src_lines")]
    pub show_src_lines: usize,

    /// Frames shown in the short backtrace at a stop
    #[serde(default = "default_show_frames")]
    pub show_frames: usize,

    /// Path prefixes skipped by `step`
    #[serde(default)]
    pub skip_paths: Vec<String>,

    /// Skip locations without readable source while stepping
    #[serde(default)]
    pub skip_nosrc: bool,

    /// Maximum frames kept by the replay recorder
    #[serde(default = "default_record_log_size")]
    pub record_log_size: usize,

    /// Do not stop at program start
    #[serde(default)]
    pub nonstop: bool,

    /// Commands run before prompting (like an init script)
    #[serde(default)]
    pub commands: Vec<String>,

    /// Snap line breakpoints on a method's first line to its call event
    #[serde(default = "default_true")]
    pub hook_call: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            postmortem: false,
            show_src_lines: default_show_src_lines(),
            show_frames: default_show_frames(),
            skip_paths: Vec::new(),
            skip_nosrc: false,
            record_log_size: default_record_log_size(),
            nonstop: false,
            commands: Vec::new(),
            hook_call: true,
        }
    }
}

fn default_show_src_lines() -> usize {
    10
}
fn default_show_frames() -> usize {
    2
}
fn default_record_log_size() -> usize {
    10_000
}
fn default_true() -> bool {
    true
}

impl SessionConfig {
    /// Names accepted by `config set`
    pub const KEYS: &'static [&'static str] = &[
        "show_src_lines",
        "show_frames",
        "skip_nosrc",
        "postmortem",
        "record_log_size",
    ];

    /// Change a runtime setting by name
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
            value
                .parse()
                .map_err(|_| Error::Config(format!("invalid value for {}: {}", key, value)))
        }

        match key {
            "show_src_lines" => self.show_src_lines = parse(key, value)?,
            "show_frames" => self.show_frames = parse(key, value)?,
            "skip_nosrc" => self.skip_nosrc = parse(key, value)?,
            "postmortem" => self.postmortem = parse(key, value)?,
            "record_log_size" => self.record_log_size = parse(key, value)?,
            _ => return Err(Error::Config(format!("unknown configuration: {}", key))),
        }
        Ok(())
    }

    /// Current value of a runtime setting
    pub fn get(&self, key: &str) -> Option<String> {
        let value = match key {
            "show_src_lines" => self.show_src_lines.to_string(),
            "show_frames" => self.show_frames.to_string(),
            "skip_nosrc" => self.skip_nosrc.to_string(),
            "postmortem" => self.postmortem.to_string(),
            "record_log_size" => self.record_log_size.to_string(),
            _ => return None,
        };
        Some(value)
    }
}

/// Remote front end configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    /// Host to bind for TCP sessions
    #[serde(default = "default_host")]
    pub host: String,

    /// TCP port; a Unix socket is used when unset
    #[serde(default)]
    pub port: Option<u16>,

    /// Explicit socket path
    #[serde(default)]
    pub sock_path: Option<PathBuf>,

    /// Shared secret the client must present in its greeting
    #[serde(default)]
    pub cookie: Option<String>,

    /// Terminal width assumed until the client reports one
    #[serde(default = "default_width")]
    pub width: usize,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: None,
            sock_path: None,
            cookie: None,
            width: default_width(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_width() -> usize {
    80
}

impl Config {
    /// Load configuration from the default config file
    ///
    /// Returns default configuration if file doesn't exist
    pub fn load() -> Result<Self> {
        if let Some(path) = config_path() {
            if path.exists() {
                return Self::load_from(&path);
            }
        }
        Ok(Self::default())
    }

    /// Load configuration from an explicit file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::FileRead {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;
        toml::from_str(&content).map_err(|e| Error::ConfigParse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_file() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.session.show_src_lines, 10);
        assert_eq!(config.session.show_frames, 2);
        assert!(config.session.hook_call);
        assert_eq!(config.remote.width, 80);
        assert!(config.remote.port.is_none());
    }

    #[test]
    fn test_partial_session_table() {
        let config: Config = toml::from_str(
            r#"
[session]
postmortem = true
skip_paths = ["/usr/lib"]
commands = ["break main.rb:3"]

[remote]
port = 12345
cookie = "secret"
"#,
        )
        .unwrap();
        assert!(config.session.postmortem);
        assert_eq!(config.session.skip_paths, vec!["/usr/lib".to_string()]);
        assert_eq!(config.session.commands.len(), 1);
        assert_eq!(config.remote.port, Some(12345));
        assert_eq!(config.remote.cookie.as_deref(), Some("secret"));
    }

    #[test]
    fn test_set_runtime_value() {
        let mut session = SessionConfig::default();
        session.set("show_frames", "5").unwrap();
        assert_eq!(session.get("show_frames").as_deref(), Some("5"));
        assert!(session.set("show_frames", "many").is_err());
        assert!(session.set("nonexistent", "1").is_err());
    }
}
