//! Error types for the debugger engine
//!
//! Command-level errors are recoverable: the session reports them to the
//! front end and prompts again. Transport errors close one connection.
//! Only `Internal` is fatal to the session.

use std::io;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the debugger engine
#[derive(Error, Debug)]
pub enum Error {
    // === Command Errors ===
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("{0}")]
    InvalidCommand(String),

    #[error("{0}")]
    Evaluation(String),

    #[error("No thread is suspended. Use 'pause' or wait for a breakpoint")]
    NotSuspended,

    #[error("Thread #{0} not found. Use 'info threads' to see available threads")]
    ThreadNotFound(usize),

    #[error("Thread #{0} is running and cannot be selected")]
    ThreadRunning(usize),

    #[error("Frame {0} not found")]
    FrameNotFound(usize),

    // === Breakpoint Errors ===
    #[error("Breakpoint #{0} not found")]
    BreakpointNotFound(usize),

    #[error("Invalid breakpoint location: {0}")]
    InvalidLocation(String),

    #[error("Failed to set breakpoint at {location}: {reason}")]
    HookRegistration { location: String, reason: String },

    // === Mode Violations ===
    #[error("'{command}' is not supported in postmortem mode")]
    Postmortem { command: String },

    #[error("'{command}' is not supported in replay mode")]
    Replay { command: String },

    // === Protocol Errors ===
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Protocol version mismatch: server {server}, client {client}")]
    VersionMismatch { server: String, client: String },

    #[error("Cookie mismatch")]
    CookieMismatch,

    #[error("Front end disconnected")]
    Disconnected,

    // === Configuration Errors ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(String),

    #[error("Failed to read file '{path}': {error}")]
    FileRead { path: String, error: String },

    #[error("Invalid program '{path}': {reason}")]
    InvalidProgram { path: String, reason: String },

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // === Serialization Errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Test Errors ===
    #[error("Test assertion failed: {0}")]
    TestAssertion(String),

    // === Internal Errors ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an invalid command error
    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Self::InvalidCommand(message.into())
    }

    /// Create a postmortem violation for the given command
    pub fn postmortem(command: &str) -> Self {
        Self::Postmortem {
            command: command.to_string(),
        }
    }

    /// Create a replay-mode violation for the given command
    pub fn replay(command: &str) -> Self {
        Self::Replay {
            command: command.to_string(),
        }
    }

    /// Create a hook registration error
    pub fn hook_registration(location: &str, reason: &str) -> Self {
        Self::HookRegistration {
            location: location.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether the command-wait loop may report this error and prompt again
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Error::Internal(_) | Error::Disconnected)
    }
}
