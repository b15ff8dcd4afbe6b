//! rdbg - an interactive debugger engine
//!
//! A session coordinator drives program threads that report their events
//! through the host runtime's introspection contract, and talks to users
//! through pluggable front ends (local console, remote text protocol, DAP).

pub mod breakpoint;
pub mod cli;
pub mod commands;
pub mod common;
pub mod frontend;
pub mod runtime;
pub mod session;
pub mod testing;
pub mod thread;

// Re-export commonly used types for tests
pub use common::{Error, Result};
