//! Scenario test runner
//!
//! Reads YAML test scenarios and drives a simulated program through a
//! real session. Assertions are made against structured responses
//! (frames, locals, evaluation results) rather than fragile string
//! matching wherever the session offers them.

mod config;
mod runner;

pub use config::*;
pub use runner::{load_scenario, run_all, run_scenario, TestResult};
