//! Test scenario configuration types
//!
//! Defines the data structures for deserializing YAML test scenarios.

use serde::Deserialize;
use std::path::PathBuf;

use crate::common::config::SessionConfig;

/// A complete test scenario loaded from a YAML file
#[derive(Deserialize, Debug)]
pub struct TestScenario {
    /// Name of the test scenario
    pub name: String,
    /// Optional description of what the test verifies
    pub description: Option<String>,
    /// Simulated program to debug, relative to the scenario file
    pub program: PathBuf,
    /// Session settings for the run
    #[serde(default)]
    pub session: SessionConfig,
    /// Seconds to wait for the session after each step (default: 10)
    pub timeout: Option<u64>,
    /// The sequence of test steps to execute
    pub steps: Vec<TestStep>,
}

/// A single test step in the execution flow
#[derive(Deserialize, Debug)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TestStep {
    /// Type a REPL command
    Command {
        /// The command line (e.g., "break main.rb:3", "continue")
        command: String,
        /// Reply to a confirmation question the command asks
        answer: Option<String>,
        /// Optional expectations for the command output
        expect: Option<CommandExpectation>,
    },
    /// Check the stop the previous command ended in
    Await {
        /// Expected stop event properties
        expect: Option<StopExpectation>,
    },
    /// Inspect local variables and make assertions
    InspectLocals {
        /// Variable assertions to check
        asserts: Vec<VariableAssertion>,
    },
    /// Inspect the call stack
    InspectStack {
        /// Frame assertions to check
        asserts: Vec<FrameAssertion>,
    },
    /// Check everything the session printed so far
    CheckOutput {
        /// Expected substring in output
        contains: Option<String>,
        /// Substring that must not appear
        not_contains: Option<String>,
    },
    /// Evaluate an expression
    Evaluate {
        /// Expression to evaluate
        expression: String,
        /// Expected result
        expect: Option<EvaluateExpectation>,
    },
    /// Wait for the session to end
    Finish {
        /// Expected exit status
        exit_code: Option<i32>,
    },
}

/// Expectations for a command result
#[derive(Deserialize, Debug)]
pub struct CommandExpectation {
    /// Substring that should be in the output
    pub output_contains: Option<String>,
    /// Substring that must not be in the output
    pub output_not_contains: Option<String>,
}

/// Expectations for a stop event
#[derive(Deserialize, Debug)]
pub struct StopExpectation {
    /// Expected stop reason (e.g., "breakpoint", "step", "pause")
    pub reason: Option<String>,
    /// Expected source file (partial match)
    pub file: Option<String>,
    /// Expected line number
    pub line: Option<u32>,
}

/// Assertion for a variable
#[derive(Deserialize, Debug)]
pub struct VariableAssertion {
    /// Variable name to check
    pub name: String,
    /// Expected value (exact match)
    pub value: Option<String>,
    /// Expected value substring (partial match)
    pub value_contains: Option<String>,
    /// Expected class name
    #[serde(rename = "type")]
    pub type_name: Option<String>,
}

/// Assertion for a stack frame
#[derive(Deserialize, Debug)]
pub struct FrameAssertion {
    /// Frame index (0 = current/innermost)
    pub index: usize,
    /// Expected frame name (partial match)
    pub function: Option<String>,
    /// Expected source file (partial match)
    pub file: Option<String>,
    /// Expected line number
    pub line: Option<u32>,
}

/// Expectations for an evaluate result
#[derive(Deserialize, Debug)]
pub struct EvaluateExpectation {
    /// Whether the evaluation should succeed (default: true)
    pub success: Option<bool>,
    /// Expected result value
    pub result: Option<String>,
    /// Expected substring of the result or error message
    pub result_contains: Option<String>,
    /// Expected class name
    #[serde(rename = "type")]
    pub type_name: Option<String>,
}
