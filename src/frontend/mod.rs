//! Front ends
//!
//! A front end is the session's only way to talk to a user or an IDE. The
//! coordinator owns it and calls it from its own thread; implementations
//! that need background I/O run it on threads of their own and hand data
//! over through channels.

pub mod console;
pub mod dap;
pub mod remote;
pub mod scripted;

use crate::breakpoint::BreakpointId;
use crate::common::Result;
use crate::thread::Interrupter;

/// One unit of input from a front end
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    /// REPL text, parsed by the command grammar
    Line(String),
    /// Pre-decoded protocol request; answered with a `Response` event
    Request { id: i64, request: Request },
    /// The user interrupted while at the prompt
    Interrupt,
    /// The front end will never produce more input
    Closed,
}

/// Structured requests from protocol front ends
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Replace all line breakpoints of one file
    SetBreakpoints { path: String, lines: Vec<u32> },
    /// Replace all exception breakpoints
    SetExceptionBreakpoints { patterns: Vec<String> },
    Threads,
    StackTrace { thread: usize },
    Locals { thread: usize, frame: Option<usize> },
    Evaluate { thread: Option<usize>, expr: String },
    Continue,
    Next,
    StepIn,
    StepOut,
    Pause,
    Disconnect { terminate: bool },
}

impl Request {
    /// Whether the request can be answered while the program runs
    pub fn allowed_while_running(&self) -> bool {
        matches!(
            self,
            Request::SetBreakpoints { .. }
                | Request::SetExceptionBreakpoints { .. }
                | Request::Threads
                | Request::Pause
                | Request::Disconnect { .. }
        )
    }
}

/// Session events reported to front ends
#[derive(Debug, Clone, PartialEq)]
pub enum FrontEvent {
    Stopped {
        thread: usize,
        reason: String,
        breakpoint: Option<BreakpointId>,
    },
    Continued {
        thread: usize,
    },
    ThreadStarted {
        thread: usize,
        name: String,
    },
    ThreadExited {
        thread: usize,
    },
    Terminated {
        code: i32,
    },
    /// Answer to a [`Request`]
    Response {
        id: i64,
        result: std::result::Result<serde_json::Value, String>,
    },
}

/// The contract every front end implements
pub trait FrontEnd: Send {
    /// Called once before the session starts
    fn connect(&mut self, _interrupter: Interrupter) {}

    /// Block until the next command
    fn next_command(&mut self, prompt: &str) -> Result<Input>;

    /// Input that arrived while the program was running, without blocking
    fn poll(&mut self) -> Vec<Input> {
        Vec::new()
    }

    fn emit_output(&mut self, lines: &[String]);

    fn emit_event(&mut self, _event: &FrontEvent) {}

    /// Ask a question and wait for the answer
    fn ask(&mut self, prompt: &str) -> Result<String>;

    /// The session is ending
    fn quit(&mut self, _code: i32) {}

    /// Terminal width in columns
    fn width(&self) -> usize {
        80
    }
}

/// Whether a confirmation answer means yes
///
/// An empty answer takes the default.
pub fn confirmed(answer: &str, default: bool) -> bool {
    match answer.trim().chars().next() {
        None => default,
        Some(c) => c.eq_ignore_ascii_case(&'y'),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confirmation_answers() {
        assert!(confirmed("", true));
        assert!(!confirmed("", false));
        assert!(confirmed("Yes", false));
        assert!(!confirmed("n", true));
    }

    #[test]
    fn test_running_requests() {
        assert!(Request::Threads.allowed_while_running());
        assert!(!Request::Next.allowed_while_running());
    }
}
