//! Messages between thread control units and the coordinator
//!
//! `SessionEvent` flows from every thread into the coordinator's single
//! inbox; `ThreadCommand` flows from the coordinator into one thread's
//! inbox. Both are plain data: no callbacks cross the boundary.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

use crate::breakpoint::BreakpointId;
use crate::runtime::{CodeUnit, Frame, NativeThreadId, Value};
use crate::thread::step::StepKind;

/// Why a thread suspended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspendKind {
    Breakpoint,
    Step,
    /// Forced stop while another thread is suspended
    Pause,
    /// External interrupt
    Trap,
    /// Uncaught exception with postmortem enabled
    Postmortem,
}

impl SuspendKind {
    /// Reason string used by structured front ends
    pub fn reason(self) -> &'static str {
        match self {
            SuspendKind::Breakpoint => "breakpoint",
            SuspendKind::Step => "step",
            SuspendKind::Pause | SuspendKind::Trap => "pause",
            SuspendKind::Postmortem => "exception",
        }
    }
}

/// A breakpoint firing as observed by the thread
#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    pub id: BreakpointId,
    /// Extra detail, e.g. the old and new value of a watch
    pub note: Option<String>,
}

/// Serializable summary of a frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameSummary {
    pub index: usize,
    pub name: String,
    pub path: String,
    pub line: u32,
    pub depth: usize,
}

impl FrameSummary {
    pub fn new(index: usize, frame: &Frame) -> Self {
        Self {
            index,
            name: frame.name.clone(),
            path: frame.path.clone(),
            line: frame.line,
            depth: frame.depth,
        }
    }

    pub fn location(&self) -> String {
        format!("{}:{}", self.path, self.line)
    }
}

/// A stop reported by a thread
#[derive(Debug, Clone)]
pub struct Suspend {
    pub thread: usize,
    pub kind: SuspendKind,
    pub hit: Option<Hit>,
    /// Formatted stop text (source listing, short backtrace)
    pub output: Vec<String>,
    /// Top frame at the stop
    pub frame: Option<FrameSummary>,
    /// Stack depth at the stop
    pub depth: usize,
}

/// Outcome of a request answered by a thread
#[derive(Debug, Clone)]
pub enum ResultKind {
    /// Plain text answer
    Output,
    /// Display expressions evaluated at a stop
    Display,
    /// A `watch` expression was evaluated and can be registered
    WatchArmed {
        expr: String,
        receiver: Option<u64>,
        value: Value,
    },
    /// A `trace pass` target was evaluated
    TracePass { expr: String, object: Value },
    /// Replay cursor moved; `active` is false once back at the live state
    Replay { active: bool },
    /// Structured stack trace
    Frames(Vec<FrameSummary>),
    /// Structured locals of the selected frame
    Locals(Vec<(String, Value)>),
    /// Structured evaluation result
    Evaluated(std::result::Result<Value, String>),
}

/// Events delivered to the coordinator
#[derive(Debug)]
pub enum SessionEvent {
    /// The main thread is ready; the session can run startup commands
    Init { thread: usize },
    ThreadBegin {
        thread: usize,
        native: NativeThreadId,
        name: String,
        management: bool,
        commands: UnboundedSender<ThreadCommand>,
    },
    ThreadEnd { thread: usize },
    /// A code unit was loaded; the thread waits until breakpoints are resolved
    Load {
        thread: usize,
        unit: Arc<CodeUnit>,
        output: Vec<String>,
    },
    /// Tracer output; the thread does not wait
    Trace { thread: usize, output: Vec<String> },
    Suspend(Suspend),
    Result {
        thread: usize,
        kind: ResultKind,
        output: Vec<String>,
    },
    /// The debuggee finished
    Shutdown { code: i32 },
    /// A front end has requests queued while the program runs
    Wake,
}

impl SessionEvent {
    /// Originating thread, if any
    pub fn thread(&self) -> Option<usize> {
        match self {
            SessionEvent::Init { thread }
            | SessionEvent::ThreadBegin { thread, .. }
            | SessionEvent::ThreadEnd { thread }
            | SessionEvent::Load { thread, .. }
            | SessionEvent::Trace { thread, .. }
            | SessionEvent::Result { thread, .. } => Some(*thread),
            SessionEvent::Suspend(s) => Some(s.thread),
            SessionEvent::Shutdown { .. } | SessionEvent::Wake => None,
        }
    }
}

/// Read-only queries answered from the thread's captured frames
#[derive(Debug, Clone, PartialEq)]
pub enum Show {
    Backtrace {
        max: Option<usize>,
        pattern: Option<String>,
    },
    /// Source around the selected frame; `None` continues the last listing
    List { start: Option<u32>, end: Option<u32> },
    Locals,
    Frame,
    Outline,
    Record,
    /// Structured frames for protocol front ends
    Frames,
    /// Structured locals of a frame (the selected one when `None`)
    Variables { frame: Option<usize> },
}

/// Frame selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameMove {
    To(usize),
    Up,
    Down,
}

/// How an expression result is reported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalMode {
    /// `p`: show the value
    Print,
    /// `eval`: evaluate for side effects, show only errors
    Silent,
    /// Arm a watch breakpoint
    Watch,
    /// Arm an object tracer
    TracePass,
    /// Answer a protocol request
    Structured,
}

/// Replay cursor movement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayMove {
    Back,
    Forward,
    Reset,
}

/// Commands delivered to a suspended thread
#[derive(Debug, Clone, PartialEq)]
pub enum ThreadCommand {
    /// Resume after an interactive stop; clears any step in progress
    Continue,
    /// Resume after a non-interactive wait, keeping step state
    Resume,
    Step { kind: StepKind, count: usize },
    Replay(ReplayMove),
    Record(bool),
    Show(Show),
    Frame(FrameMove),
    Eval { expr: String, mode: EvalMode },
    /// Evaluate display expressions (index, expression)
    Display(Vec<(usize, String)>),
}

impl ThreadCommand {
    /// Whether the thread leaves its wait loop on this command
    pub fn resumes(&self) -> bool {
        matches!(
            self,
            ThreadCommand::Continue | ThreadCommand::Resume | ThreadCommand::Step { .. }
        )
    }
}
