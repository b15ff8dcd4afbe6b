//! Introspection contract with the host runtime
//!
//! The engine never instruments a program itself. The host runtime owns
//! the execution threads and reports events on each of them through that
//! thread's [`ThreadClient`](crate::thread::ThreadClient); the engine calls
//! back through [`Runtime`] to capture frames, evaluate expressions and
//! enumerate loaded code.

pub mod expr;
pub mod sim;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Host-assigned thread identity
pub type NativeThreadId = u64;

/// Opaque handle to a frame's lexical context
pub type BindingId = u64;

/// Kinds of runtime events a hook may observe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A new line starts executing
    Line,
    /// A method is entered
    Call,
    /// A method returns
    Return,
    /// A block is entered
    BlockCall,
    /// A block returns
    BlockReturn,
    /// An exception is raised
    Raise,
}

impl EventKind {
    /// Whether the event leaves a frame
    pub fn is_return(self) -> bool {
        matches!(self, EventKind::Return | EventKind::BlockReturn)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Line => "line",
            EventKind::Call => "call",
            EventKind::Return => "return",
            EventKind::BlockCall => "b_call",
            EventKind::BlockReturn => "b_return",
            EventKind::Raise => "raise",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structural kind of a code unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    /// Top-level script body
    #[default]
    Script,
    /// Method body
    Method,
    /// Block body
    Block,
    /// Compiler-duplicated cleanup region
    Ensure,
}

/// A compiled unit of source with known breakable lines
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeUnit {
    pub id: u64,
    pub path: String,
    pub name: String,
    /// Owning class or module for methods
    pub owner: Option<String>,
    /// Singleton (class-level) method
    pub singleton: bool,
    pub kind: UnitKind,
    pub first_line: u32,
    pub last_line: u32,
    /// Breakable line → events on that line, nested units excluded
    pub lines: BTreeMap<u32, Vec<EventKind>>,
}

impl CodeUnit {
    /// Whether this unit defines the given method
    pub fn defines(&self, owner: &str, singleton: bool, name: &str) -> bool {
        self.kind == UnitKind::Method
            && self.owner.as_deref() == Some(owner)
            && self.singleton == singleton
            && self.name == name
    }

    /// Whether this unit belongs to the requested source path
    ///
    /// Relative requests match any unit whose path ends with them.
    pub fn matches_path(&self, path: &str) -> bool {
        if self.path == path {
            return true;
        }
        !path.starts_with('/')
            && self.path.ends_with(path)
            && self.path[..self.path.len() - path.len()].ends_with('/')
    }
}

/// A value produced by the runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Value {
    pub class_name: String,
    /// Class chain starting with `class_name`
    #[serde(default)]
    pub ancestors: Vec<String>,
    pub repr: String,
    /// Object identity; 0 for immediates
    #[serde(default)]
    pub id: u64,
}

impl Value {
    pub fn new(class_name: &str, repr: &str) -> Self {
        Self {
            class_name: class_name.to_string(),
            ancestors: vec![class_name.to_string()],
            repr: repr.to_string(),
            id: 0,
        }
    }

    pub fn nil() -> Self {
        Self::new("NilClass", "nil")
    }

    pub fn boolean(value: bool) -> Self {
        if value {
            Self::new("TrueClass", "true")
        } else {
            Self::new("FalseClass", "false")
        }
    }

    /// Truthiness: everything except `nil` and `false`
    pub fn is_truthy(&self) -> bool {
        self.class_name != "NilClass" && self.class_name != "FalseClass"
    }

    /// Whether the value is an instance of `class` or one of its subclasses
    pub fn is_a(&self, class: &str) -> bool {
        self.class_name == class || self.ancestors.iter().any(|a| a == class)
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.repr)
    }
}

/// Kind of a stack frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    Method,
    Block,
    #[default]
    Other,
}

/// Immutable snapshot of one stack frame
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub kind: FrameKind,
    /// Display name, e.g. `Foo#bar`, `block in Foo#bar`, `<main>`
    pub name: String,
    pub owner: Option<String>,
    pub path: String,
    pub line: u32,
    /// Call-stack depth, 1 for the outermost frame
    pub depth: usize,
    /// Code unit the frame executes
    pub unit: Option<u64>,
    pub binding: BindingId,
    /// Identity of `self`
    pub receiver: Option<u64>,
    pub return_value: Option<Value>,
    pub locals: Vec<(String, Value)>,
}

impl Frame {
    pub fn location(&self) -> String {
        format!("{}:{}", self.path, self.line)
    }
}

/// Method identity carried by call/return events
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodRef {
    pub owner: String,
    pub singleton: bool,
    pub name: String,
}

/// One event reported by the host on the thread where it happened
#[derive(Debug, Clone, PartialEq)]
pub struct TraceEvent {
    pub kind: EventKind,
    pub path: String,
    pub line: u32,
    /// Depth of the frame where the event happens
    pub depth: usize,
    pub method: Option<MethodRef>,
    pub return_value: Option<Value>,
    pub exception: Option<Value>,
}

impl TraceEvent {
    pub fn new(kind: EventKind, path: &str, line: u32, depth: usize) -> Self {
        Self {
            kind,
            path: path.to_string(),
            line,
            depth,
            method: None,
            return_value: None,
            exception: None,
        }
    }
}

/// The host runtime's introspection capabilities
///
/// Implementations must be callable from any debuggee thread; calls for a
/// thread are only made from that thread or while it is suspended.
pub trait Runtime: Send + Sync + 'static {
    /// Capture the call stack of a thread, innermost frame first
    fn capture_frames(&self, thread: NativeThreadId) -> Vec<Frame>;

    /// Evaluate an expression in a frame's lexical context
    fn evaluate(
        &self,
        thread: NativeThreadId,
        frame: &Frame,
        expr: &str,
    ) -> std::result::Result<Value, String>;

    /// All live threads
    fn live_threads(&self) -> Vec<NativeThreadId>;

    /// All currently loaded code units, nested units flattened
    fn loaded_units(&self) -> Vec<Arc<CodeUnit>>;

    /// Whether a hook can be placed at the location
    fn check_instrumentable(&self, _path: &str, _line: u32) -> std::result::Result<(), String> {
        Ok(())
    }

    /// Source text of a file, one entry per line
    fn source_lines(&self, path: &str) -> Option<Vec<String>> {
        std::fs::read_to_string(path)
            .ok()
            .map(|content| content.lines().map(str::to_string).collect())
    }

    /// Terminate the debuggee process with an exit status
    fn terminate(&self, code: i32);

    /// Look up a loaded unit by id
    fn unit(&self, id: u64) -> Option<Arc<CodeUnit>> {
        self.loaded_units().into_iter().find(|u| u.id == id)
    }
}
