//! Breakpoints
//!
//! Breakpoint records live in the [`Registry`], owned by the coordinator
//! thread. Active breakpoints are projected into the shared
//! [`HookTable`] that thread control units consult on every event.

pub mod hooks;
pub mod registry;
pub mod resolve;

pub use hooks::{Hook, HookTable, HookTarget};
pub use registry::{AddOutcome, Registry};
pub use resolve::{resolve_location, Location};

use crate::runtime::Value;

/// Stable internal breakpoint identity
pub type BreakpointId = u64;

/// Activation state of a breakpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointState {
    /// Waiting for its code to be loaded
    Pending,
    Active,
    Disabled,
    Deleted,
}

impl std::fmt::Display for BreakpointState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakpointState::Pending => write!(f, "pending"),
            BreakpointState::Active => write!(f, "active"),
            BreakpointState::Disabled => write!(f, "disabled"),
            BreakpointState::Deleted => write!(f, "deleted"),
        }
    }
}

/// What a breakpoint watches for
#[derive(Debug, Clone, PartialEq)]
pub enum BreakpointKind {
    /// Source location; `resolved` is set once a loaded unit covers it
    Line {
        path: String,
        line: u32,
        hook_call: bool,
        resolved: Option<Location>,
    },
    /// Exception class pattern, matched against the raised class chain
    Catch { pattern: String },
    /// Method entry, `Klass#m` or `Klass.m`
    Method {
        owner: String,
        singleton: bool,
        name: String,
        /// Location of the defining unit once loaded
        resolved: Option<(String, u32)>,
    },
    /// Fires when an expression's value changes
    Watch {
        expr: String,
        /// Restrict evaluation to frames of this receiver
        receiver: Option<u64>,
        initial: Option<Value>,
    },
    /// Fires when an expression becomes truthy
    Check { expr: String },
}

/// Registry lookup and duplicate-detection key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BreakpointKey {
    Line(String, u32),
    Catch(String),
    Method(String),
    Watch(String),
    Check(String),
}

impl std::fmt::Display for BreakpointKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakpointKey::Line(path, line) => write!(f, "{}:{}", path, line),
            BreakpointKey::Catch(pattern) => write!(f, "catch {}", pattern),
            BreakpointKey::Method(sig) => write!(f, "{}", sig),
            BreakpointKey::Watch(expr) => write!(f, "watch {}", expr),
            BreakpointKey::Check(expr) => write!(f, "check {}", expr),
        }
    }
}

/// Commands attached to a breakpoint
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttachedCommands {
    /// Run before the stop is reported
    pub pre: Option<String>,
    /// Run, then continue automatically
    pub do_: Option<String>,
}

impl AttachedCommands {
    pub fn is_empty(&self) -> bool {
        self.pre.is_none() && self.do_.is_none()
    }
}

/// A breakpoint record
#[derive(Debug, Clone)]
pub struct Breakpoint {
    pub id: BreakpointId,
    pub kind: BreakpointKind,
    pub condition: Option<String>,
    pub commands: AttachedCommands,
    pub oneshot: bool,
    pub state: BreakpointState,
    pub hits: u64,
}

impl Breakpoint {
    /// Create a pending breakpoint; the registry assigns the id
    pub fn new(kind: BreakpointKind) -> Self {
        Self {
            id: 0,
            kind,
            condition: None,
            commands: AttachedCommands::default(),
            oneshot: false,
            state: BreakpointState::Pending,
            hits: 0,
        }
    }

    pub fn line(path: &str, line: u32, hook_call: bool) -> Self {
        Self::new(BreakpointKind::Line {
            path: path.to_string(),
            line,
            hook_call,
            resolved: None,
        })
    }

    pub fn catch(pattern: &str) -> Self {
        Self::new(BreakpointKind::Catch {
            pattern: pattern.to_string(),
        })
    }

    /// Method breakpoint from `Klass#m` or `Klass.m`
    pub fn method(signature: &str) -> Option<Self> {
        let (idx, singleton) = match (signature.rfind('#'), signature.rfind('.')) {
            (Some(i), _) => (i, false),
            (None, Some(i)) => (i, true),
            (None, None) => return None,
        };
        let (owner, name) = (&signature[..idx], &signature[idx + 1..]);
        if owner.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self::new(BreakpointKind::Method {
            owner: owner.to_string(),
            singleton,
            name: name.to_string(),
            resolved: None,
        }))
    }

    pub fn watch(expr: &str, receiver: Option<u64>, initial: Value) -> Self {
        Self::new(BreakpointKind::Watch {
            expr: expr.to_string(),
            receiver,
            initial: Some(initial),
        })
    }

    pub fn check(expr: &str) -> Self {
        Self::new(BreakpointKind::Check {
            expr: expr.to_string(),
        })
    }

    pub fn with_condition(mut self, condition: Option<String>) -> Self {
        self.condition = condition;
        self
    }

    pub fn with_commands(mut self, commands: AttachedCommands) -> Self {
        self.commands = commands;
        self
    }

    pub fn oneshot(mut self) -> Self {
        self.oneshot = true;
        self
    }

    /// Identity used for lookup and duplicate rejection
    pub fn key(&self) -> BreakpointKey {
        match &self.kind {
            BreakpointKind::Line {
                path,
                line,
                resolved,
                ..
            } => match resolved {
                Some(loc) => BreakpointKey::Line(loc.path.clone(), loc.line),
                None => BreakpointKey::Line(path.clone(), *line),
            },
            BreakpointKind::Catch { pattern } => BreakpointKey::Catch(pattern.clone()),
            BreakpointKind::Method {
                owner,
                singleton,
                name,
                ..
            } => BreakpointKey::Method(method_signature(owner, *singleton, name)),
            BreakpointKind::Watch { expr, .. } => BreakpointKey::Watch(expr.clone()),
            BreakpointKind::Check { expr } => BreakpointKey::Check(expr.clone()),
        }
    }

    /// Whether this breakpoint waits for code to load before it can activate
    pub fn needs_resolution(&self) -> bool {
        matches!(
            self.kind,
            BreakpointKind::Line { .. } | BreakpointKind::Method { .. }
        )
    }

    /// One-line description as shown by `info breakpoints` and at stops
    pub fn describe(&self) -> String {
        let pending = if self.state == BreakpointState::Pending {
            " (pending)"
        } else {
            ""
        };

        let mut text = match &self.kind {
            BreakpointKind::Line {
                path,
                line,
                resolved,
                ..
            } => match resolved {
                Some(loc) => format!("BP - Line  {}:{} ({})", loc.path, loc.line, loc.event),
                None => format!("BP - Line{}  {}:{}", pending, path, line),
            },
            BreakpointKind::Catch { pattern } => format!("BP - Catch  {:?}", pattern),
            BreakpointKind::Method {
                owner,
                singleton,
                name,
                resolved,
            } => {
                let sig = method_signature(owner, *singleton, name);
                match resolved {
                    Some((path, line)) => format!("BP - Method  {} at {}:{}", sig, path, line),
                    None => format!("BP - Method{}  {}", pending, sig),
                }
            }
            BreakpointKind::Watch { expr, initial, .. } => match initial {
                Some(value) => format!("BP - Watch  {} = {}", expr, value),
                None => format!("BP - Watch  {}", expr),
            },
            BreakpointKind::Check { expr } => format!("BP - Check  {}", expr),
        };

        if let Some(cond) = &self.condition {
            text.push_str(&format!(" if: {}", cond));
        }
        if let Some(pre) = &self.commands.pre {
            text.push_str(&format!(" pre: {}", pre));
        }
        if let Some(cmd) = &self.commands.do_ {
            text.push_str(&format!(" do: {}", cmd));
        }
        if self.state == BreakpointState::Disabled {
            text.push_str(" (disabled)");
        }
        text
    }
}

/// `Klass#m` for instance methods, `Klass.m` for singleton methods
pub fn method_signature(owner: &str, singleton: bool, name: &str) -> String {
    format!("{}{}{}", owner, if singleton { "." } else { "#" }, name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::EventKind;

    #[test]
    fn test_method_signature_parsing() {
        let bp = Breakpoint::method("Foo#bar").unwrap();
        assert_eq!(bp.key(), BreakpointKey::Method("Foo#bar".into()));

        let bp = Breakpoint::method("Foo::Baz.create").unwrap();
        match &bp.kind {
            BreakpointKind::Method {
                owner, singleton, name, ..
            } => {
                assert_eq!(owner, "Foo::Baz");
                assert!(singleton);
                assert_eq!(name, "create");
            }
            other => panic!("unexpected kind {:?}", other),
        }

        assert!(Breakpoint::method("bar").is_none());
        assert!(Breakpoint::method("Foo#").is_none());
    }

    #[test]
    fn test_line_key_follows_resolution() {
        let mut bp = Breakpoint::line("foo.rb", 4, true);
        assert_eq!(bp.key(), BreakpointKey::Line("foo.rb".into(), 4));
        assert_eq!(bp.describe(), "BP - Line (pending)  foo.rb:4");

        if let BreakpointKind::Line { resolved, .. } = &mut bp.kind {
            *resolved = Some(Location {
                path: "/app/foo.rb".into(),
                line: 5,
                event: EventKind::Line,
                unit: 1,
            });
        }
        bp.state = BreakpointState::Active;
        assert_eq!(bp.key(), BreakpointKey::Line("/app/foo.rb".into(), 5));
        assert_eq!(bp.describe(), "BP - Line  /app/foo.rb:5 (line)");
    }

    #[test]
    fn test_description_includes_condition_and_commands() {
        let bp = Breakpoint::catch("ZeroDivisionError")
            .with_condition(Some("x > 1".into()))
            .with_commands(AttachedCommands {
                pre: Some("p x".into()),
                do_: Some("bt".into()),
            });
        assert_eq!(
            bp.describe(),
            "BP - Catch  \"ZeroDivisionError\" if: x > 1 pre: p x do: bt"
        );
    }
}
