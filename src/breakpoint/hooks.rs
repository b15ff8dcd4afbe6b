//! Installed hooks
//!
//! The registry projects every active breakpoint into a [`Hook`]. Thread
//! control units look hooks up by event while the registry stays owned by
//! the coordinator.

use std::sync::{Arc, Mutex, PoisonError};

use super::BreakpointId;
use crate::runtime::{EventKind, TraceEvent, Value};

/// What an installed hook matches
#[derive(Debug)]
pub enum HookTarget {
    Line {
        path: String,
        line: u32,
        event: EventKind,
    },
    Method {
        owner: String,
        singleton: bool,
        name: String,
    },
    Catch {
        pattern: String,
    },
    /// Value of `expr` last seen by any thread
    Watch {
        expr: String,
        receiver: Option<u64>,
        current: Mutex<Option<Value>>,
    },
    Check {
        expr: String,
    },
}

/// An active breakpoint as seen by the threads
#[derive(Debug)]
pub struct Hook {
    pub id: BreakpointId,
    pub target: HookTarget,
    pub condition: Option<String>,
    pub oneshot: bool,
}

impl Hook {
    /// Static match against an event
    ///
    /// Watch and check hooks match every line-like event; whether they fire
    /// depends on evaluating their expression in the thread's frame.
    pub fn matches(&self, event: &TraceEvent) -> bool {
        match &self.target {
            HookTarget::Line { path, line, event: kind } => {
                event.kind == *kind && event.line == *line && event.path == *path
            }
            HookTarget::Method {
                owner,
                singleton,
                name,
            } => {
                event.kind == EventKind::Call
                    && event.method.as_ref().is_some_and(|m| {
                        m.owner == *owner && m.singleton == *singleton && m.name == *name
                    })
            }
            HookTarget::Catch { pattern } => {
                event.kind == EventKind::Raise
                    && event.exception.as_ref().is_some_and(|e| e.is_a(pattern))
            }
            HookTarget::Watch { .. } => matches!(
                event.kind,
                EventKind::Line | EventKind::Return | EventKind::BlockReturn
            ),
            HookTarget::Check { .. } => event.kind == EventKind::Line,
        }
    }

    /// Record a newly observed watch value
    ///
    /// Returns the previous value when it differs from `value`.
    pub fn update_watch(&self, value: &Value) -> Option<Option<Value>> {
        let HookTarget::Watch { current, .. } = &self.target else {
            return None;
        };
        let mut current = current.lock().unwrap_or_else(PoisonError::into_inner);
        if current.as_ref() == Some(value) {
            return None;
        }
        Some(current.replace(value.clone()))
    }
}

/// Hooks currently installed
#[derive(Debug, Default)]
pub struct HookTable {
    hooks: Vec<Arc<Hook>>,
}

impl HookTable {
    pub fn install(&mut self, hook: Hook) {
        self.remove(hook.id);
        self.hooks.push(Arc::new(hook));
    }

    /// Remove a hook; false when it was not installed
    pub fn remove(&mut self, id: BreakpointId) -> bool {
        let before = self.hooks.len();
        self.hooks.retain(|h| h.id != id);
        self.hooks.len() != before
    }

    pub fn clear(&mut self) {
        self.hooks.clear();
    }

    pub fn contains(&self, id: BreakpointId) -> bool {
        self.hooks.iter().any(|h| h.id == id)
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Hooks that may fire for the event, in installation order
    pub fn matching(&self, event: &TraceEvent) -> Vec<Arc<Hook>> {
        self.hooks
            .iter()
            .filter(|h| h.matches(event))
            .cloned()
            .collect()
    }

    /// Whether a location breakpoint sits on this line
    pub fn has_line(&self, path: &str, line: u32) -> bool {
        self.hooks.iter().any(|h| {
            matches!(&h.target, HookTarget::Line { path: p, line: l, .. } if p == path && *l == line)
        })
    }
}
