//! State shared between the coordinator and every thread control unit
//!
//! Registry, thread table and current-thread selection stay on the
//! coordinator thread. Only what threads must consult on every event lives
//! here: installed hooks, tracers, runtime settings and the stop flags.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::mpsc::UnboundedSender;

use crate::breakpoint::HookTable;
use crate::common::config::SessionConfig;
use crate::runtime::{EventKind, Frame, Runtime, TraceEvent, Value};
use crate::session::event::SessionEvent;

/// What a tracer reports
#[derive(Debug, Clone, PartialEq)]
pub enum TraceKind {
    Line,
    Call,
    Exception,
    /// Uses of one object as receiver or argument
    Pass { expr: String, object: Value },
}

impl TraceKind {
    pub fn describe(&self) -> String {
        match self {
            TraceKind::Line => "LineTracer".to_string(),
            TraceKind::Call => "CallTracer".to_string(),
            TraceKind::Exception => "ExceptionTracer".to_string(),
            TraceKind::Pass { expr, object } => format!("ObjectTracer for {} ({})", expr, object),
        }
    }

    fn tag(&self) -> &'static str {
        match self {
            TraceKind::Line => "line",
            TraceKind::Call => "call",
            TraceKind::Exception => "exception",
            TraceKind::Pass { .. } => "object",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tracer {
    pub id: usize,
    pub kind: TraceKind,
}

impl Tracer {
    /// Text for an event, `None` when the tracer ignores it
    ///
    /// `top` yields the frame the event happened in; it is only called by
    /// tracers that need it.
    pub fn render(
        &self,
        thread: usize,
        event: &TraceEvent,
        top: impl FnOnce() -> Option<Frame>,
    ) -> Option<String> {
        let prefix = format!(
            "DEBUGGER (trace/{}) #th:{} #depth:{}",
            self.kind.tag(),
            thread,
            event.depth
        );
        let location = format!("{}:{}", event.path, event.line);
        let method = || {
            event
                .method
                .as_ref()
                .map(|m| crate::breakpoint::method_signature(&m.owner, m.singleton, &m.name))
                .unwrap_or_else(|| "?".to_string())
        };
        let indent = " ".repeat(event.depth.saturating_sub(1));

        match &self.kind {
            TraceKind::Line if event.kind == EventKind::Line => {
                Some(format!("{}  at {}", prefix, location))
            }
            TraceKind::Call if event.kind == EventKind::Call => {
                Some(format!("{} >{} {} at {}", prefix, indent, method(), location))
            }
            TraceKind::Call if event.kind == EventKind::Return => {
                let value = event
                    .return_value
                    .as_ref()
                    .map(|v| v.repr.as_str())
                    .unwrap_or("nil");
                Some(format!(
                    "{} <{} {} #=> {} at {}",
                    prefix,
                    indent,
                    method(),
                    value,
                    location
                ))
            }
            TraceKind::Exception if event.kind == EventKind::Raise => {
                let exception = event.exception.as_ref()?;
                Some(format!("{} {} at {}", prefix, exception, location))
            }
            TraceKind::Pass { object, .. } if event.kind == EventKind::Call && object.id != 0 => {
                let frame = top()?;
                if frame.receiver == Some(object.id) {
                    return Some(format!(
                        "{} {} is used as a receiver of {} at {}",
                        prefix,
                        object,
                        method(),
                        location
                    ));
                }
                let (name, _) = frame.locals.iter().find(|(_, v)| v.id == object.id)?;
                Some(format!(
                    "{} {} is used as a parameter {} of {} at {}",
                    prefix,
                    object,
                    name,
                    method(),
                    location
                ))
            }
            _ => None,
        }
    }
}

/// Shared engine state
pub struct Control {
    runtime: Arc<dyn Runtime>,
    events: UnboundedSender<SessionEvent>,
    hooks: Arc<RwLock<HookTable>>,
    tracers: RwLock<Vec<Arc<Tracer>>>,
    settings: RwLock<SessionConfig>,
    active: AtomicBool,
    stop_all: AtomicBool,
    trap: AtomicBool,
    next_thread: AtomicUsize,
    next_tracer: AtomicUsize,
    /// Columns of the attached front end
    width: AtomicUsize,
}

impl Control {
    pub fn new(
        runtime: Arc<dyn Runtime>,
        events: UnboundedSender<SessionEvent>,
        settings: SessionConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            events,
            hooks: Arc::new(RwLock::new(HookTable::default())),
            tracers: RwLock::new(Vec::new()),
            settings: RwLock::new(settings),
            active: AtomicBool::new(true),
            stop_all: AtomicBool::new(false),
            trap: AtomicBool::new(false),
            next_thread: AtomicUsize::new(1),
            next_tracer: AtomicUsize::new(0),
            width: AtomicUsize::new(80),
        })
    }

    pub fn runtime(&self) -> &Arc<dyn Runtime> {
        &self.runtime
    }

    /// Post an event to the coordinator; false once it has gone away
    pub fn send(&self, event: SessionEvent) -> bool {
        self.events.send(event).is_ok()
    }

    pub fn events(&self) -> UnboundedSender<SessionEvent> {
        self.events.clone()
    }

    /// The hook table, shared with the breakpoint registry
    pub fn hook_table(&self) -> Arc<RwLock<HookTable>> {
        Arc::clone(&self.hooks)
    }

    pub fn hooks(&self) -> RwLockReadGuard<'_, HookTable> {
        self.hooks.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn hooks_mut(&self) -> RwLockWriteGuard<'_, HookTable> {
        self.hooks.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn tracers(&self) -> Vec<Arc<Tracer>> {
        self.tracers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn add_tracer(&self, kind: TraceKind) -> usize {
        let id = self.next_tracer.fetch_add(1, Ordering::SeqCst);
        self.tracers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(Tracer { id, kind }));
        id
    }

    /// Remove tracers matching a predicate, returning how many were removed
    pub fn remove_tracers(&self, pred: impl Fn(&Tracer) -> bool) -> usize {
        let mut tracers = self.tracers.write().unwrap_or_else(PoisonError::into_inner);
        let before = tracers.len();
        tracers.retain(|t| !pred(t));
        before - tracers.len()
    }

    /// Read runtime settings
    pub fn settings(&self) -> RwLockReadGuard<'_, SessionConfig> {
        self.settings.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn settings_mut(&self) -> RwLockWriteGuard<'_, SessionConfig> {
        self.settings.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn width(&self) -> usize {
        self.width.load(Ordering::Relaxed)
    }

    pub fn set_width(&self, width: usize) {
        self.width.store(width, Ordering::Relaxed);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Stop intercepting events: hooks, tracers and stop requests go away
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.stop_all.store(false, Ordering::SeqCst);
        self.trap.store(false, Ordering::SeqCst);
        self.hooks_mut().clear();
        self.remove_tracers(|_| true);
    }

    pub fn set_stop_all(&self, on: bool) {
        self.stop_all.store(on, Ordering::SeqCst);
    }

    pub fn stop_all_requested(&self) -> bool {
        self.stop_all.load(Ordering::SeqCst)
    }

    pub fn request_trap(&self) {
        self.trap.store(true, Ordering::SeqCst);
    }

    /// Consume a pending trap request
    pub fn take_trap(&self) -> bool {
        self.trap.swap(false, Ordering::SeqCst)
    }

    /// Sequential thread control unit id
    pub fn next_thread_id(&self) -> usize {
        self.next_thread.fetch_add(1, Ordering::SeqCst)
    }
}

/// Handle front ends use to interrupt a free-running program
#[derive(Clone)]
pub struct Interrupter {
    control: Arc<Control>,
}

impl Interrupter {
    pub fn new(control: Arc<Control>) -> Self {
        Self { control }
    }

    /// Suspend the next thread that reaches a safe point
    pub fn interrupt(&self) {
        if self.control.is_active() {
            tracing::debug!("interrupt requested");
            self.control.request_trap();
        }
    }

    /// Ask the coordinator to poll the front end while the program runs
    pub fn notify(&self) {
        self.control.send(SessionEvent::Wake);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{FrameKind, MethodRef};

    fn call_event() -> TraceEvent {
        let mut event = TraceEvent::new(EventKind::Call, "/a.rb", 2, 2);
        event.method = Some(MethodRef {
            owner: "Foo".into(),
            singleton: false,
            name: "bar".into(),
        });
        event
    }

    fn frame(receiver: Option<u64>, locals: Vec<(String, Value)>) -> Frame {
        Frame {
            kind: FrameKind::Method,
            name: "Foo#bar".into(),
            owner: Some("Foo".into()),
            path: "/a.rb".into(),
            line: 2,
            depth: 2,
            unit: None,
            binding: 1,
            receiver,
            return_value: None,
            locals,
        }
    }

    #[test]
    fn test_line_and_call_tracers() {
        let line = Tracer {
            id: 0,
            kind: TraceKind::Line,
        };
        let event = TraceEvent::new(EventKind::Line, "/a.rb", 3, 1);
        assert_eq!(
            line.render(1, &event, || None).unwrap(),
            "DEBUGGER (trace/line) #th:1 #depth:1  at /a.rb:3"
        );
        assert!(line.render(1, &call_event(), || None).is_none());

        let call = Tracer {
            id: 1,
            kind: TraceKind::Call,
        };
        assert_eq!(
            call.render(1, &call_event(), || None).unwrap(),
            "DEBUGGER (trace/call) #th:1 #depth:2 >  Foo#bar at /a.rb:2"
        );
    }

    #[test]
    fn test_object_tracer() {
        let mut object = Value::new("Foo", "#<Foo:7>");
        object.id = 7;
        let tracer = Tracer {
            id: 0,
            kind: TraceKind::Pass {
                expr: "obj".into(),
                object: object.clone(),
            },
        };

        let out = tracer
            .render(1, &call_event(), || Some(frame(Some(7), Vec::new())))
            .unwrap();
        assert!(out.ends_with("#<Foo:7> is used as a receiver of Foo#bar at /a.rb:2"));

        let out = tracer
            .render(1, &call_event(), || {
                Some(frame(None, vec![("arg".into(), object.clone())]))
            })
            .unwrap();
        assert!(out.contains("is used as a parameter arg of Foo#bar"));

        assert!(tracer
            .render(1, &call_event(), || Some(frame(Some(8), Vec::new())))
            .is_none());
    }
}
