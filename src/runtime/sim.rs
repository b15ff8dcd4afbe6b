//! Simulated host runtime
//!
//! Runs a program described in YAML on real OS threads and reports its
//! events through each thread's [`ThreadClient`]. Code units, their
//! breakable lines and the source text are declared up front; threads are
//! lists of operations (`load`, `call`, `line`, `return`, `raise`, ...).
//!
//! ```yaml
//! units:
//!   - id: 1
//!     path: /app/main.rb
//!     first_line: 1
//!     last_line: 3
//!     lines: { 1: [line], 3: [line] }
//! threads:
//!   - name: main
//!     ops:
//!       - load: [1]
//!       - call: { unit: 1 }
//!       - line: 1
//!       - line: 3
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::Deserialize;

use super::expr;
use super::{
    BindingId, CodeUnit, EventKind, Frame, FrameKind, MethodRef, NativeThreadId, Runtime,
    TraceEvent, UnitKind, Value,
};
use crate::common::config::SessionConfig;
use crate::common::{Error, Result};
use crate::frontend::FrontEnd;
use crate::session::{Attacher, Engine};
use crate::thread::ThreadClient;

/// A simulated program
#[derive(Debug, Clone, Deserialize)]
pub struct SimProgram {
    #[serde(default)]
    pub name: Option<String>,

    /// Code units the program can load
    #[serde(default)]
    pub units: Vec<UnitDef>,

    /// Source text per path
    #[serde(default)]
    pub sources: HashMap<String, String>,

    /// Locations the runtime refuses to instrument
    #[serde(default)]
    pub uninstrumentable: Vec<LocationDef>,

    /// Thread definitions; the first one is the main thread
    pub threads: Vec<ThreadDef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UnitDef {
    pub id: u64,
    pub path: String,
    #[serde(default = "default_unit_name")]
    pub name: String,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub singleton: bool,
    #[serde(default)]
    pub kind: UnitKind,
    pub first_line: u32,
    pub last_line: u32,
    #[serde(default)]
    pub lines: BTreeMap<u32, Vec<EventKind>>,
}

fn default_unit_name() -> String {
    "<main>".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocationDef {
    pub path: String,
    pub line: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThreadDef {
    pub name: String,
    /// Debugger-internal thread, never suspended
    #[serde(default)]
    pub management: bool,
    /// Written as `- line: 3` maps; nested `repeat` ops included
    #[serde(with = "serde_yaml::with::singleton_map_recursive")]
    pub ops: Vec<Op>,
}

/// One step of a simulated thread
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    /// Make code units available
    Load(Vec<u64>),
    /// Execute a line in the current frame
    Line(u32),
    /// Enter a code unit
    Call {
        unit: u64,
        #[serde(default)]
        receiver: Option<u64>,
        /// Arguments as name → expression
        #[serde(default)]
        args: BTreeMap<String, String>,
    },
    /// Leave the current frame
    Return {
        #[serde(default)]
        value: Option<String>,
    },
    /// Assign a local in the current frame
    Set { name: String, value: String },
    /// Raise an exception in the current frame
    Raise {
        class: String,
        #[serde(default)]
        ancestors: Vec<String>,
        #[serde(default)]
        message: String,
        #[serde(default)]
        rescued: bool,
    },
    /// Run ops repeatedly; `times: 0` loops until the program stops
    Repeat { times: u64, ops: Vec<Op> },
    /// Start another thread by name
    Spawn(String),
    /// Sleep for milliseconds
    Sleep(u64),
}

impl SimProgram {
    /// Parse a program from YAML text
    pub fn parse(name: &str, content: &str) -> Result<Self> {
        let program: SimProgram =
            serde_yaml::from_str(content).map_err(|e| Error::InvalidProgram {
                path: name.to_string(),
                reason: e.to_string(),
            })?;
        program.validate(name)?;
        Ok(program)
    }

    /// Load a program from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::FileRead {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;
        Self::parse(&path.display().to_string(), &content)
    }

    fn validate(&self, name: &str) -> Result<()> {
        let invalid = |reason: String| Error::InvalidProgram {
            path: name.to_string(),
            reason,
        };

        if self.threads.is_empty() {
            return Err(invalid("no threads defined".to_string()));
        }
        for unit in &self.units {
            if unit.first_line > unit.last_line {
                return Err(invalid(format!(
                    "unit {} ends before it starts ({} > {})",
                    unit.id, unit.first_line, unit.last_line
                )));
            }
        }

        fn check_ops(ops: &[Op], program: &SimProgram) -> std::result::Result<(), String> {
            for op in ops {
                match op {
                    Op::Load(ids) => {
                        if let Some(id) = ids.iter().find(|id| !program.has_unit(**id)) {
                            return Err(format!("load of unknown unit {}", id));
                        }
                    }
                    Op::Call { unit, .. } if !program.has_unit(*unit) => {
                        return Err(format!("call of unknown unit {}", unit));
                    }
                    Op::Spawn(name) if !program.threads.iter().any(|t| &t.name == name) => {
                        return Err(format!("spawn of unknown thread '{}'", name));
                    }
                    Op::Repeat { ops, .. } => check_ops(ops, program)?,
                    _ => {}
                }
            }
            Ok(())
        }

        for thread in &self.threads {
            check_ops(&thread.ops, self).map_err(invalid)?;
        }
        Ok(())
    }

    fn has_unit(&self, id: u64) -> bool {
        self.units.iter().any(|u| u.id == id)
    }
}

impl From<&UnitDef> for CodeUnit {
    fn from(def: &UnitDef) -> Self {
        CodeUnit {
            id: def.id,
            path: def.path.clone(),
            name: def.name.clone(),
            owner: def.owner.clone(),
            singleton: def.singleton,
            kind: def.kind,
            first_line: def.first_line,
            last_line: def.last_line,
            lines: def.lines.clone(),
        }
    }
}

/// A live frame on a simulated stack
#[derive(Debug, Clone)]
struct SimFrame {
    unit: Arc<CodeUnit>,
    line: u32,
    binding: BindingId,
    receiver: Option<u64>,
    locals: Vec<(String, Value)>,
}

impl SimFrame {
    fn name(&self) -> String {
        match (self.unit.kind, &self.unit.owner) {
            (UnitKind::Method, Some(owner)) => {
                let sep = if self.unit.singleton { "." } else { "#" };
                format!("{}{}{}", owner, sep, self.unit.name)
            }
            _ => self.unit.name.clone(),
        }
    }

    fn lookup(&self, name: &str) -> Option<Value> {
        if name == "self" {
            let class = self.unit.owner.as_deref().unwrap_or("Object");
            let mut value = match self.receiver {
                Some(id) => Value::new(class, &format!("#<{}:{}>", class, id)),
                None => Value::new("Object", "main"),
            };
            value.id = self.receiver.unwrap_or(0);
            return Some(value);
        }
        self.locals
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
    }

    fn assign(&mut self, name: &str, value: Value) {
        match self.locals.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = value,
            None => self.locals.push((name.to_string(), value)),
        }
    }
}

/// The simulated runtime
pub struct SimRuntime {
    program: SimProgram,
    loaded: RwLock<Vec<Arc<CodeUnit>>>,
    stacks: Mutex<HashMap<NativeThreadId, Vec<SimFrame>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    next_native: AtomicU64,
    next_binding: AtomicU64,
    stopping: AtomicBool,
    exit_code: AtomicI32,
}

impl SimRuntime {
    pub fn new(program: SimProgram) -> Arc<Self> {
        Arc::new(Self {
            program,
            loaded: RwLock::new(Vec::new()),
            stacks: Mutex::new(HashMap::new()),
            handles: Mutex::new(Vec::new()),
            next_native: AtomicU64::new(1),
            next_binding: AtomicU64::new(1),
            stopping: AtomicBool::new(false),
            exit_code: AtomicI32::new(0),
        })
    }

    /// Run the program to completion
    ///
    /// The main thread runs on a spawned OS thread like every other one.
    /// Returns the exit status.
    pub fn run(self: &Arc<Self>, attacher: Attacher) -> Result<i32> {
        let main = self
            .program
            .threads
            .first()
            .cloned()
            .ok_or_else(|| Error::Internal("program has no threads".to_string()))?;

        tracing::info!(
            program = self.program.name.as_deref().unwrap_or("sim"),
            threads = self.program.threads.len(),
            "Starting simulated program"
        );

        self.spawn_thread(main, attacher, true)?;

        // Spawned threads register their handles, so drain until none remain
        loop {
            let handle = self.lock_handles().pop();
            match handle {
                Some(handle) => {
                    if handle.join().is_err() {
                        tracing::error!("simulated thread panicked");
                    }
                }
                None => break,
            }
        }

        Ok(self.exit_code.load(Ordering::SeqCst))
    }

    /// Run the program under a debug session driven by `frontend`
    pub fn debug(
        self: &Arc<Self>,
        frontend: Box<dyn FrontEnd>,
        settings: SessionConfig,
    ) -> Result<i32> {
        self.debug_when(frontend, settings, || Ok(()))
    }

    /// Like [`debug`](Self::debug), but the program starts only once
    /// `ready` returns; the session already serves the front end meanwhile
    pub fn debug_when(
        self: &Arc<Self>,
        frontend: Box<dyn FrontEnd>,
        settings: SessionConfig,
        ready: impl FnOnce() -> Result<()>,
    ) -> Result<i32> {
        let engine = Engine::start(Arc::clone(self) as Arc<dyn Runtime>, frontend, settings)?;
        let result = ready().and_then(|()| self.run(engine.attacher()));
        engine.shutdown(result.as_ref().map_or(1, |code| *code));
        engine.join()?;
        result
    }

    /// Exit status recorded so far
    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::SeqCst)
    }

    fn spawn_thread(self: &Arc<Self>, def: ThreadDef, attacher: Attacher, main: bool) -> Result<()> {
        let native = self.next_native.fetch_add(1, Ordering::SeqCst);
        let runtime = Arc::clone(self);

        let handle = std::thread::Builder::new()
            .name(format!("sim-{}", def.name))
            .spawn(move || runtime.thread_main(def, native, attacher, main))?;

        self.lock_handles().push(handle);
        Ok(())
    }

    fn thread_main(self: Arc<Self>, def: ThreadDef, native: NativeThreadId, attacher: Attacher, main: bool) {
        self.lock_stacks().insert(native, Vec::new());

        let mut client = if def.management {
            attacher.attach_management(native, &def.name)
        } else {
            attacher.attach(native, &def.name)
        };
        if main {
            client.on_init();
        }

        let mut ctx = ThreadCtx {
            native,
            client,
            attacher,
        };
        let outcome = self.exec(&def.ops, &mut ctx);

        if let Flow::Uncaught(exception) = &outcome {
            tracing::debug!(thread = %def.name, exception = %exception, "uncaught exception");
            if main {
                self.exit_code.store(1, Ordering::SeqCst);
            }
        }

        self.lock_stacks().remove(&native);
        ctx.client.end();

        // The process ends with its main thread
        if main {
            self.stopping.store(true, Ordering::SeqCst);
        }
    }

    fn exec(self: &Arc<Self>, ops: &[Op], ctx: &mut ThreadCtx) -> Flow {
        for op in ops {
            if self.stopping.load(Ordering::SeqCst) {
                return Flow::Stop;
            }
            let flow = self.exec_op(op, ctx);
            if !matches!(flow, Flow::Next) {
                return flow;
            }
        }
        Flow::Next
    }

    fn exec_op(self: &Arc<Self>, op: &Op, ctx: &mut ThreadCtx) -> Flow {
        match op {
            Op::Load(ids) => {
                // A file's units become visible together, nested ones included
                let units: Vec<Arc<CodeUnit>> = ids
                    .iter()
                    .filter_map(|id| self.program.units.iter().find(|u| u.id == *id))
                    .map(|def| Arc::new(CodeUnit::from(def)))
                    .collect();
                self.loaded
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .extend(units.iter().cloned());
                for unit in &units {
                    ctx.client.on_load(unit);
                }
            }

            Op::Line(line) => {
                let Some((path, depth)) = self.with_top(ctx.native, |frame, depth| {
                    frame.line = *line;
                    (frame.unit.path.clone(), depth)
                }) else {
                    return Flow::Next;
                };
                ctx.client
                    .on_event(&TraceEvent::new(EventKind::Line, &path, *line, depth));
            }

            Op::Call {
                unit,
                receiver,
                args,
            } => {
                let Some(unit) = self.loaded_unit(*unit) else {
                    tracing::warn!(unit, "call of a unit that is not loaded");
                    return Flow::Next;
                };
                let locals = args
                    .iter()
                    .map(|(name, src)| (name.clone(), self.eval_in_top(ctx.native, src)))
                    .collect();
                let frame = SimFrame {
                    line: unit.first_line,
                    binding: self.next_binding.fetch_add(1, Ordering::SeqCst),
                    receiver: *receiver,
                    locals,
                    unit: Arc::clone(&unit),
                };

                let depth = {
                    let mut stacks = self.lock_stacks();
                    let stack = stacks.entry(ctx.native).or_default();
                    stack.push(frame);
                    stack.len()
                };

                let kind = match unit.kind {
                    UnitKind::Method => Some(EventKind::Call),
                    UnitKind::Block => Some(EventKind::BlockCall),
                    _ => None,
                };
                if let Some(kind) = kind {
                    let mut event = TraceEvent::new(kind, &unit.path, unit.first_line, depth);
                    event.method = unit.owner.as_ref().map(|owner| MethodRef {
                        owner: owner.clone(),
                        singleton: unit.singleton,
                        name: unit.name.clone(),
                    });
                    ctx.client.on_event(&event);
                }
            }

            Op::Return { value } => {
                let value = match value {
                    Some(src) => self.eval_in_top(ctx.native, src),
                    None => Value::nil(),
                };
                let top = self.with_top(ctx.native, |frame, depth| {
                    (Arc::clone(&frame.unit), frame.line, depth)
                });
                let Some((unit, line, depth)) = top else {
                    return Flow::Next;
                };

                let kind = match unit.kind {
                    UnitKind::Method => Some(EventKind::Return),
                    UnitKind::Block => Some(EventKind::BlockReturn),
                    _ => None,
                };
                if let Some(kind) = kind {
                    let mut event = TraceEvent::new(kind, &unit.path, line, depth);
                    event.return_value = Some(value);
                    event.method = unit.owner.as_ref().map(|owner| MethodRef {
                        owner: owner.clone(),
                        singleton: unit.singleton,
                        name: unit.name.clone(),
                    });
                    ctx.client.on_event(&event);
                }

                if let Some(stack) = self.lock_stacks().get_mut(&ctx.native) {
                    stack.pop();
                }
            }

            Op::Set { name, value } => {
                let value = self.eval_in_top(ctx.native, value);
                self.with_top(ctx.native, |frame, _| frame.assign(name, value));
            }

            Op::Raise {
                class,
                ancestors,
                message,
                rescued,
            } => {
                let mut exception = Value::new(class, &format!("#<{}: {}>", class, message));
                exception.ancestors = std::iter::once(class.clone())
                    .chain(ancestors.iter().cloned())
                    .collect();

                if let Some((path, line, depth)) = self.with_top(ctx.native, |frame, depth| {
                    (frame.unit.path.clone(), frame.line, depth)
                }) {
                    let mut event = TraceEvent::new(EventKind::Raise, &path, line, depth);
                    event.exception = Some(exception.clone());
                    ctx.client.on_event(&event);
                }

                if !rescued {
                    ctx.client.on_uncaught(&exception);
                    return Flow::Uncaught(exception);
                }
            }

            Op::Repeat { times, ops } => {
                let mut n = 0;
                while *times == 0 || n < *times {
                    let flow = self.exec(ops, ctx);
                    if !matches!(flow, Flow::Next) {
                        return flow;
                    }
                    n += 1;
                }
            }

            Op::Spawn(name) => {
                let def = self.program.threads.iter().find(|t| &t.name == name).cloned();
                if let Some(def) = def {
                    if let Err(e) = self.spawn_thread(def, ctx.attacher.clone(), false) {
                        tracing::error!(thread = %name, error = %e, "failed to spawn thread");
                    }
                }
            }

            Op::Sleep(ms) => std::thread::sleep(Duration::from_millis(*ms)),
        }

        Flow::Next
    }

    fn with_top<T>(&self, native: NativeThreadId, f: impl FnOnce(&mut SimFrame, usize) -> T) -> Option<T> {
        let mut stacks = self.lock_stacks();
        let stack = stacks.get_mut(&native)?;
        let depth = stack.len();
        stack.last_mut().map(|frame| f(frame, depth))
    }

    fn eval_in_top(&self, native: NativeThreadId, src: &str) -> Value {
        let stacks = self.lock_stacks();
        let top = stacks.get(&native).and_then(|s| s.last());
        let result = expr::evaluate(src, &|name| top.and_then(|f| f.lookup(name)));
        result.unwrap_or_else(|e| {
            tracing::warn!(expr = src, error = %e, "program expression failed");
            Value::nil()
        })
    }

    fn loaded_unit(&self, id: u64) -> Option<Arc<CodeUnit>> {
        self.loaded
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|u| u.id == id)
            .cloned()
    }

    fn lock_stacks(&self) -> MutexGuard<'_, HashMap<NativeThreadId, Vec<SimFrame>>> {
        self.stacks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_handles(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct ThreadCtx {
    native: NativeThreadId,
    client: ThreadClient,
    attacher: Attacher,
}

enum Flow {
    Next,
    Stop,
    Uncaught(Value),
}

impl Runtime for SimRuntime {
    fn capture_frames(&self, thread: NativeThreadId) -> Vec<Frame> {
        let stacks = self.lock_stacks();
        let Some(stack) = stacks.get(&thread) else {
            return Vec::new();
        };

        stack
            .iter()
            .enumerate()
            .rev()
            .map(|(i, f)| Frame {
                kind: match f.unit.kind {
                    UnitKind::Method => FrameKind::Method,
                    UnitKind::Block => FrameKind::Block,
                    _ => FrameKind::Other,
                },
                name: f.name(),
                owner: f.unit.owner.clone(),
                path: f.unit.path.clone(),
                line: f.line,
                depth: i + 1,
                unit: Some(f.unit.id),
                binding: f.binding,
                receiver: f.receiver,
                return_value: None,
                locals: f.locals.clone(),
            })
            .collect()
    }

    fn evaluate(
        &self,
        thread: NativeThreadId,
        frame: &Frame,
        src: &str,
    ) -> std::result::Result<Value, String> {
        let mut stacks = self.lock_stacks();
        let live = stacks
            .get_mut(&thread)
            .and_then(|s| s.iter_mut().find(|f| f.binding == frame.binding));

        let lookup = |name: &str| -> Option<Value> {
            frame
                .locals
                .iter()
                .rev()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.clone())
        };

        match live {
            Some(live) => {
                if let Some((target, rhs)) = expr::split_assignment(src) {
                    let value = expr::evaluate(rhs, &|name| live.lookup(name))?;
                    live.assign(target, value.clone());
                    return Ok(value);
                }
                expr::evaluate(src, &|name| live.lookup(name))
            }
            None => expr::evaluate(src, &lookup),
        }
    }

    fn live_threads(&self) -> Vec<NativeThreadId> {
        let mut threads: Vec<_> = self.lock_stacks().keys().copied().collect();
        threads.sort_unstable();
        threads
    }

    fn loaded_units(&self) -> Vec<Arc<CodeUnit>> {
        self.loaded
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn check_instrumentable(&self, path: &str, line: u32) -> std::result::Result<(), String> {
        let refused = self
            .program
            .uninstrumentable
            .iter()
            .any(|loc| loc.path == path && loc.line == line);
        if refused {
            return Err(format!("{}:{} cannot be instrumented", path, line));
        }
        Ok(())
    }

    fn source_lines(&self, path: &str) -> Option<Vec<String>> {
        if let Some(text) = self.program.sources.get(path) {
            return Some(text.lines().map(str::to_string).collect());
        }
        std::fs::read_to_string(path)
            .ok()
            .map(|content| content.lines().map(str::to_string).collect())
    }

    fn terminate(&self, code: i32) {
        tracing::info!(code, "terminating simulated program");
        self.exit_code.store(code, Ordering::SeqCst);
        self.stopping.store(true, Ordering::SeqCst);
    }
}
