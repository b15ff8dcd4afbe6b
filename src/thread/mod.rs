//! Thread control units
//!
//! One [`ThreadClient`] exists per debuggee thread. The host runtime calls
//! its `on_*` entry points on that thread; the client decides whether the
//! event is a stop, and if so reports it to the coordinator and blocks on
//! its own inbox until a resuming command arrives.

pub mod control;
pub mod format;
pub mod replay;
pub mod step;

use std::cell::OnceCell;
use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

pub use control::{Control, Interrupter, TraceKind, Tracer};

use crate::breakpoint::{BreakpointId, HookTarget};
use crate::common::Error;
use crate::runtime::{CodeUnit, EventKind, Frame, NativeThreadId, TraceEvent, Value};
use crate::session::event::{
    EvalMode, FrameMove, FrameSummary, Hit, ReplayMove, ResultKind, SessionEvent, Show, Suspend,
    SuspendKind, ThreadCommand,
};
use replay::{Forward, ReplayLog};
use step::{Decision, Step, StepKind};

/// Suspend/resume state of a thread control unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadMode {
    /// Not scheduled yet
    Unset,
    /// Suspended and blocked on its inbox
    WaitingForAction,
    Running,
    /// Debugger-internal thread, never suspended
    Management,
}

impl std::fmt::Display for ThreadMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ThreadMode::Unset => write!(f, "unset"),
            ThreadMode::WaitingForAction => write!(f, "waiting"),
            ThreadMode::Running => write!(f, "running"),
            ThreadMode::Management => write!(f, "management"),
        }
    }
}

pub struct ThreadClient {
    id: usize,
    native: NativeThreadId,
    mode: ThreadMode,
    control: Arc<Control>,
    /// `None` once detached
    inbox: Option<UnboundedReceiver<ThreadCommand>>,
    frames: Vec<Frame>,
    frame_index: usize,
    step: Option<Step>,
    output: Vec<String>,
    recording: bool,
    replay: ReplayLog,
    /// Live frames saved while the replay cursor is away from them
    live_frames: Option<Vec<Frame>>,
    postmortem: bool,
    /// Last truth value of each check breakpoint on this thread
    check_state: HashMap<BreakpointId, bool>,
    /// Next line for a continued `list`
    list_next: Option<u32>,
}

impl ThreadClient {
    fn new(control: Arc<Control>, native: NativeThreadId, mode: ThreadMode) -> Self {
        let capacity = control.settings().record_log_size;
        Self {
            id: control.next_thread_id(),
            native,
            mode,
            control,
            inbox: None,
            frames: Vec::new(),
            frame_index: 0,
            step: None,
            output: Vec::new(),
            recording: false,
            replay: ReplayLog::new(capacity),
            live_frames: None,
            postmortem: false,
            check_state: HashMap::new(),
            list_next: None,
        }
    }

    /// Register a debuggee thread and wait until the coordinator lets it run
    pub(crate) fn attach(control: Arc<Control>, native: NativeThreadId, name: &str) -> Self {
        let mut client = Self::new(control, native, ThreadMode::Unset);
        if !client.control.is_active() {
            return client;
        }

        let (tx, rx) = unbounded_channel();
        client.inbox = Some(rx);
        let begin = SessionEvent::ThreadBegin {
            thread: client.id,
            native,
            name: name.to_string(),
            management: false,
            commands: tx,
        };
        tracing::debug!(thread = client.id, native, name, "thread begin");

        if client.control.send(begin) {
            client.wait_next_action();
        } else {
            client.detach();
        }
        client
    }

    /// Register a debugger-internal thread; it never waits
    pub(crate) fn management(control: Arc<Control>, native: NativeThreadId, name: &str) -> Self {
        let client = Self::new(control, native, ThreadMode::Management);
        let (tx, _rx) = unbounded_channel();
        client.control.send(SessionEvent::ThreadBegin {
            thread: client.id,
            native,
            name: name.to_string(),
            management: true,
            commands: tx,
        });
        client
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn mode(&self) -> ThreadMode {
        self.mode
    }

    fn is_live(&self) -> bool {
        self.mode != ThreadMode::Management && self.inbox.is_some() && self.control.is_active()
    }

    /// Program start on the main thread
    pub fn on_init(&mut self) {
        if !self.is_live() {
            return;
        }
        if self.control.send(SessionEvent::Init { thread: self.id }) {
            self.wait_next_action();
        }
    }

    /// A code unit was loaded on this thread
    ///
    /// Blocks until pending breakpoints have been resolved against it.
    pub fn on_load(&mut self, unit: &Arc<CodeUnit>) {
        if !self.is_live() {
            return;
        }
        let event = SessionEvent::Load {
            thread: self.id,
            unit: Arc::clone(unit),
            output: std::mem::take(&mut self.output),
        };
        if self.control.send(event) {
            self.frames = self.control.runtime().capture_frames(self.native);
            self.wait_next_action();
        } else {
            self.detach();
        }
    }

    /// A runtime event happened on this thread
    pub fn on_event(&mut self, event: &TraceEvent) {
        if !self.is_live() {
            return;
        }

        self.replay.advance();
        if self.recording && event.kind == EventKind::Line {
            let frames = self.control.runtime().capture_frames(self.native);
            self.replay.record(frames);
        }

        self.run_tracers(event);

        if self.control.take_trap() {
            self.suspend(Some(event), SuspendKind::Trap, None, None);
            return;
        }
        if self.control.stop_all_requested() {
            self.suspend(Some(event), SuspendKind::Pause, None, None);
            return;
        }
        if let Some(hit) = self.check_breakpoints(event) {
            self.step = None;
            self.suspend(Some(event), SuspendKind::Breakpoint, Some(hit), None);
            return;
        }
        self.check_step(event);
    }

    /// An exception is about to unwind past the outermost frame
    pub fn on_uncaught(&mut self, exception: &Value) {
        if !self.is_live() || !self.control.settings().postmortem {
            return;
        }
        tracing::info!(thread = self.id, exception = %exception, "entering postmortem mode");
        self.postmortem = true;
        self.step = None;
        self.output
            .push(format!("Enter postmortem mode with {}", exception));
        self.suspend(None, SuspendKind::Postmortem, None, None);
        self.postmortem = false;
        self.frames.clear();
    }

    /// The thread is exiting
    pub fn end(self) {
        tracing::debug!(thread = self.id, "thread end");
        self.control.send(SessionEvent::ThreadEnd { thread: self.id });
    }

    fn detach(&mut self) {
        if self.inbox.take().is_some() {
            tracing::debug!(thread = self.id, "detached from session");
        }
        self.step = None;
        self.frames.clear();
        self.mode = ThreadMode::Running;
    }

    fn suspend(
        &mut self,
        event: Option<&TraceEvent>,
        kind: SuspendKind,
        hit: Option<Hit>,
        finished: Option<Value>,
    ) {
        self.frames = self.control.runtime().capture_frames(self.native);
        if let Some(top) = self.frames.first_mut() {
            if let Some(event) = event.filter(|e| e.kind.is_return()) {
                top.return_value = event.return_value.clone();
            }
            if top.return_value.is_none() {
                top.return_value = finished;
            }
        }
        self.frame_index = 0;
        self.list_next = None;

        if kind != SuspendKind::Pause {
            let text = self.stop_text();
            self.output.extend(text);
        }

        let suspend = Suspend {
            thread: self.id,
            kind,
            hit,
            output: std::mem::take(&mut self.output),
            frame: self.frames.first().map(|f| FrameSummary::new(0, f)),
            depth: self.frames.first().map_or(0, |f| f.depth),
        };
        tracing::debug!(thread = self.id, ?kind, depth = suspend.depth, "suspend");

        if !self.control.send(SessionEvent::Suspend(suspend)) {
            self.detach();
            return;
        }
        self.wait_next_action();
    }

    fn wait_next_action(&mut self) {
        self.mode = ThreadMode::WaitingForAction;

        loop {
            let command = match self.inbox.as_mut() {
                Some(rx) => rx.blocking_recv(),
                None => None,
            };
            let Some(command) = command else {
                self.detach();
                return;
            };
            tracing::trace!(thread = self.id, ?command, "command");
            if self.handle(command) {
                break;
            }
        }

        self.mode = ThreadMode::Running;
        if !self.postmortem {
            self.frames.clear();
        }
    }

    /// Handle one command; true when the thread resumes
    fn handle(&mut self, command: ThreadCommand) -> bool {
        match command {
            ThreadCommand::Continue => {
                self.step = None;
                self.leave_replay();
                true
            }
            ThreadCommand::Resume => true,
            ThreadCommand::Step { kind, count } => {
                self.leave_replay();
                let index = if kind == StepKind::Finish {
                    self.frame_index
                } else {
                    0
                };
                self.step = Some(match self.frames.get(index) {
                    Some(frame) => {
                        let unit = frame.unit.and_then(|id| self.control.runtime().unit(id));
                        Step::new(kind, count, frame, unit.as_deref())
                    }
                    None => Step::start(),
                });
                true
            }
            ThreadCommand::Replay(movement) => {
                self.replay_move(movement);
                false
            }
            ThreadCommand::Record(on) => {
                self.set_recording(on);
                false
            }
            ThreadCommand::Show(show) => {
                self.show(show);
                false
            }
            ThreadCommand::Frame(movement) => {
                self.move_frame(movement);
                false
            }
            ThreadCommand::Eval { expr, mode } => {
                self.eval(&expr, mode);
                false
            }
            ThreadCommand::Display(exprs) => {
                self.display(&exprs);
                false
            }
        }
    }

    fn reply(&mut self, kind: ResultKind, mut output: Vec<String>) {
        let mut lines = std::mem::take(&mut self.output);
        lines.append(&mut output);
        self.control.send(SessionEvent::Result {
            thread: self.id,
            kind,
            output: lines,
        });
    }

    fn selected(&self) -> Option<&Frame> {
        self.frames.get(self.frame_index)
    }

    /// Source listing and short backtrace for the selected frame
    fn stop_text(&self) -> Vec<String> {
        let Some(frame) = self.selected() else {
            return Vec::new();
        };
        let settings = self.control.settings();
        let mut out = Vec::new();
        if let Some(source) = self.control.runtime().source_lines(&frame.path) {
            let (start, end) = format::window(frame.line, settings.show_src_lines, source.len());
            out.extend(format::source_listing(&source, &frame.path, frame.line, start, end));
        }
        out.extend(format::short_backtrace(
            &self.frames,
            self.frame_index,
            settings.show_frames,
            self.control.width(),
        ));
        out
    }

    fn check_breakpoints(&mut self, event: &TraceEvent) -> Option<Hit> {
        let hooks = self.control.hooks().matching(event);
        if hooks.is_empty() {
            return None;
        }

        let runtime = Arc::clone(self.control.runtime());
        let native = self.native;
        let top: OnceCell<Option<Frame>> = OnceCell::new();
        let top_frame = || {
            top.get_or_init(|| runtime.capture_frames(native).into_iter().next())
                .as_ref()
        };

        for hook in hooks {
            let mut note = None;

            match &hook.target {
                HookTarget::Watch { expr, receiver, .. } => {
                    let Some(frame) = top_frame() else { continue };
                    if receiver.is_some() && frame.receiver != *receiver {
                        continue;
                    }
                    let Ok(value) = runtime.evaluate(native, frame, expr) else {
                        continue;
                    };
                    let Some(previous) = hook.update_watch(&value) else {
                        continue;
                    };
                    let previous = previous.map_or_else(|| "nil".to_string(), |v| v.repr);
                    note = Some(format!("BP - Watch  {} = {} -> {}", expr, previous, value));
                }
                HookTarget::Check { expr } => {
                    let Some(frame) = top_frame() else { continue };
                    let truthy = runtime
                        .evaluate(native, frame, expr)
                        .map(|v| v.is_truthy())
                        .unwrap_or(false);
                    let was = self.check_state.insert(hook.id, truthy).unwrap_or(false);
                    if !truthy || was {
                        continue;
                    }
                }
                _ => {}
            }

            if let Some(condition) = &hook.condition {
                let Some(frame) = top_frame() else { continue };
                match runtime.evaluate(native, frame, condition) {
                    Ok(value) if value.is_truthy() => {}
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::debug!(id = hook.id, error = %e, "breakpoint condition failed");
                        continue;
                    }
                }
            }

            // Only the first thread to take a oneshot hook fires it
            if hook.oneshot && !self.control.hooks_mut().remove(hook.id) {
                continue;
            }

            return Some(Hit { id: hook.id, note });
        }
        None
    }

    fn skip_location(&self, event: &TraceEvent) -> bool {
        {
            let settings = self.control.settings();
            if settings.skip_paths.iter().any(|p| event.path.starts_with(p.as_str())) {
                return true;
            }
            if settings.skip_nosrc && self.control.runtime().source_lines(&event.path).is_none() {
                return true;
            }
        }
        self.control.hooks().has_line(&event.path, event.line)
    }

    fn check_step(&mut self, event: &TraceEvent) {
        if self.step.is_none() || !Step::observes(event) {
            return;
        }
        let skipped = self.skip_location(event);
        let runtime = Arc::clone(self.control.runtime());
        let native = self.native;

        let Some(step) = self.step.as_mut() else {
            return;
        };
        match step.decide(event, skipped) {
            Decision::Ignore => {}
            Decision::Reanchor => {
                let unit = if step.kind == StepKind::Next {
                    runtime
                        .capture_frames(native)
                        .first()
                        .and_then(|f| f.unit)
                        .and_then(|id| runtime.unit(id))
                } else {
                    None
                };
                step.reanchor(event, unit.as_deref());
            }
            Decision::Stop => {
                let finished = self.step.take().and_then(|s| s.return_value);
                self.suspend(Some(event), SuspendKind::Step, None, finished);
            }
        }
    }

    fn run_tracers(&mut self, event: &TraceEvent) {
        let tracers = self.control.tracers();
        if tracers.is_empty() {
            return;
        }

        let runtime = Arc::clone(self.control.runtime());
        let native = self.native;
        let top: OnceCell<Option<Frame>> = OnceCell::new();
        let lines: Vec<String> = tracers
            .iter()
            .filter_map(|t| {
                t.render(self.id, event, || {
                    top.get_or_init(|| runtime.capture_frames(native).into_iter().next())
                        .clone()
                })
            })
            .collect();

        if !lines.is_empty() {
            self.control.send(SessionEvent::Trace {
                thread: self.id,
                output: lines,
            });
        }
    }

    fn show(&mut self, show: Show) {
        if show == Show::Record {
            let (cursor, len) = self.replay.position();
            let state = if self.recording { "on" } else { "off" };
            let mut out = vec![format!("Recorder for #{}: {} ({} records)", self.id, state, len)];
            if let Some(cursor) = cursor {
                out.push(format!("Replaying record #{}", cursor));
            }
            self.reply(ResultKind::Output, out);
            return;
        }
        if let Show::Variables { frame } = show {
            let vars = self
                .frames
                .get(frame.unwrap_or(self.frame_index))
                .map(|frame| {
                    let mut vars = Vec::new();
                    if let Some(value) = &frame.return_value {
                        vars.push(("%return".to_string(), value.clone()));
                    }
                    vars.extend(frame.locals.iter().cloned());
                    vars
                })
                .unwrap_or_default();
            self.reply(ResultKind::Locals(vars), Vec::new());
            return;
        }
        if show == Show::Frames {
            let frames = self
                .frames
                .iter()
                .enumerate()
                .map(|(i, f)| FrameSummary::new(i, f))
                .collect();
            self.reply(ResultKind::Frames(frames), Vec::new());
            return;
        }

        let Some(frame) = self.selected().cloned() else {
            self.reply(ResultKind::Output, vec!["No frames available".to_string()]);
            return;
        };

        let out = match show {
            Show::Backtrace { max, pattern } => {
                format::backtrace(
                    &self.frames,
                    self.frame_index,
                    max,
                    pattern.as_deref(),
                    self.control.width(),
                )
            }
            Show::List { start, end } => self.list(&frame, start, end),
            Show::Locals => format::locals(&frame),
            Show::Frame => vec![format::fit(
                format::frame_line(self.frame_index, &frame, true),
                self.control.width(),
            )],
            Show::Outline => self.outline(&frame),
            Show::Record | Show::Frames | Show::Variables { .. } => Vec::new(),
        };
        self.reply(ResultKind::Output, out);
    }

    fn list(&mut self, frame: &Frame, start: Option<u32>, end: Option<u32>) -> Vec<String> {
        let Some(source) = self.control.runtime().source_lines(&frame.path) else {
            return vec![format!("No sourcefile available for {}", frame.path)];
        };
        let max = self.control.settings().show_src_lines.max(1) as u32;

        let (start, end) = match (start, end) {
            (Some(s), Some(e)) => (s, e),
            (Some(s), None) => (s, s + max - 1),
            (None, _) => match self.list_next {
                Some(next) => (next, next + max - 1),
                None => format::window(frame.line, max as usize, source.len()),
            },
        };

        let out = format::source_listing(&source, &frame.path, frame.line, start.max(1), end);
        if out.is_empty() {
            return vec![format!("Already at the end of {}", frame.path)];
        }
        self.list_next = Some(end + 1);
        out
    }

    fn outline(&self, frame: &Frame) -> Vec<String> {
        let mut out = Vec::new();
        if !frame.locals.is_empty() {
            let names: Vec<&str> = frame.locals.iter().map(|(n, _)| n.as_str()).collect();
            out.push(format!("locals: {}", names.join("  ")));
        }
        if let Some(owner) = &frame.owner {
            let mut methods: Vec<String> = self
                .control
                .runtime()
                .loaded_units()
                .iter()
                .filter(|u| u.owner.as_deref() == Some(owner.as_str()))
                .filter(|u| u.kind == crate::runtime::UnitKind::Method)
                .map(|u| u.name.clone())
                .collect();
            methods.sort();
            methods.dedup();
            if !methods.is_empty() {
                out.push(format!("{}#methods: {}", owner, methods.join("  ")));
            }
        }
        out
    }

    fn move_frame(&mut self, movement: FrameMove) {
        let len = self.frames.len();
        let target = match movement {
            FrameMove::To(n) => n,
            FrameMove::Up => self.frame_index + 1,
            FrameMove::Down => self.frame_index.wrapping_sub(1),
        };
        if target >= len {
            let index = if movement == FrameMove::Down { 0 } else { target };
            let message = match movement {
                FrameMove::To(_) => Error::FrameNotFound(index).to_string(),
                FrameMove::Up => "Already at the outermost frame".to_string(),
                FrameMove::Down => "Already at the innermost frame".to_string(),
            };
            self.reply(ResultKind::Output, vec![message]);
            return;
        }

        self.frame_index = target;
        self.list_next = None;
        let out = self.stop_text();
        self.reply(ResultKind::Output, out);
    }

    fn eval(&mut self, expr: &str, mode: EvalMode) {
        let Some(frame) = self.selected().cloned() else {
            let message = "eval error: no frame to evaluate in".to_string();
            match mode {
                EvalMode::Structured => self.reply(ResultKind::Evaluated(Err(message)), Vec::new()),
                _ => self.reply(ResultKind::Output, vec![message]),
            }
            return;
        };

        let result = self.control.runtime().evaluate(self.native, &frame, expr);
        match (mode, result) {
            (EvalMode::Print, Ok(value)) => {
                self.refresh_locals();
                self.reply(ResultKind::Output, vec![format!("=> {}", value)]);
            }
            (EvalMode::Silent, Ok(_)) => {
                self.refresh_locals();
                self.reply(ResultKind::Output, Vec::new());
            }
            (EvalMode::Watch, Ok(value)) => self.reply(
                ResultKind::WatchArmed {
                    expr: expr.to_string(),
                    receiver: frame.receiver,
                    value,
                },
                Vec::new(),
            ),
            (EvalMode::TracePass, Ok(object)) => self.reply(
                ResultKind::TracePass {
                    expr: expr.to_string(),
                    object,
                },
                Vec::new(),
            ),
            (EvalMode::Structured, result) => {
                self.refresh_locals();
                self.reply(ResultKind::Evaluated(result), Vec::new());
            }
            (_, Err(e)) => self.reply(ResultKind::Output, vec![format!("eval error: {}", e)]),
        }
    }

    /// Pick up assignments made by an evaluation
    fn refresh_locals(&mut self) {
        if self.live_frames.is_some() {
            return;
        }
        let fresh = self.control.runtime().capture_frames(self.native);
        if fresh.len() != self.frames.len() {
            return;
        }
        for (frame, fresh) in self.frames.iter_mut().zip(fresh) {
            if frame.binding == fresh.binding {
                frame.locals = fresh.locals;
            }
        }
    }

    fn display(&mut self, exprs: &[(usize, String)]) {
        let frame = self.selected().cloned();
        let runtime = Arc::clone(self.control.runtime());
        let out = exprs
            .iter()
            .map(|(i, expr)| {
                let result = match &frame {
                    Some(frame) => runtime.evaluate(self.native, frame, expr),
                    None => Err("no frame to evaluate in".to_string()),
                };
                match result {
                    Ok(value) => format!("{}: {} = {}", i, expr, value),
                    Err(e) => format!("{}: {} = eval error: {}", i, expr, e),
                }
            })
            .collect();
        self.reply(ResultKind::Display, out);
    }

    fn set_recording(&mut self, on: bool) {
        if on && !self.recording {
            self.replay = ReplayLog::new(self.control.settings().record_log_size);
        }
        if !on {
            self.leave_replay();
        }
        self.recording = on;
        let state = if on { "on" } else { "off" };
        tracing::debug!(thread = self.id, state, "recording");
        self.reply(
            ResultKind::Output,
            vec![format!("Recorder for #{}: {}", self.id, state)],
        );
    }

    fn replay_move(&mut self, movement: ReplayMove) {
        let (message, active) = match movement {
            ReplayMove::Back => match self.replay.back().map(<[Frame]>::to_vec) {
                Some(frames) => {
                    if self.live_frames.is_none() {
                        self.live_frames = Some(std::mem::take(&mut self.frames));
                    }
                    self.frames = frames;
                    (None, true)
                }
                None => (
                    Some("Can not step back more.".to_string()),
                    self.replay.is_replaying(),
                ),
            },
            ReplayMove::Forward => {
                let moved = self.replay.forward().map(|f| match f {
                    Forward::Entry(frames) => Some(frames.to_vec()),
                    Forward::Live => None,
                });
                match moved {
                    Some(Some(frames)) => {
                        self.frames = frames;
                        (None, true)
                    }
                    Some(None) => {
                        self.leave_replay();
                        (None, false)
                    }
                    None => (Some("Can not step forward more.".to_string()), false),
                }
            }
            ReplayMove::Reset => {
                self.leave_replay();
                (None, false)
            }
        };

        self.frame_index = 0;
        self.list_next = None;
        let mut out: Vec<String> = message.into_iter().collect();
        if out.is_empty() {
            if active {
                let (cursor, len) = self.replay.position();
                out.push(format!(
                    "[replay] #{}/{}",
                    cursor.map_or(len, |c| c + 1),
                    len
                ));
            }
            out.extend(self.stop_text());
        }
        self.reply(ResultKind::Replay { active }, out);
    }

    fn leave_replay(&mut self) {
        if let Some(live) = self.live_frames.take() {
            self.frames = live;
        }
        self.replay.reset();
    }
}
