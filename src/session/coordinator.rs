//! The session coordinator
//!
//! Runs on its own thread and owns everything the debuggee threads never
//! touch: the breakpoint registry, the thread table, the current-thread
//! selection and the front end. It alternates between two states:
//! dispatching events from the shared inbox, and prompting for commands
//! while a thread is suspended for interaction (a subsession).

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use super::command::{
    self, BreakOptions, BreakTarget, Command, ConfigCommand, InfoTarget, TraceCommand,
};
use super::event::{
    EvalMode, FrameMove, FrameSummary, ResultKind, SessionEvent, Show, Suspend, SuspendKind,
    ThreadCommand,
};
use super::postmortem::{self, Mode, Route};
use crate::breakpoint::{
    AddOutcome, AttachedCommands, Breakpoint, BreakpointKind, BreakpointState, Registry,
};
use crate::common::config::SessionConfig;
use crate::common::{Error, Result};
use crate::frontend::{confirmed, FrontEnd, FrontEvent, Input, Request};
use crate::runtime::NativeThreadId;
use crate::thread::step::StepKind;
use crate::thread::{Control, TraceKind};

const PROMPT: &str = "(rdbg) ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreadState {
    Running,
    /// The current thread, waiting for commands
    Waiting,
    /// Parked until the world resumes
    Held,
    /// Suspended for interaction while another subsession is open
    Deferred,
}

struct ThreadEntry {
    #[allow(dead_code)]
    native: NativeThreadId,
    name: String,
    management: bool,
    commands: UnboundedSender<ThreadCommand>,
    state: ThreadState,
    /// Top frame at the last stop
    location: Option<FrameSummary>,
}

/// A query sent to a thread whose `Result` is outstanding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Awaiting {
    Reply,
    Request(i64),
}

enum Outcome {
    /// Prompt again
    Retry,
    /// Wait for the thread's answer
    Sent(Awaiting),
    /// The current thread was resumed
    Resumed,
    /// The session is over
    Quit,
}

pub(crate) struct Coordinator {
    control: Arc<Control>,
    registry: Registry,
    frontend: Box<dyn FrontEnd>,
    inbox: UnboundedReceiver<SessionEvent>,
    threads: BTreeMap<usize, ThreadEntry>,
    current: Option<usize>,
    awaiting: Option<Awaiting>,
    deferred: VecDeque<Suspend>,
    presets: VecDeque<String>,
    /// Front-end input queued before the program started
    early: VecDeque<Input>,
    auto_continue: bool,
    /// At program start, before the first stop
    starting: bool,
    mode: Mode,
    displays: Vec<String>,
    last_command: Option<String>,
}

impl Coordinator {
    pub(crate) fn new(
        control: Arc<Control>,
        frontend: Box<dyn FrontEnd>,
        inbox: UnboundedReceiver<SessionEvent>,
    ) -> Self {
        let registry = Registry::new(control.hook_table());
        let presets = control.settings().commands.iter().cloned().collect();
        control.set_width(frontend.width());
        Self {
            control,
            registry,
            frontend,
            inbox,
            threads: BTreeMap::new(),
            current: None,
            awaiting: None,
            deferred: VecDeque::new(),
            presets,
            early: VecDeque::new(),
            auto_continue: false,
            starting: false,
            mode: Mode::Live,
            displays: Vec::new(),
            last_command: None,
        }
    }

    /// Run until the program ends or the user quits
    pub(crate) fn run(mut self) -> Result<()> {
        let result = self.main_loop();
        if let Err(e) = &result {
            tracing::error!(error = %e, "session failed");
        }
        self.detach();
        tracing::info!("Debug session ended");
        result
    }

    fn main_loop(&mut self) -> Result<()> {
        loop {
            if self.is_prompting() {
                if !self.command_step()? {
                    return Ok(());
                }
                continue;
            }

            let Some(event) = self.next_event() else {
                return Ok(());
            };
            if !self.dispatch(event)? {
                return Ok(());
            }
        }
    }

    fn is_prompting(&self) -> bool {
        self.current.is_some() && self.awaiting.is_none()
    }

    fn next_event(&mut self) -> Option<SessionEvent> {
        if self.current.is_none() {
            if let Some(suspend) = self.deferred.pop_front() {
                return Some(SessionEvent::Suspend(suspend));
            }
        }
        self.inbox.blocking_recv()
    }

    /// Handle one event; false ends the session
    fn dispatch(&mut self, event: SessionEvent) -> Result<bool> {
        match event {
            SessionEvent::Init { thread } => {
                tracing::debug!(thread, "program start");
                self.starting = true;
                self.current = Some(thread);
                self.set_state(thread, ThreadState::Waiting);
            }
            SessionEvent::ThreadBegin {
                thread,
                native,
                name,
                management,
                commands,
            } => {
                tracing::info!(thread, native, name = %name, management, "thread started");
                let state = if management {
                    ThreadState::Running
                } else if self.control.stop_all_requested() {
                    ThreadState::Held
                } else {
                    let _ = commands.send(ThreadCommand::Resume);
                    ThreadState::Running
                };
                if !management {
                    self.frontend.emit_event(&FrontEvent::ThreadStarted {
                        thread,
                        name: name.clone(),
                    });
                }
                self.threads.insert(
                    thread,
                    ThreadEntry {
                        native,
                        name,
                        management,
                        commands,
                        state,
                        location: None,
                    },
                );
            }
            SessionEvent::ThreadEnd { thread } => {
                tracing::info!(thread, "thread exited");
                self.deferred.retain(|s| s.thread != thread);
                if let Some(entry) = self.threads.remove(&thread) {
                    if !entry.management {
                        self.frontend
                            .emit_event(&FrontEvent::ThreadExited { thread });
                    }
                }
            }
            SessionEvent::Load {
                thread,
                unit,
                output,
            } => {
                self.flush(output);
                let runtime = Arc::clone(self.control.runtime());
                let activated = self.registry.on_load(&*runtime);
                // A later unit can offer a closer line to an active breakpoint
                self.registry.rehash(&*runtime);
                tracing::debug!(thread, unit = unit.id, path = %unit.path, activated, "code loaded");
                let notices = self.registry.take_notices();
                self.flush(notices);
                self.release_or_hold(thread);
            }
            SessionEvent::Trace { output, .. } => self.flush(output),
            SessionEvent::Suspend(suspend) => self.on_suspend(suspend),
            SessionEvent::Result {
                thread,
                kind,
                output,
            } => self.on_result(thread, kind, output),
            SessionEvent::Shutdown { code } => {
                tracing::info!(code, "program finished");
                self.frontend.emit_event(&FrontEvent::Terminated { code });
                self.frontend.quit(code);
                return Ok(false);
            }
            SessionEvent::Wake => {
                // While prompting the command loop reads the front end itself
                if self.current.is_none() {
                    for input in self.frontend.poll() {
                        if !self.running_input(input)? {
                            return Ok(false);
                        }
                    }
                }
            }
        }
        Ok(true)
    }

    /// Let a thread at a non-interactive wait go, unless the world is stopped
    fn release_or_hold(&mut self, thread: usize) {
        if self.control.stop_all_requested() {
            self.set_state(thread, ThreadState::Held);
        } else {
            if let Err(e) = self.send(thread, ThreadCommand::Resume) {
                tracing::warn!(thread, error = %e, "cannot release thread");
            }
            self.set_state(thread, ThreadState::Running);
        }
    }

    fn on_suspend(&mut self, suspend: Suspend) {
        let thread = suspend.thread;
        if let Some(entry) = self.threads.get_mut(&thread) {
            entry.location = suspend.frame.clone();
        }

        if suspend.kind == SuspendKind::Pause {
            self.flush(suspend.output);
            self.release_or_hold(thread);
            return;
        }

        if let Some(current) = self.current {
            if current != thread {
                tracing::debug!(thread, current, "suspend deferred");
                self.set_state(thread, ThreadState::Deferred);
                self.deferred.push_back(suspend);
                return;
            }
        }

        let mut lines = Vec::new();
        let mut breakpoint = None;
        if let Some(hit) = &suspend.hit {
            if let Some(record) = self.registry.record_hit(hit.id) {
                let text = hit.note.clone().unwrap_or(record.description);
                lines.push(format!("Stop by #{}  {}", record.index, text));
                breakpoint = Some(hit.id);

                let AttachedCommands { pre, do_ } = record.breakpoint.commands;
                if let Some(pre) = pre {
                    self.presets.push_back(pre);
                }
                if let Some(cmd) = do_ {
                    self.presets.push_back(cmd);
                    self.auto_continue = true;
                }
            }
        }
        lines.extend(suspend.output);
        self.flush(lines);

        self.mode = if suspend.kind == SuspendKind::Postmortem {
            Mode::Postmortem
        } else {
            Mode::Live
        };
        self.current = Some(thread);
        self.set_state(thread, ThreadState::Waiting);
        tracing::info!(
            thread,
            kind = ?suspend.kind,
            location = suspend.frame.as_ref().map(FrameSummary::location).unwrap_or_default(),
            "thread suspended"
        );
        self.frontend.emit_event(&FrontEvent::Stopped {
            thread,
            reason: suspend.kind.reason().to_string(),
            breakpoint,
        });

        let list: Vec<_> = self.displays.iter().cloned().enumerate().collect();
        if !list.is_empty() && self.send(thread, ThreadCommand::Display(list)).is_ok() {
            self.awaiting = Some(Awaiting::Reply);
        } else {
            self.stop_world();
        }
    }

    /// Force every other thread to its next pause point
    fn stop_world(&mut self) {
        if self.auto_continue || self.control.stop_all_requested() {
            return;
        }
        tracing::debug!("stopping other threads");
        self.control.set_stop_all(true);
    }

    fn on_result(&mut self, thread: usize, kind: ResultKind, output: Vec<String>) {
        let request = match self.awaiting.take() {
            Some(Awaiting::Request(id)) => Some(id),
            _ => None,
        };
        tracing::trace!(thread, ?kind, "result");

        if let Some(id) = request {
            let result = match kind {
                ResultKind::Frames(frames) => Ok(json!({ "frames": frames })),
                ResultKind::Locals(vars) => {
                    let vars: Vec<_> = vars
                        .iter()
                        .map(|(name, value)| {
                            json!({ "name": name, "value": value.repr, "type": value.class_name })
                        })
                        .collect();
                    Ok(json!({ "variables": vars }))
                }
                ResultKind::Evaluated(result) => {
                    result.map(|v| json!({ "result": v.repr, "type": v.class_name }))
                }
                _ => Err(output.join("\n")),
            };
            self.respond(id, result);
            return;
        }

        self.flush(output);
        match kind {
            ResultKind::Output | ResultKind::Frames(_) | ResultKind::Locals(_) => {}
            ResultKind::Evaluated(_) => {}
            ResultKind::Display => self.stop_world(),
            ResultKind::WatchArmed {
                expr,
                receiver,
                value,
            } => {
                self.add_breakpoint(Breakpoint::watch(&expr, receiver, value));
            }
            ResultKind::TracePass { expr, object } => {
                let kind = TraceKind::Pass { expr, object };
                let text = kind.describe();
                let id = self.control.add_tracer(kind);
                self.output(format!("Enable {} (#{})", text, id));
            }
            ResultKind::Replay { active } => {
                self.mode = if active { Mode::Replay } else { Mode::Live };
            }
        }
    }

    /// One round of the command-wait loop; false ends the session
    fn command_step(&mut self) -> Result<bool> {
        while let Ok(event) = self.inbox.try_recv() {
            if !self.dispatch(event)? {
                return Ok(false);
            }
        }
        if !self.is_prompting() {
            return Ok(true);
        }
        self.control.set_width(self.frontend.width());

        if let Some(line) = self.presets.pop_front() {
            self.output(format!("(rdbg:commands) {}", line));
            return self.run_line(&line, false);
        }
        if self.auto_continue {
            self.auto_continue = false;
            let outcome = self.execute(Command::Continue);
            return self.apply(outcome);
        }
        if self.starting {
            self.early.extend(self.frontend.poll());
            if let Some(input) = self.early.pop_front() {
                return self.handle_input(input);
            }
            self.starting = false;
            let command = if self.control.settings().nonstop {
                ThreadCommand::Continue
            } else {
                ThreadCommand::Step {
                    kind: StepKind::In,
                    count: 1,
                }
            };
            let outcome = self.resume(command);
            return self.apply(outcome);
        }

        let input = match self.frontend.next_command(PROMPT) {
            Ok(input) => input,
            Err(e) => {
                tracing::warn!(error = %e, "front end failed");
                Input::Closed
            }
        };
        self.handle_input(input)
    }

    fn handle_input(&mut self, input: Input) -> Result<bool> {
        match input {
            Input::Line(line) => self.run_line(&line, true),
            Input::Request { id, request } => {
                let outcome = self.request(id, request);
                self.apply(outcome)
            }
            Input::Interrupt => Ok(true),
            Input::Closed => {
                tracing::info!("front end closed");
                Ok(false)
            }
        }
    }

    fn run_line(&mut self, line: &str, from_user: bool) -> Result<bool> {
        let line = line.trim();
        let text = if line.is_empty() {
            match &self.last_command {
                Some(last) if from_user => last.clone(),
                _ => return Ok(true),
            }
        } else {
            line.to_string()
        };

        let outcome = command::parse(&text).and_then(|command| {
            if from_user {
                self.last_command = command.is_repeatable().then(|| text.clone());
            }
            self.execute(command)
        });
        self.apply(outcome)
    }

    fn apply(&mut self, outcome: Result<Outcome>) -> Result<bool> {
        match outcome {
            Ok(Outcome::Retry) | Ok(Outcome::Resumed) => Ok(true),
            Ok(Outcome::Sent(awaiting)) => {
                self.awaiting = Some(awaiting);
                Ok(true)
            }
            Ok(Outcome::Quit) => Ok(false),
            Err(e) if e.is_recoverable() => {
                self.output(e.to_string());
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    fn execute(&mut self, command: Command) -> Result<Outcome> {
        if let Route::Replay(movement) = postmortem::route(&command, self.mode)? {
            return self.query(ThreadCommand::Replay(movement));
        }

        match command {
            Command::Step { kind, count } => self.resume(ThreadCommand::Step { kind, count }),
            Command::StepBack | Command::StepReset => Ok(Outcome::Retry),
            Command::Continue => self.resume(ThreadCommand::Continue),
            Command::Quit { force, code } => self.quit(force, code),
            Command::Kill { force, code } => self.kill(force, code),
            Command::Break { target, options } => self.break_command(target, options),
            Command::Catch { pattern, options } => self.catch_command(pattern, options),
            Command::Watch(expr) => self.query(ThreadCommand::Eval {
                expr,
                mode: EvalMode::Watch,
            }),
            Command::Delete(index) => self.delete(index),
            Command::Enable(index) => {
                let runtime = Arc::clone(self.control.runtime());
                self.registry.enable(index, &*runtime)?;
                let notices = self.registry.take_notices();
                self.flush(notices);
                self.show_breakpoint(index);
                Ok(Outcome::Retry)
            }
            Command::Disable(index) => {
                self.registry.disable(index)?;
                self.show_breakpoint(index);
                Ok(Outcome::Retry)
            }
            Command::Backtrace { max, pattern } => {
                self.query(ThreadCommand::Show(Show::Backtrace { max, pattern }))
            }
            Command::List { start, end } => self.query(ThreadCommand::Show(Show::List { start, end })),
            Command::Info(target) => self.info(target),
            Command::Outline => self.query(ThreadCommand::Show(Show::Outline)),
            Command::Frame(None) => self.query(ThreadCommand::Show(Show::Frame)),
            Command::Frame(Some(n)) => self.query(ThreadCommand::Frame(FrameMove::To(n))),
            Command::Up => self.query(ThreadCommand::Frame(FrameMove::Up)),
            Command::Down => self.query(ThreadCommand::Frame(FrameMove::Down)),
            Command::Print(expr) => self.query(ThreadCommand::Eval {
                expr,
                mode: EvalMode::Print,
            }),
            Command::Eval(expr) => self.query(ThreadCommand::Eval {
                expr,
                mode: EvalMode::Silent,
            }),
            Command::Display(None) => {
                if self.displays.is_empty() {
                    return Ok(Outcome::Retry);
                }
                let list = self.displays.iter().cloned().enumerate().collect();
                self.query(ThreadCommand::Display(list))
            }
            Command::Display(Some(expr)) => {
                self.displays.push(expr.clone());
                let index = self.displays.len() - 1;
                self.query(ThreadCommand::Display(vec![(index, expr)]))
            }
            Command::Undisplay(index) => self.undisplay(index),
            Command::Trace(trace) => self.trace(trace),
            Command::Thread(None) => {
                let lines = self.thread_list();
                self.flush(lines);
                Ok(Outcome::Retry)
            }
            Command::Thread(Some(n)) => self.switch_thread(n),
            Command::Record(None) => self.query(ThreadCommand::Show(Show::Record)),
            Command::Record(Some(on)) => self.query(ThreadCommand::Record(on)),
            Command::Config(config) => self.config(config),
            Command::Help => {
                let lines = command::HELP.iter().map(|s| s.to_string()).collect();
                self.flush(lines);
                Ok(Outcome::Retry)
            }
        }
    }

    /// Send a query to the current thread
    fn query(&mut self, command: ThreadCommand) -> Result<Outcome> {
        let thread = self.current.ok_or(Error::NotSuspended)?;
        self.send(thread, command)?;
        Ok(Outcome::Sent(Awaiting::Reply))
    }

    /// Send a resuming command to the current thread and restart the world
    fn resume(&mut self, command: ThreadCommand) -> Result<Outcome> {
        let thread = self.current.ok_or(Error::NotSuspended)?;
        self.send(thread, command)?;

        self.control.set_stop_all(false);
        // Interrupts typed at the prompt are stale now
        self.control.take_trap();
        self.set_state(thread, ThreadState::Running);
        for entry in self.threads.values_mut() {
            if entry.state == ThreadState::Held {
                let _ = entry.commands.send(ThreadCommand::Resume);
                entry.state = ThreadState::Running;
            }
        }
        self.current = None;
        self.mode = Mode::Live;
        self.starting = false;

        tracing::debug!(thread, "resumed");
        self.frontend.emit_event(&FrontEvent::Continued { thread });
        Ok(Outcome::Resumed)
    }

    fn quit(&mut self, force: bool, code: Option<i32>) -> Result<Outcome> {
        if !force && !confirmed(&self.frontend.ask("Really quit? [Y/n] ")?, true) {
            return Ok(Outcome::Retry);
        }
        if let Some(code) = code {
            self.control.runtime().terminate(code);
        }
        self.frontend.quit(code.unwrap_or(0));
        self.detach();
        Ok(Outcome::Quit)
    }

    fn kill(&mut self, force: bool, code: Option<i32>) -> Result<Outcome> {
        if !force && !confirmed(&self.frontend.ask("Really kill? [Y/n] ")?, true) {
            return Ok(Outcome::Retry);
        }
        let code = code.unwrap_or(1);
        tracing::info!(code, "terminating the program");
        self.control.runtime().terminate(code);
        self.frontend.quit(code);
        self.detach();
        Ok(Outcome::Quit)
    }

    /// Stop intercepting and let every thread run free
    fn detach(&mut self) {
        if self.threads.is_empty() && !self.control.is_active() {
            return;
        }
        tracing::info!("detaching from the program");
        self.control.deactivate();
        for entry in self.threads.values() {
            if entry.state != ThreadState::Running {
                let _ = entry.commands.send(ThreadCommand::Continue);
            }
        }
        self.threads.clear();
        self.deferred.clear();
        self.current = None;
        self.awaiting = None;
    }

    fn current_path(&self) -> Option<String> {
        let thread = self.current?;
        let location = self.threads.get(&thread)?.location.as_ref()?;
        Some(location.path.clone())
    }

    fn break_command(
        &mut self,
        target: Option<BreakTarget>,
        options: BreakOptions,
    ) -> Result<Outcome> {
        let BreakOptions {
            condition,
            pre,
            do_,
        } = options;
        let commands = AttachedCommands { pre, do_ };

        let bp = match target {
            None => match condition {
                Some(expr) => Breakpoint::check(&expr),
                None if commands.is_empty() => {
                    self.list_breakpoints(|_| true);
                    return Ok(Outcome::Retry);
                }
                None => return Err(Error::invalid("usage: break [location] [if: expr]")),
            },
            Some(BreakTarget::Line { path, line }) => {
                let path = match path {
                    Some(path) => path,
                    None => self
                        .current_path()
                        .ok_or_else(|| Error::invalid("no current file, use break <path>:<line>"))?,
                };
                let hook_call = self.control.settings().hook_call;
                Breakpoint::line(&path, line, hook_call).with_condition(condition)
            }
            Some(BreakTarget::Method(signature)) => Breakpoint::method(&signature)
                .ok_or(Error::InvalidLocation(signature))?
                .with_condition(condition),
        };

        self.add_breakpoint(bp.with_commands(commands));
        Ok(Outcome::Retry)
    }

    fn catch_command(&mut self, pattern: Option<String>, options: BreakOptions) -> Result<Outcome> {
        let Some(pattern) = pattern else {
            self.list_breakpoints(|bp| matches!(bp.kind, BreakpointKind::Catch { .. }));
            return Ok(Outcome::Retry);
        };
        let bp = Breakpoint::catch(&pattern)
            .with_condition(options.condition)
            .with_commands(AttachedCommands {
                pre: options.pre,
                do_: options.do_,
            });
        self.add_breakpoint(bp);
        Ok(Outcome::Retry)
    }

    fn add_breakpoint(&mut self, bp: Breakpoint) -> AddOutcome {
        let runtime = Arc::clone(self.control.runtime());
        let outcome = self.registry.add(bp, &*runtime);

        let mut lines = Vec::new();
        match &outcome {
            AddOutcome::Added { id, index } => {
                if let Some(bp) = self.registry.get(*index) {
                    tracing::info!(id, key = %bp.key(), state = %bp.state, "breakpoint added");
                    lines.push(format!("#{}  {}", index, bp.describe()));
                }
            }
            AddOutcome::Duplicate { index } => {
                let existing = self
                    .registry
                    .get(*index)
                    .map(Breakpoint::describe)
                    .unwrap_or_default();
                lines.push(format!("duplicated breakpoint: #{}  {}", index, existing));
            }
        }
        lines.extend(self.registry.take_notices());
        self.flush(lines);
        outcome
    }

    fn show_breakpoint(&mut self, index: usize) {
        if let Some(bp) = self.registry.get(index) {
            let line = format!("#{}  {}", index, bp.describe());
            self.output(line);
        }
    }

    fn list_breakpoints(&mut self, filter: impl Fn(&Breakpoint) -> bool) {
        let lines = self
            .registry
            .list()
            .filter(|(_, bp)| filter(bp))
            .map(|(i, bp)| format!("#{}  {}", i, bp.describe()))
            .collect();
        self.flush(lines);
    }

    fn delete(&mut self, index: Option<usize>) -> Result<Outcome> {
        let Some(index) = index else {
            if self.registry.is_empty() {
                return Ok(Outcome::Retry);
            }
            if !confirmed(&self.frontend.ask("Remove all breakpoints? [y/N] ")?, false) {
                return Ok(Outcome::Retry);
            }
            let lines = self
                .registry
                .list()
                .map(|(i, bp)| format!("deleted: #{}  {}", i, bp.describe()))
                .collect();
            self.registry.delete_all();
            self.flush(lines);
            return Ok(Outcome::Retry);
        };

        let bp = self
            .registry
            .delete(index)
            .ok_or(Error::BreakpointNotFound(index))?;
        self.output(format!("deleted: #{}  {}", index, bp.describe()));
        Ok(Outcome::Retry)
    }

    fn info(&mut self, target: InfoTarget) -> Result<Outcome> {
        match target {
            InfoTarget::Default | InfoTarget::Locals => {
                self.query(ThreadCommand::Show(Show::Locals))
            }
            InfoTarget::Frame => self.query(ThreadCommand::Show(Show::Frame)),
            InfoTarget::Breakpoints => {
                self.list_breakpoints(|_| true);
                Ok(Outcome::Retry)
            }
            InfoTarget::Threads => {
                let lines = self.thread_list();
                self.flush(lines);
                Ok(Outcome::Retry)
            }
            InfoTarget::Display => {
                let lines = self
                    .displays
                    .iter()
                    .enumerate()
                    .map(|(i, expr)| format!("{}: {}", i, expr))
                    .collect();
                self.flush(lines);
                Ok(Outcome::Retry)
            }
        }
    }

    fn undisplay(&mut self, index: Option<usize>) -> Result<Outcome> {
        match index {
            None => {
                if !self.displays.is_empty()
                    && confirmed(&self.frontend.ask("Clear all displays? [y/N] ")?, false)
                {
                    self.displays.clear();
                }
            }
            Some(i) if i < self.displays.len() => {
                self.displays.remove(i);
            }
            Some(i) => return Err(Error::invalid(format!("Display #{} not found", i))),
        }
        Ok(Outcome::Retry)
    }

    fn thread_list(&self) -> Vec<String> {
        self.threads
            .iter()
            .filter(|(_, entry)| !entry.management)
            .map(|(id, entry)| {
                let marker = if Some(*id) == self.current { "--> " } else { "    " };
                let state = match entry.state {
                    ThreadState::Running => "running",
                    ThreadState::Waiting | ThreadState::Deferred => "suspended",
                    ThreadState::Held => "paused",
                };
                let location = entry
                    .location
                    .as_ref()
                    .filter(|_| entry.state != ThreadState::Running)
                    .map(|f| format!(" @ {}", f.location()))
                    .unwrap_or_default();
                format!("{}#{} {} ({}){}", marker, id, entry.name, state, location)
            })
            .collect()
    }

    fn switch_thread(&mut self, target: usize) -> Result<Outcome> {
        let current = self.current.ok_or(Error::NotSuspended)?;
        if target == current {
            return self.query(ThreadCommand::Show(Show::Frame));
        }
        let state = self
            .threads
            .get(&target)
            .filter(|entry| !entry.management)
            .map(|entry| entry.state)
            .ok_or(Error::ThreadNotFound(target))?;

        match state {
            ThreadState::Running => Err(Error::ThreadRunning(target)),
            ThreadState::Held | ThreadState::Waiting => {
                self.set_state(current, ThreadState::Held);
                self.set_state(target, ThreadState::Waiting);
                self.current = Some(target);
                self.mode = Mode::Live;
                self.query(ThreadCommand::Show(Show::Frame))
            }
            ThreadState::Deferred => {
                self.set_state(current, ThreadState::Held);
                self.current = None;
                if let Some(pos) = self.deferred.iter().position(|s| s.thread == target) {
                    if let Some(suspend) = self.deferred.remove(pos) {
                        self.on_suspend(suspend);
                    }
                }
                Ok(Outcome::Retry)
            }
        }
    }

    fn trace(&mut self, trace: TraceCommand) -> Result<Outcome> {
        let kind = match trace {
            TraceCommand::List => {
                let tracers = self.control.tracers();
                let lines = if tracers.is_empty() {
                    vec!["No tracers".to_string()]
                } else {
                    tracers
                        .iter()
                        .map(|t| format!("#{} {}", t.id, t.kind.describe()))
                        .collect()
                };
                self.flush(lines);
                return Ok(Outcome::Retry);
            }
            TraceCommand::Line => TraceKind::Line,
            TraceCommand::Call => TraceKind::Call,
            TraceCommand::Exception => TraceKind::Exception,
            TraceCommand::Pass(expr) => {
                return self.query(ThreadCommand::Eval {
                    expr,
                    mode: EvalMode::TracePass,
                })
            }
            TraceCommand::Off(None) => {
                let removed = self.control.remove_tracers(|_| true);
                self.output(format!("Disable {} tracers", removed));
                return Ok(Outcome::Retry);
            }
            TraceCommand::Off(Some(id)) => {
                if self.control.remove_tracers(|t| t.id == id) == 0 {
                    return Err(Error::invalid(format!("Unknown tracer: #{}", id)));
                }
                self.output(format!("Disable tracer #{}", id));
                return Ok(Outcome::Retry);
            }
        };

        let text = kind.describe();
        let id = self.control.add_tracer(kind);
        self.output(format!("Enable {} (#{})", text, id));
        Ok(Outcome::Retry)
    }

    fn config(&mut self, config: ConfigCommand) -> Result<Outcome> {
        let lines = match config {
            ConfigCommand::Show => {
                let settings = self.control.settings();
                SessionConfig::KEYS
                    .iter()
                    .filter_map(|key| settings.get(key).map(|v| format!("{} = {}", key, v)))
                    .collect()
            }
            ConfigCommand::Get(key) => {
                let value = self
                    .control
                    .settings()
                    .get(&key)
                    .ok_or_else(|| Error::Config(format!("unknown configuration: {}", key)))?;
                vec![format!("{} = {}", key, value)]
            }
            ConfigCommand::Set(key, value) => {
                self.control.settings_mut().set(&key, &value)?;
                tracing::debug!(key = %key, value = %value, "configuration changed");
                vec![format!("{} = {}", key, value)]
            }
        };
        self.flush(lines);
        Ok(Outcome::Retry)
    }

    /// Handle a structured request while a thread is suspended
    fn request(&mut self, id: i64, request: Request) -> Result<Outcome> {
        match self.handle_request(id, request) {
            Err(e) if e.is_recoverable() => {
                self.respond(id, Err(e.to_string()));
                Ok(Outcome::Retry)
            }
            other => other,
        }
    }

    /// Handle front-end input that arrived while the program runs
    fn running_input(&mut self, input: Input) -> Result<bool> {
        match input {
            Input::Request { id, request } if request.allowed_while_running() => {
                let outcome = self.request(id, request);
                self.apply(outcome)
            }
            Input::Request { id, .. } => {
                self.respond(id, Err("The program is running".to_string()));
                Ok(true)
            }
            Input::Interrupt => {
                self.control.request_trap();
                Ok(true)
            }
            Input::Closed => Ok(false),
            Input::Line(line) => {
                tracing::debug!(line = %line, "input ignored while running");
                Ok(true)
            }
        }
    }

    fn handle_request(&mut self, id: i64, request: Request) -> Result<Outcome> {
        match request {
            Request::SetBreakpoints { path, lines } => {
                let body = self.set_line_breakpoints(&path, &lines);
                self.respond(id, Ok(body));
                Ok(Outcome::Retry)
            }
            Request::SetExceptionBreakpoints { patterns } => {
                self.registry
                    .delete_where(|bp| matches!(bp.kind, BreakpointKind::Catch { .. }));
                let runtime = Arc::clone(self.control.runtime());
                for pattern in patterns {
                    self.registry.add(Breakpoint::catch(&pattern), &*runtime);
                }
                self.respond(id, Ok(json!({})));
                Ok(Outcome::Retry)
            }
            Request::Threads => {
                let threads: Vec<_> = self
                    .threads
                    .iter()
                    .filter(|(_, entry)| !entry.management)
                    .map(|(id, entry)| json!({ "id": id, "name": entry.name }))
                    .collect();
                self.respond(id, Ok(json!({ "threads": threads })));
                Ok(Outcome::Retry)
            }
            Request::StackTrace { thread } => {
                self.request_thread(id, thread, ThreadCommand::Show(Show::Frames))
            }
            Request::Locals { thread, frame } => {
                self.request_thread(id, thread, ThreadCommand::Show(Show::Variables { frame }))
            }
            Request::Evaluate { thread, expr } => {
                let thread = thread.or(self.current).ok_or(Error::NotSuspended)?;
                self.request_thread(
                    id,
                    thread,
                    ThreadCommand::Eval {
                        expr,
                        mode: EvalMode::Structured,
                    },
                )
            }
            Request::Continue => {
                self.respond_then(id, json!({ "allThreadsContinued": true }), Command::Continue)
            }
            Request::Next => self.respond_then(id, json!({}), step(StepKind::Next)),
            Request::StepIn => self.respond_then(id, json!({}), step(StepKind::In)),
            Request::StepOut => self.respond_then(id, json!({}), step(StepKind::Finish)),
            Request::Pause => {
                if self.current.is_none() {
                    self.control.request_trap();
                }
                self.respond(id, Ok(json!({})));
                Ok(Outcome::Retry)
            }
            Request::Disconnect { terminate } => {
                self.respond(id, Ok(json!({})));
                if terminate {
                    self.kill(true, None)
                } else {
                    self.quit(true, None)
                }
            }
        }
    }

    /// Acknowledge a resuming request, then carry it out
    fn respond_then(&mut self, id: i64, body: serde_json::Value, command: Command) -> Result<Outcome> {
        postmortem::route(&command, self.mode)?;
        self.current.ok_or(Error::NotSuspended)?;
        self.respond(id, Ok(body));
        self.execute(command)
    }

    fn request_thread(&mut self, id: i64, thread: usize, command: ThreadCommand) -> Result<Outcome> {
        let entry = self
            .threads
            .get(&thread)
            .ok_or(Error::ThreadNotFound(thread))?;
        if entry.state == ThreadState::Running {
            return Err(Error::ThreadRunning(thread));
        }
        entry
            .commands
            .send(command)
            .map_err(|_| Error::ThreadNotFound(thread))?;
        Ok(Outcome::Sent(Awaiting::Request(id)))
    }

    fn set_line_breakpoints(&mut self, path: &str, lines: &[u32]) -> serde_json::Value {
        self.registry.delete_where(
            |bp| matches!(&bp.kind, BreakpointKind::Line { path: p, .. } if p == path),
        );

        let runtime = Arc::clone(self.control.runtime());
        let hook_call = self.control.settings().hook_call;
        let mut result = Vec::new();
        for line in lines {
            let outcome = self
                .registry
                .add(Breakpoint::line(path, *line, hook_call), &*runtime);
            let entry = match outcome {
                AddOutcome::Added { index, .. } => {
                    let bp = self.registry.get(index);
                    let verified = bp.is_some_and(|bp| bp.state == BreakpointState::Active);
                    let resolved = bp
                        .and_then(|bp| match &bp.kind {
                            BreakpointKind::Line {
                                resolved: Some(loc),
                                ..
                            } => Some(loc.line),
                            _ => None,
                        })
                        .unwrap_or(*line);
                    json!({ "verified": verified, "line": resolved })
                }
                AddOutcome::Duplicate { .. } => {
                    json!({ "verified": false, "line": line, "message": "duplicated breakpoint" })
                }
            };
            result.push(entry);
        }
        for notice in self.registry.take_notices() {
            tracing::warn!(notice = %notice, "breakpoint");
        }
        json!({ "breakpoints": result })
    }

    fn respond(&mut self, id: i64, result: std::result::Result<serde_json::Value, String>) {
        self.frontend.emit_event(&FrontEvent::Response { id, result });
    }

    /// Deliver a command to a thread's inbox
    ///
    /// Fails when the thread is unknown or its inbox is closed, so callers
    /// never wait for a reply that cannot come.
    fn send(&self, thread: usize, command: ThreadCommand) -> Result<()> {
        let entry = self
            .threads
            .get(&thread)
            .ok_or(Error::ThreadNotFound(thread))?;
        entry.commands.send(command).map_err(|_| {
            tracing::warn!(thread, "thread inbox closed");
            Error::ThreadNotFound(thread)
        })
    }

    fn set_state(&mut self, thread: usize, state: ThreadState) {
        if let Some(entry) = self.threads.get_mut(&thread) {
            entry.state = state;
        }
    }

    fn output(&mut self, line: String) {
        self.frontend.emit_output(&[line]);
    }

    fn flush(&mut self, lines: Vec<String>) {
        if !lines.is_empty() {
            self.frontend.emit_output(&lines);
        }
    }
}

fn step(kind: StepKind) -> Command {
    Command::Step { kind, count: 1 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::scripted::ScriptedFrontEnd;
    use crate::runtime::sim::{SimProgram, SimRuntime};

    fn coordinator() -> Coordinator {
        let program = SimProgram::parse("idle", "threads:\n  - name: main\n    ops: []\n").unwrap();
        let (events, inbox) = tokio::sync::mpsc::unbounded_channel();
        let control = Control::new(SimRuntime::new(program), events, SessionConfig::default());
        let (frontend, _handle) = ScriptedFrontEnd::new();
        Coordinator::new(control, Box::new(frontend), inbox)
    }

    /// Register a suspended thread whose inbox is already gone
    fn vanished_thread(coordinator: &mut Coordinator, thread: usize) {
        let (commands, inbox) = tokio::sync::mpsc::unbounded_channel();
        drop(inbox);
        coordinator.threads.insert(
            thread,
            ThreadEntry {
                native: 0,
                name: "main".to_string(),
                management: false,
                commands,
                state: ThreadState::Waiting,
                location: None,
            },
        );
        coordinator.current = Some(thread);
    }

    #[test]
    fn test_query_to_closed_inbox_fails() {
        let mut coordinator = coordinator();
        vanished_thread(&mut coordinator, 1);

        let sent = coordinator.query(ThreadCommand::Show(Show::Frame));
        assert!(matches!(sent, Err(Error::ThreadNotFound(1))));
        assert!(coordinator.awaiting.is_none());

        let sent = coordinator.request_thread(7, 1, ThreadCommand::Show(Show::Frames));
        assert!(matches!(sent, Err(Error::ThreadNotFound(1))));
    }

    #[test]
    fn test_query_to_unknown_thread_fails() {
        let mut coordinator = coordinator();
        coordinator.current = Some(3);
        let sent = coordinator.query(ThreadCommand::Show(Show::Locals));
        assert!(matches!(sent, Err(Error::ThreadNotFound(3))));
    }
}
