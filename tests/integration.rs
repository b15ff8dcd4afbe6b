//! End-to-end integration tests for the debugger engine
//!
//! These tests verify complete debugging sessions by:
//! 1. Loading simulated programs from tests/fixtures
//! 2. Running them under a real session driven through the scripted front end
//! 3. Verifying breakpoints, stepping, thread handling and exceptions

use std::path::PathBuf;
use std::thread::JoinHandle;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncWriteExt, BufReader};

use rdbg::common::config::SessionConfig;
use rdbg::frontend::dap::{codec, DapFrontEnd};
use rdbg::frontend::scripted::{End, ScriptHandle, ScriptedFrontEnd, Transcript};
use rdbg::frontend::{FrontEvent, Input, Request};
use rdbg::runtime::sim::{SimProgram, SimRuntime};

const TIMEOUT: Duration = Duration::from_secs(10);

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

fn program(name: &str) -> SimProgram {
    SimProgram::load(&fixture(name)).expect("Failed to load fixture program")
}

/// Settings for a session that runs straight to its first breakpoint
fn nonstop(commands: &[&str]) -> SessionConfig {
    SessionConfig {
        nonstop: true,
        commands: commands.iter().map(|c| c.to_string()).collect(),
        ..SessionConfig::default()
    }
}

/// A debug session running on its own thread
struct Session {
    handle: ScriptHandle,
    thread: Option<JoinHandle<rdbg::Result<i32>>>,
}

impl Session {
    /// Start the program without waiting for it to stop
    fn spawn(name: &str, settings: SessionConfig) -> Self {
        let runtime = SimRuntime::new(program(name));
        let (frontend, handle) = ScriptedFrontEnd::new();
        let thread = std::thread::spawn(move || runtime.debug(Box::new(frontend), settings));
        Self {
            handle,
            thread: Some(thread),
        }
    }

    /// Start the program and wait for the session's first prompt
    fn start(name: &str, settings: SessionConfig) -> (Self, Transcript) {
        let session = Self::spawn(name, settings);
        let first = session.handle.wait(TIMEOUT).expect("Session did not start");
        (session, first)
    }

    fn command(&self, line: &str) -> Transcript {
        self.handle
            .command(line, TIMEOUT)
            .unwrap_or_else(|e| panic!("Command '{}' failed: {}", line, e))
    }

    fn frames(&mut self, thread: usize) -> Vec<Value> {
        let (result, _) = self
            .handle
            .request(Request::StackTrace { thread }, TIMEOUT)
            .expect("No stack trace response");
        let body = result.expect("Stack trace request failed");
        body["frames"].as_array().cloned().unwrap_or_default()
    }

    /// Stop providing input and collect the program's exit status
    fn join(mut self) -> i32 {
        self.handle.close();
        let thread = self.thread.take().expect("Session already joined");
        thread
            .join()
            .expect("Session thread panicked")
            .expect("Session failed")
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // A failed assertion left the session waiting
        if self.thread.is_some() {
            self.handle.send(Input::Line("kill!".to_string()));
            self.handle.close();
        }
    }
}

fn terminated(transcript: &Transcript) -> Option<i32> {
    transcript.events.iter().find_map(|event| match event {
        FrontEvent::Terminated { code } => Some(*code),
        _ => None,
    })
}

// ============== Stepping ==============

#[test]
fn test_initial_stop_is_a_step() {
    let (session, first) = Session::start("calc.yml", SessionConfig::default());

    assert_eq!(first.end, End::Prompt);
    assert_eq!(first.stopped().map(|(_, reason)| reason), Some("step"));
    assert!(first.contains("[1, 10] in /app/calc.rb"), "{:?}", first.output);
    assert!(first.contains("=>   1| class Calc"));
    assert!(first.contains("=>#0\t<main> at /app/calc.rb:1"));

    let end = session.command("continue");
    assert_eq!(end.end, End::Quit(0));
    assert_eq!(terminated(&end), Some(0));
    assert_eq!(session.join(), 0);
}

#[test]
fn test_finish_returns_to_caller() {
    let (mut session, first) = Session::start("calc.yml", nonstop(&["break calc.rb:3"]));
    let (thread, reason) = first.stopped().expect("No stop");
    assert_eq!(reason, "breakpoint");

    let frames = session.frames(thread);
    assert_eq!(frames.len(), 3);
    assert_eq!(frames[0]["name"], "Calc#add");
    assert_eq!(frames[0]["depth"], 3);
    assert_eq!(frames[1]["name"], "Calc#double");
    assert_eq!(frames[2]["name"], "<main>");

    let finished = session.command("finish");
    assert_eq!(finished.stopped(), Some((thread, "step")));
    assert!(
        finished.contains("=>#0\tCalc#double #=> 40 at /app/calc.rb:8"),
        "{:?}",
        finished.output
    );

    let frames = session.frames(thread);
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0]["depth"], 2);
    assert_eq!(frames[0]["line"], 8);

    assert_eq!(session.command("continue").end, End::Quit(0));
    assert_eq!(session.join(), 0);
}

#[test]
fn test_next_steps_over_calls() {
    let (session, first) = Session::start("calc.yml", nonstop(&["break calc.rb:13"]));
    assert!(first.contains("Stop by #0  BP - Line  /app/calc.rb:13 (line)"));

    let next = session.command("next");
    assert_eq!(next.stopped().map(|(_, reason)| reason), Some("step"));
    assert!(next.contains("=>  14| puts b"), "{:?}", next.output);
    assert!(!next.contains("Calc#add"));

    let locals = session.command("info locals");
    assert_eq!(locals.output, vec!["a = 20", "b = 40"]);

    assert_eq!(session.command("continue").end, End::Quit(0));
    assert_eq!(session.join(), 0);
}

#[test]
fn test_step_enters_calls() {
    let (session, _first) = Session::start("calc.yml", nonstop(&["break calc.rb:13"]));

    let step = session.command("step");
    assert!(
        step.contains("=>#0\tCalc#double at /app/calc.rb:7"),
        "{:?}",
        step.output
    );
    assert_eq!(session.command("p n").output, vec!["=> 20"]);

    // Quitting detaches and lets the program finish on its own
    assert_eq!(session.command("quit!").end, End::Quit(0));
    assert_eq!(session.join(), 0);
}

#[test]
fn test_frame_navigation() {
    let (session, first) = Session::start("calc.yml", nonstop(&["break calc.rb:3"]));
    assert!(first.contains("  # and 1 frames (use `bt' command for all frames)"));

    let up = session.command("up");
    assert!(
        up.contains("=>#1\tCalc#double at /app/calc.rb:7"),
        "{:?}",
        up.output
    );
    assert_eq!(session.command("p n").output, vec!["=> 20"]);
    assert!(session.command("p x").contains("eval error"));

    let bt = session.command("bt");
    assert_eq!(bt.output.len(), 3);
    assert!(bt.output[1].starts_with("=>#1"));

    assert!(session.command("frame 7").contains("Frame 7 not found"));
    assert_eq!(session.command("continue").end, End::Quit(0));
    assert_eq!(session.join(), 0);
}

// ============== Breakpoints ==============

#[test]
fn test_pending_breakpoint_resolves_on_load() {
    let (session, first) = Session::start("calc.yml", nonstop(&["break calc.rb:11"]));

    assert!(first.contains("(rdbg:commands) break calc.rb:11"));
    assert!(
        first.contains("#0  BP - Line (pending)  calc.rb:11"),
        "{:?}",
        first.output
    );
    // Line 11 is blank; the nearest breakable line after it is 12
    assert_eq!(first.stopped().map(|(_, reason)| reason), Some("breakpoint"));
    assert!(first.contains("Stop by #0  BP - Line  /app/calc.rb:12 (line)"));

    let info = session.command("info breakpoints");
    assert_eq!(info.output, vec!["#0  BP - Line  /app/calc.rb:12 (line)"]);

    assert_eq!(session.command("continue").end, End::Quit(0));
    assert_eq!(session.join(), 0);
}

#[test]
fn test_duplicate_breakpoint_is_rejected() {
    let (session, _first) = Session::start("calc.yml", nonstop(&["break calc.rb:11"]));

    let same_key = session.command("break /app/calc.rb:12");
    assert!(
        same_key.contains("duplicated breakpoint: #0"),
        "{:?}",
        same_key.output
    );

    // Resolves onto the existing breakpoint's line
    let same_line = session.command("break calc.rb:12");
    assert!(same_line.contains("duplicated breakpoint: #0  BP - Line  /app/calc.rb:12 (line)"));

    assert_eq!(session.command("info breakpoints").output.len(), 1);

    let deleted = session.command("delete 0");
    assert!(deleted.contains("deleted: #0"));
    assert!(session.command("info breakpoints").output.is_empty());

    assert_eq!(session.command("continue").end, End::Quit(0));
    assert_eq!(session.join(), 0);
}

#[test]
fn test_thread_cannot_hit_breakpoint_while_another_is_suspended() {
    let (session, first) = Session::start("workers.yml", nonstop(&["break workers.rb:2"]));
    let (main, reason) = first.stopped().expect("Main thread did not stop");
    assert_eq!(reason, "breakpoint");

    // Let the spinner reach its pause point
    std::thread::sleep(Duration::from_millis(100));
    let added = session.command("break workers.rb:6");
    assert!(added.contains("#1  BP - Line  /app/workers.rb:6 (line)"));
    assert!(added.stopped().is_none());

    std::thread::sleep(Duration::from_millis(100));
    let threads = session.command("info threads");
    assert!(threads.contains("spinner (paused)"), "{:?}", threads.output);
    assert!(threads.output.iter().any(|l| l.starts_with("--> #")));
    assert!(!threads.contains("Stop by"));

    let resumed = session.command("continue");
    let (spinner, reason) = resumed.stopped().expect("Spinner did not stop");
    assert_ne!(spinner, main);
    assert_eq!(reason, "breakpoint");
    assert!(resumed.contains("Stop by #1  BP - Line  /app/workers.rb:6 (line)"));

    assert_eq!(session.command("kill!").end, End::Quit(1));
    assert_eq!(session.join(), 1);
}

#[test]
fn test_breakpoint_moves_when_a_closer_unit_loads() {
    let (session, first) = Session::start("reload.yml", nonstop(&["break reload.rb:3"]));

    // Resolved to line 6 while only the script was loaded, then moved into
    // the method body once it appeared
    assert_eq!(first.stopped().map(|(_, reason)| reason), Some("breakpoint"));
    assert!(
        first.contains("Stop by #0  BP - Line  /app/reload.rb:3 (line)"),
        "{:?}",
        first.output
    );
    assert!(first.contains("=>#0\tGreeter#hello at /app/reload.rb:3"));

    let info = session.command("info breakpoints");
    assert_eq!(info.output, vec!["#0  BP - Line  /app/reload.rb:3 (line)"]);

    assert_eq!(session.command("continue").end, End::Quit(0));
    assert_eq!(session.join(), 0);
}

#[test]
fn test_do_commands_run_and_continue() {
    let (session, first) = Session::start("calc.yml", nonstop(&["break calc.rb:3 do: p x"]));

    assert!(first.contains("Stop by #0  BP - Line  /app/calc.rb:3"), "{:?}", first.output);
    assert!(first.contains("(rdbg:commands) p x"));
    assert!(first.output.iter().any(|line| line == "=> 20"));
    assert_eq!(first.end, End::Quit(0));
    assert_eq!(session.join(), 0);
}

#[test]
fn test_pre_commands_run_before_the_prompt() {
    let (session, first) = Session::start("calc.yml", nonstop(&["break calc.rb:3 pre: p y"]));

    assert_eq!(first.end, End::Prompt);
    assert_eq!(first.stopped().map(|(_, reason)| reason), Some("breakpoint"));
    assert!(first.contains("(rdbg:commands) p y"));
    assert!(first.output.iter().any(|line| line == "=> 20"));

    assert_eq!(session.command("continue").end, End::Quit(0));
    assert_eq!(session.join(), 0);
}

#[test]
fn test_watch_stops_when_value_changes() {
    let (session, first) = Session::start("counter.yml", nonstop(&["break counter.rb:2"]));
    assert!(first.contains("Stop by #0  BP - Line  /app/counter.rb:2 (line)"));

    let armed = session.command("watch count");
    assert_eq!(armed.output, vec!["#1  BP - Watch  count = 0"]);

    let changed = session.command("continue");
    assert!(
        changed.contains("Stop by #1  BP - Watch  count = 0 -> 1"),
        "{:?}",
        changed.output
    );
    assert!(changed.contains("=>#0\t<main> at /app/counter.rb:3"));

    // Line 4 leaves the value alone; line 5 sees the next change
    let again = session.command("continue");
    assert!(again.contains("Stop by #1  BP - Watch  count = 1 -> 2"), "{:?}", again.output);
    assert!(again.contains("=>#0\t<main> at /app/counter.rb:5"));

    assert_eq!(session.command("continue").end, End::Quit(0));
    assert_eq!(session.join(), 0);
}

// ============== Inspection ==============

#[test]
fn test_display_is_shown_at_every_stop() {
    let (session, _first) = Session::start("calc.yml", nonstop(&["break calc.rb:13"]));

    assert_eq!(session.command("display a").output, vec!["0: a = 20"]);

    let next = session.command("next");
    assert!(next.contains("=>  14| puts b"), "{:?}", next.output);
    assert_eq!(next.output.last().map(String::as_str), Some("0: a = 20"));

    assert_eq!(session.command("info display").output, vec!["0: a"]);
    assert!(session.command("undisplay 0").output.is_empty());
    assert!(session.command("info display").output.is_empty());

    assert_eq!(session.command("continue").end, End::Quit(0));
    assert_eq!(session.join(), 0);
}

#[test]
fn test_trace_prints_calls_while_running() {
    let (session, _first) = Session::start("calc.yml", nonstop(&["break calc.rb:13"]));

    assert_eq!(session.command("trace call").output, vec!["Enable CallTracer (#0)"]);

    let end = session.command("continue");
    assert_eq!(end.end, End::Quit(0));
    let traced = |text: &str| {
        end.output
            .iter()
            .any(|line| line.starts_with("DEBUGGER (trace/call) #th:1") && line.contains(text))
    };
    assert!(traced("Calc#double at /app/calc.rb"), "{:?}", end.output);
    assert!(traced("Calc#add #=> 40"), "{:?}", end.output);
    assert_eq!(session.join(), 0);
}

#[test]
fn test_record_and_step_back() {
    let (session, _first) = Session::start("calc.yml", SessionConfig::default());

    assert_eq!(session.command("record on").output, vec!["Recorder for #1: on"]);
    for line in [2, 6, 12, 13] {
        let step = session.command("step");
        let at = format!("=>#0\t<main> at /app/calc.rb:{}", line);
        assert!(step.contains(&at), "{:?}", step.output);
    }

    let back = session.command("step back");
    assert_eq!(back.output.first().map(String::as_str), Some("[replay] #3/4"));
    assert!(back.contains("=>#0\t<main> at /app/calc.rb:12"), "{:?}", back.output);

    let next = session.command("next");
    assert_eq!(next.output, vec!["'next' is not supported in replay mode"]);

    assert!(session.command("step back").contains("[replay] #2/4"));
    assert!(session.command("step back").contains("[replay] #1/4"));
    assert_eq!(
        session.command("step back").output,
        vec!["Can not step back more."]
    );

    let forward = session.command("step");
    assert_eq!(forward.output.first().map(String::as_str), Some("[replay] #2/4"));
    assert!(forward.contains("=>#0\t<main> at /app/calc.rb:6"));

    let live = session.command("step reset");
    assert!(!live.contains("[replay]"));
    assert!(live.contains("=>#0\t<main> at /app/calc.rb:13"), "{:?}", live.output);

    assert_eq!(session.command("continue").end, End::Quit(0));
    assert_eq!(session.join(), 0);
}

// ============== Session control ==============

#[test]
fn test_quit_asks_and_uses_the_exit_code() {
    let (session, _first) = Session::start("calc.yml", nonstop(&["break calc.rb:13"]));

    let asked = session.command("quit 3");
    assert_eq!(asked.end, End::Ask("Really quit? [Y/n] ".to_string()));
    assert_eq!(session.command("n").end, End::Prompt);

    assert!(matches!(session.command("quit 3").end, End::Ask(_)));
    assert_eq!(session.command("y").end, End::Quit(3));
    assert_eq!(session.join(), 3);
}

#[test]
fn test_interrupt_pauses_a_running_program() {
    let session = Session::spawn("workers.yml", nonstop(&[]));

    // Give the spinner time to start looping
    std::thread::sleep(Duration::from_millis(100));
    assert!(session.handle.interrupt());

    let paused = session.handle.wait(TIMEOUT).expect("Program was not interrupted");
    assert_eq!(paused.end, End::Prompt);
    assert_eq!(paused.stopped().map(|(_, reason)| reason), Some("pause"));
    assert!(paused.contains("at /app/workers.rb:"), "{:?}", paused.output);

    assert_eq!(session.command("kill!").end, End::Quit(1));
    assert_eq!(session.join(), 1);
}

// ============== Exceptions ==============

#[test]
fn test_catch_matches_exception_subclasses() {
    let (session, first) = Session::start("errors.yml", nonstop(&["catch ZeroDivisionError"]));

    assert_eq!(first.stopped().map(|(_, reason)| reason), Some("breakpoint"));
    assert!(first.contains("Stop by #0  BP - Catch  \"ZeroDivisionError\""));
    assert!(first.contains("=>#0\t<main> at /app/errors.rb:3"));

    // Overflow descends from ZeroDivisionError
    let subclass = session.command("continue");
    assert!(
        subclass.contains("=>#0\t<main> at /app/errors.rb:5"),
        "{:?}",
        subclass.output
    );

    // Neither ArgumentError nor the uncaught RuntimeError match
    let end = session.command("continue");
    assert!(!end.contains("Stop by"));
    assert_eq!(end.end, End::Quit(1));
    assert_eq!(terminated(&end), Some(1));
    assert_eq!(session.join(), 1);
}

#[test]
fn test_postmortem_gates_stepping() {
    let settings = SessionConfig {
        postmortem: true,
        ..nonstop(&[])
    };
    let (session, first) = Session::start("errors.yml", settings);

    assert_eq!(first.stopped().map(|(_, reason)| reason), Some("exception"));
    assert!(first.contains("Enter postmortem mode with #<RuntimeError: boom>"));

    let next = session.command("next");
    assert_eq!(next.output, vec!["'next' is not supported in postmortem mode"]);
    assert!(next.stopped().is_none());

    assert!(session.command("bt").contains("<main> at /app/errors.rb:9"));

    assert_eq!(session.command("continue").end, End::Quit(1));
    assert_eq!(session.join(), 1);
}

#[test]
fn test_uncaught_exception_without_postmortem_ends_session() {
    let (session, first) = Session::start("errors.yml", nonstop(&[]));
    assert_eq!(first.end, End::Quit(1));
    assert!(first.stopped().is_none());
    assert_eq!(session.join(), 1);
}

// ============== Scenario runner ==============

#[test]
fn test_scenario_file_passes() {
    let result = rdbg::testing::run_scenario(&fixture("calc_scenario.yml"), false)
        .expect("Scenario failed to run");
    assert!(result.passed, "{:?}", result.error);
    assert_eq!(result.steps_run, result.steps_total);
}

// ============== DAP ==============

async fn send<W: tokio::io::AsyncWrite + Unpin>(writer: &mut W, seq: i64, command: &str, arguments: Value) {
    let message = json!({ "seq": seq, "type": "request", "command": command, "arguments": arguments });
    codec::write_message(writer, &message.to_string())
        .await
        .expect("Failed to write DAP request");
}

/// Read messages until one matches, skipping the rest
async fn recv_until<R: tokio::io::AsyncBufRead + Unpin>(
    reader: &mut R,
    matches: impl Fn(&Value) -> bool,
) -> Value {
    loop {
        let text = tokio::time::timeout(TIMEOUT, codec::read_message(reader))
            .await
            .expect("Timed out waiting for a DAP message")
            .expect("Failed to read DAP message");
        let message: Value = serde_json::from_str(&text).expect("Invalid DAP JSON");
        if matches(&message) {
            return message;
        }
    }
}

fn response_to(seq: i64) -> impl Fn(&Value) -> bool {
    move |m| m["type"] == "response" && m["request_seq"] == seq
}

fn event(name: &'static str) -> impl Fn(&Value) -> bool {
    move |m| m["type"] == "event" && m["event"] == name
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dap_session_end_to_end() {
    let (ours, theirs) = tokio::io::duplex(64 * 1024);
    let (server_reader, server_writer) = tokio::io::split(theirs);
    let (frontend, startup) = DapFrontEnd::spawn(server_reader, server_writer).unwrap();

    let runtime = SimRuntime::new(program("calc.yml"));
    let session = tokio::task::spawn_blocking(move || {
        runtime.debug_when(Box::new(frontend), nonstop(&[]), || startup.configured())
    });

    let (reader, mut writer) = tokio::io::split(ours);
    let mut reader = BufReader::new(reader);

    send(&mut writer, 1, "initialize", json!({ "adapterID": "rdbg" })).await;
    let init = recv_until(&mut reader, response_to(1)).await;
    assert_eq!(init["success"], true);

    // Nothing is loaded yet, so the breakpoint stays pending
    send(
        &mut writer,
        2,
        "setBreakpoints",
        json!({ "source": { "path": "/app/calc.rb" }, "breakpoints": [{ "line": 3 }] }),
    )
    .await;
    let set = recv_until(&mut reader, response_to(2)).await;
    assert_eq!(set["success"], true);
    assert_eq!(set["body"]["breakpoints"][0]["verified"], false);
    assert!(set["body"]["breakpoints"][0]["id"].is_i64());

    send(&mut writer, 3, "configurationDone", json!({})).await;
    assert_eq!(recv_until(&mut reader, response_to(3)).await["success"], true);

    let stopped = recv_until(&mut reader, event("stopped")).await;
    assert_eq!(stopped["body"]["reason"], "breakpoint");
    let thread = stopped["body"]["threadId"].as_i64().unwrap();

    send(&mut writer, 4, "stackTrace", json!({ "threadId": thread })).await;
    let trace = recv_until(&mut reader, response_to(4)).await;
    assert_eq!(trace["body"]["totalFrames"], 3);
    let top = &trace["body"]["stackFrames"][0];
    assert_eq!(top["name"], "Calc#add");
    assert_eq!(top["line"], 3);
    assert_eq!(top["source"]["name"], "calc.rb");
    let frame_id = top["id"].as_i64().unwrap();
    assert_eq!(frame_id, thread * 10_000);

    send(&mut writer, 5, "scopes", json!({ "frameId": frame_id })).await;
    let scopes = recv_until(&mut reader, response_to(5)).await;
    let reference = scopes["body"]["scopes"][0]["variablesReference"].clone();
    assert_eq!(reference, frame_id + 1);

    send(&mut writer, 6, "variables", json!({ "variablesReference": reference })).await;
    let vars = recv_until(&mut reader, response_to(6)).await;
    let x = vars["body"]["variables"]
        .as_array()
        .unwrap()
        .iter()
        .find(|v| v["name"] == "x")
        .cloned()
        .expect("x not among the variables");
    assert_eq!(x["value"], "20");
    assert_eq!(x["type"], "Integer");

    send(
        &mut writer,
        7,
        "evaluate",
        json!({ "expression": "x + y", "frameId": frame_id }),
    )
    .await;
    let eval = recv_until(&mut reader, response_to(7)).await;
    assert_eq!(eval["body"]["result"], "40");

    send(&mut writer, 8, "continue", json!({ "threadId": thread })).await;
    assert_eq!(recv_until(&mut reader, response_to(8)).await["success"], true);
    let exited = recv_until(&mut reader, event("exited")).await;
    assert_eq!(exited["body"]["exitCode"], 0);
    recv_until(&mut reader, event("terminated")).await;

    writer.shutdown().await.unwrap();
    drop(writer);
    drop(reader);
    let code = session.await.unwrap().unwrap();
    assert_eq!(code, 0);
}
