//! Scripted front end
//!
//! Lets another thread drive a session the way a user would: send a line,
//! then wait for whatever the session printed until it prompts again.
//! Used by the scenario runner and the integration tests.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use super::{FrontEnd, FrontEvent, Input, Request};
use crate::common::{Error, Result};
use crate::thread::Interrupter;

/// What the session did, as seen by the driving side
#[derive(Debug, Clone, PartialEq)]
enum Activity {
    Output(Vec<String>),
    Event(FrontEvent),
    Prompt,
    Ask(String),
    Quit(i32),
}

/// Why a wait ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum End {
    /// The session is waiting for a command
    Prompt,
    /// The session asked a question
    Ask(String),
    /// The session ended with an exit status
    Quit(i32),
    /// The session went away without saying goodbye
    Gone,
}

/// Everything the session produced between two waits
#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub output: Vec<String>,
    pub events: Vec<FrontEvent>,
    pub end: End,
}

impl Transcript {
    /// Whether any output line contains the text
    pub fn contains(&self, text: &str) -> bool {
        self.output.iter().any(|line| line.contains(text))
    }

    /// All output as one string
    pub fn text(&self) -> String {
        self.output.join("\n")
    }

    /// The last stop reported in this transcript
    pub fn stopped(&self) -> Option<(usize, &str)> {
        self.events.iter().rev().find_map(|event| match event {
            FrontEvent::Stopped { thread, reason, .. } => Some((*thread, reason.as_str())),
            _ => None,
        })
    }

    /// The answer to a structured request
    pub fn response(&self, id: i64) -> Option<&std::result::Result<serde_json::Value, String>> {
        self.events.iter().find_map(|event| match event {
            FrontEvent::Response { id: rid, result } if *rid == id => Some(result),
            _ => None,
        })
    }
}

/// The session side
pub struct ScriptedFrontEnd {
    inputs: Receiver<Input>,
    activity: Sender<Activity>,
    width: usize,
    interrupter: Arc<OnceLock<Interrupter>>,
}

impl ScriptedFrontEnd {
    pub fn new() -> (Self, ScriptHandle) {
        let (input_tx, input_rx) = mpsc::channel();
        let (activity_tx, activity_rx) = mpsc::channel();
        let interrupter = Arc::new(OnceLock::new());
        let frontend = Self {
            inputs: input_rx,
            activity: activity_tx,
            width: 80,
            interrupter: Arc::clone(&interrupter),
        };
        let handle = ScriptHandle {
            inputs: Some(input_tx),
            activity: activity_rx,
            next_id: 1,
            interrupter,
        };
        (frontend, handle)
    }

    fn record(&self, activity: Activity) {
        let _ = self.activity.send(activity);
    }
}

impl FrontEnd for ScriptedFrontEnd {
    fn connect(&mut self, interrupter: Interrupter) {
        let _ = self.interrupter.set(interrupter);
    }

    fn next_command(&mut self, _prompt: &str) -> Result<Input> {
        self.record(Activity::Prompt);
        Ok(self.inputs.recv().unwrap_or(Input::Closed))
    }

    fn emit_output(&mut self, lines: &[String]) {
        self.record(Activity::Output(lines.to_vec()));
    }

    fn emit_event(&mut self, event: &FrontEvent) {
        self.record(Activity::Event(event.clone()));
    }

    fn ask(&mut self, prompt: &str) -> Result<String> {
        self.record(Activity::Ask(prompt.to_string()));
        match self.inputs.recv() {
            Ok(Input::Line(answer)) => Ok(answer),
            Ok(_) => Ok(String::new()),
            Err(_) => Err(Error::Disconnected),
        }
    }

    fn quit(&mut self, code: i32) {
        self.record(Activity::Quit(code));
    }

    fn width(&self) -> usize {
        self.width
    }
}

/// The driving side
pub struct ScriptHandle {
    inputs: Option<Sender<Input>>,
    activity: Receiver<Activity>,
    next_id: i64,
    interrupter: Arc<OnceLock<Interrupter>>,
}

impl ScriptHandle {
    /// Queue input without waiting
    pub fn send(&self, input: Input) {
        if let Some(inputs) = &self.inputs {
            let _ = inputs.send(input);
        }
    }

    /// Wait until the session prompts, asks, or ends
    pub fn wait(&self, timeout: Duration) -> Result<Transcript> {
        let deadline = Instant::now() + timeout;
        let mut output = Vec::new();
        let mut events = Vec::new();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let activity = match self.activity.recv_timeout(remaining) {
                Ok(activity) => activity,
                Err(RecvTimeoutError::Timeout) => {
                    return Err(Error::TestAssertion(format!(
                        "session did not prompt within {:?}; output so far: {:?}",
                        timeout, output
                    )))
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Ok(Transcript {
                        output,
                        events,
                        end: End::Gone,
                    })
                }
            };

            let end = match activity {
                Activity::Output(lines) => {
                    output.extend(lines);
                    continue;
                }
                Activity::Event(event) => {
                    events.push(event);
                    continue;
                }
                Activity::Prompt => End::Prompt,
                Activity::Ask(prompt) => End::Ask(prompt),
                Activity::Quit(code) => End::Quit(code),
            };
            return Ok(Transcript {
                output,
                events,
                end,
            });
        }
    }

    /// Send a command line and wait for the session to settle
    pub fn command(&self, line: &str, timeout: Duration) -> Result<Transcript> {
        self.send(Input::Line(line.to_string()));
        self.wait(timeout)
    }

    /// Send a structured request and wait for its answer
    pub fn request(
        &mut self,
        request: Request,
        timeout: Duration,
    ) -> Result<(std::result::Result<serde_json::Value, String>, Transcript)> {
        let id = self.next_id;
        self.next_id += 1;
        self.send(Input::Request { id, request });
        let transcript = self.wait(timeout)?;
        let result = transcript.response(id).cloned().ok_or_else(|| {
            Error::TestAssertion(format!("no response to request {}", id))
        })?;
        Ok((result, transcript))
    }

    /// Interrupt the running program, like Ctrl-C at a console
    ///
    /// False until the session has connected the front end.
    pub fn interrupt(&self) -> bool {
        match self.interrupter.get() {
            Some(interrupter) => {
                interrupter.interrupt();
                true
            }
            None => false,
        }
    }

    /// Stop providing input; the session detaches at its next prompt
    pub fn close(&mut self) {
        self.inputs = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transcript_collects_until_prompt() {
        let (mut frontend, handle) = ScriptedFrontEnd::new();
        frontend.emit_output(&["hello".to_string()]);
        frontend.emit_event(&FrontEvent::Continued { thread: 1 });
        handle.send(Input::Line("next".to_string()));
        assert_eq!(frontend.next_command("(rdbg) ").unwrap(), Input::Line("next".into()));

        let transcript = handle.wait(Duration::from_secs(1)).unwrap();
        assert_eq!(transcript.output, vec!["hello"]);
        assert_eq!(transcript.events.len(), 1);
        assert_eq!(transcript.end, End::Prompt);
    }

    #[test]
    fn test_ask_and_close() {
        let (mut frontend, mut handle) = ScriptedFrontEnd::new();
        handle.send(Input::Line("y".to_string()));
        assert_eq!(frontend.ask("Really quit? [Y/n] ").unwrap(), "y");
        assert_eq!(
            handle.wait(Duration::from_secs(1)).unwrap().end,
            End::Ask("Really quit? [Y/n] ".to_string())
        );

        handle.close();
        assert_eq!(frontend.next_command("(rdbg) ").unwrap(), Input::Closed);
    }

    #[test]
    fn test_wait_reports_a_vanished_session() {
        let (frontend, handle) = ScriptedFrontEnd::new();
        drop(frontend);
        assert_eq!(handle.wait(Duration::from_secs(1)).unwrap().end, End::Gone);
    }
}
