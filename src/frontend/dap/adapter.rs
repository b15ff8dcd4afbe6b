//! Request side of the DAP front end
//!
//! Runs on the I/O thread. Handshake requests and `scopes` are answered
//! here; everything else becomes a session [`Request`] whose response is
//! sent once the coordinator reports it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};

use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedSender;

use super::types::{
    Capabilities, DisconnectArguments, EvaluateArguments, EventMessage, ExceptionFilter,
    LaunchArguments, RequestMessage, ResponseMessage, Scope, ScopesArguments,
    SetBreakpointsArguments, SetExceptionBreakpointsArguments, ThreadArguments,
    VariablesArguments,
};
use super::LaunchArgs;
use crate::common::{Error, Result};
use crate::frontend::{Input, Request};
use crate::thread::Interrupter;

/// Frame ids are `thread * FRAME_STRIDE + frame index`
pub const FRAME_STRIDE: i64 = 10_000;

/// Messages for the writer task
#[derive(Debug)]
pub enum Outgoing {
    Message(Value),
    /// Acknowledged once everything queued before it is written
    Flush(std::sync::mpsc::Sender<()>),
}

/// A request the session has yet to answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Waiting {
    pub command: String,
    pub thread: Option<usize>,
}

/// State shared by the I/O thread and the front end
#[derive(Default)]
pub struct Shared {
    pending: Mutex<HashMap<i64, Waiting>>,
    next_breakpoint: AtomicI64,
    pub interrupter: OnceLock<Interrupter>,
}

impl Shared {
    pub fn expect(&self, seq: i64, waiting: Waiting) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(seq, waiting);
    }

    pub fn take(&self, seq: i64) -> Option<Waiting> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&seq)
    }

    pub fn breakpoint_id(&self) -> i64 {
        self.next_breakpoint.fetch_add(1, Ordering::Relaxed) + 1
    }
}

pub fn frame_id(thread: usize, index: usize) -> i64 {
    thread as i64 * FRAME_STRIDE + index as i64
}

fn split_frame_id(id: i64) -> Result<(usize, usize)> {
    if id < 0 {
        return Err(Error::Protocol(format!("invalid frame id {}", id)));
    }
    Ok(((id / FRAME_STRIDE) as usize, (id % FRAME_STRIDE) as usize))
}

fn thread_id(id: i64) -> Result<usize> {
    usize::try_from(id).map_err(|_| Error::Protocol(format!("invalid thread id {}", id)))
}

fn capabilities() -> Capabilities {
    Capabilities {
        supports_configuration_done_request: true,
        supports_conditional_breakpoints: false,
        supports_step_back: false,
        supports_terminate_request: false,
        exception_breakpoint_filters: vec![
            ExceptionFilter {
                filter: "any".to_string(),
                label: "rescue any exception".to_string(),
                default: false,
            },
            ExceptionFilter {
                filter: "RuntimeError".to_string(),
                label: "rescue RuntimeError".to_string(),
                default: false,
            },
        ],
    }
}

/// Translate a request that the session answers
///
/// Returns the request and the thread it concerns, or `None` for commands
/// this adapter does not support.
pub fn session_request(req: &RequestMessage) -> Result<Option<(Request, Option<usize>)>> {
    let translated = match req.command.as_str() {
        "setBreakpoints" => {
            let args: SetBreakpointsArguments = req.args()?;
            let path = args
                .source
                .path
                .ok_or_else(|| Error::Protocol("setBreakpoints without a source path".into()))?;
            let lines = args.breakpoints.iter().map(|bp| bp.line).collect();
            (Request::SetBreakpoints { path, lines }, None)
        }
        "setExceptionBreakpoints" => {
            let args: SetExceptionBreakpointsArguments = req.args()?;
            let patterns = args
                .filters
                .into_iter()
                .map(|filter| match filter.as_str() {
                    "any" => "Exception".to_string(),
                    _ => filter,
                })
                .collect();
            (Request::SetExceptionBreakpoints { patterns }, None)
        }
        "threads" => (Request::Threads, None),
        "stackTrace" => {
            let args: ThreadArguments = req.args()?;
            let thread = thread_id(args.thread_id)?;
            (Request::StackTrace { thread }, Some(thread))
        }
        "variables" => {
            let args: VariablesArguments = req.args()?;
            let (thread, frame) = split_frame_id(args.variables_reference - 1)?;
            (
                Request::Locals {
                    thread,
                    frame: Some(frame),
                },
                Some(thread),
            )
        }
        "evaluate" => {
            let args: EvaluateArguments = req.args()?;
            let thread = args
                .frame_id
                .map(split_frame_id)
                .transpose()?
                .map(|(thread, _)| thread);
            (
                Request::Evaluate {
                    thread,
                    expr: args.expression,
                },
                thread,
            )
        }
        "continue" => (Request::Continue, None),
        "next" => (Request::Next, None),
        "stepIn" => (Request::StepIn, None),
        "stepOut" => (Request::StepOut, None),
        "pause" => (Request::Pause, None),
        "disconnect" => {
            let args: DisconnectArguments = req.args()?;
            (
                Request::Disconnect {
                    terminate: args.terminate_debuggee.unwrap_or(false),
                },
                None,
            )
        }
        _ => return Ok(None),
    };
    Ok(Some(translated))
}

pub struct Adapter {
    pub shared: std::sync::Arc<Shared>,
    pub session: UnboundedSender<Input>,
    pub outgoing: UnboundedSender<Outgoing>,
    pub launched: Option<std::sync::mpsc::Sender<LaunchArgs>>,
    pub configured: Option<std::sync::mpsc::Sender<()>>,
}

impl Adapter {
    pub fn handle(&mut self, req: RequestMessage) {
        tracing::debug!(seq = req.seq, command = %req.command, "DAP request");
        if let Err(e) = self.dispatch(&req) {
            self.respond(req.seq, &req.command, Err(e.to_string()));
        }
    }

    fn dispatch(&mut self, req: &RequestMessage) -> Result<()> {
        match req.command.as_str() {
            "initialize" => {
                self.respond(req.seq, &req.command, Ok(serde_json::to_value(capabilities())?));
                self.event("initialized", None);
            }
            "launch" | "attach" => {
                let args: LaunchArguments = req.args()?;
                if let Some(launched) = self.launched.take() {
                    let _ = launched.send(LaunchArgs {
                        program: args.program,
                        stop_on_entry: args.stop_on_entry,
                    });
                }
                self.respond(req.seq, &req.command, Ok(json!({})));
            }
            "configurationDone" => {
                if let Some(configured) = self.configured.take() {
                    let _ = configured.send(());
                }
                self.respond(req.seq, &req.command, Ok(json!({})));
            }
            "scopes" => {
                let args: ScopesArguments = req.args()?;
                split_frame_id(args.frame_id)?;
                let scope = Scope {
                    name: "Local variables".to_string(),
                    variables_reference: args.frame_id + 1,
                    expensive: false,
                };
                self.respond(req.seq, &req.command, Ok(json!({ "scopes": [scope] })));
            }
            _ => match session_request(req)? {
                Some((request, thread)) => self.forward(req, request, thread),
                None => {
                    return Err(Error::Protocol(format!(
                        "Unsupported request: {}",
                        req.command
                    )))
                }
            },
        }
        Ok(())
    }

    fn forward(&mut self, req: &RequestMessage, request: Request, thread: Option<usize>) {
        self.shared.expect(
            req.seq,
            Waiting {
                command: req.command.clone(),
                thread,
            },
        );
        let input = Input::Request {
            id: req.seq,
            request,
        };
        if self.session.send(input).is_err() {
            self.shared.take(req.seq);
            self.respond(req.seq, &req.command, Err("The session has ended".to_string()));
            return;
        }
        if let Some(interrupter) = self.shared.interrupter.get() {
            interrupter.notify();
        }
    }

    fn respond(&self, seq: i64, command: &str, result: std::result::Result<Value, String>) {
        send(&self.outgoing, &ResponseMessage::new(seq, command, result));
    }

    fn event(&self, event: &str, body: Option<Value>) {
        send(&self.outgoing, &EventMessage::new(event, body));
    }
}

/// Queue a message for the writer task
pub fn send<T: serde::Serialize>(outgoing: &UnboundedSender<Outgoing>, message: &T) {
    match serde_json::to_value(message) {
        Ok(value) => {
            let _ = outgoing.send(Outgoing::Message(value));
        }
        Err(e) => tracing::error!(error = %e, "failed to encode DAP message"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(command: &str, arguments: Value) -> RequestMessage {
        serde_json::from_value(json!({
            "seq": 7,
            "type": "request",
            "command": command,
            "arguments": arguments,
        }))
        .unwrap()
    }

    #[test]
    fn test_frame_ids_encode_thread_and_index() {
        assert_eq!(frame_id(3, 2), 30_002);
        assert_eq!(split_frame_id(30_002).unwrap(), (3, 2));
        assert!(split_frame_id(-1).is_err());
    }

    #[test]
    fn test_set_breakpoints_translation() {
        let req = request(
            "setBreakpoints",
            json!({ "source": { "path": "/app/main.rb" }, "breakpoints": [{ "line": 3 }, { "line": 9 }] }),
        );
        let (translated, thread) = session_request(&req).unwrap().unwrap();
        assert_eq!(
            translated,
            Request::SetBreakpoints {
                path: "/app/main.rb".into(),
                lines: vec![3, 9]
            }
        );
        assert_eq!(thread, None);

        let no_path = request("setBreakpoints", json!({ "source": {} }));
        assert!(session_request(&no_path).is_err());
    }

    #[test]
    fn test_variables_reference_names_a_frame() {
        let req = request("variables", json!({ "variablesReference": frame_id(1, 2) + 1 }));
        let (translated, thread) = session_request(&req).unwrap().unwrap();
        assert_eq!(
            translated,
            Request::Locals {
                thread: 1,
                frame: Some(2)
            }
        );
        assert_eq!(thread, Some(1));
    }

    #[test]
    fn test_requests_without_arguments() {
        let req = request("threads", Value::Null);
        assert_eq!(session_request(&req).unwrap().unwrap().0, Request::Threads);

        let req = request("disconnect", json!({ "terminateDebuggee": true }));
        assert_eq!(
            session_request(&req).unwrap().unwrap().0,
            Request::Disconnect { terminate: true }
        );

        let req = request("setExceptionBreakpoints", json!({ "filters": ["any"] }));
        assert_eq!(
            session_request(&req).unwrap().unwrap().0,
            Request::SetExceptionBreakpoints {
                patterns: vec!["Exception".into()]
            }
        );

        assert!(session_request(&request("restartFrame", json!({})))
            .unwrap()
            .is_none());
    }
}
