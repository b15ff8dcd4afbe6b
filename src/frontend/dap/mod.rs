//! Debug Adapter Protocol front end
//!
//! DAP messages are read and written on an I/O thread with its own tokio
//! runtime. Requests reach the coordinator as [`Input::Request`] with the
//! DAP `seq` as id; the coordinator's [`FrontEvent`]s come back as DAP
//! responses and events.

mod adapter;
pub mod codec;
pub mod types;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};

use crate::common::{Error, Result};
use crate::frontend::{FrontEnd, FrontEvent, Input};
use crate::session::event::FrameSummary;
use crate::thread::Interrupter;
use adapter::{Adapter, Outgoing, Shared, Waiting};
use types::{EventMessage, RequestMessage, ResponseMessage, Source, StackFrame};

/// How long `quit` waits for queued messages to be written
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// What the client asked for in `launch` or `attach`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchArgs {
    pub program: Option<String>,
    pub stop_on_entry: bool,
}

/// Handshake progress, observed before the program starts
pub struct Startup {
    launched: std::sync::mpsc::Receiver<LaunchArgs>,
    configured: std::sync::mpsc::Receiver<()>,
}

impl Startup {
    /// Block until the client sends `launch` or `attach`
    pub fn launched(&self) -> Result<LaunchArgs> {
        self.launched.recv().map_err(|_| Error::Disconnected)
    }

    /// Block until the client sends `configurationDone`
    pub fn configured(&self) -> Result<()> {
        self.configured.recv().map_err(|_| Error::Disconnected)
    }
}

pub struct DapFrontEnd {
    shared: Arc<Shared>,
    outgoing: UnboundedSender<Outgoing>,
    incoming: UnboundedReceiver<Input>,
}

impl DapFrontEnd {
    /// Serve DAP over the process's standard streams
    pub fn stdio() -> Result<(Self, Startup)> {
        Self::spawn(tokio::io::stdin(), tokio::io::stdout())
    }

    /// Serve DAP over any byte stream pair
    pub fn spawn<R, W>(reader: R, writer: W) -> Result<(Self, Startup)>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let shared = Arc::new(Shared::default());
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (launched_tx, launched_rx) = std::sync::mpsc::channel();
        let (configured_tx, configured_rx) = std::sync::mpsc::channel();

        let adapter = Adapter {
            shared: Arc::clone(&shared),
            session: in_tx,
            outgoing: out_tx.clone(),
            launched: Some(launched_tx),
            configured: Some(configured_tx),
        };

        std::thread::Builder::new()
            .name("rdbg-dap".to_string())
            .spawn(move || serve(reader, writer, out_rx, adapter))?;

        Ok((
            Self {
                shared,
                outgoing: out_tx,
                incoming: in_rx,
            },
            Startup {
                launched: launched_rx,
                configured: configured_rx,
            },
        ))
    }

    fn event(&self, event: &str, body: Value) {
        adapter::send(&self.outgoing, &EventMessage::new(event, Some(body)));
    }

    fn respond(&self, id: i64, result: std::result::Result<Value, String>) {
        let Some(waiting) = self.shared.take(id) else {
            tracing::warn!(id, "response for an unknown request");
            return;
        };
        let result = result.map(|body| shape_body(&waiting, body, &self.shared));
        adapter::send(
            &self.outgoing,
            &ResponseMessage::new(id, &waiting.command, result),
        );
    }
}

/// Turn a session response body into the DAP body of its command
fn shape_body(waiting: &Waiting, mut body: Value, shared: &Shared) -> Value {
    match waiting.command.as_str() {
        "stackTrace" => {
            let thread = waiting.thread.unwrap_or_default();
            let frames: Vec<FrameSummary> =
                serde_json::from_value(body["frames"].take()).unwrap_or_default();
            let stack: Vec<StackFrame> = frames
                .iter()
                .map(|frame| StackFrame {
                    id: adapter::frame_id(thread, frame.index),
                    name: frame.name.clone(),
                    source: Source {
                        name: Path::new(&frame.path)
                            .file_name()
                            .map(|name| name.to_string_lossy().into_owned()),
                        path: Some(frame.path.clone()),
                    },
                    line: frame.line,
                    column: 1,
                })
                .collect();
            json!({ "stackFrames": stack, "totalFrames": stack.len() })
        }
        "setBreakpoints" => {
            if let Some(breakpoints) = body["breakpoints"].as_array_mut() {
                for bp in breakpoints {
                    bp["id"] = json!(shared.breakpoint_id());
                }
            }
            body
        }
        "variables" => {
            if let Some(variables) = body["variables"].as_array_mut() {
                for var in variables {
                    var["variablesReference"] = json!(0);
                }
            }
            body
        }
        "evaluate" => {
            body["variablesReference"] = json!(0);
            body
        }
        _ => body,
    }
}

impl FrontEnd for DapFrontEnd {
    fn connect(&mut self, interrupter: Interrupter) {
        let _ = self.shared.interrupter.set(interrupter);
        // Requests may already be queued from before the session started
        if let Some(interrupter) = self.shared.interrupter.get() {
            interrupter.notify();
        }
    }

    fn next_command(&mut self, _prompt: &str) -> Result<Input> {
        Ok(self.incoming.blocking_recv().unwrap_or(Input::Closed))
    }

    fn poll(&mut self) -> Vec<Input> {
        let mut inputs = Vec::new();
        loop {
            match self.incoming.try_recv() {
                Ok(input) => inputs.push(input),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    inputs.push(Input::Closed);
                    break;
                }
            }
        }
        inputs
    }

    fn emit_output(&mut self, lines: &[String]) {
        for line in lines {
            self.event(
                "output",
                json!({ "category": "console", "output": format!("{}\n", line) }),
            );
        }
    }

    fn emit_event(&mut self, event: &FrontEvent) {
        match event {
            FrontEvent::Stopped { thread, reason, .. } => self.event(
                "stopped",
                json!({ "reason": reason, "threadId": thread, "allThreadsStopped": true }),
            ),
            FrontEvent::Continued { thread } => self.event(
                "continued",
                json!({ "threadId": thread, "allThreadsContinued": true }),
            ),
            FrontEvent::ThreadStarted { thread, .. } => {
                self.event("thread", json!({ "reason": "started", "threadId": thread }))
            }
            FrontEvent::ThreadExited { thread } => {
                self.event("thread", json!({ "reason": "exited", "threadId": thread }))
            }
            FrontEvent::Terminated { code } => {
                self.event("exited", json!({ "exitCode": code }));
                self.event("terminated", json!({}));
            }
            FrontEvent::Response { id, result } => self.respond(*id, result.clone()),
        }
    }

    fn ask(&mut self, prompt: &str) -> Result<String> {
        // No way to ask a DAP client; take the default answer
        tracing::debug!(prompt, "question answered with default");
        Ok(String::new())
    }

    fn quit(&mut self, code: i32) {
        tracing::info!(code, "closing DAP session");
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        if self.outgoing.send(Outgoing::Flush(done_tx)).is_ok() {
            let _ = done_rx.recv_timeout(FLUSH_TIMEOUT);
        }
    }
}

/// Body of the I/O thread
fn serve<R, W>(reader: R, mut writer: W, mut outgoing: UnboundedReceiver<Outgoing>, mut adapter: Adapter)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "DAP I/O runtime failed");
            return;
        }
    };

    runtime.block_on(async move {
        let writer_task = tokio::spawn(async move {
            let mut seq: i64 = 0;
            while let Some(out) = outgoing.recv().await {
                match out {
                    Outgoing::Message(mut message) => {
                        seq += 1;
                        message["seq"] = json!(seq);
                        if let Err(e) = codec::write_message(&mut writer, &message.to_string()).await {
                            tracing::warn!(error = %e, "DAP write failed");
                            break;
                        }
                    }
                    Outgoing::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });

        let mut reader = BufReader::new(reader);
        loop {
            match codec::read_message(&mut reader).await {
                Ok(text) => match serde_json::from_str::<RequestMessage>(&text) {
                    Ok(req) => adapter.handle(req),
                    Err(e) => tracing::warn!(error = %e, "ignoring malformed DAP message"),
                },
                Err(Error::Disconnected) => {
                    tracing::info!("DAP client disconnected");
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "DAP read failed");
                    break;
                }
            }
        }

        // Closing the input channel ends the session loop
        drop(adapter);
        let _ = writer_task.await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::Request;
    use tokio::io::{AsyncWriteExt, DuplexStream};

    struct Client {
        writer: tokio::io::WriteHalf<DuplexStream>,
        reader: BufReader<tokio::io::ReadHalf<DuplexStream>>,
    }

    impl Client {
        async fn send(&mut self, seq: i64, command: &str, arguments: Value) {
            let message = json!({ "seq": seq, "type": "request", "command": command, "arguments": arguments });
            codec::write_message(&mut self.writer, &message.to_string())
                .await
                .unwrap();
        }

        async fn recv(&mut self) -> Value {
            let text = codec::read_message(&mut self.reader).await.unwrap();
            serde_json::from_str(&text).unwrap()
        }
    }

    fn connect() -> (DapFrontEnd, Startup, Client) {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(theirs);
        let (frontend, startup) = DapFrontEnd::spawn(reader, writer).unwrap();
        let (reader, writer) = tokio::io::split(ours);
        let client = Client {
            writer,
            reader: BufReader::new(reader),
        };
        (frontend, startup, client)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_handshake_is_answered_locally() {
        let (_frontend, startup, mut client) = connect();

        client.send(1, "initialize", json!({ "adapterID": "rdbg" })).await;
        let response = client.recv().await;
        assert_eq!(response["type"], "response");
        assert_eq!(response["request_seq"], 1);
        assert_eq!(response["body"]["supportsConfigurationDoneRequest"], true);
        let initialized = client.recv().await;
        assert_eq!(initialized["event"], "initialized");
        assert!(initialized["seq"].as_i64().unwrap() > response["seq"].as_i64().unwrap());

        client
            .send(2, "launch", json!({ "program": "app.yaml", "stopOnEntry": true }))
            .await;
        assert_eq!(client.recv().await["success"], true);
        let launch = tokio::task::spawn_blocking(move || {
            let launch = startup.launched().unwrap();
            (launch, startup)
        })
        .await
        .unwrap();
        assert_eq!(
            launch.0,
            LaunchArgs {
                program: Some("app.yaml".into()),
                stop_on_entry: true
            }
        );

        client.send(3, "scopes", json!({ "frameId": 10_001 })).await;
        let scopes = client.recv().await;
        assert_eq!(scopes["body"]["scopes"][0]["variablesReference"], 10_002);

        client.send(4, "restartFrame", json!({})).await;
        let unsupported = client.recv().await;
        assert_eq!(unsupported["success"], false);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_session_responses_are_shaped() {
        let (frontend, _startup, mut client) = connect();

        client.send(5, "stackTrace", json!({ "threadId": 2 })).await;
        let mut frontend = tokio::task::spawn_blocking(move || {
            let mut frontend = frontend;
            let input = frontend.next_command("").unwrap();
            assert_eq!(
                input,
                Input::Request {
                    id: 5,
                    request: Request::StackTrace { thread: 2 }
                }
            );
            frontend.emit_event(&FrontEvent::Response {
                id: 5,
                result: Ok(json!({ "frames": [
                    { "index": 0, "name": "foo", "path": "/app/lib/foo.rb", "line": 4, "depth": 2 },
                    { "index": 1, "name": "<main>", "path": "/app/main.rb", "line": 9, "depth": 1 }
                ] })),
            });
            frontend
        })
        .await
        .unwrap();

        let response = client.recv().await;
        assert_eq!(response["command"], "stackTrace");
        assert_eq!(response["body"]["totalFrames"], 2);
        let top = &response["body"]["stackFrames"][0];
        assert_eq!(top["id"], 20_000);
        assert_eq!(top["line"], 4);
        assert_eq!(top["source"]["name"], "foo.rb");

        frontend.emit_event(&FrontEvent::Stopped {
            thread: 2,
            reason: "breakpoint".into(),
            breakpoint: None,
        });
        let stopped = client.recv().await;
        assert_eq!(stopped["event"], "stopped");
        assert_eq!(stopped["body"]["threadId"], 2);

        client.writer.shutdown().await.unwrap();
        drop(client);
        let closed = tokio::task::spawn_blocking(move || frontend.next_command("").unwrap())
            .await
            .unwrap();
        assert_eq!(closed, Input::Closed);
    }
}
