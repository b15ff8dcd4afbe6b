//! Server side of the remote text protocol
//!
//! The socket is served by a dedicated I/O thread running its own tokio
//! runtime. The coordinator talks to it through channels: lines to send
//! go out, commands and answers come back. Output produced while no client
//! is connected is kept and replayed when one attaches.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use super::protocol::{ClientLine, Greeting, ServerLine};
use super::transport::{self, BoxedConnection, Endpoint, Listener};
use crate::common::config::RemoteConfig;
use crate::common::{Error, Result};
use crate::frontend::{FrontEnd, Input};
use crate::thread::Interrupter;

/// Output lines kept while no client is attached
const MAX_BACKLOG: usize = 10_000;

/// Client input forwarded to the coordinator
#[derive(Debug)]
enum Incoming {
    Command(String),
    Answer(String),
}

pub struct RemoteFrontEnd {
    endpoint: Endpoint,
    outgoing: UnboundedSender<ServerLine>,
    incoming: UnboundedReceiver<Incoming>,
    width: Arc<AtomicUsize>,
    interrupter: Arc<OnceLock<Interrupter>>,
    io_thread: Option<JoinHandle<()>>,
}

impl RemoteFrontEnd {
    /// Bind the endpoint and start serving it
    pub fn listen(config: &RemoteConfig) -> Result<Self> {
        let endpoint = Endpoint::from_config(config);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let width = Arc::new(AtomicUsize::new(config.width));
        let interrupter = Arc::new(OnceLock::new());

        let server = Server {
            cookie: config.cookie.clone(),
            outgoing: out_rx,
            incoming: in_tx,
            width: Arc::clone(&width),
            interrupter: Arc::clone(&interrupter),
            backlog: VecDeque::new(),
            waiting: None,
        };

        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let bind_endpoint = endpoint.clone();
        let io_thread = std::thread::Builder::new()
            .name("rdbg-remote".to_string())
            .spawn(move || server.run(bind_endpoint, ready_tx))?;

        ready_rx
            .recv()
            .map_err(|_| Error::Internal("remote I/O thread exited".to_string()))??;
        tracing::info!(endpoint = %endpoint, "remote session listening");

        Ok(Self {
            endpoint,
            outgoing: out_tx,
            incoming: in_rx,
            width,
            interrupter,
            io_thread: Some(io_thread),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn send(&self, line: ServerLine) {
        if self.outgoing.send(line).is_err() {
            tracing::debug!("remote I/O thread is gone");
        }
    }
}

impl FrontEnd for RemoteFrontEnd {
    fn connect(&mut self, interrupter: Interrupter) {
        let _ = self.interrupter.set(interrupter);
    }

    fn next_command(&mut self, _prompt: &str) -> Result<Input> {
        self.send(ServerLine::Input);
        loop {
            match self.incoming.blocking_recv() {
                Some(Incoming::Command(text)) => return Ok(Input::Line(text)),
                Some(Incoming::Answer(text)) => {
                    tracing::debug!(answer = %text, "unexpected answer");
                }
                None => return Ok(Input::Closed),
            }
        }
    }

    fn emit_output(&mut self, lines: &[String]) {
        for line in lines {
            self.send(ServerLine::Out(line.clone()));
        }
    }

    fn ask(&mut self, prompt: &str) -> Result<String> {
        self.send(ServerLine::Ask(prompt.to_string()));
        loop {
            match self.incoming.blocking_recv() {
                Some(Incoming::Answer(text)) => return Ok(text),
                Some(Incoming::Command(text)) => {
                    tracing::debug!(command = %text, "command while asking");
                }
                None => return Err(Error::Disconnected),
            }
        }
    }

    fn quit(&mut self, code: i32) {
        tracing::info!(code, "closing remote session");
        self.send(ServerLine::Quit);
        if let Some(handle) = self.io_thread.take() {
            if handle.join().is_err() {
                tracing::error!("remote I/O thread panicked");
            }
        }
    }

    fn width(&self) -> usize {
        self.width.load(Ordering::Relaxed)
    }
}

/// How a client connection ended
enum Closing {
    Quit,
    Disconnected,
}

struct Server {
    cookie: Option<String>,
    outgoing: UnboundedReceiver<ServerLine>,
    incoming: UnboundedSender<Incoming>,
    width: Arc<AtomicUsize>,
    interrupter: Arc<OnceLock<Interrupter>>,
    backlog: VecDeque<ServerLine>,
    /// Outstanding `input`/`ask`, repeated to a newly attached client
    waiting: Option<ServerLine>,
}

impl Server {
    fn run(mut self, endpoint: Endpoint, ready: std::sync::mpsc::Sender<io::Result<()>>) {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        };

        runtime.block_on(async move {
            let listener = match Listener::bind(&endpoint).await {
                Ok(listener) => {
                    let _ = ready.send(Ok(()));
                    listener
                }
                Err(e) => {
                    let _ = ready.send(Err(e));
                    return;
                }
            };
            self.serve(&listener).await;
            listener.cleanup();
        });
    }

    async fn serve(&mut self, listener: &Listener) {
        loop {
            let conn = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                },
                line = self.outgoing.recv() => match line {
                    None | Some(ServerLine::Quit) => return,
                    Some(line) => {
                        self.keep(line);
                        continue;
                    }
                },
            };

            match self.session(conn).await {
                Ok(Closing::Quit) => return,
                Ok(Closing::Disconnected) => tracing::info!("remote client detached"),
                Err(e) => tracing::warn!(error = %e, "remote client dropped"),
            }
        }
    }

    /// Hold a line until a client attaches
    fn keep(&mut self, line: ServerLine) {
        match line {
            ServerLine::Input | ServerLine::Ask(_) => self.waiting = Some(line),
            line => {
                if self.backlog.len() >= MAX_BACKLOG {
                    self.backlog.pop_front();
                }
                self.backlog.push_back(line);
            }
        }
    }

    async fn session(&mut self, conn: BoxedConnection) -> Result<Closing> {
        let (reader, mut writer) = tokio::io::split(conn);
        let mut lines = BufReader::new(reader).lines();

        let Some(line) = lines.next_line().await? else {
            return Ok(Closing::Disconnected);
        };
        let greeting = Greeting::parse(&line)
            .and_then(|greeting| greeting.check(self.cookie.as_deref()).map(|_| greeting));
        let greeting = match greeting {
            Ok(greeting) => greeting,
            Err(e) => {
                let _ = transport::write_line(&mut writer, &ServerLine::Out(e.to_string())).await;
                return Err(e);
            }
        };
        self.width.store(greeting.width, Ordering::Relaxed);
        tracing::info!(width = greeting.width, "remote client attached");

        while let Some(pending) = self.backlog.pop_front() {
            if let Err(e) = transport::write_line(&mut writer, &pending).await {
                self.backlog.push_front(pending);
                return Err(e.into());
            }
        }
        if let Some(waiting) = &self.waiting {
            transport::write_line(&mut writer, waiting).await?;
        }

        loop {
            // `next_line` is cancel-safe, so output never splits a client line
            tokio::select! {
                read = lines.next_line() => {
                    let Some(line) = read? else {
                        return Ok(Closing::Disconnected);
                    };
                    self.client_line(&line);
                }
                out = self.outgoing.recv() => {
                    let Some(out) = out else {
                        return Ok(Closing::Quit);
                    };
                    let quit = out == ServerLine::Quit;
                    self.deliver(&mut writer, out).await?;
                    if quit {
                        return Ok(Closing::Quit);
                    }
                }
            }
        }
    }

    /// Write a line to the client, keeping it for the next one on failure
    async fn deliver<W>(&mut self, writer: &mut W, line: ServerLine) -> io::Result<()>
    where
        W: tokio::io::AsyncWrite + Unpin,
    {
        if matches!(line, ServerLine::Input | ServerLine::Ask(_)) {
            self.waiting = Some(line.clone());
        }
        match transport::write_line(writer, &line).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.keep(line);
                Err(e)
            }
        }
    }

    fn client_line(&mut self, line: &str) {
        let forward = match ClientLine::parse(line) {
            Ok(ClientLine::Pause) => {
                if let Some(interrupter) = self.interrupter.get() {
                    interrupter.interrupt();
                }
                return;
            }
            Ok(ClientLine::Width(width)) => {
                self.width.store(width, Ordering::Relaxed);
                return;
            }
            Ok(ClientLine::Command(text)) => Incoming::Command(text),
            Ok(ClientLine::Answer(text)) => Incoming::Answer(text),
            Err(e) => {
                tracing::warn!(error = %e, "ignoring client line");
                return;
            }
        };
        self.waiting = None;
        let _ = self.incoming.send(forward);
    }
}
