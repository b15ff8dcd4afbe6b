//! Debug session engine
//!
//! An [`Engine`] owns the coordinator thread. Runtimes register their
//! threads through an [`Attacher`]; front ends interrupt through an
//! [`Interrupter`].

pub mod command;
pub mod coordinator;
pub mod event;
pub mod postmortem;

use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::sync::mpsc;

use crate::common::config::SessionConfig;
use crate::common::{Error, Result};
use crate::frontend::FrontEnd;
use crate::runtime::{NativeThreadId, Runtime};
use crate::thread::{Control, Interrupter, ThreadClient};
use coordinator::Coordinator;
use event::SessionEvent;

/// A running debug session
pub struct Engine {
    control: Arc<Control>,
    handle: Option<JoinHandle<Result<()>>>,
}

impl Engine {
    /// Connect the front end and start the coordinator thread
    pub fn start(
        runtime: Arc<dyn Runtime>,
        mut frontend: Box<dyn FrontEnd>,
        settings: SessionConfig,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let control = Control::new(runtime, tx, settings);
        frontend.connect(Interrupter::new(Arc::clone(&control)));

        let coordinator = Coordinator::new(Arc::clone(&control), frontend, rx);
        let handle = std::thread::Builder::new()
            .name("rdbg-session".to_string())
            .spawn(move || coordinator.run())?;

        tracing::info!("Debug session started");
        Ok(Self {
            control,
            handle: Some(handle),
        })
    }

    /// Handle for registering program threads
    pub fn attacher(&self) -> Attacher {
        Attacher {
            control: Arc::clone(&self.control),
        }
    }

    pub fn interrupter(&self) -> Interrupter {
        Interrupter::new(Arc::clone(&self.control))
    }

    pub fn control(&self) -> &Arc<Control> {
        &self.control
    }

    /// Report that the program finished
    pub fn shutdown(&self, code: i32) {
        self.control.send(SessionEvent::Shutdown { code });
    }

    /// Wait for the coordinator to finish
    pub fn join(mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| Error::Internal("session thread panicked".to_string()))?,
            None => Ok(()),
        }
    }
}

/// Registers program threads with a session
#[derive(Clone)]
pub struct Attacher {
    control: Arc<Control>,
}

impl Attacher {
    /// Attach a program thread; blocks until the session lets it run
    pub fn attach(&self, native: NativeThreadId, name: &str) -> ThreadClient {
        ThreadClient::attach(Arc::clone(&self.control), native, name)
    }

    /// Attach a thread whose events are never intercepted
    pub fn attach_management(&self, native: NativeThreadId, name: &str) -> ThreadClient {
        ThreadClient::management(Arc::clone(&self.control), native, name)
    }
}
