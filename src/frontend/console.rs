//! Local REPL front end
//!
//! Reads command lines from any `BufRead` and prints to any `Write`, so the
//! same code serves the terminal and tests. Ctrl-C interrupts the running
//! program when signal handling is enabled.

use std::io::{self, BufRead, BufReader, Stdin, Stdout, Write};

use super::{FrontEnd, Input};
use crate::common::Result;
use crate::thread::Interrupter;

pub struct Console<R, W> {
    input: R,
    output: W,
    handle_signals: bool,
    width: usize,
}

impl Console<BufReader<Stdin>, Stdout> {
    /// Console on the process's standard streams
    pub fn stdio() -> Self {
        let width = std::env::var("COLUMNS")
            .ok()
            .and_then(|c| c.parse().ok())
            .unwrap_or(80);
        Self {
            input: BufReader::new(io::stdin()),
            output: io::stdout(),
            handle_signals: true,
            width,
        }
    }
}

impl<R: BufRead, W: Write> Console<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self {
            input,
            output,
            handle_signals: false,
            width: 80,
        }
    }

    pub fn into_output(self) -> W {
        self.output
    }

    /// Print a prompt and read one line; `None` at end of input
    fn read_line(&mut self, prompt: &str) -> Result<Option<String>> {
        write!(self.output, "{}", prompt)?;
        self.output.flush()?;

        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
    }
}

impl<R, W> FrontEnd for Console<R, W>
where
    R: BufRead + Send,
    W: Write + Send,
{
    fn connect(&mut self, interrupter: Interrupter) {
        if !self.handle_signals {
            return;
        }
        let spawned = std::thread::Builder::new()
            .name("rdbg-signal".to_string())
            .spawn(move || watch_ctrl_c(interrupter));
        if let Err(e) = spawned {
            tracing::warn!(error = %e, "Ctrl-C handling unavailable");
        }
    }

    fn next_command(&mut self, prompt: &str) -> Result<Input> {
        Ok(match self.read_line(prompt)? {
            Some(line) => Input::Line(line),
            None => {
                let _ = writeln!(self.output);
                Input::Closed
            }
        })
    }

    fn emit_output(&mut self, lines: &[String]) {
        for line in lines {
            if writeln!(self.output, "{}", line).is_err() {
                return;
            }
        }
        let _ = self.output.flush();
    }

    fn ask(&mut self, prompt: &str) -> Result<String> {
        Ok(self.read_line(prompt)?.unwrap_or_default())
    }

    fn quit(&mut self, _code: i32) {
        let _ = self.output.flush();
    }

    fn width(&self) -> usize {
        self.width
    }
}

/// Turn every Ctrl-C into an interrupt request
fn watch_ctrl_c(interrupter: Interrupter) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::warn!(error = %e, "Ctrl-C handling unavailable");
            return;
        }
    };

    runtime.block_on(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            tracing::debug!("Ctrl-C");
            interrupter.interrupt();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_reads_lines_until_eof() {
        let mut console = Console::new(Cursor::new("next\r\ninfo\n"), Vec::new());
        assert_eq!(console.next_command("(rdbg) ").unwrap(), Input::Line("next".into()));
        assert_eq!(console.next_command("(rdbg) ").unwrap(), Input::Line("info".into()));
        assert_eq!(console.next_command("(rdbg) ").unwrap(), Input::Closed);

        let out = String::from_utf8(console.into_output()).unwrap();
        assert!(out.starts_with("(rdbg) (rdbg) "));
    }

    #[test]
    fn test_output_and_ask() {
        let mut console = Console::new(Cursor::new("y\n"), Vec::new());
        console.emit_output(&["a".to_string(), "b".to_string()]);
        assert_eq!(console.ask("Really quit? [Y/n] ").unwrap(), "y");
        assert_eq!(console.ask("again? ").unwrap(), "");

        let out = String::from_utf8(console.into_output()).unwrap();
        assert_eq!(out, "a\nb\nReally quit? [Y/n] again? ");
    }
}
