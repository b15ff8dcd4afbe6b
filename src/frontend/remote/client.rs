//! Client side of the remote text protocol (`rdbg attach`)

use std::io::Write;

use tokio::io::{AsyncBufReadExt, BufReader};

use super::protocol::{ClientLine, Greeting, ServerLine};
use super::transport::{self, Endpoint};
use crate::common::config::RemoteConfig;
use crate::common::{paths, Error, Result};

const PROMPT: &str = "(rdbg:remote) ";

/// What the server is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reply {
    Command,
    Answer,
}

/// Pick the session to attach to
///
/// An explicit port or socket wins; otherwise the only open local session
/// is used.
pub fn find_endpoint(config: &RemoteConfig) -> Result<Endpoint> {
    if config.port.is_some() || config.sock_path.is_some() {
        return Ok(Endpoint::from_config(config));
    }

    let mut sockets = paths::list_sockets();
    match sockets.len() {
        0 => Err(Error::Config("No debug session found".to_string())),
        1 => Ok(Endpoint::Local(sockets.remove(0))),
        _ => {
            let list: Vec<String> = sockets.iter().map(|p| p.display().to_string()).collect();
            Err(Error::Config(format!(
                "Multiple debug sessions found, choose one with --sock:\n  {}",
                list.join("\n  ")
            )))
        }
    }
}

/// Attach the terminal to a listening session until it quits
pub async fn attach(config: &RemoteConfig) -> Result<()> {
    let endpoint = find_endpoint(config)?;
    let conn = transport::connect(&endpoint).await?;
    tracing::info!(endpoint = %endpoint, "attached");

    let (reader, mut writer) = tokio::io::split(conn);
    let mut server = BufReader::new(reader).lines();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    let width = std::env::var("COLUMNS")
        .ok()
        .and_then(|c| c.parse().ok())
        .unwrap_or(config.width);
    let greeting = Greeting::new(width, config.cookie.clone());
    transport::write_line(&mut writer, &greeting).await?;

    let mut awaiting: Option<Reply> = None;
    loop {
        tokio::select! {
            line = server.next_line() => {
                let Some(line) = line? else {
                    println!("Session closed");
                    return Ok(());
                };
                match ServerLine::parse(&line)? {
                    ServerLine::Out(text) => println!("{}", text),
                    ServerLine::Input => {
                        prompt(PROMPT);
                        awaiting = Some(Reply::Command);
                    }
                    ServerLine::Ask(question) => {
                        prompt(&question);
                        awaiting = Some(Reply::Answer);
                    }
                    ServerLine::Quit => return Ok(()),
                }
            }
            line = stdin.next_line(), if awaiting.is_some() => {
                let Some(text) = line? else {
                    // End of input detaches the client and leaves the session open
                    println!();
                    return Ok(());
                };
                let reply = match awaiting.take() {
                    Some(Reply::Answer) => ClientLine::Answer(text),
                    _ => ClientLine::Command(text),
                };
                transport::write_line(&mut writer, &reply).await?;
            }
            signal = tokio::signal::ctrl_c() => {
                signal?;
                if awaiting.is_none() {
                    transport::write_line(&mut writer, &ClientLine::Pause).await?;
                } else {
                    println!();
                    prompt(PROMPT);
                }
            }
        }
    }
}

fn prompt(text: &str) {
    print!("{}", text);
    let _ = std::io::stdout().flush();
}
