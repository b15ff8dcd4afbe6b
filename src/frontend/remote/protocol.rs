//! Remote text protocol
//!
//! Newline-terminated ASCII lines. The client opens with a greeting:
//! ```text
//! version: <v> width: <n> cookie: <c>
//! ```
//! then sends `pause`, `command <text>`, `answer <text>` or `width <n>`.
//! The server sends `out <text>`, `input`, `ask <prompt>` and `quit`.

use std::fmt;

use crate::common::{Error, Result};

/// Version both ends must agree on
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Placeholder for a missing cookie
const NO_COOKIE: &str = "-";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    pub version: String,
    pub width: usize,
    pub cookie: Option<String>,
}

impl Greeting {
    pub fn new(width: usize, cookie: Option<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            width,
            cookie,
        }
    }

    pub fn parse(line: &str) -> Result<Self> {
        let bad = || Error::Protocol(format!("malformed greeting: {}", line.trim()));
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let [version_key, version, width_key, width, cookie_key, cookie] = tokens[..] else {
            return Err(bad());
        };
        if version_key != "version:" || width_key != "width:" || cookie_key != "cookie:" {
            return Err(bad());
        }

        Ok(Self {
            version: version.to_string(),
            width: width.parse().map_err(|_| bad())?,
            cookie: (cookie != NO_COOKIE).then(|| cookie.to_string()),
        })
    }

    /// Reject a client speaking another version or holding the wrong cookie
    pub fn check(&self, cookie: Option<&str>) -> Result<()> {
        if self.version != PROTOCOL_VERSION {
            return Err(Error::VersionMismatch {
                server: PROTOCOL_VERSION.to_string(),
                client: self.version.clone(),
            });
        }
        if let Some(expected) = cookie {
            if self.cookie.as_deref() != Some(expected) {
                return Err(Error::CookieMismatch);
            }
        }
        Ok(())
    }
}

impl fmt::Display for Greeting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "version: {} width: {} cookie: {}",
            self.version,
            self.width,
            self.cookie.as_deref().unwrap_or(NO_COOKIE)
        )
    }
}

/// Lines sent by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientLine {
    /// Interrupt the running program
    Pause,
    Command(String),
    Answer(String),
    Width(usize),
}

impl ClientLine {
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (word, rest) = line.split_once(' ').unwrap_or((line, ""));
        match word {
            "pause" => Ok(ClientLine::Pause),
            "command" => Ok(ClientLine::Command(rest.to_string())),
            "answer" => Ok(ClientLine::Answer(rest.to_string())),
            "width" => rest
                .trim()
                .parse()
                .map(ClientLine::Width)
                .map_err(|_| Error::Protocol(format!("invalid width: {}", rest))),
            _ => Err(Error::Protocol(format!("unknown client line: {}", line))),
        }
    }
}

impl fmt::Display for ClientLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientLine::Pause => write!(f, "pause"),
            ClientLine::Command(text) => write!(f, "command {}", text),
            ClientLine::Answer(text) => write!(f, "answer {}", text),
            ClientLine::Width(width) => write!(f, "width {}", width),
        }
    }
}

/// Lines sent by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerLine {
    Out(String),
    /// Waiting for a command
    Input,
    Ask(String),
    Quit,
}

impl ServerLine {
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (word, rest) = line.split_once(' ').unwrap_or((line, ""));
        match word {
            "out" => Ok(ServerLine::Out(rest.to_string())),
            "input" => Ok(ServerLine::Input),
            "ask" => Ok(ServerLine::Ask(rest.to_string())),
            "quit" => Ok(ServerLine::Quit),
            _ => Err(Error::Protocol(format!("unknown server line: {}", line))),
        }
    }
}

impl fmt::Display for ServerLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerLine::Out(text) => write!(f, "out {}", text),
            ServerLine::Input => write!(f, "input"),
            ServerLine::Ask(prompt) => write!(f, "ask {}", prompt),
            ServerLine::Quit => write!(f, "quit"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greeting() {
        let greeting = Greeting::new(120, Some("s3cret".into()));
        let parsed = Greeting::parse(&greeting.to_string()).unwrap();
        assert_eq!(parsed, greeting);
        assert!(parsed.check(Some("s3cret")).is_ok());
        assert!(matches!(parsed.check(Some("other")), Err(Error::CookieMismatch)));

        let anonymous = Greeting::parse("version: 0.0.0 width: 80 cookie: -").unwrap();
        assert_eq!(anonymous.cookie, None);
        assert!(matches!(
            anonymous.check(None),
            Err(Error::VersionMismatch { .. })
        ));

        assert!(Greeting::parse("hello").is_err());
        assert!(Greeting::parse("version: 1 width: wide cookie: -").is_err());
    }

    #[test]
    fn test_client_lines() {
        assert_eq!(ClientLine::parse("pause\n").unwrap(), ClientLine::Pause);
        assert_eq!(
            ClientLine::parse("command b main.rb:3").unwrap(),
            ClientLine::Command("b main.rb:3".into())
        );
        assert_eq!(ClientLine::parse("answer").unwrap(), ClientLine::Answer(String::new()));
        assert_eq!(ClientLine::parse("width 100").unwrap(), ClientLine::Width(100));
        assert!(ClientLine::parse("width x").is_err());
        assert!(ClientLine::parse("jump").is_err());
    }

    #[test]
    fn test_server_lines() {
        assert_eq!(
            ServerLine::parse("out => 42").unwrap(),
            ServerLine::Out("=> 42".into())
        );
        assert_eq!(ServerLine::parse("input").unwrap(), ServerLine::Input);
        assert_eq!(ServerLine::Ask("Really quit? [Y/n] ".into()).to_string(), "ask Really quit? [Y/n] ");
        assert_eq!(ServerLine::parse("quit\r\n").unwrap(), ServerLine::Quit);
    }
}
