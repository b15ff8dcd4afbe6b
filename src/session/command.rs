//! REPL command grammar
//!
//! Parsing is pure: a line of text becomes a [`Command`] or an error
//! message. Nothing here touches session state.

use crate::common::{Error, Result};
use crate::thread::step::StepKind;

/// Where a `break` command points
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakTarget {
    /// `path:line`, or a bare line in the current file
    Line { path: Option<String>, line: u32 },
    /// `Klass#m` or `Klass.m`
    Method(String),
}

/// Trailing `if:` / `pre:` / `do:` clauses
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BreakOptions {
    pub condition: Option<String>,
    pub pre: Option<String>,
    pub do_: Option<String>,
}

impl BreakOptions {
    pub fn is_empty(&self) -> bool {
        self.condition.is_none() && self.pre.is_none() && self.do_.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoTarget {
    /// Bare `info`: locals of the selected frame
    Default,
    Breakpoints,
    Locals,
    Threads,
    Display,
    Frame,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceCommand {
    List,
    Line,
    Call,
    Exception,
    Pass(String),
    /// Remove one tracer by id, or all of them
    Off(Option<usize>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigCommand {
    Show,
    Get(String),
    Set(String, String),
}

/// A parsed REPL command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Step { kind: StepKind, count: usize },
    StepBack,
    StepReset,
    Continue,
    Quit { force: bool, code: Option<i32> },
    Kill { force: bool, code: Option<i32> },
    Break {
        target: Option<BreakTarget>,
        options: BreakOptions,
    },
    Catch {
        pattern: Option<String>,
        options: BreakOptions,
    },
    Watch(String),
    Delete(Option<usize>),
    Enable(usize),
    Disable(usize),
    Backtrace {
        max: Option<usize>,
        pattern: Option<String>,
    },
    List { start: Option<u32>, end: Option<u32> },
    Info(InfoTarget),
    Outline,
    Frame(Option<usize>),
    Up,
    Down,
    Print(String),
    Eval(String),
    Display(Option<String>),
    Undisplay(Option<usize>),
    Trace(TraceCommand),
    Thread(Option<usize>),
    Record(Option<bool>),
    Config(ConfigCommand),
    Help,
}

impl Command {
    /// Whether an empty line repeats this command
    pub fn is_repeatable(&self) -> bool {
        matches!(
            self,
            Command::Step { .. }
                | Command::StepBack
                | Command::Continue
                | Command::List { .. }
                | Command::Up
                | Command::Down
        )
    }
}

/// Parse one line of REPL input
///
/// Input that is not a known command is evaluated and pretty-printed.
pub fn parse(line: &str) -> Result<Command> {
    let line = line.trim();
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };
    let arg = (!rest.is_empty()).then_some(rest);

    let command = match word {
        "s" | "step" => match arg {
            Some("back") => Command::StepBack,
            Some("reset") => Command::StepReset,
            _ => step(StepKind::In, arg)?,
        },
        "n" | "next" => step(StepKind::Next, arg)?,
        "fin" | "finish" => step(StepKind::Finish, arg)?,
        "c" | "cont" | "continue" => Command::Continue,
        "q" | "quit" | "q!" | "quit!" => Command::Quit {
            force: word.ends_with('!'),
            code: arg.map(exit_code).transpose()?,
        },
        "kill" | "kill!" => Command::Kill {
            force: word.ends_with('!'),
            code: arg.map(exit_code).transpose()?,
        },
        "b" | "break" => {
            let (head, options) = split_options(rest);
            let target = match head {
                "" => None,
                head => Some(break_target(head)?),
            };
            Command::Break { target, options }
        }
        "catch" => {
            let (head, options) = split_options(rest);
            Command::Catch {
                pattern: (!head.is_empty()).then(|| head.to_string()),
                options,
            }
        }
        "watch" => Command::Watch(required(arg, "watch <expr>")?.to_string()),
        "del" | "delete" => Command::Delete(arg.map(|a| number(a, "delete")).transpose()?),
        "enable" => Command::Enable(number(required(arg, "enable <n>")?, "enable")?),
        "disable" => Command::Disable(number(required(arg, "disable <n>")?, "disable")?),
        "bt" | "backtrace" => backtrace(rest)?,
        "l" | "list" => list(arg)?,
        "i" | "info" => Command::Info(match arg {
            None => InfoTarget::Default,
            Some("b" | "break" | "breakpoints") => InfoTarget::Breakpoints,
            Some("l" | "locals" | "local") => InfoTarget::Locals,
            Some("th" | "threads" | "thread") => InfoTarget::Threads,
            Some("d" | "display") => InfoTarget::Display,
            Some("f" | "frame") => InfoTarget::Frame,
            Some(other) => return Err(Error::invalid(format!("unknown info target: {}", other))),
        }),
        "o" | "outline" | "ls" => Command::Outline,
        "f" | "frame" => Command::Frame(arg.map(|a| number(a, "frame")).transpose()?),
        "up" => Command::Up,
        "down" => Command::Down,
        "p" | "pp" => Command::Print(required(arg, "p <expr>")?.to_string()),
        "eval" | "call" => Command::Eval(required(arg, "eval <expr>")?.to_string()),
        "display" => Command::Display(arg.map(str::to_string)),
        "undisplay" => Command::Undisplay(arg.map(|a| number(a, "undisplay")).transpose()?),
        "trace" => Command::Trace(trace(arg)?),
        "th" | "thread" => Command::Thread(arg.map(|a| number(a, "thread")).transpose()?),
        "record" => Command::Record(match arg {
            None => None,
            Some("on") => Some(true),
            Some("off") => Some(false),
            Some(other) => return Err(Error::invalid(format!("unknown record option: {}", other))),
        }),
        "config" => Command::Config(config(arg)?),
        "h" | "help" => Command::Help,
        _ => Command::Print(line.to_string()),
    };
    Ok(command)
}

fn required<'a>(arg: Option<&'a str>, usage: &str) -> Result<&'a str> {
    arg.ok_or_else(|| Error::invalid(format!("usage: {}", usage)))
}

fn number(arg: &str, command: &str) -> Result<usize> {
    arg.parse()
        .map_err(|_| Error::invalid(format!("{}: not a number: {}", command, arg)))
}

fn exit_code(arg: &str) -> Result<i32> {
    arg.parse()
        .map_err(|_| Error::invalid(format!("invalid exit status: {}", arg)))
}

fn step(kind: StepKind, arg: Option<&str>) -> Result<Command> {
    let count = match arg {
        Some(a) => number(a, kind.as_str())?,
        None => 1,
    };
    if count == 0 {
        return Err(Error::invalid(format!("{}: count must be positive", kind.as_str())));
    }
    Ok(Command::Step { kind, count })
}

fn break_target(text: &str) -> Result<BreakTarget> {
    if let Ok(line) = text.parse::<u32>() {
        return Ok(BreakTarget::Line { path: None, line });
    }
    if let Some((path, line)) = text.rsplit_once(':') {
        if let Ok(line) = line.parse::<u32>() {
            if !path.is_empty() {
                return Ok(BreakTarget::Line {
                    path: Some(path.to_string()),
                    line,
                });
            }
        }
    }
    if text.contains('#') || text.contains('.') {
        return Ok(BreakTarget::Method(text.to_string()));
    }
    Err(Error::InvalidLocation(text.to_string()))
}

/// Split `head if: cond pre: cmd do: cmd` into the head and the clauses
///
/// Keywords only count at the start of a word. Each clause runs until the
/// next keyword.
pub fn split_options(text: &str) -> (&str, BreakOptions) {
    const KEYWORDS: [&str; 3] = ["if:", "pre:", "do:"];

    let mut marks: Vec<(usize, &str)> = Vec::new();
    for keyword in KEYWORDS {
        let mut from = 0;
        while let Some(found) = text[from..].find(keyword) {
            let at = from + found;
            let word_start = at == 0 || text[..at].ends_with(char::is_whitespace);
            if word_start {
                marks.push((at, keyword));
                break;
            }
            from = at + keyword.len();
        }
    }
    marks.sort_unstable();

    let head_end = marks.first().map_or(text.len(), |(at, _)| *at);
    let mut options = BreakOptions::default();
    for (i, (at, keyword)) in marks.iter().enumerate() {
        let end = marks.get(i + 1).map_or(text.len(), |(next, _)| *next);
        let value = text[at + keyword.len()..end].trim();
        if value.is_empty() {
            continue;
        }
        let value = Some(value.to_string());
        match *keyword {
            "if:" => options.condition = value,
            "pre:" => options.pre = value,
            _ => options.do_ = value,
        }
    }
    (text[..head_end].trim(), options)
}

fn backtrace(rest: &str) -> Result<Command> {
    let mut max = None;
    let mut pattern = None;

    let rest = rest.trim();
    let numeric = match rest.find('/') {
        Some(start) => {
            let body = &rest[start + 1..];
            let body = body.strip_suffix('/').unwrap_or(body);
            pattern = Some(body.to_string());
            &rest[..start]
        }
        None => rest,
    };
    if let Some(n) = numeric.split_whitespace().next() {
        max = Some(number(n, "backtrace")?);
    }
    Ok(Command::Backtrace { max, pattern })
}

fn list(arg: Option<&str>) -> Result<Command> {
    let Some(arg) = arg else {
        return Ok(Command::List {
            start: None,
            end: None,
        });
    };
    let parse = |s: &str| {
        s.trim()
            .parse::<u32>()
            .map_err(|_| Error::invalid(format!("list: invalid line range: {}", arg)))
    };
    match arg.split_once('-') {
        Some((start, end)) => Ok(Command::List {
            start: Some(parse(start)?),
            end: Some(parse(end)?),
        }),
        None => Ok(Command::List {
            start: Some(parse(arg)?),
            end: None,
        }),
    }
}

fn trace(arg: Option<&str>) -> Result<TraceCommand> {
    let Some(arg) = arg else {
        return Ok(TraceCommand::List);
    };
    let (word, rest) = match arg.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (arg, ""),
    };
    match word {
        "line" => Ok(TraceCommand::Line),
        "call" => Ok(TraceCommand::Call),
        "raise" | "exception" => Ok(TraceCommand::Exception),
        "pass" | "object" if !rest.is_empty() => Ok(TraceCommand::Pass(rest.to_string())),
        "off" if rest.is_empty() => Ok(TraceCommand::Off(None)),
        "off" => Ok(TraceCommand::Off(Some(number(rest, "trace off")?))),
        _ => Err(Error::invalid(format!("unknown trace type: {}", arg))),
    }
}

fn config(arg: Option<&str>) -> Result<ConfigCommand> {
    let Some(arg) = arg else {
        return Ok(ConfigCommand::Show);
    };
    if let Some(rest) = arg.strip_prefix("set ") {
        let (key, value) = rest
            .trim()
            .split_once(char::is_whitespace)
            .ok_or_else(|| Error::invalid("usage: config set <key> <value>"))?;
        return Ok(ConfigCommand::Set(key.to_string(), value.trim().to_string()));
    }
    if let Some((key, value)) = arg.split_once('=') {
        return Ok(ConfigCommand::Set(
            key.trim().to_string(),
            value.trim().to_string(),
        ));
    }
    if arg == "show" {
        return Ok(ConfigCommand::Show);
    }
    Ok(ConfigCommand::Get(arg.to_string()))
}

pub const HELP: &[&str] = &[
    "Control flow",
    "  s[tep] [n]          Step into the next line",
    "  n[ext] [n]          Step over to the next line",
    "  fin[ish] [n]        Run until the current frame returns",
    "  c[ontinue]          Resume the program",
    "  step back | reset   Move through or leave the recorded history",
    "  q[uit][!] [code]    Detach and let the program finish",
    "  kill[!] [code]      Terminate the program",
    "Breakpoints",
    "  b[reak] [loc] [if: expr] [pre: cmd] [do: cmd]",
    "  catch <Exception>   Stop when the exception is raised",
    "  watch <expr>        Stop when the value changes",
    "  del[ete] [n]        Delete one or all breakpoints",
    "  enable n | disable n",
    "Inspection",
    "  bt [n] [/pattern/]  Show the backtrace",
    "  l[ist] [a[-b]]      Show source",
    "  i[nfo] [b|l|th|d|f] Show breakpoints, locals, threads, displays or the frame",
    "  o[utline]           Show locals and methods",
    "  f[rame] [n] | up | down",
    "  p <expr> | eval <expr>",
    "  display [expr] | undisplay [n]",
    "  trace [line|call|raise|pass <expr>|off [n]]",
    "  th[read] [n]        List threads or switch to one",
    "  record [on|off]     Record executed lines for step back",
    "  config [set <key> <value>]",
];
