//! Stepping decisions
//!
//! A [`Step`] is armed when a suspended thread receives a step command and
//! is consulted on every line, return and block-return event until it is
//! satisfied. All decisions are pure functions of the event and the
//! recorded start location.

use crate::breakpoint::resolve::next_breakable_line;
use crate::runtime::{CodeUnit, EventKind, Frame, TraceEvent, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    /// Stop at the next event anywhere
    In,
    /// Stop at the next line of the same frame, or when it returns
    Next,
    /// Stop once the current frame has returned
    Finish,
}

impl StepKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StepKind::In => "step",
            StepKind::Next => "next",
            StepKind::Finish => "finish",
        }
    }
}

/// Outcome of offering an event to a step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Not a stopping point
    Ignore,
    /// Condition met, but more repetitions remain
    Reanchor,
    Stop,
}

/// An armed step request
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub kind: StepKind,
    /// Satisfied conditions still needed before stopping
    pub remaining: usize,
    /// Depth of the frame the step started in
    pub depth: usize,
    pub path: String,
    pub line: u32,
    /// Upper bound of the `next` line window
    pub next_line: Option<u32>,
    /// Value returned by the frame being finished
    pub return_value: Option<Value>,
}

impl Step {
    /// Arm a step from the selected frame
    pub fn new(kind: StepKind, count: usize, frame: &Frame, unit: Option<&CodeUnit>) -> Self {
        Self {
            kind,
            remaining: count.max(1),
            depth: frame.depth,
            path: frame.path.clone(),
            line: frame.line,
            next_line: unit.and_then(|u| next_breakable_line(u, frame.line)),
            return_value: None,
        }
    }

    /// Arm a step-in without a frame (program start)
    pub fn start() -> Self {
        Self {
            kind: StepKind::In,
            remaining: 1,
            depth: 0,
            path: String::new(),
            line: 0,
            next_line: None,
            return_value: None,
        }
    }

    /// Whether the event could ever satisfy a step
    pub fn observes(event: &TraceEvent) -> bool {
        matches!(
            event.kind,
            EventKind::Line | EventKind::Return | EventKind::BlockReturn
        )
    }

    /// Whether the event satisfies this step's stop condition
    pub fn satisfied(&self, event: &TraceEvent) -> bool {
        match self.kind {
            StepKind::In => true,
            StepKind::Next => {
                event.depth <= self.depth
                    || self.next_line.is_some_and(|next| {
                        event.path == self.path && event.line > self.line && event.line <= next
                    })
            }
            StepKind::Finish => event.depth < self.depth,
        }
    }

    /// Offer an event
    ///
    /// `skipped` marks locations that never stop a step (skipped paths,
    /// missing source, lines owned by a breakpoint).
    pub fn decide(&mut self, event: &TraceEvent, skipped: bool) -> Decision {
        if !Self::observes(event) {
            return Decision::Ignore;
        }
        if self.kind == StepKind::Finish && event.kind.is_return() && event.depth == self.depth {
            self.return_value = event.return_value.clone();
        }
        if skipped || !self.satisfied(event) {
            return Decision::Ignore;
        }
        if self.remaining > 1 {
            Decision::Reanchor
        } else {
            Decision::Stop
        }
    }

    /// Restart the step from the event's location for the next repetition
    pub fn reanchor(&mut self, event: &TraceEvent, unit: Option<&CodeUnit>) {
        self.remaining -= 1;
        self.depth = event.depth;
        self.path = event.path.clone();
        self.line = event.line;
        self.next_line = unit.and_then(|u| next_breakable_line(u, event.line));
        self.return_value = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{FrameKind, UnitKind};
    use std::collections::BTreeMap;

    fn frame(path: &str, line: u32, depth: usize) -> Frame {
        Frame {
            kind: FrameKind::Method,
            name: "Foo#bar".into(),
            owner: Some("Foo".into()),
            path: path.into(),
            line,
            depth,
            unit: Some(1),
            binding: 1,
            receiver: None,
            return_value: None,
            locals: Vec::new(),
        }
    }

    fn unit() -> CodeUnit {
        CodeUnit {
            id: 1,
            path: "/a.rb".into(),
            name: "bar".into(),
            owner: Some("Foo".into()),
            singleton: false,
            kind: UnitKind::Method,
            first_line: 2,
            last_line: 9,
            lines: [(2, vec![EventKind::Call]), (3, vec![EventKind::Line]), (5, vec![EventKind::Line]), (9, vec![EventKind::Return])]
                .into_iter()
                .collect::<BTreeMap<_, _>>(),
        }
    }

    fn line(path: &str, line: u32, depth: usize) -> TraceEvent {
        TraceEvent::new(EventKind::Line, path, line, depth)
    }

    #[test]
    fn test_step_in_stops_anywhere() {
        let mut step = Step::new(StepKind::In, 1, &frame("/a.rb", 3, 2), Some(&unit()));
        assert_eq!(step.decide(&line("/other.rb", 40, 5), false), Decision::Stop);
        assert_eq!(step.decide(&line("/other.rb", 40, 5), true), Decision::Ignore);
        assert_eq!(
            step.decide(&TraceEvent::new(EventKind::Call, "/a.rb", 2, 3), false),
            Decision::Ignore
        );
    }

    #[test]
    fn test_next_skips_deeper_frames() {
        let mut step = Step::new(StepKind::Next, 1, &frame("/a.rb", 3, 2), Some(&unit()));
        assert_eq!(step.next_line, Some(5));

        // Inside a method called from line 3
        assert_eq!(step.decide(&line("/lib.rb", 10, 3), false), Decision::Ignore);
        // Same frame, next line
        assert_eq!(step.decide(&line("/a.rb", 5, 2), false), Decision::Stop);
    }

    #[test]
    fn test_next_line_window_matches_deeper_same_file() {
        let mut step = Step::new(StepKind::Next, 1, &frame("/a.rb", 3, 2), Some(&unit()));
        // A recursive call executing line 4 of the same file
        assert_eq!(step.decide(&line("/a.rb", 4, 3), false), Decision::Stop);
        // Past the window in a deeper frame
        assert_eq!(step.decide(&line("/a.rb", 7, 3), false), Decision::Ignore);
    }

    #[test]
    fn test_next_stops_when_frame_returns() {
        let mut step = Step::new(StepKind::Next, 1, &frame("/a.rb", 3, 2), Some(&unit()));
        let ret = TraceEvent::new(EventKind::Return, "/a.rb", 9, 2);
        assert_eq!(step.decide(&ret, false), Decision::Stop);
        assert_eq!(step.decide(&line("/main.rb", 20, 1), false), Decision::Stop);
    }

    #[test]
    fn test_finish_requires_shallower_depth() {
        let mut step = Step::new(StepKind::Finish, 1, &frame("/a.rb", 3, 3), Some(&unit()));
        assert_eq!(step.decide(&line("/a.rb", 5, 3), false), Decision::Ignore);
        assert_eq!(step.decide(&line("/lib.rb", 1, 4), false), Decision::Ignore);

        let mut ret = TraceEvent::new(EventKind::Return, "/a.rb", 9, 3);
        ret.return_value = Some(Value::new("Integer", "42"));
        assert_eq!(step.decide(&ret, false), Decision::Ignore);
        assert_eq!(step.return_value.as_ref().unwrap().repr, "42");

        assert_eq!(step.decide(&line("/main.rb", 7, 2), false), Decision::Stop);
    }

    #[test]
    fn test_repeat_count_reanchors() {
        let u = unit();
        let mut step = Step::new(StepKind::Next, 2, &frame("/a.rb", 3, 2), Some(&u));
        let first = line("/a.rb", 5, 2);
        assert_eq!(step.decide(&first, false), Decision::Reanchor);
        step.reanchor(&first, Some(&u));
        assert_eq!((step.remaining, step.line, step.next_line), (1, 5, Some(9)));

        assert_eq!(step.decide(&TraceEvent::new(EventKind::Return, "/a.rb", 9, 2), false), Decision::Stop);
    }
}
