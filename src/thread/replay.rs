//! Recorded frame log for step-back replay
//!
//! While recording, the thread appends a frame stack for every executed
//! line. Replay only moves a cursor over the log; recorded history is never
//! modified, except that the oldest entries fall off once the log is full.

use std::collections::VecDeque;

use crate::runtime::Frame;

/// Where a forward move ended up
#[derive(Debug, PartialEq)]
pub enum Forward<'a> {
    Entry(&'a [Frame]),
    /// Past the newest entry, back to live execution
    Live,
}

#[derive(Debug, Default)]
pub struct ReplayLog {
    entries: VecDeque<Vec<Frame>>,
    capacity: usize,
    cursor: Option<usize>,
    /// Newest entry was recorded for the event the thread stopped at
    tail_is_current: bool,
}

impl ReplayLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
            cursor: None,
            tail_is_current: false,
        }
    }

    /// Called at the start of every event
    pub fn advance(&mut self) {
        self.tail_is_current = false;
    }

    pub fn record(&mut self, frames: Vec<Frame>) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(frames);
        self.tail_is_current = true;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_replaying(&self) -> bool {
        self.cursor.is_some()
    }

    /// Move one entry back; `None` at the oldest entry
    pub fn back(&mut self) -> Option<&[Frame]> {
        let target = match self.cursor {
            Some(0) => return None,
            Some(i) => i - 1,
            None => {
                let skip = usize::from(self.tail_is_current);
                self.entries.len().checked_sub(1 + skip)?
            }
        };
        self.cursor = Some(target);
        self.entries.get(target).map(Vec::as_slice)
    }

    /// Move one entry forward; `None` when not replaying
    pub fn forward(&mut self) -> Option<Forward<'_>> {
        let i = self.cursor?;
        let last = if self.tail_is_current {
            self.entries.len().saturating_sub(1)
        } else {
            self.entries.len()
        };
        if i + 1 >= last {
            self.cursor = None;
            return Some(Forward::Live);
        }
        self.cursor = Some(i + 1);
        self.entries.get(i + 1).map(|f| Forward::Entry(f.as_slice()))
    }

    /// Leave replay mode
    pub fn reset(&mut self) {
        self.cursor = None;
    }

    /// Position as `(cursor, len)` for status output
    pub fn position(&self) -> (Option<usize>, usize) {
        (self.cursor, self.entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::FrameKind;

    fn frames(line: u32) -> Vec<Frame> {
        vec![Frame {
            kind: FrameKind::Other,
            name: "<main>".into(),
            owner: None,
            path: "/a.rb".into(),
            line,
            depth: 1,
            unit: None,
            binding: 1,
            receiver: None,
            return_value: None,
            locals: Vec::new(),
        }]
    }

    fn recorded(lines: &[u32]) -> ReplayLog {
        let mut log = ReplayLog::new(100);
        for line in lines {
            log.advance();
            log.record(frames(*line));
        }
        log
    }

    #[test]
    fn test_back_skips_current_position() {
        // Stopped at line 3, which was recorded as it executed
        let mut log = recorded(&[1, 2, 3]);
        assert_eq!(log.back().unwrap()[0].line, 2);
        assert_eq!(log.back().unwrap()[0].line, 1);
        assert!(log.back().is_none());
        assert!(log.is_replaying());
    }

    #[test]
    fn test_forward_returns_to_live() {
        let mut log = recorded(&[1, 2, 3]);
        assert!(log.forward().is_none());

        log.back();
        log.back();
        assert!(matches!(log.forward(), Some(Forward::Entry(f)) if f[0].line == 2));
        assert_eq!(log.forward(), Some(Forward::Live));
        assert!(!log.is_replaying());
    }

    #[test]
    fn test_stop_on_unrecorded_event() {
        let mut log = recorded(&[1, 2]);
        // A return event happened after the last line was recorded
        log.advance();
        assert_eq!(log.back().unwrap()[0].line, 2);
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let mut log = ReplayLog::new(2);
        for line in 1..=3 {
            log.record(frames(line));
        }
        assert_eq!(log.len(), 2);
        log.advance();
        assert_eq!(log.back().unwrap()[0].line, 3);
        assert_eq!(log.back().unwrap()[0].line, 2);
        assert!(log.back().is_none());
    }
}
