//! Text shown at stops and for frame queries

use crate::runtime::Frame;

/// Marker column for the current line or frame
fn mark(current: bool) -> &'static str {
    if current {
        "=>"
    } else {
        "  "
    }
}

/// `Foo#bar #=> 42 at /app/foo.rb:3`
pub fn frame_str(frame: &Frame) -> String {
    match &frame.return_value {
        Some(value) => format!("{} #=> {} at {}", frame.name, value, frame.location()),
        None => format!("{} at {}", frame.name, frame.location()),
    }
}

/// One backtrace line: `=>#0\tFoo#bar at /app/foo.rb:3`
pub fn frame_line(index: usize, frame: &Frame, current: bool) -> String {
    format!("{}#{}\t{}", mark(current), index, frame_str(frame))
}

/// Cut a line to `width` columns, marking the cut; 0 means unlimited
pub fn fit(line: String, width: usize) -> String {
    if width == 0 || line.chars().count() <= width {
        return line;
    }
    let mut cut: String = line.chars().take(width.saturating_sub(3)).collect();
    cut.push_str("...");
    cut
}

/// The first `max` frames plus a count of the rest
pub fn short_backtrace(frames: &[Frame], selected: usize, max: usize, width: usize) -> Vec<String> {
    let mut out: Vec<String> = frames
        .iter()
        .enumerate()
        .take(max)
        .map(|(i, f)| fit(frame_line(i, f, i == selected), width))
        .collect();
    if frames.len() > max {
        out.push(format!(
            "  # and {} frames (use `bt' command for all frames)",
            frames.len() - max
        ));
    }
    out
}

/// Full backtrace, optionally limited and filtered by a substring
pub fn backtrace(
    frames: &[Frame],
    selected: usize,
    max: Option<usize>,
    pattern: Option<&str>,
    width: usize,
) -> Vec<String> {
    frames
        .iter()
        .enumerate()
        .filter(|(_, f)| pattern.map_or(true, |p| frame_str(f).contains(p)))
        .take(max.unwrap_or(usize::MAX))
        .map(|(i, f)| fit(frame_line(i, f, i == selected), width))
        .collect()
}

/// Window of about `max_lines` lines centered on `current`
pub fn window(current: u32, max_lines: usize, total: usize) -> (u32, u32) {
    let half = (max_lines / 2) as u32;
    let start = current.saturating_sub(half).max(1);
    let end = (start + max_lines as u32).saturating_sub(1).min(total as u32);
    (start, end)
}

/// Listing of `[start, end]` with the current line marked
pub fn source_listing(source: &[String], path: &str, current: u32, start: u32, end: u32) -> Vec<String> {
    let end = end.min(source.len() as u32);
    if start < 1 || start > end {
        return Vec::new();
    }

    let mut out = vec![format!("[{}, {}] in {}", start, end, path)];
    for lineno in start..=end {
        let text = &source[(lineno - 1) as usize];
        out.push(format!("{}{:>4}| {}", mark(lineno == current), lineno, text));
    }
    out
}

/// Local variables of a frame, return value first
pub fn locals(frame: &Frame) -> Vec<String> {
    let mut out = Vec::new();
    if let Some(value) = &frame.return_value {
        out.push(format!("%return = {}", value));
    }
    out.extend(
        frame
            .locals
            .iter()
            .map(|(name, value)| format!("{} = {}", name, value)),
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{FrameKind, Value};

    fn frame(name: &str, line: u32) -> Frame {
        Frame {
            kind: FrameKind::Method,
            name: name.into(),
            owner: None,
            path: "/app/foo.rb".into(),
            line,
            depth: 1,
            unit: None,
            binding: 0,
            receiver: None,
            return_value: None,
            locals: vec![("x".into(), Value::new("Integer", "1"))],
        }
    }

    #[test]
    fn test_frame_lines() {
        let mut f = frame("Foo#bar", 3);
        assert_eq!(frame_line(0, &f, true), "=>#0\tFoo#bar at /app/foo.rb:3");
        f.return_value = Some(Value::new("Integer", "42"));
        assert_eq!(frame_line(1, &f, false), "  #1\tFoo#bar #=> 42 at /app/foo.rb:3");
        assert_eq!(locals(&f), vec!["%return = 42".to_string(), "x = 1".to_string()]);
    }

    #[test]
    fn test_short_backtrace_counts_rest() {
        let frames: Vec<_> = (0..5).map(|i| frame("f", i + 1)).collect();
        let out = short_backtrace(&frames, 0, 2, 80);
        assert_eq!(out.len(), 3);
        assert_eq!(out[2], "  # and 3 frames (use `bt' command for all frames)");
        assert_eq!(short_backtrace(&frames, 0, 10, 80).len(), 5);
    }

    #[test]
    fn test_backtrace_filter() {
        let frames = vec![frame("Foo#bar", 3), frame("<main>", 9)];
        let out = backtrace(&frames, 0, None, Some("main"), 80);
        assert_eq!(out, vec!["  #1\t<main> at /app/foo.rb:9".to_string()]);
        assert_eq!(backtrace(&frames, 0, Some(1), None, 80).len(), 1);
    }

    #[test]
    fn test_frame_lines_fit_the_width() {
        let frames = vec![frame("Foo#a_rather_long_method_name", 3)];
        let out = backtrace(&frames, 0, None, None, 20);
        assert_eq!(out, vec!["=>#0\tFoo#a_rather...".to_string()]);
        assert_eq!(out[0].chars().count(), 20);

        let out = short_backtrace(&frames, 0, 2, 0);
        assert_eq!(out, vec!["=>#0\tFoo#a_rather_long_method_name at /app/foo.rb:3".to_string()]);
        assert_eq!(fit("short".to_string(), 20), "short");
    }

    #[test]
    fn test_source_listing() {
        let source: Vec<String> = (1..=20).map(|i| format!("line {}", i)).collect();
        let (start, end) = window(2, 10, source.len());
        assert_eq!((start, end), (1, 10));
        let out = source_listing(&source, "/app/foo.rb", 2, start, end);
        assert_eq!(out[0], "[1, 10] in /app/foo.rb");
        assert_eq!(out[1], "     1| line 1");
        assert_eq!(out[2], "=>   2| line 2");

        assert_eq!(window(15, 10, 20), (10, 19));
        assert_eq!(window(19, 10, 20), (14, 20));
        assert!(source_listing(&source, "/app/foo.rb", 1, 30, 40).is_empty());
    }
}
