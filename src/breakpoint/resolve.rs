//! Nearest breakable location resolution
//!
//! Maps a requested `path:line` onto the closest line at or after it that a
//! loaded code unit can actually hook, choosing among nested units.

use std::sync::Arc;

use crate::runtime::{CodeUnit, EventKind, UnitKind};

/// An exact, hookable location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    /// Path of the unit that owns the line
    pub path: String,
    pub line: u32,
    /// Event the hook observes at that line
    pub event: EventKind,
    pub unit: u64,
}

struct Candidate<'a> {
    unit: &'a CodeUnit,
    line: u32,
    events: &'a [EventKind],
}

impl Candidate<'_> {
    fn has_call(&self) -> bool {
        self.events.contains(&EventKind::Call)
    }
}

/// Resolve a requested line against the currently loaded units
///
/// Returns `None` when no loaded unit covers the request; the caller keeps
/// the breakpoint pending and retries on the next load.
pub fn resolve_location(
    units: &[Arc<CodeUnit>],
    path: &str,
    line: u32,
    hook_call: bool,
) -> Option<Location> {
    let mut candidates: Vec<&CodeUnit> = units
        .iter()
        .map(Arc::as_ref)
        .filter(|u| u.matches_path(path) && u.first_line <= line && u.kind != UnitKind::Ensure)
        .collect();
    candidates.sort_by_key(|u| (u.first_line, u.id));

    let mut nearest: Option<Candidate> = None;

    for unit in candidates {
        let lines: Vec<u32> = unit.lines.keys().copied().collect();
        let idx = lines.partition_point(|l| *l < line);
        let Some(&found) = lines.get(idx) else {
            continue;
        };
        let events = unit.lines[&found].as_slice();

        // Block entry alone is not a place execution can stop
        if events == [EventKind::BlockCall] {
            continue;
        }

        let resolved = if hook_call && events.contains(&EventKind::Call) && line == unit.first_line {
            unit.first_line
        } else {
            found
        };
        let candidate = Candidate {
            unit,
            line: resolved,
            events,
        };

        match &nearest {
            None => nearest = Some(candidate),
            Some(best) if candidate.line.abs_diff(line) < best.line.abs_diff(line) => {
                nearest = Some(candidate)
            }
            Some(best) if candidate.line.abs_diff(line) == best.line.abs_diff(line) => {
                let prefer = hook_call
                    && best.unit.first_line <= unit.first_line
                    && ((best.line > line && !best.has_call()) || candidate.has_call());
                if prefer {
                    nearest = Some(candidate);
                }
            }
            Some(_) => {}
        }
    }

    let best = nearest?;
    let event = [
        EventKind::Call,
        EventKind::Line,
        EventKind::Return,
        EventKind::BlockReturn,
    ]
    .into_iter()
    .find(|e| best.events.contains(e))?;

    Some(Location {
        path: best.unit.path.clone(),
        line: best.line,
        event,
        unit: best.unit.id,
    })
}

/// Smallest breakable line of a unit strictly after `line`
///
/// Falls back to the unit's last line when that still lies ahead.
pub fn next_breakable_line(unit: &CodeUnit, line: u32) -> Option<u32> {
    unit.lines
        .range(line + 1..)
        .next()
        .map(|(l, _)| *l)
        .or_else(|| (unit.last_line > line).then_some(unit.last_line))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn unit(id: u64, kind: UnitKind, first: u32, last: u32, lines: &[(u32, &[EventKind])]) -> Arc<CodeUnit> {
        unit_at("/app/foo.rb", id, kind, first, last, lines)
    }

    fn unit_at(
        path: &str,
        id: u64,
        kind: UnitKind,
        first: u32,
        last: u32,
        lines: &[(u32, &[EventKind])],
    ) -> Arc<CodeUnit> {
        Arc::new(CodeUnit {
            id,
            path: path.to_string(),
            name: if kind == UnitKind::Method { "bar".into() } else { "<main>".into() },
            owner: (kind == UnitKind::Method).then(|| "Foo".to_string()),
            singleton: false,
            kind,
            first_line: first,
            last_line: last,
            lines: lines
                .iter()
                .map(|(l, e)| (*l, e.to_vec()))
                .collect::<BTreeMap<_, _>>(),
        })
    }

    use EventKind::*;

    fn program() -> Vec<Arc<CodeUnit>> {
        vec![
            unit(1, UnitKind::Script, 1, 20, &[(1, &[Line]), (2, &[Line]), (10, &[Line]), (12, &[Line])]),
            unit(2, UnitKind::Method, 2, 6, &[(2, &[Call]), (3, &[Line]), (5, &[Line]), (6, &[Return])]),
            unit(3, UnitKind::Block, 12, 14, &[(12, &[BlockCall]), (13, &[Line]), (14, &[BlockReturn])]),
        ]
    }

    #[test]
    fn test_exact_line() {
        let loc = resolve_location(&program(), "/app/foo.rb", 10, true).unwrap();
        assert_eq!((loc.line, loc.event, loc.unit), (10, Line, 1));
    }

    #[test]
    fn test_snaps_forward_to_nearest_breakable_line() {
        let loc = resolve_location(&program(), "/app/foo.rb", 4, true).unwrap();
        assert_eq!((loc.line, loc.unit), (5, 2));

        let loc = resolve_location(&program(), "/app/foo.rb", 7, true).unwrap();
        assert_eq!((loc.line, loc.unit), (10, 1));
    }

    #[test]
    fn test_def_line_prefers_method_entry() {
        let loc = resolve_location(&program(), "/app/foo.rb", 2, true).unwrap();
        assert_eq!((loc.line, loc.event, loc.unit), (2, Call, 2));

        let loc = resolve_location(&program(), "/app/foo.rb", 2, false).unwrap();
        assert_eq!((loc.line, loc.event, loc.unit), (2, Line, 1));
    }

    #[test]
    fn test_skips_block_entry_only_lines() {
        // Line 12 in the block unit only has block entry; the script's own
        // line 12 wins.
        let loc = resolve_location(&program(), "/app/foo.rb", 12, true).unwrap();
        assert_eq!((loc.line, loc.unit), (12, 1));

        let loc = resolve_location(&program(), "/app/foo.rb", 13, true).unwrap();
        assert_eq!((loc.line, loc.unit), (13, 3));
    }

    #[test]
    fn test_return_only_line() {
        let loc = resolve_location(&program(), "/app/foo.rb", 14, true).unwrap();
        assert_eq!((loc.line, loc.event), (14, BlockReturn));
    }

    #[test]
    fn test_no_candidate_stays_pending() {
        assert!(resolve_location(&program(), "/app/foo.rb", 30, true).is_none());
        assert!(resolve_location(&program(), "/app/other.rb", 1, true).is_none());
        assert!(resolve_location(&[], "/app/foo.rb", 1, true).is_none());
    }

    #[test]
    fn test_ensure_units_are_ignored() {
        let mut units = program();
        units.push(unit(4, UnitKind::Ensure, 15, 16, &[(16, &[Line])]));
        assert!(resolve_location(&units, "/app/foo.rb", 16, true).is_none());
    }

    #[test]
    fn test_relative_path_matches() {
        let loc = resolve_location(&program(), "foo.rb", 10, true).unwrap();
        assert_eq!(loc.path, "/app/foo.rb");
    }

    #[test]
    fn test_independent_of_load_order() {
        let mut reversed = program();
        reversed.reverse();
        for line in 1..=14 {
            assert_eq!(
                resolve_location(&program(), "/app/foo.rb", line, true),
                resolve_location(&reversed, "/app/foo.rb", line, true),
                "line {}",
                line
            );
        }
    }

    #[test]
    fn test_closer_line_beats_later_unit() {
        let units = vec![
            unit_at("/a/foo.rb", 1, UnitKind::Script, 1, 10, &[(6, &[Line])]),
            unit_at("/b/foo.rb", 2, UnitKind::Script, 1, 10, &[(9, &[Line])]),
        ];
        let loc = resolve_location(&units, "foo.rb", 5, true).unwrap();
        assert_eq!((loc.path.as_str(), loc.line), ("/a/foo.rb", 6));

        let mut reversed = units.clone();
        reversed.reverse();
        let loc = resolve_location(&reversed, "foo.rb", 5, true).unwrap();
        assert_eq!((loc.path.as_str(), loc.line), ("/a/foo.rb", 6));
    }

    #[test]
    fn test_next_breakable_line() {
        let units = program();
        assert_eq!(next_breakable_line(&units[1], 3), Some(5));
        assert_eq!(next_breakable_line(&units[1], 5), Some(6));
        assert_eq!(next_breakable_line(&units[1], 6), None);
        assert_eq!(next_breakable_line(&units[0], 12), Some(20));
    }
}
