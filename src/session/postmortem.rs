//! Command gating for postmortem and replay inspection
//!
//! Both modes show frames that no longer match live execution, so commands
//! that would run the program from them are rejected or redirected.

use super::command::Command;
use super::event::ReplayMove;
use crate::common::{Error, Result};
use crate::thread::step::StepKind;

/// Inspection mode of the current thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Live,
    /// Stopped at an uncaught exception; the frames are gone
    Postmortem,
    /// Looking at recorded frames
    Replay,
}

/// How an accepted command is carried out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Run normally
    Live,
    /// Move the replay cursor instead
    Replay(ReplayMove),
}

/// Decide whether a command may run in the given mode
pub fn route(command: &Command, mode: Mode) -> Result<Route> {
    match (mode, command) {
        (Mode::Postmortem, Command::Step { kind, .. }) => Err(Error::postmortem(kind.as_str())),
        (Mode::Postmortem, Command::StepBack | Command::StepReset) => {
            Err(Error::postmortem("step back"))
        }
        (Mode::Postmortem, Command::Record(Some(_))) => Err(Error::postmortem("record")),

        (Mode::Replay, Command::Step { kind: StepKind::In, .. }) => {
            Ok(Route::Replay(ReplayMove::Forward))
        }
        (Mode::Replay, Command::Step { kind, .. }) => Err(Error::replay(kind.as_str())),
        (Mode::Replay, Command::Eval(_)) => Err(Error::replay("eval")),

        (_, Command::StepBack) => Ok(Route::Replay(ReplayMove::Back)),
        (_, Command::StepReset) => Ok(Route::Replay(ReplayMove::Reset)),
        _ => Ok(Route::Live),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(kind: StepKind) -> Command {
        Command::Step { kind, count: 1 }
    }

    #[test]
    fn test_postmortem_rejects_execution() {
        for kind in [StepKind::In, StepKind::Next, StepKind::Finish] {
            let err = route(&step(kind), Mode::Postmortem).unwrap_err();
            assert!(matches!(err, Error::Postmortem { .. }));
        }
        assert!(route(&Command::StepBack, Mode::Postmortem).is_err());
        assert_eq!(
            route(&Command::Continue, Mode::Postmortem).unwrap(),
            Route::Live
        );
        assert_eq!(
            route(&Command::Print("x".into()), Mode::Postmortem).unwrap(),
            Route::Live
        );
    }

    #[test]
    fn test_replay_redirects_step() {
        assert_eq!(
            route(&step(StepKind::In), Mode::Replay).unwrap(),
            Route::Replay(ReplayMove::Forward)
        );
        assert!(matches!(
            route(&step(StepKind::Next), Mode::Replay),
            Err(Error::Replay { .. })
        ));
        assert_eq!(
            route(&Command::StepBack, Mode::Live).unwrap(),
            Route::Replay(ReplayMove::Back)
        );
        assert_eq!(
            route(&step(StepKind::Next), Mode::Live).unwrap(),
            Route::Live
        );
    }
}
