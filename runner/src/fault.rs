//! Crash/recovery sessions: a run that is made to crash at a chosen iteration, followed by a
//! run that recovers from the state the crashed one persisted.

use crate::{
    command::CommandLine,
    executors::{Executor, ExecutorError},
    reset::EnvironmentReset,
};
use nvbench_analysis::Outcome;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Crashed,
    Recovered,
    RecoveryFailed,
}

/// Which endings of the crash phase count as the expected crash
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashAcceptance {
    pub exit_codes: Vec<i32>,
    pub by_signal: bool,
}

impl Default for CrashAcceptance {
    fn default() -> Self {
        Self {
            exit_codes: vec![0],
            by_signal: false,
        }
    }
}

impl CrashAcceptance {
    pub fn accepts(&self, outcome: &Outcome) -> bool {
        match outcome {
            Outcome::Success(_) | Outcome::Timeout(_) => self.exit_codes.contains(&0),
            Outcome::Failed(Some(code)) => self.exit_codes.contains(code),
            Outcome::Failed(None) => self.by_signal,
        }
    }
}

/// Two phase run sharing persisted state
#[derive(Debug, Clone)]
pub struct RecoverySession {
    crash: CommandLine,
    recovery: CommandLine,
    acceptance: CrashAcceptance,
    state: SessionState,
    history: Vec<SessionState>,
}

impl RecoverySession {
    pub fn new(crash: CommandLine, recovery: CommandLine, acceptance: CrashAcceptance) -> Self {
        Self {
            crash,
            recovery,
            acceptance,
            state: SessionState::Idle,
            history: Vec::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// every state this session passed through, in order
    pub fn history(&self) -> &[SessionState] {
        &self.history
    }

    pub fn crash_command(&self) -> &CommandLine {
        &self.crash
    }

    pub fn recovery_command(&self) -> &CommandLine {
        &self.recovery
    }

    fn transition(&mut self, state: SessionState) {
        debug!("Recovery session {:?} -> {:?}", self.state, state);
        self.state = state;
        self.history.push(state);
    }

    /// Run both phases from Idle and wipe the persisted state afterwards. The result is a single
    /// outcome for the whole session: success with the time of both phases, or the failing
    /// phase's outcome.
    #[instrument(skip_all, level = "debug")]
    pub fn run<E: Executor>(
        &mut self,
        executor: &mut E,
        persisted: &EnvironmentReset,
    ) -> Result<Outcome, ExecutorError> {
        if self.state != SessionState::Idle {
            warn!("Recovery session restarted from {:?}", self.state);
            self.transition(SessionState::Idle);
        }

        let result = self.phases(executor);

        // the next attempt must never see this attempt's state, even if a phase errored
        let wiped = persisted.reset();
        debug!(
            removed = wiped.removed,
            failed = wiped.failed,
            bytes = wiped.bytes,
            "Recovery session state wiped"
        );
        if self.state != SessionState::Idle {
            self.transition(SessionState::Idle);
        }

        result
    }

    fn phases<E: Executor>(&mut self, executor: &mut E) -> Result<Outcome, ExecutorError> {
        info!("(crash) {}", self.crash);
        let outcome = executor.execute(&self.crash)?;

        if !self.acceptance.accepts(&outcome) {
            warn!("Crash phase ended unexpectedly: {outcome}");

            return Ok(outcome);
        }

        let crash_seconds = outcome.seconds().unwrap_or(0.0);
        self.transition(SessionState::Crashed);
        info!("(recovery) {}", self.recovery);

        let outcome = executor.execute(&self.recovery)?;

        Ok(match outcome {
            Outcome::Success(seconds) => {
                self.transition(SessionState::Recovered);
                Outcome::Success(crash_seconds + seconds)
            }
            Outcome::Timeout(seconds) => {
                self.transition(SessionState::Recovered);
                Outcome::Timeout(crash_seconds + seconds)
            }
            failed @ Outcome::Failed(_) => {
                self.transition(SessionState::RecoveryFailed);
                failed
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{collections::VecDeque, fs};

    /// replays canned outcomes and remembers what it was asked to run
    #[derive(Default)]
    struct Scripted {
        outcomes: VecDeque<Outcome>,
        seen: Vec<CommandLine>,
    }

    impl Executor for Scripted {
        fn execute(&mut self, command: &CommandLine) -> Result<Outcome, ExecutorError> {
            self.seen.push(command.clone());
            Ok(self
                .outcomes
                .pop_front()
                .unwrap_or(Outcome::Failed(Some(1))))
        }
    }

    fn kmeans() -> CommandLine {
        CommandLine::new("./kmeans-pthread.o").args(["-p", "1000000"])
    }

    fn session() -> RecoverySession {
        RecoverySession::new(
            kmeans().args(["-a", "10"]),
            kmeans().args(["-r", "1"]),
            CrashAcceptance::default(),
        )
    }

    #[test]
    fn crash_then_recovery_is_one_success() {
        let mut executor = Scripted {
            outcomes: [Outcome::Success(1.0), Outcome::Success(2.5)].into(),
            ..Default::default()
        };
        let mut session = session();

        let outcome = session
            .run(&mut executor, &EnvironmentReset::default())
            .unwrap();

        assert_eq!(outcome, Outcome::Success(3.5));
        assert_eq!(executor.seen.len(), 2);
        assert_eq!(executor.seen[0].args, ["-p", "1000000", "-a", "10"]);
        assert_eq!(executor.seen[1].args, ["-p", "1000000", "-r", "1"]);
        assert_eq!(
            session.history(),
            [
                SessionState::Crashed,
                SessionState::Recovered,
                SessionState::Idle
            ]
        );
    }

    #[test]
    fn failed_recovery_is_reported() {
        let mut executor = Scripted {
            outcomes: [Outcome::Success(1.0), Outcome::Failed(Some(134))].into(),
            ..Default::default()
        };
        let mut session = session();

        let outcome = session
            .run(&mut executor, &EnvironmentReset::default())
            .unwrap();

        assert_eq!(outcome, Outcome::Failed(Some(134)));
        assert_eq!(session.history()[1], SessionState::RecoveryFailed);
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn unexpected_crash_skips_recovery() {
        let mut executor = Scripted {
            outcomes: [Outcome::Failed(Some(2))].into(),
            ..Default::default()
        };
        let mut session = session();

        let outcome = session
            .run(&mut executor, &EnvironmentReset::default())
            .unwrap();

        assert_eq!(outcome, Outcome::Failed(Some(2)));
        assert_eq!(executor.seen.len(), 1);
        assert!(session.history().is_empty());
    }

    #[test]
    fn crash_by_signal_can_be_expected() {
        let acceptance = CrashAcceptance {
            exit_codes: vec![],
            by_signal: true,
        };

        assert!(acceptance.accepts(&Outcome::Failed(None)));
        assert!(!acceptance.accepts(&Outcome::Success(1.0)));
        assert!(!CrashAcceptance::default().accepts(&Outcome::Failed(None)));
    }

    #[test]
    fn persisted_state_is_wiped_after_the_session() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("MemLog0");
        fs::write(&log, "state").unwrap();

        let reset =
            EnvironmentReset::new(&[crate::reset::ResetTarget::new(dir.path())]).unwrap();
        let mut executor = Scripted {
            outcomes: [Outcome::Success(1.0), Outcome::Success(1.0)].into(),
            ..Default::default()
        };

        session().run(&mut executor, &reset).unwrap();

        assert!(!log.exists());
        assert!(dir.path().exists());
    }
}
