pub mod local;

pub use local::{kill_stragglers, LocalExecutor};

use crate::command::CommandLine;
use nvbench_analysis::Outcome;
use std::io;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Failed to wait for a child process")]
    ChildError(#[from] io::Error),
    #[error("{label} failed {attempts} times in a row, giving up")]
    FailureThreshold { label: String, attempts: u32 },
    #[error("Run was cancelled")]
    Cancelled,
}

/// Something that runs a single command to completion
pub trait Executor {
    /// Run `command` once. A command that can't be spawned or exits non zero is a
    /// `Outcome::Failed`, not an error; errors are reserved for the harness itself.
    fn execute(&mut self, command: &CommandLine) -> Result<Outcome, ExecutorError>;
}

impl<E: Executor + ?Sized> Executor for &mut E {
    fn execute(&mut self, command: &CommandLine) -> Result<Outcome, ExecutorError> {
        (**self).execute(command)
    }
}

/// Result of retrying one run spec: the successful outcome, if any, and every discarded attempt
#[derive(Debug, Clone, PartialEq)]
pub struct Retried {
    pub success: Option<Outcome>,
    pub failures: Vec<Outcome>,
}

/// Bounded retry on failure: an attempt is repeated until it succeeds or `max_failed`
/// consecutive attempts failed.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_failed: u32,
}

impl RetryPolicy {
    pub fn new(max_failed: u32) -> Self {
        Self { max_failed }
    }

    /// Call `attempt` with the attempt number until it succeeds or the threshold is hit. Errors of
    /// `attempt` are returned right away.
    pub fn run<F>(&self, label: &str, mut attempt: F) -> Result<Retried, ExecutorError>
    where
        F: FnMut(u32) -> Result<Outcome, ExecutorError>,
    {
        let mut failures = Vec::new();

        while (failures.len() as u32) < self.max_failed {
            let outcome = attempt(failures.len() as u32)?;

            if outcome.is_success() {
                return Ok(Retried {
                    success: Some(outcome),
                    failures,
                });
            }

            warn!(
                "{label}: {outcome}, rerun ({}/{})",
                failures.len() + 1,
                self.max_failed
            );
            failures.push(outcome);
        }

        info!("{label}: failed {} times, giving up", failures.len());

        Ok(Retried {
            success: None,
            failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stops_at_first_success() {
        let policy = RetryPolicy::new(20);
        let retried = policy
            .run("kmeans.pthread[0]", |attempt| {
                Ok(if attempt < 2 {
                    Outcome::Failed(Some(1))
                } else {
                    Outcome::Success(1.25)
                })
            })
            .unwrap();

        assert_eq!(retried.success, Some(Outcome::Success(1.25)));
        assert_eq!(retried.failures.len(), 2);
    }

    #[test]
    fn gives_up_after_max_failed() {
        let policy = RetryPolicy::new(20);
        let mut calls = 0;
        let retried = policy
            .run("pca.dthread[0]", |_| {
                calls += 1;
                Ok(Outcome::Timeout(601.0))
            })
            .unwrap();

        assert_eq!(calls, 20);
        assert_eq!(retried.success, None);
        assert_eq!(retried.failures.len(), 20);
    }

    #[test]
    fn errors_are_not_retried() {
        let policy = RetryPolicy::new(3);
        let mut calls = 0;
        let result = policy.run("x", |_| {
            calls += 1;
            Err(ExecutorError::Cancelled)
        });

        assert!(matches!(result, Err(ExecutorError::Cancelled)));
        assert_eq!(calls, 1);
    }
}
