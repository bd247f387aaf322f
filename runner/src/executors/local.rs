use super::{Executor, ExecutorError};
use crate::{command::CommandLine, config::Clock, sampler::MemorySampler};
use nix::{
    sys::{
        resource::{getrusage, UsageWho},
        signal::{kill, Signal},
        time::{TimeVal, TimeValLike},
    },
    unistd::Pid,
};
use nvbench_analysis::Outcome;
use std::{
    fs,
    path::Path,
    process::{self, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tracing::{debug, error, info, warn};
use wait_timeout::ChildExt;

/// Executor that runs one child at a time on this machine
#[derive(Debug, Clone)]
pub struct LocalExecutor {
    clock: Clock,
    timeout: Option<Duration>,
    sample_interval: Option<Duration>,
    poll: Duration,
    cancel: Arc<AtomicBool>,
}

impl LocalExecutor {
    pub fn new(cancel: Arc<AtomicBool>) -> Self {
        Self {
            clock: Clock::Cpu,
            timeout: None,
            sample_interval: None,
            poll: Duration::from_millis(200),
            cancel,
        }
    }

    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// advisory limit, slower runs are reported as `Outcome::Timeout` but never killed
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn sample_memory(mut self, interval: Option<Duration>) -> Self {
        self.sample_interval = interval;
        self
    }
}

impl Executor for LocalExecutor {
    fn execute(&mut self, command: &CommandLine) -> Result<Outcome, ExecutorError> {
        if self.cancel.load(Ordering::SeqCst) {
            return Err(ExecutorError::Cancelled);
        }

        info!("Executing: {command}");

        let cpu_before = children_cpu_time();
        let start = Instant::now();

        let mut child = match command
            .to_command()
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                warn!("Failed to spawn {}: {e}", command.exec.display());

                return Ok(Outcome::Failed(None));
            }
        };

        let sampler = self
            .sample_interval
            .map(|interval| MemorySampler::start(child.id(), interval));

        // poll so a cancellation doesn't have to wait for the benchmark
        let status = loop {
            if let Some(status) = child.wait_timeout(self.poll)? {
                break status;
            }

            if self.cancel.load(Ordering::SeqCst) {
                warn!("Cancelled, killing {}", child.id());
                child.kill()?;
                child.wait()?;

                if let Some(sampler) = sampler {
                    sampler.stop();
                }

                return Err(ExecutorError::Cancelled);
            }
        };

        let wall = start.elapsed();

        if let Some(sampler) = sampler {
            let stats = sampler.stop();
            info!(
                peak_kib = stats.peak_kib,
                samples = stats.samples,
                "Resident memory of {}",
                command.exec.display()
            );
        }

        let seconds = match self.clock {
            Clock::Cpu => (children_cpu_time() - cpu_before).as_secs_f64(),
            Clock::Wall => wall.as_secs_f64(),
        };

        debug!(
            "Finished in {} ns | status: {}",
            wall.as_nanos(),
            status.success()
        );

        if !status.success() {
            kill_stragglers(&command.exec);

            return Ok(Outcome::Failed(status.code()));
        }

        match self.timeout {
            Some(limit) if wall > limit => {
                warn!(
                    "{} took {} s, slower than {} s, ignoring result",
                    command.exec.display(),
                    wall.as_secs_f64(),
                    limit.as_secs()
                );

                Ok(Outcome::Timeout(seconds))
            }
            _ => Ok(Outcome::Success(seconds)),
        }
    }
}

/// user + system time of all waited-for children of this process
fn children_cpu_time() -> Duration {
    let to_duration = |time: TimeVal| Duration::from_micros(time.num_microseconds().max(0) as u64);

    match getrusage(UsageWho::RUSAGE_CHILDREN) {
        Ok(usage) => to_duration(usage.user_time()) + to_duration(usage.system_time()),
        Err(errno) => {
            error!(errno = ?errno, "getrusage failed, cpu time will read as 0");
            Duration::ZERO
        }
    }
}

/// Kill every process with `exec` as one of its arguments. Benchmarks that fork internally
/// may leave orphans behind after a failed run. Bare program names resolved through `PATH`
/// are skipped, they would match unrelated processes. Returns the number of killed processes.
pub fn kill_stragglers(exec: &Path) -> usize {
    let needle = exec.to_string_lossy();
    let own = process::id();

    if exec.components().count() < 2 {
        debug!("Not looking for stragglers of bare program {needle}");
        return 0;
    }

    let entries = match fs::read_dir("/proc") {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Failed to list processes: {e}");
            return 0;
        }
    };

    entries
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
        .filter(|pid| *pid != own)
        .filter(|pid| {
            fs::read(format!("/proc/{pid}/cmdline"))
                .map(|cmdline| {
                    String::from_utf8_lossy(&cmdline)
                        .split('\0')
                        .any(|arg| arg == needle)
                })
                .unwrap_or(false)
        })
        .filter(|pid| match kill(Pid::from_raw(*pid as i32), Signal::SIGKILL) {
            Ok(()) => {
                info!(pid, "Killed straggler of {needle}");
                true
            }
            Err(errno) => {
                debug!(pid, errno = ?errno, "Failed to kill straggler");
                false
            }
        })
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    fn executor() -> LocalExecutor {
        LocalExecutor::new(Arc::new(AtomicBool::new(false)))
    }

    #[test]
    fn success_and_failure() {
        let mut executor = executor();

        assert!(matches!(
            executor.execute(&CommandLine::new("true")),
            Ok(Outcome::Success(_))
        ));
        assert!(matches!(
            executor.execute(&CommandLine::new("sh").args(["-c", "exit 3"])),
            Ok(Outcome::Failed(Some(3)))
        ));
    }

    #[test]
    fn missing_executable_is_a_failed_run() {
        let mut executor = executor();

        assert!(matches!(
            executor.execute(&CommandLine::new("/nonexistent/benchmark-pthread.out")),
            Ok(Outcome::Failed(None))
        ));
    }

    #[test]
    fn environment_reaches_the_child() {
        let mut executor = executor();
        let command = CommandLine::new("sh")
            .args(["-c", "test \"$NVBENCH_PROBE\" = yes"])
            .env("NVBENCH_PROBE", "yes");

        assert!(matches!(
            executor.execute(&command),
            Ok(Outcome::Success(_))
        ));
    }

    #[test]
    fn cpu_clock_measures_children() {
        let mut executor = executor().clock(Clock::Cpu);
        let command = CommandLine::new("sh").args([
            "-c",
            "i=0; while [ $i -lt 200000 ]; do i=$((i+1)); done",
        ]);

        match executor.execute(&command) {
            Ok(Outcome::Success(seconds)) => assert!(seconds > 0.0),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn slow_runs_are_advisory_timeouts() {
        let mut executor = executor()
            .clock(Clock::Wall)
            .timeout(Some(Duration::from_millis(10)));

        match executor.execute(&CommandLine::new("sleep").arg("0.2")) {
            Ok(Outcome::Timeout(seconds)) => assert!(seconds >= 0.2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn cancelled_executor_refuses_to_start() {
        let mut executor = LocalExecutor::new(Arc::new(AtomicBool::new(true)));

        assert!(matches!(
            executor.execute(&CommandLine::new("true")),
            Err(ExecutorError::Cancelled)
        ));
    }

    #[test]
    fn cancelling_kills_the_running_child() {
        let cancel = Arc::new(AtomicBool::new(false));
        let mut executor = LocalExecutor::new(cancel.clone());

        let setter = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(300));
            cancel.store(true, Ordering::SeqCst);
        });

        let start = Instant::now();
        let result = executor.execute(&CommandLine::new("sleep").arg("5"));
        setter.join().unwrap();

        assert!(matches!(result, Err(ExecutorError::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn stragglers_are_killed() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("straggler-marker.out");
        let mut child = Command::new("sh")
            .args(["-c", "sleep 5; :"])
            .arg(&marker)
            .spawn()
            .unwrap();
        // give the fork time to exec before looking at its command line
        std::thread::sleep(Duration::from_millis(300));

        assert!(kill_stragglers(&marker) >= 1);
        assert!(!child.wait().unwrap().success());
    }
}
