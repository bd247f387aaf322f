//! One harness session: expand the selection into a plan, run it under the retry policy and
//! emit the report, whatever way the runs ended.

use crate::{
    cli::Selection,
    command::{expand, CommandLine, CommandTemplate, Vars},
    config::{BenchmarkConfig, ConfigErrors, HarnessConfig},
    executors::{Executor, ExecutorError, RetryPolicy},
    fault::{CrashAcceptance, RecoverySession},
    matrix::{ParameterPoint, RunMatrix, RunSpec},
    reset::{self, EnvironmentReset},
    topology::{CpuTopology, TopologyError},
};
use nvbench_analysis::{Aggregator, Report, ReportError, ReportMeta, SeriesKey};
use std::{
    collections::{BTreeMap, HashMap},
    env, fs,
    io::Write,
    path::PathBuf,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Invalid configuration")]
    Config(#[from] ConfigErrors),
    #[error("Run matrix aborted")]
    Executor(#[from] ExecutorError),
    #[error("Failed to control the cpu topology")]
    Topology(#[from] TopologyError),
    #[error("Failed to emit the report")]
    Report(#[from] ReportError),
}

/// How a planned run is executed
#[derive(Debug, Clone)]
pub enum Invocation {
    Single(CommandLine),
    Recovery(RecoverySession),
}

#[derive(Debug, Clone)]
pub struct PlannedRun {
    pub spec: RunSpec,
    pub invocation: Invocation,
    // artifacts moved away after a successful attempt, (from, to)
    pub collect: Vec<(PathBuf, PathBuf)>,
}

/// Every run of a session with its command lines already expanded, so template errors surface
/// before the first benchmark starts
#[derive(Debug)]
pub struct Plan {
    tag: String,
    runs: Vec<PlannedRun>,
    backends: Vec<String>,
    prepare: HashMap<ParameterPoint, CommandLine>,
    reset: EnvironmentReset,
    scratch: BTreeMap<String, EnvironmentReset>,
    abort_reset: BTreeMap<String, EnvironmentReset>,
}

fn base_command(
    benchmark: &BenchmarkConfig,
    spec: &RunSpec,
    vars: &Vars,
) -> Result<CommandLine, ConfigErrors> {
    let template = CommandTemplate {
        exec: benchmark.exec.clone(),
        args: benchmark
            .args
            .iter()
            .chain(benchmark.inputs.get(&spec.input).into_iter().flatten())
            .cloned()
            .collect(),
    };

    let mut command = template.expand(vars)?;
    if let Some(dir) = &benchmark.workdir {
        command = command.current_dir(dir);
    }

    Ok(command)
}

impl Plan {
    pub fn new(
        config: &HarnessConfig,
        selection: &Selection,
        meta: &ReportMeta,
    ) -> Result<Self, ConfigErrors> {
        let mut matrix = RunMatrix::new(meta.cores, meta.input.clone(), meta.runs);
        for name in selection.benchmarks.iter() {
            let benchmark = config
                .benchmark(name)
                .ok_or_else(|| ConfigErrors::UnknownToken(name.clone()))?;
            matrix = matrix.benchmark(name.clone(), benchmark.axes.clone());
        }
        for name in selection.backends.iter() {
            matrix = matrix.backend(name.clone());
        }

        let pwd = env::current_dir()
            .map(|dir| dir.display().to_string())
            .unwrap_or_else(|_| ".".to_owned());

        let mut runs = Vec::new();
        let mut prepare = HashMap::new();

        for spec in matrix.specs() {
            let (Some(benchmark), Some(backend)) =
                (config.benchmark(&spec.benchmark), config.backend(&spec.backend))
            else {
                return Err(ConfigErrors::UnknownToken(spec.backend.clone()));
            };

            let mut vars = spec.vars();
            vars.insert("pwd".to_owned(), pwd.clone());
            vars.extend(benchmark.vars.clone());
            vars.extend(backend.vars.clone());

            let mut base = base_command(benchmark, &spec, &vars)?;
            for (key, value) in backend.env.iter() {
                base = base.env(key, expand(value, &vars)?);
            }

            if let Some(template) = &benchmark.prepare {
                let point = spec.parameter_point();
                if !prepare.contains_key(&point) {
                    let mut command = template.expand(&vars)?;
                    if let Some(dir) = &benchmark.workdir {
                        command = command.current_dir(dir);
                    }
                    prepare.insert(point, command);
                }
            }

            let invocation = if spec.injects_crash() {
                let crash_args = benchmark
                    .crash_args
                    .iter()
                    .map(|arg| expand(arg, &vars))
                    .collect::<Result<Vec<_>, _>>()?;
                let recover_args = backend
                    .recover_args
                    .iter()
                    .map(|arg| expand(arg, &vars))
                    .collect::<Result<Vec<_>, _>>()?;

                Invocation::Recovery(RecoverySession::new(
                    base.clone().args(crash_args),
                    base.args(recover_args),
                    CrashAcceptance {
                        exit_codes: benchmark.crash_exit_codes.clone(),
                        by_signal: benchmark.crash_by_signal,
                    },
                ))
            } else {
                Invocation::Single(base)
            };

            let collect = backend
                .collect
                .iter()
                .map(|step| {
                    Ok((
                        PathBuf::from(expand(&step.from, &vars)?),
                        PathBuf::from(expand(&step.to, &vars)?),
                    ))
                })
                .collect::<Result<Vec<_>, ConfigErrors>>()?;

            runs.push(PlannedRun {
                spec,
                invocation,
                collect,
            });
        }

        let mut scratch = BTreeMap::new();
        let mut abort_reset = BTreeMap::new();
        for backend in config.backends.iter() {
            scratch.insert(backend.name.clone(), EnvironmentReset::new(&backend.scratch)?);
            abort_reset.insert(
                backend.name.clone(),
                EnvironmentReset::new(&backend.abort_reset)?,
            );
        }

        debug!("Planned {} runs", runs.len());

        Ok(Self {
            tag: meta.tag.clone(),
            runs,
            backends: matrix.backends().to_vec(),
            prepare,
            reset: EnvironmentReset::new(&config.reset)?,
            scratch,
            abort_reset,
        })
    }

    pub fn runs(&self) -> &[PlannedRun] {
        &self.runs
    }

    pub fn backends(&self) -> &[String] {
        &self.backends
    }

    /// report rows and columns in matrix order
    pub fn keys(&self) -> Vec<SeriesKey> {
        self.runs.iter().map(|run| run.spec.series_key()).collect()
    }

    /// Run every planned run in order, feeding the aggregator as runs complete. A run that
    /// exhausts the retry budget aborts the matrix.
    #[instrument(skip_all, level = "info")]
    pub fn execute<E: Executor>(
        &mut self,
        executor: &mut E,
        policy: RetryPolicy,
        aggregator: &mut Aggregator,
    ) -> Result<(), ExecutorError> {
        let empty = EnvironmentReset::default();

        for run in self.runs.iter_mut() {
            if let Some(prepare) = self.prepare.remove(&run.spec.parameter_point()) {
                info!("Preparing {}: {prepare}", run.spec.label());
                let outcome = executor.execute(&prepare)?;
                if !outcome.is_success() {
                    warn!("Prepare step of {} ended with {outcome}", run.spec.label());
                }
            }

            let scratch = self.scratch.get(&run.spec.backend).unwrap_or(&empty);
            let reset = &self.reset;
            let label = run.spec.to_string();
            let invocation = &mut run.invocation;
            let collect = &run.collect;

            let retried = policy.run(&label, |attempt| {
                debug!("{label}: attempt {attempt}");
                let wiped = reset.reset();
                let cleared = scratch.reset();
                debug!(
                    removed = wiped.removed + cleared.removed,
                    failed = wiped.failed + cleared.failed,
                    "{label}: environment reset"
                );

                let outcome = match &mut *invocation {
                    Invocation::Single(command) => executor.execute(command),
                    Invocation::Recovery(session) => session.run(&mut *executor, scratch),
                };

                if matches!(&outcome, Ok(outcome) if outcome.is_success()) {
                    collect_artifacts(collect);
                }

                let cleared = scratch.reset();
                if cleared.bytes > 0 {
                    debug!(bytes = cleared.bytes, "{label}: scratch state cleared");
                }
                outcome
            })?;

            let key = run.spec.series_key();
            for failure in retried.failures.iter() {
                aggregator.record(&key, failure);
            }

            match retried.success {
                Some(outcome) => {
                    aggregator.record(&key, &outcome);
                    println!(
                        "[{}] {label}: {:.6} seconds",
                        self.tag,
                        outcome.seconds().unwrap_or(0.0)
                    );
                }
                None => {
                    error!("Aborting, {label} could not be completed");
                    if let Some(abort) = self.abort_reset.get(&run.spec.backend) {
                        let summary = abort.reset();
                        info!(
                            removed = summary.removed,
                            failed = summary.failed,
                            "Cleaned up after {}",
                            run.spec.backend
                        );
                    }

                    return Err(ExecutorError::FailureThreshold {
                        label,
                        attempts: retried.failures.len() as u32,
                    });
                }
            }
        }

        Ok(())
    }
}

fn collect_artifacts(steps: &[(PathBuf, PathBuf)]) {
    for (from, to) in steps.iter() {
        match reset::collect(from, to) {
            Ok(()) => info!("Collected {from:?} into {to:?}"),
            Err(e) => warn!("Failed to collect {from:?} into {to:?}: {e}"),
        }
    }
}

/// What a finished session produced
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub failures: usize,
    pub csv: Option<PathBuf>,
    pub elapsed: Duration,
}

/// Parameters of one session, resolved from the config and the command line
#[derive(Debug)]
pub struct Session {
    pub meta: ReportMeta,
    pub max_failed: u32,
    pub csv_dir: Option<PathBuf>,
    pub topology: Option<CpuTopology>,
}

impl Session {
    pub fn from_config(
        config: &HarnessConfig,
        selection: &Selection,
    ) -> Result<Self, HarnessError> {
        let cores = selection
            .cores
            .or(config.defaults.cores)
            .unwrap_or_else(num_cpus::get_physical);

        let topology = if config.topology.enabled {
            Some(CpuTopology::new(
                &config.topology.sysfs,
                config.topology.logical_cpus,
                Duration::from_millis(config.topology.settle_ms),
            )?)
        } else {
            None
        };

        Ok(Self {
            meta: ReportMeta {
                tag: config.tag.clone(),
                input: selection
                    .input
                    .clone()
                    .unwrap_or_else(|| config.defaults.input.clone()),
                cores,
                runs: selection.runs.unwrap_or(config.defaults.runs),
                delay_ns: config.defaults.delay_ns,
                partial_means: config.report.partial_means,
                file_prefix: config.report.prefix.clone(),
            },
            max_failed: config.defaults.max_failed,
            csv_dir: config.report.dir.clone(),
            topology,
        })
    }

    /// Run the plan and emit the report to `out` (and the csv directory). The report is
    /// written even if the matrix was aborted; the run error takes precedence over report
    /// errors.
    #[instrument(skip_all, level = "info")]
    pub fn run<E: Executor, W: Write>(
        self,
        plan: &mut Plan,
        mut executor: E,
        out: &mut W,
    ) -> Result<SessionSummary, HarnessError> {
        let start = Instant::now();

        let guard = match self.topology {
            Some(topology) => Some(topology.guard(self.meta.cores)?),
            None => None,
        };
        if let Some(guard) = &guard {
            let topology = guard.topology();
            info!(
                "Restricted to {} of {} logical cpus",
                topology.online().len(),
                topology.logical()
            );
        }
        info!(
            "Running {} runs on {} cores, {} logical cpus online",
            plan.runs().len(),
            self.meta.cores,
            num_cpus::get()
        );

        let mut aggregator = Aggregator::new(self.meta.runs);
        for key in plan.keys() {
            aggregator.declare(&key);
        }

        let result = plan.execute(
            &mut executor,
            RetryPolicy::new(self.max_failed),
            &mut aggregator,
        );
        let elapsed = start.elapsed();

        let report = Report::new(&self.meta, &aggregator, plan.backends());
        let mut report_result = report.render_table(out);

        let mut csv = None;
        if let Some(dir) = &self.csv_dir {
            let path = dir.join(report.csv_file_name());
            let written = fs::create_dir_all(dir)
                .and_then(|()| fs::File::create(&path))
                .map_err(ReportError::from)
                .and_then(|file| report.write_csv(file, elapsed));

            match written {
                Ok(()) => {
                    info!("Report written to {path:?}");
                    csv = Some(path);
                }
                Err(e) => {
                    error!("Failed to write {path:?}: {e}");
                    report_result = report_result.and(Err(e));
                }
            }
        }

        drop(guard);
        info!("Finished, time: {} seconds", elapsed.as_secs_f64());

        result?;
        report_result?;

        Ok(SessionSummary {
            failures: aggregator.failures(),
            csv,
            elapsed,
        })
    }
}
