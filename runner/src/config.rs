use crate::{
    command::{template_variables, CommandTemplate, BUILTIN_VARIABLES},
    reset::ResetTarget,
};
use globset::GlobBuilder;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    io::Error,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{error, warn};

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to read config file {0:?}")]
    Read(PathBuf, #[source] Error),
    #[error("Failed to parse config")]
    Parse(#[from] serde_yaml::Error),
    #[error("Globs were invalid")]
    InvalidGlobs(#[from] globset::Error),
    #[error("Unknown argument '{0}'")]
    UnknownToken(String),
    #[error("Unknown template variable '{{{variable}}}' in '{template}'")]
    UnknownVariable { variable: String, template: String },
    #[error("Unterminated template variable in '{0}'")]
    UnterminatedVariable(String),
    #[error("Invalid core count '{0}'")]
    InvalidCores(String),
    #[error("Invalid run count '{0}'")]
    InvalidRuns(String),
    #[error("Config failed preflight checks")]
    Preflight,
}

/// which clock a run is measured with
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Clock {
    /// user + system time of the waited-for children
    #[default]
    Cpu,
    /// wall clock time between spawn and exit
    Wall,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct HarnessConfig {
    // prefix of console output, e.g. `NVthread-eval`
    #[serde(default = "default_tag")]
    pub tag: String,
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub topology: TopologyConfig,
    #[serde(default)]
    pub report: ReportConfig,
    // wiped before every attempt, regardless of backend
    #[serde(default)]
    pub reset: Vec<ResetTarget>,
    // named sets of benchmarks selectable from the command line, e.g. `phoenix`
    #[serde(default)]
    pub groups: BTreeMap<String, Vec<String>>,
    // kept as lists since their order is the column/row order of the report
    pub backends: Vec<BackendConfig>,
    pub benchmarks: Vec<BenchmarkConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields, default)]
pub struct Defaults {
    pub runs: usize,
    pub input: String,
    // input size classes accepted on the command line
    pub inputs: Vec<String>,
    // physical cores to keep online, falls back to the machine's physical core count
    pub cores: Option<usize>,
    pub max_failed: u32,
    // advisory limit in seconds, slower runs are discarded and retried
    pub timeout: Option<u64>,
    pub clock: Clock,
    pub delay_ns: u64,
    // build tool invoked in `build` mode
    pub make: String,
    // resident memory sampling interval in milliseconds
    pub sample_interval_ms: u64,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            runs: 1,
            input: "native".to_owned(),
            inputs: vec!["simlarge".to_owned(), "native".to_owned()],
            cores: None,
            max_failed: 20,
            timeout: None,
            clock: Clock::Cpu,
            delay_ns: 0,
            make: "make".to_owned(),
            sample_interval_ms: 1000,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields, default)]
pub struct TopologyConfig {
    pub enabled: bool,
    pub sysfs: PathBuf,
    // number of logical cpus, read from `<sysfs>/possible` if unset
    pub logical_cpus: Option<usize>,
    pub settle_ms: u64,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sysfs: PathBuf::from("/sys/devices/system/cpu"),
            logical_cpus: None,
            settle_ms: 2000,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields, default)]
pub struct ReportConfig {
    // directory for the csv report, no csv is written if unset
    pub dir: Option<PathBuf>,
    pub partial_means: bool,
    // prepended to the csv file name, e.g. `disk_`
    pub prefix: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            dir: Some(PathBuf::from("stats")),
            partial_means: false,
            prefix: String::new(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    pub name: String,
    // environment of the benchmark process, e.g. LD_LIBRARY_PATH
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
    // persisted state of the backend, wiped around every attempt
    #[serde(default)]
    pub scratch: Vec<ResetTarget>,
    // wiped once the matrix is aborted
    #[serde(default)]
    pub abort_reset: Vec<ResetTarget>,
    // appended to the recovery command of a crash/recovery session
    #[serde(default)]
    pub recover_args: Vec<String>,
    // artifacts moved away after every successful run
    #[serde(default)]
    pub collect: Vec<CollectStep>,
}

/// Move `from` to `to` once a run succeeded, both templates
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CollectStep {
    pub from: String,
    pub to: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct Axes {
    #[serde(default)]
    pub points: Vec<u64>,
    #[serde(default)]
    pub record_sizes: Vec<u64>,
    #[serde(default)]
    pub write_percents: Vec<u64>,
    #[serde(default)]
    pub threads: Vec<u64>,
    // 0 runs straight through without a crash
    #[serde(default)]
    pub crash_at: Vec<u64>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct BenchmarkConfig {
    pub name: String,
    pub exec: String,
    #[serde(default)]
    pub args: Vec<String>,
    // extra arguments per input size class
    #[serde(default)]
    pub inputs: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
    #[serde(default)]
    pub axes: Axes,
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    // appended to the crash phase of a crash/recovery session
    #[serde(default = "default_crash_args")]
    pub crash_args: Vec<String>,
    #[serde(default = "default_crash_exit_codes")]
    pub crash_exit_codes: Vec<i32>,
    #[serde(default)]
    pub crash_by_signal: bool,
    // run once per distinct parameter tuple before its runs
    #[serde(default)]
    pub prepare: Option<CommandTemplate>,
    #[serde(default)]
    pub build_dir: Option<PathBuf>,
}

impl HarnessConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let content =
            fs::read_to_string(path).map_err(|e| ConfigErrors::Read(path.to_path_buf(), e))?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigErrors> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn backend(&self, name: &str) -> Option<&BackendConfig> {
        self.backends.iter().find(|backend| backend.name == name)
    }

    pub fn benchmark(&self, name: &str) -> Option<&BenchmarkConfig> {
        self.benchmarks
            .iter()
            .find(|benchmark| benchmark.name == name)
    }

    /// Check the whole config and report every problem at once. Returns true if any error
    /// was found.
    pub fn preflight_checks(&self) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        if self.backends.is_empty() {
            error!("No backend was defined, unable to build a run matrix");
            contains_error = true;
        }

        if self.benchmarks.is_empty() {
            error!("No benchmark was defined, unable to build a run matrix");
            contains_error = true;
        }

        if self.defaults.runs == 0 {
            error!("defaults.runs cannot be 0");
            contains_error = true;
        }

        if self.defaults.max_failed == 0 {
            error!("defaults.max_failed cannot be 0, no run could ever be attempted");
            contains_error = true;
        }

        for duplicate in self
            .backends
            .iter()
            .map(|backend| &backend.name)
            .duplicates()
        {
            error!("Backend {duplicate} is defined more than once");
            contains_error = true;
        }

        for duplicate in self
            .benchmarks
            .iter()
            .map(|benchmark| &benchmark.name)
            .duplicates()
        {
            error!("Benchmark {duplicate} is defined more than once");
            contains_error = true;
        }

        for (group, members) in self.groups.iter() {
            if self.benchmark(group).is_some() {
                warn!("Group {group} shadows the benchmark of the same name");
            }

            for member in members {
                if self.benchmark(member).is_none() {
                    error!("Group {group} references {member} but {member} is not defined");
                    contains_error = true;
                }
            }
        }

        let targets = self.reset.iter().chain(
            self.backends
                .iter()
                .flat_map(|backend| backend.scratch.iter().chain(backend.abort_reset.iter())),
        );
        for target in targets {
            if let Some(glob) = &target.glob {
                if let Err(e) = GlobBuilder::new(glob).build() {
                    error!("Failed to compile reset glob {glob} for {:?}: {e}", target.path);
                    contains_error = true;
                }
            }
        }

        for benchmark in self.benchmarks.iter() {
            let name = &benchmark.name;

            if benchmark.axes.crash_at.iter().any(|crash| *crash != 0)
                && benchmark.crash_args.is_empty()
            {
                error!("benchmarks.{name} injects crashes but crash_args is empty");
                contains_error = true;
            }

            for input in benchmark.inputs.keys() {
                if !self.defaults.inputs.contains(input) {
                    warn!("benchmarks.{name}.inputs.{input} is not listed in defaults.inputs and can't be selected");
                }
            }

            for backend in self.backends.iter() {
                let known = BUILTIN_VARIABLES
                    .iter()
                    .map(|variable| variable.to_string())
                    .chain(benchmark.vars.keys().cloned())
                    .chain(backend.vars.keys().cloned())
                    .collect::<BTreeSet<_>>();

                let templates = std::iter::once(&benchmark.exec)
                    .chain(benchmark.args.iter())
                    .chain(benchmark.inputs.values().flatten())
                    .chain(benchmark.crash_args.iter())
                    .chain(backend.recover_args.iter())
                    .chain(backend.env.values())
                    .chain(
                        backend
                            .collect
                            .iter()
                            .flat_map(|step| [&step.from, &step.to]),
                    )
                    .chain(
                        benchmark
                            .prepare
                            .iter()
                            .flat_map(|prepare| std::iter::once(&prepare.exec).chain(&prepare.args)),
                    );

                for template in templates {
                    match template_variables(template) {
                        Ok(variables) => {
                            for variable in variables {
                                if !known.contains(variable) {
                                    error!(
                                        "benchmarks.{name} uses unknown variable {variable} in '{template}' for backend {}",
                                        backend.name
                                    );
                                    contains_error = true;
                                }
                            }
                        }
                        Err(e) => {
                            error!("benchmarks.{name}: {e}");
                            contains_error = true;
                        }
                    }
                }
            }

            if let Some(dir) = &benchmark.build_dir {
                if !dir.is_dir() {
                    warn!("benchmarks.{name}.build_dir {dir:?} is not a directory, building it will fail");
                }
            }
        }

        contains_error
    }
}

fn default_tag() -> String {
    "nvbench".to_owned()
}

fn default_crash_args() -> Vec<String> {
    vec!["-a".to_owned(), "{crash_at}".to_owned()]
}

fn default_crash_exit_codes() -> Vec<i32> {
    vec![0]
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUITE: &str = r#"
tag: NVthread-eval
defaults:
  runs: 5
  timeout: 600
  clock: wall
groups:
  phoenix: [histogram, kmeans]
backends:
  - name: pthread
    recover_args: ["-r", "1"]
  - name: nvthread
    env:
      LD_LIBRARY_PATH: /opt/nvthreads/lib
    collect:
      - from: /tmp/pagedensity.csv
        to: "pagedensity/{benchmark}_pagedensity.csv"
    scratch:
      - path: /mnt/ramdisk/nvthreads
    abort_reset:
      - path: /mnt/ramdisk
        glob: "MemLog*"
benchmarks:
  - name: histogram
    exec: "tests/{benchmark}/{benchmark}-{backend}.out"
    args: ["{pwd}/datasets/histogram_datafiles/large.bmp"]
  - name: kmeans
    exec: "./kmeans-{backend}.o"
    args: ["-p", "{points}", "-s", "{grid}", "-c", "1000"]
    vars:
      grid: "1000"
    axes:
      points: [30000000, 1000000]
      crash_at: [0, 10, 50]
"#;

    #[test]
    fn parses_suite_with_defaults() {
        let config = HarnessConfig::parse(SUITE).unwrap();

        assert_eq!(config.tag, "NVthread-eval");
        assert_eq!(config.defaults.runs, 5);
        assert_eq!(config.defaults.max_failed, 20);
        assert_eq!(config.defaults.clock, Clock::Wall);
        assert_eq!(config.defaults.timeout, Some(600));
        assert!(!config.topology.enabled);
        assert_eq!(config.report.dir, Some(PathBuf::from("stats")));
        assert_eq!(
            config.backends.iter().map(|b| b.name.as_str()).collect_vec(),
            ["pthread", "nvthread"]
        );

        assert_eq!(config.report.prefix, "");
        assert_eq!(
            config.backend("nvthread").unwrap().collect[0].to,
            "pagedensity/{benchmark}_pagedensity.csv"
        );

        let kmeans = config.benchmark("kmeans").unwrap();
        assert_eq!(kmeans.crash_args, ["-a", "{crash_at}"]);
        assert_eq!(kmeans.crash_exit_codes, [0]);
        assert!(!config.preflight_checks());
    }

    #[test]
    fn rejects_unknown_fields() {
        let result = HarnessConfig::parse(
            "backends: []\nbenchmarks: []\ntopolgy:\n  enabled: true\n",
        );

        assert!(matches!(result, Err(ConfigErrors::Parse(_))));
    }

    #[test]
    fn preflight_catches_unknown_variables_and_groups() {
        let mut config = HarnessConfig::parse(SUITE).unwrap();
        config.benchmarks[0].args.push("{nope}".to_owned());
        assert!(config.preflight_checks());

        let mut config = HarnessConfig::parse(SUITE).unwrap();
        config
            .groups
            .insert("parsec".to_owned(), vec!["canneal".to_owned()]);
        assert!(config.preflight_checks());

        let mut config = HarnessConfig::parse(SUITE).unwrap();
        config.backends[1].collect.push(CollectStep {
            from: "/tmp/{missing}.csv".to_owned(),
            to: "out".to_owned(),
        });
        assert!(config.preflight_checks());

        let mut config = HarnessConfig::parse(SUITE).unwrap();
        config.backends.push(BackendConfig {
            name: "pthread".to_owned(),
            ..Default::default()
        });
        assert!(config.preflight_checks());
    }
}
