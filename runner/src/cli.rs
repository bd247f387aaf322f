use crate::config::{ConfigErrors, HarnessConfig};
use clap::{ArgAction, Parser};
use std::path::PathBuf;
use tracing::debug;

/// Run benchmark suites across threading backends, with crash/recovery sessions and
/// trimmed-mean reports.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Suite configuration
    #[arg(short, long, default_value = "nvbench.yaml")]
    pub config: PathBuf,

    /// Directory for the csv report, overrides report.dir
    #[arg(long, conflicts_with = "no_csv")]
    pub csv: Option<PathBuf>,

    /// Only print the report table
    #[arg(long)]
    pub no_csv: bool,

    /// Sample the resident memory of every run
    #[arg(long)]
    pub sample_memory: bool,

    /// Leave the cpu topology alone even if the config enables it
    #[arg(long)]
    pub no_topology: bool,

    /// Write delay in nanoseconds, recorded in the report
    #[arg(long)]
    pub delay_ns: Option<u64>,

    /// Report the mean of incomplete series instead of NOT RUN
    #[arg(long)]
    pub partial_means: bool,

    /// Raise the log level, repeat for more
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Groups, benchmarks, backends, `<N>core`, a run count, an input size, `build` or `run`
    pub tokens: Vec<String>,
}

/// What the positional tokens selected, resolved against the config
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub build: bool,
    pub run: bool,
    pub benchmarks: Vec<String>,
    pub backends: Vec<String>,
    pub cores: Option<usize>,
    pub runs: Option<usize>,
    pub input: Option<String>,
}

impl Selection {
    /// Classify every token. Nothing selected means everything: all benchmarks, all backends.
    pub fn from_tokens<S: AsRef<str>>(
        tokens: &[S],
        config: &HarnessConfig,
    ) -> Result<Self, ConfigErrors> {
        let mut selection = Selection {
            build: false,
            run: false,
            benchmarks: Vec::new(),
            backends: Vec::new(),
            cores: None,
            runs: None,
            input: None,
        };

        for token in tokens.iter().map(AsRef::as_ref) {
            if token == "build" {
                selection.build = true;
            } else if token == "run" {
                selection.run = true;
            } else if let Some(members) = config.groups.get(token) {
                selection.benchmarks.extend(members.iter().cloned());
            } else if config.benchmark(token).is_some() {
                selection.benchmarks.push(token.to_owned());
            } else if config.backend(token).is_some() {
                selection.backends.push(token.to_owned());
            } else if let Some(cores) = token.strip_suffix("core") {
                match cores.parse::<usize>() {
                    Ok(cores) if cores > 0 => selection.cores = Some(cores),
                    _ => return Err(ConfigErrors::InvalidCores(token.to_owned())),
                }
            } else if !token.is_empty() && token.bytes().all(|b| b.is_ascii_digit()) {
                match token.parse::<usize>() {
                    Ok(runs) if runs > 0 => selection.runs = Some(runs),
                    _ => return Err(ConfigErrors::InvalidRuns(token.to_owned())),
                }
            } else if config.defaults.inputs.iter().any(|input| input == token) {
                selection.input = Some(token.to_owned());
            } else {
                return Err(ConfigErrors::UnknownToken(token.to_owned()));
            }
        }

        if selection.benchmarks.is_empty() {
            selection.benchmarks = config.benchmarks.iter().map(|b| b.name.clone()).collect();
        }
        if selection.backends.is_empty() {
            selection.backends = config.backends.iter().map(|b| b.name.clone()).collect();
        }

        // `build` alone only builds
        if !selection.build {
            selection.run = true;
        }

        debug!("Selected {selection:?}");

        Ok(selection)
    }
}
