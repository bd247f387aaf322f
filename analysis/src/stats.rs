use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{cmp::Ordering, collections::BTreeMap, fmt};
use tracing::{debug, warn};

/// Outcome of a single attempt of a run
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Outcome {
    /// exited with 0, elapsed seconds
    Success(f64),
    /// non zero exit code, `None` if the child was killed by a signal
    Failed(Option<i32>),
    /// finished, but slower than the advisory limit; the sample is discarded
    Timeout(f64),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn seconds(&self) -> Option<f64> {
        match self {
            Self::Success(seconds) | Self::Timeout(seconds) => Some(*seconds),
            Self::Failed(_) => None,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success(seconds) => write!(f, "success ({seconds} s)"),
            Self::Failed(Some(code)) => write!(f, "failed (exit code {code})"),
            Self::Failed(None) => write!(f, "failed (killed by signal)"),
            Self::Timeout(seconds) => write!(f, "too slow ({seconds} s)"),
        }
    }
}

/// Grouping of samples: one row label (benchmark plus its varying axes) and one backend
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SeriesKey {
    pub label: String,
    pub backend: String,
}

impl SeriesKey {
    pub fn new(label: impl Into<String>, backend: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            backend: backend.into(),
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.label, self.backend)
    }
}

/// Successful samples of one key plus failure bookkeeping
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Series {
    pub samples: Vec<f64>,
    pub failures: usize,
    pub timeouts: usize,
}

/// Result of summarizing a series against the configured run count
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Summary {
    TrimmedMean(f64),
    NotRun,
    Incomplete { samples: usize, partial: f64 },
}

/// Mean after dropping exactly one minimum and one maximum sample if there are at least 4
/// samples, the plain mean otherwise. `None` for an empty slice.
pub fn trimmed_mean(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }

    let kept = if samples.len() >= 4 {
        let sorted = samples
            .iter()
            .copied()
            .sorted_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal))
            .collect_vec();

        sorted[1..sorted.len() - 1].to_vec()
    } else {
        samples.to_vec()
    };

    Some(kept.iter().sum::<f64>() / kept.len() as f64)
}

/// Collects outcomes per [`SeriesKey`], keeping the order in which rows and backends were
/// declared so reports follow the caller's configuration order.
#[derive(Debug, Clone)]
pub struct Aggregator {
    runs: usize,
    rows: Vec<String>,
    series: BTreeMap<SeriesKey, Series>,
}

impl Aggregator {
    pub fn new(runs: usize) -> Self {
        Self {
            runs,
            rows: Vec::new(),
            series: BTreeMap::new(),
        }
    }

    pub fn runs(&self) -> usize {
        self.runs
    }

    /// register a key so it shows up in reports even if it is never run
    pub fn declare(&mut self, key: &SeriesKey) {
        if !self.rows.contains(&key.label) {
            self.rows.push(key.label.clone());
        }

        self.series.entry(key.clone()).or_default();
    }

    /// row labels in declaration order
    pub fn rows(&self) -> &[String] {
        &self.rows
    }

    pub fn series(&self, key: &SeriesKey) -> Option<&Series> {
        self.series.get(key)
    }

    /// Record the outcome of one attempt. Returns false if a successful sample was rejected
    /// because the series already holds the configured run count.
    pub fn record(&mut self, key: &SeriesKey, outcome: &Outcome) -> bool {
        self.declare(key);
        let runs = self.runs;
        let series = self.series.entry(key.clone()).or_default();

        match outcome {
            Outcome::Success(seconds) => {
                if series.samples.len() >= runs {
                    warn!(key = %key, "Series already holds {runs} samples, dropping {seconds}");

                    return false;
                }

                series.samples.push(*seconds);
                debug!(key = %key, samples = series.samples.len(), "Recorded sample {seconds}");
            }
            Outcome::Failed(_) => series.failures += 1,
            Outcome::Timeout(_) => {
                series.failures += 1;
                series.timeouts += 1;
            }
        }

        true
    }

    pub fn summarize(&self, key: &SeriesKey) -> Summary {
        let samples = match self.series.get(key) {
            Some(series) => series.samples.as_slice(),
            None => return Summary::NotRun,
        };

        match trimmed_mean(samples) {
            None => Summary::NotRun,
            Some(mean) if samples.len() >= self.runs => Summary::TrimmedMean(mean),
            Some(partial) => Summary::Incomplete {
                samples: samples.len(),
                partial,
            },
        }
    }

    /// total failed attempts over all series
    pub fn failures(&self) -> usize {
        self.series.values().map(|series| series.failures).sum()
    }
}
