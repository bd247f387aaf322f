//! Expansion of the configuration axes into an ordered list of runs.
//!
//! Order, outer to inner: benchmark, points, record size, write percent, threads, backend,
//! crash iteration, run index. Named axes keep the order they were given in, numeric axes are
//! sorted ascending. Axes without values collapse into a single `None`.

use crate::{command::Vars, config::Axes};
use itertools::{iproduct, Itertools};
use nvbench_analysis::SeriesKey;
use std::fmt;

/// One fully specified benchmark invocation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunSpec {
    pub benchmark: String,
    pub backend: String,
    pub cores: usize,
    pub input: String,
    pub points: Option<u64>,
    pub record_size: Option<u64>,
    pub write_percent: Option<u64>,
    pub threads: Option<u64>,
    pub crash_at: Option<u64>,
    pub run: usize,
}

/// The parameters a prepare step depends on, everything but backend, crash and run index
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParameterPoint {
    pub benchmark: String,
    pub points: Option<u64>,
    pub record_size: Option<u64>,
    pub write_percent: Option<u64>,
    pub threads: Option<u64>,
}

impl RunSpec {
    /// Row label of the report: the benchmark plus every configured axis value
    pub fn label(&self) -> String {
        let parameters = [
            ("p", self.points),
            ("rs", self.record_size),
            ("w", self.write_percent),
            ("t", self.threads),
            ("crash", self.crash_at),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.map(|value| format!("{name}={value}")))
        .join(",");

        if parameters.is_empty() {
            self.benchmark.clone()
        } else {
            format!("{}[{parameters}]", self.benchmark)
        }
    }

    pub fn series_key(&self) -> SeriesKey {
        SeriesKey::new(self.label(), self.backend.clone())
    }

    pub fn parameter_point(&self) -> ParameterPoint {
        ParameterPoint {
            benchmark: self.benchmark.clone(),
            points: self.points,
            record_size: self.record_size,
            write_percent: self.write_percent,
            threads: self.threads,
        }
    }

    /// true if this run is a crash/recovery session rather than a straight run
    pub fn injects_crash(&self) -> bool {
        matches!(self.crash_at, Some(crash) if crash != 0)
    }

    /// template variables provided by this run
    pub fn vars(&self) -> Vars {
        let mut vars = Vars::new();

        vars.insert("benchmark".to_owned(), self.benchmark.clone());
        vars.insert("backend".to_owned(), self.backend.clone());
        vars.insert("input".to_owned(), self.input.clone());
        vars.insert("cores".to_owned(), self.cores.to_string());
        vars.insert(
            "cores_minus_one".to_owned(),
            self.cores.saturating_sub(1).max(1).to_string(),
        );
        vars.insert("run".to_owned(), self.run.to_string());

        let axes = [
            ("points", self.points),
            ("record_size", self.record_size),
            ("write_percent", self.write_percent),
            ("threads", self.threads),
            ("crash_at", self.crash_at),
        ];
        for (name, value) in axes {
            if let Some(value) = value {
                vars.insert(name.to_owned(), value.to_string());
            }
        }

        vars
    }
}

impl fmt::Display for RunSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}[{}]", self.label(), self.backend, self.run)
    }
}

/// A numeric axis: sorted, deduplicated, `[None]` if empty
fn numeric_axis(values: &[u64]) -> Vec<Option<u64>> {
    if values.is_empty() {
        vec![None]
    } else {
        values.iter().copied().sorted().dedup().map(Some).collect()
    }
}

/// The cross product of all configuration axes
#[derive(Debug, Clone)]
pub struct RunMatrix {
    benchmarks: Vec<(String, Axes)>,
    backends: Vec<String>,
    cores: usize,
    input: String,
    runs: usize,
}

impl RunMatrix {
    pub fn new(cores: usize, input: impl Into<String>, runs: usize) -> Self {
        Self {
            benchmarks: Vec::new(),
            backends: Vec::new(),
            cores,
            input: input.into(),
            runs,
        }
    }

    pub fn benchmark(mut self, name: impl Into<String>, axes: Axes) -> Self {
        let name = name.into();

        if !self.benchmarks.iter().any(|(known, _)| *known == name) {
            self.benchmarks.push((name, axes));
        }

        self
    }

    pub fn backend(mut self, name: impl Into<String>) -> Self {
        let name = name.into();

        if !self.backends.contains(&name) {
            self.backends.push(name);
        }

        self
    }

    pub fn backends(&self) -> &[String] {
        &self.backends
    }

    /// Every run, in execution order
    pub fn specs(&self) -> Vec<RunSpec> {
        let mut specs = Vec::new();

        for (benchmark, axes) in self.benchmarks.iter() {
            let parameters = iproduct!(
                numeric_axis(&axes.points),
                numeric_axis(&axes.record_sizes),
                numeric_axis(&axes.write_percents),
                numeric_axis(&axes.threads)
            );

            for (points, record_size, write_percent, threads) in parameters {
                let runs = iproduct!(
                    self.backends.iter(),
                    numeric_axis(&axes.crash_at),
                    0..self.runs
                );

                specs.extend(runs.map(|(backend, crash_at, run)| RunSpec {
                    benchmark: benchmark.clone(),
                    backend: backend.clone(),
                    cores: self.cores,
                    input: self.input.clone(),
                    points,
                    record_size,
                    write_percent,
                    threads,
                    crash_at,
                    run,
                }));
            }
        }

        specs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kmeans_axes() -> Axes {
        Axes {
            points: vec![30000000, 1000000],
            crash_at: vec![50, 10],
            ..Default::default()
        }
    }

    #[test]
    fn order_is_sorted_and_stable() {
        let matrix = RunMatrix::new(12, "native", 2)
            .benchmark("kmeans", kmeans_axes())
            .backend("nvthread");

        let first = matrix.specs();
        assert_eq!(first, matrix.specs());

        let order = first
            .iter()
            .map(|spec| (spec.points, spec.crash_at, spec.run))
            .collect_vec();
        assert_eq!(
            order,
            vec![
                (Some(1000000), Some(10), 0),
                (Some(1000000), Some(10), 1),
                (Some(1000000), Some(50), 0),
                (Some(1000000), Some(50), 1),
                (Some(30000000), Some(10), 0),
                (Some(30000000), Some(10), 1),
                (Some(30000000), Some(50), 0),
                (Some(30000000), Some(50), 1),
            ]
        );
    }

    #[test]
    fn unused_axes_collapse() {
        let matrix = RunMatrix::new(4, "simlarge", 3)
            .benchmark("histogram", Axes::default())
            .benchmark("pca", Axes::default())
            .backend("pthread")
            .backend("dthread")
            .backend("pthread");

        let specs = matrix.specs();
        assert_eq!(specs.len(), 2 * 2 * 3);
        assert_eq!(matrix.backends(), ["pthread", "dthread"]);
        assert_eq!(specs[0].label(), "histogram");
        assert_eq!(specs[3].backend, "dthread");
        assert_eq!(specs[6].benchmark, "pca");
        assert!(specs.iter().all(|spec| spec.crash_at.is_none()));
    }

    #[test]
    fn backend_is_inside_points_and_outside_crash() {
        let matrix = RunMatrix::new(4, "native", 1)
            .benchmark("kmeans", kmeans_axes())
            .backend("pthread")
            .backend("nvthread");

        let order = matrix
            .specs()
            .into_iter()
            .map(|spec| format!("{}", spec))
            .collect_vec();

        assert_eq!(order[0], "kmeans[p=1000000,crash=10].pthread[0]");
        assert_eq!(order[1], "kmeans[p=1000000,crash=50].pthread[0]");
        assert_eq!(order[2], "kmeans[p=1000000,crash=10].nvthread[0]");
        assert_eq!(order[4], "kmeans[p=30000000,crash=10].pthread[0]");
    }

    #[test]
    fn vars_only_hold_configured_axes() {
        let spec = RunMatrix::new(1, "native", 1)
            .benchmark(
                "tcbmtsimple",
                Axes {
                    record_sizes: vec![64],
                    ..Default::default()
                },
            )
            .backend("nvthread")
            .specs()
            .remove(0);

        let vars = spec.vars();
        assert_eq!(vars.get("record_size").map(String::as_str), Some("64"));
        assert_eq!(vars.get("cores_minus_one").map(String::as_str), Some("1"));
        assert!(!vars.contains_key("points"));
        assert!(!spec.injects_crash());
        assert_eq!(spec.label(), "tcbmtsimple[rs=64]");
    }
}
