//! `build` mode: rebuild the selected benchmarks in place before measuring them.

use crate::{command::CommandLine, config::BenchmarkConfig};
use std::{fmt, path::Path, process::Stdio};
use tracing::{error, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Succeeded,
    Failed,
    // no build_dir configured
    Skipped,
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BuildStatus::Succeeded => "succeeded",
            BuildStatus::Failed => "failed",
            BuildStatus::Skipped => "skipped",
        })
    }
}

pub struct Builder<'a> {
    make: &'a str,
}

impl<'a> Builder<'a> {
    pub fn new(make: &'a str) -> Self {
        Self { make }
    }

    /// `make clean` then `make` inside `dir`. Output of the build tool is passed through.
    #[instrument(skip(self), level = "info")]
    pub fn build_dir(&self, dir: &Path) -> BuildStatus {
        for target in [Some("clean"), None] {
            let mut command = CommandLine::new(self.make).current_dir(dir);
            if let Some(target) = target {
                command.push(target);
            }

            info!("Building: {command}");

            match command.to_command().stdin(Stdio::null()).status() {
                Ok(status) if status.success() => {}
                Ok(status) => {
                    warn!("{command} in {dir:?} exited with {status}");
                    return BuildStatus::Failed;
                }
                Err(e) => {
                    error!("Failed to run {command} in {dir:?}: {e}");
                    return BuildStatus::Failed;
                }
            }
        }

        BuildStatus::Succeeded
    }

    /// Build every benchmark in order and print the summary lines, prefixed with `tag`
    pub fn build_all<'b, I>(&self, tag: &str, benchmarks: I) -> Vec<(String, BuildStatus)>
    where
        I: IntoIterator<Item = &'b BenchmarkConfig>,
    {
        let results: Vec<_> = benchmarks
            .into_iter()
            .map(|benchmark| {
                let status = match &benchmark.build_dir {
                    Some(dir) => self.build_dir(dir),
                    None => BuildStatus::Skipped,
                };

                (benchmark.name.clone(), status)
            })
            .collect();

        println!("[{tag}] Build summary:");
        for (name, status) in results.iter() {
            println!("[{tag}] {name}: {status}");
        }

        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HarnessConfig;

    fn benchmark(config: &str) -> BenchmarkConfig {
        HarnessConfig::parse(config).unwrap().benchmarks.remove(0)
    }

    #[test]
    fn reports_each_benchmark() {
        let dir = tempfile::tempdir().unwrap();
        let mut built = benchmark("backends: []\nbenchmarks:\n  - name: pca\n    exec: ./pca\n");
        built.build_dir = Some(dir.path().to_path_buf());
        let unbuilt = benchmark("backends: []\nbenchmarks:\n  - name: histogram\n    exec: ./h\n");

        let results = Builder::new("true").build_all("test", [&built, &unbuilt]);
        assert_eq!(
            results,
            vec![
                ("pca".to_owned(), BuildStatus::Succeeded),
                ("histogram".to_owned(), BuildStatus::Skipped)
            ]
        );

        assert_eq!(
            Builder::new("false").build_dir(dir.path()),
            BuildStatus::Failed
        );
    }

    #[test]
    fn missing_directory_fails() {
        assert_eq!(
            Builder::new("true").build_dir(Path::new("/nonexistent/nvbench/build")),
            BuildStatus::Failed
        );
    }
}
