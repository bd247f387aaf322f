use globset::{GlobBuilder, GlobMatcher};
use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use tracing::{debug, info, warn};

/// A location to wipe between runs. Directories are emptied but kept, files are removed. With
/// a glob only entries below `path` whose file name matches are removed.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ResetTarget {
    pub path: PathBuf,
    #[serde(default)]
    pub glob: Option<String>,
}

impl ResetTarget {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            glob: None,
        }
    }

    pub fn matching(path: impl Into<PathBuf>, glob: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            glob: Some(glob.into()),
        }
    }
}

#[derive(Debug, Clone)]
struct CompiledTarget {
    path: PathBuf,
    matcher: Option<GlobMatcher>,
}

/// What a reset pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResetSummary {
    pub removed: usize,
    pub failed: usize,
    pub bytes: u64,
}

/// Clears transient state before a run. Failures are logged, never fatal.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentReset {
    targets: Vec<CompiledTarget>,
}

impl EnvironmentReset {
    pub fn new(targets: &[ResetTarget]) -> Result<Self, globset::Error> {
        let targets = targets
            .iter()
            .map(|target| {
                let matcher = match &target.glob {
                    Some(glob) => Some(GlobBuilder::new(glob).build()?.compile_matcher()),
                    None => None,
                };

                Ok(CompiledTarget {
                    path: target.path.clone(),
                    matcher,
                })
            })
            .collect::<Result<Vec<_>, globset::Error>>()?;

        Ok(Self { targets })
    }

    /// Wipe all targets synchronously
    pub fn reset(&self) -> ResetSummary {
        let mut summary = ResetSummary::default();

        for target in self.targets.iter() {
            if target.path.symlink_metadata().is_err() {
                debug!(path = ?target.path, "Nothing to reset");
                continue;
            }

            let victims = match &target.matcher {
                Some(matcher) => matching_entries(&target.path, matcher),
                None if target.path.is_dir() => match fs::read_dir(&target.path) {
                    Ok(entries) => entries
                        .filter_map(Result::ok)
                        .map(|entry| entry.path())
                        .collect(),
                    Err(error) => {
                        warn!(path = ?target.path, error = ?error, "Failed to list scratch directory");
                        summary.failed += 1;
                        continue;
                    }
                },
                None => vec![target.path.clone()],
            };

            let bytes = victims.iter().map(|path| disk_usage(path)).sum::<u64>();
            if target.path.is_dir() {
                info!(path = ?target.path, bytes, "Clearing {} entries", victims.len());
            }

            for victim in victims {
                match remove(&victim) {
                    Ok(()) => summary.removed += 1,
                    // already gone together with a matching parent
                    Err(error) if error.kind() == io::ErrorKind::NotFound => {}
                    Err(error) => {
                        warn!(path = ?victim, error = ?error, "Failed to remove, continuing with stale state");
                        summary.failed += 1;
                    }
                }
            }

            summary.bytes += bytes;
        }

        summary
    }
}

/// entries below `root` whose file name matches, parents before children
fn matching_entries(root: &Path, matcher: &GlobMatcher) -> Vec<PathBuf> {
    WalkBuilder::new(root)
        .standard_filters(false)
        .build()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(error) => {
                debug!(error = ?error, "Failed to walk scratch directory");
                None
            }
        })
        .filter(|entry| entry.depth() > 0)
        .filter(|entry| matcher.is_match(entry.file_name()))
        .map(|entry| entry.into_path())
        .collect()
}

/// bytes used by a file or a whole tree, the equivalent of `du`
pub fn disk_usage(path: &Path) -> u64 {
    WalkBuilder::new(path)
        .standard_filters(false)
        .build()
        .filter_map(Result::ok)
        .filter_map(|entry| entry.metadata().ok())
        .filter(|metadata| metadata.is_file())
        .map(|metadata| metadata.len())
        .sum()
}

/// Move a run artifact to `to`, creating its parent directories. Falls back to copy and remove
/// when both sides live on different file systems.
pub fn collect(from: &Path, to: &Path) -> io::Result<()> {
    if let Some(parent) = to.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    match fs::rename(from, to) {
        Err(error) if error.raw_os_error() == Some(nix::libc::EXDEV) => {
            debug!(from = ?from, to = ?to, "Crossing file systems, copying instead");
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
        result => result,
    }
}

fn remove(path: &Path) -> io::Result<()> {
    let metadata = path.symlink_metadata()?;

    if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}
