use std::{
    collections::BTreeSet,
    fs, io,
    path::PathBuf,
    thread,
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, error, info, instrument};

#[derive(Error, Debug)]
pub enum TopologyError {
    #[error("Failed to set cpu{cpu} online={online}")]
    SetOnline {
        cpu: usize,
        online: bool,
        #[source]
        source: io::Error,
    },
    #[error("Failed to read the cpu range from {0:?}")]
    Possible(PathBuf, #[source] io::Error),
    #[error("Malformed cpu range '{0}'")]
    MalformedRange(String),
    #[error("Can't keep {target} cores online, only {available} physical cores are known")]
    InvalidTarget { target: usize, available: usize },
}

/// Online/offline control over the logical cpus of the machine. Even numbered cpus are
/// treated as distinct physical cores, odd ones as their hyperthread siblings.
#[derive(Debug, Clone)]
pub struct CpuTopology {
    sysfs: PathBuf,
    logical: usize,
    settle: Duration,
}

impl CpuTopology {
    /// `logical` defaults to the size of `<sysfs>/possible`
    pub fn new(
        sysfs: impl Into<PathBuf>,
        logical: Option<usize>,
        settle: Duration,
    ) -> Result<Self, TopologyError> {
        let sysfs = sysfs.into();
        let logical = match logical {
            Some(logical) => logical,
            None => {
                let possible = sysfs.join("possible");
                let range = fs::read_to_string(&possible)
                    .map_err(|e| TopologyError::Possible(possible, e))?;

                parse_cpu_range(&range)?.len()
            }
        };

        Ok(Self {
            sysfs,
            logical,
            settle,
        })
    }

    pub fn logical(&self) -> usize {
        self.logical
    }

    fn online_file(&self, cpu: usize) -> PathBuf {
        self.sysfs.join(format!("cpu{cpu}")).join("online")
    }

    fn set_online(&self, cpu: usize, online: bool) -> Result<(), TopologyError> {
        fs::write(self.online_file(cpu), if online { "1" } else { "0" }).map_err(|source| {
            TopologyError::SetOnline {
                cpu,
                online,
                source,
            }
        })
    }

    /// The set of currently online cpus. cpu0 has no online switch and is always online.
    pub fn online(&self) -> BTreeSet<usize> {
        (0..self.logical)
            .filter(|cpu| {
                *cpu == 0
                    || fs::read_to_string(self.online_file(*cpu))
                        .map(|state| state.trim() == "1")
                        .unwrap_or(false)
            })
            .collect()
    }

    /// cpu0 plus every even numbered cpu
    pub fn physical(&self) -> usize {
        1 + (1..self.logical).filter(|cpu| cpu % 2 == 0).count()
    }

    /// Keep `target` physical cores online: cpu0 plus the first `target - 1` even cpus. Every
    /// other cpu is taken offline. Returns the online set.
    #[instrument(skip(self), level = "info")]
    pub fn restrict(&self, target: usize) -> Result<BTreeSet<usize>, TopologyError> {
        let available = self.physical();
        if target == 0 || target > available {
            return Err(TopologyError::InvalidTarget { target, available });
        }

        // core 0 is always alive
        let mut alive = 1;

        for cpu in 1..self.logical {
            let online = cpu % 2 == 0 && alive < target;
            if online {
                alive += 1;
            }

            self.set_online(cpu, online)?;
        }

        let online = self.online();
        info!("Set CPU done, alive #cores: {}", online.len());

        Ok(online)
    }

    /// Bring every cpu back online and give the kernel time to settle. All cpus are attempted
    /// even if one fails, the first error is returned.
    #[instrument(skip(self), level = "info")]
    pub fn restore_all(&self) -> Result<(), TopologyError> {
        let mut first_error = None;

        for cpu in 1..self.logical {
            if let Err(e) = self.set_online(cpu, true) {
                error!("{e}");
                first_error.get_or_insert(e);
            }
        }

        thread::sleep(self.settle);
        info!("Restored CPU, alive #cores: {}", self.online().len());

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Restore, then restrict to `target` cores. The returned guard restores all cpus when it
    /// is dropped, also when the restriction itself failed halfway.
    pub fn guard(self, target: usize) -> Result<TopologyGuard, TopologyError> {
        let guard = TopologyGuard { topology: self };

        guard.topology.restore_all()?;
        guard.topology.restrict(target)?;

        Ok(guard)
    }
}

/// Keeps the machine restricted while alive
#[derive(Debug)]
pub struct TopologyGuard {
    topology: CpuTopology,
}

impl TopologyGuard {
    pub fn topology(&self) -> &CpuTopology {
        &self.topology
    }
}

impl Drop for TopologyGuard {
    fn drop(&mut self) {
        match self.topology.restore_all() {
            Ok(()) => debug!("Topology restored"),
            Err(error) => error!(error = ?error, "Failed to restore cpu topology"),
        }
    }
}

/// Parse a kernel cpu list such as `0-3,8,10-11`
pub fn parse_cpu_range(range: &str) -> Result<BTreeSet<usize>, TopologyError> {
    let malformed = || TopologyError::MalformedRange(range.trim().to_owned());
    let mut cpus = BTreeSet::new();

    for part in range.trim().split(',').filter(|part| !part.is_empty()) {
        match part.split_once('-') {
            Some((low, high)) => {
                let low: usize = low.parse().map_err(|_| malformed())?;
                let high: usize = high.parse().map_err(|_| malformed())?;
                cpus.extend(low..=high);
            }
            None => {
                cpus.insert(part.parse().map_err(|_| malformed())?);
            }
        }
    }

    Ok(cpus)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_sysfs(logical: usize) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("possible"), format!("0-{}\n", logical - 1)).unwrap();

        for cpu in 1..logical {
            let cpu_dir = dir.path().join(format!("cpu{cpu}"));
            fs::create_dir_all(&cpu_dir).unwrap();
            fs::write(cpu_dir.join("online"), "1").unwrap();
        }

        dir
    }

    fn topology(dir: &tempfile::TempDir) -> CpuTopology {
        CpuTopology::new(dir.path(), None, Duration::ZERO).unwrap()
    }

    #[test]
    fn restrict_keeps_even_cpus() {
        let dir = fake_sysfs(8);
        let topology = topology(&dir);

        assert_eq!(topology.logical(), 8);
        assert_eq!(topology.physical(), 4);
        assert_eq!(
            topology.restrict(4).unwrap(),
            BTreeSet::from([0, 2, 4, 6])
        );
        assert_eq!(topology.restrict(1).unwrap(), BTreeSet::from([0]));
    }

    #[test]
    fn restrict_then_restore_leaves_everything_online() {
        let dir = fake_sysfs(8);
        let topology = topology(&dir);

        topology.restrict(4).unwrap();
        topology.restore_all().unwrap();

        assert_eq!(topology.online(), (0..8).collect::<BTreeSet<_>>());
    }

    #[test]
    fn guard_restores_on_drop() {
        let dir = fake_sysfs(6);
        let guard = topology(&dir).guard(2).unwrap();

        assert_eq!(guard.topology().online(), BTreeSet::from([0, 2]));
        drop(guard);

        assert_eq!(topology(&dir).online(), (0..6).collect::<BTreeSet<_>>());
    }

    #[test]
    fn rejects_more_cores_than_even_cpus() {
        let dir = fake_sysfs(8);

        assert!(matches!(
            topology(&dir).restrict(6),
            Err(TopologyError::InvalidTarget {
                target: 6,
                available: 4
            })
        ));
        // nothing was taken offline
        assert_eq!(topology(&dir).online().len(), 8);
    }

    #[test]
    fn rejects_impossible_targets() {
        let dir = fake_sysfs(4);

        assert!(matches!(
            topology(&dir).restrict(0),
            Err(TopologyError::InvalidTarget { .. })
        ));
        assert!(matches!(
            topology(&dir).restrict(3),
            Err(TopologyError::InvalidTarget { .. })
        ));
    }

    #[test]
    fn parses_cpu_ranges() {
        assert_eq!(parse_cpu_range("0-3,8,10-11\n").unwrap().len(), 7);
        assert_eq!(parse_cpu_range("0").unwrap(), BTreeSet::from([0]));
        assert!(parse_cpu_range("0-x").is_err());
    }
}
