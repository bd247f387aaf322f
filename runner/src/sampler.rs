use parking_lot::Mutex;
use std::{
    fs,
    sync::{
        mpsc::{self, RecvTimeoutError, Sender},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{debug, warn};

/// Peak resident memory seen while a child was running
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub peak_kib: u64,
    pub samples: usize,
}

/// Background poller of a child's resident set size. Stopped cooperatively once the child
/// has exited; it never touches the child itself.
pub struct MemorySampler {
    stop: Sender<()>,
    handle: JoinHandle<()>,
    stats: Arc<Mutex<MemoryStats>>,
}

impl MemorySampler {
    pub fn start(pid: u32, interval: Duration) -> Self {
        let (stop, stopped) = mpsc::channel();
        let stats = Arc::new(Mutex::new(MemoryStats::default()));
        let shared = stats.clone();

        let handle = thread::spawn(move || loop {
            match resident_kib(pid) {
                Some(kib) => {
                    let mut stats = shared.lock();
                    stats.peak_kib = stats.peak_kib.max(kib);
                    stats.samples += 1;
                }
                None => debug!(pid, "No resident memory reading"),
            }

            match stopped.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => continue,
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        });

        Self {
            stop,
            handle,
            stats,
        }
    }

    pub fn stop(self) -> MemoryStats {
        // the sampler may already be gone, in which case there's nobody to notify
        let _ = self.stop.send(());

        if self.handle.join().is_err() {
            warn!("Memory sampler panicked, its readings are incomplete");
        }

        let stats = *self.stats.lock();
        stats
    }
}

/// `VmRSS` of a process in KiB, `None` if the process is gone or the kernel doesn't report it
pub fn resident_kib(pid: u32) -> Option<u64> {
    let status = fs::read_to_string(format!("/proc/{pid}/status")).ok()?;

    status
        .lines()
        .find(|line| line.starts_with("VmRSS:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kib| kib.parse().ok())
}
