use log::debug;
use sysinfo::{CpuRefreshKind, RefreshKind, System};

use crate::config::PerformanceTier;

/// CPU budget for one encode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourcePlan {
    /// Passed to the encoder as `-threads`
    pub threads: usize,
    /// Logical CPUs on the machine
    pub total_cores: usize,
    /// Unix nice value to apply after spawn
    pub niceness: i32,
}

impl ResourcePlan {
    pub fn for_tier(tier: PerformanceTier, total_cores: usize) -> Self {
        let total_cores = total_cores.max(1);
        let (threads, niceness) = match tier {
            PerformanceTier::Background => (1, 10),
            PerformanceTier::Standard => (((total_cores as f64) * 0.75).floor().max(1.0) as usize, 0),
            PerformanceTier::Maximum => (total_cores, -5),
        };
        Self {
            threads,
            total_cores,
            niceness,
        }
    }

    /// Plan for this machine
    pub fn detect(tier: PerformanceTier) -> Self {
        Self::for_tier(tier, logical_cores())
    }

    /// Pin and reprioritise a running encoder. Failures are logged and ignored.
    pub fn apply(&self, pid: u32) {
        #[cfg(target_os = "linux")]
        if self.threads < self.total_cores {
            set_affinity(pid, self.threads);
        }
        #[cfg(unix)]
        if self.niceness != 0 {
            set_niceness(pid, self.niceness);
        }
        #[cfg(not(unix))]
        debug!("Process priority hints are not supported here (pid {})", pid);
    }
}

fn logical_cores() -> usize {
    let sys = System::new_with_specifics(RefreshKind::new().with_cpu(CpuRefreshKind::new()));
    match sys.cpus().len() {
        0 => std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
        n => n,
    }
}

#[cfg(target_os = "linux")]
fn set_affinity(pid: u32, cores: usize) {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let mut set = CpuSet::new();
    for core in 0..cores {
        if let Err(e) = set.set(core) {
            debug!("Cannot add core {} to affinity set: {}", core, e);
            return;
        }
    }
    if let Err(e) = sched_setaffinity(Pid::from_raw(pid as i32), &set) {
        debug!("Failed to pin pid {} to {} core(s): {}", pid, cores, e);
    }
}

#[cfg(unix)]
fn set_niceness(pid: u32, niceness: i32) {
    // SAFETY: setpriority only reads its scalar arguments
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, pid as libc::id_t, niceness) };
    if rc != 0 {
        debug!(
            "Failed to set priority {} on pid {}: {}",
            niceness,
            pid,
            std::io::Error::last_os_error()
        );
    }
}
