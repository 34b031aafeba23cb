//! Process CPU usage
//!
//! `CpuMonitor` samples this process's CPU load whenever a report line is
//! produced and keeps a running mean for the summary line. Readings are
//! normalised to the whole machine, so a process saturating every core reads
//! 100%.

use sysinfo::{Pid, System};
use tracing::debug;

pub struct CpuMonitor {
    system: System,
    pid: Pid,
    cores: f64,
    samples: u64,
    total: f64,
}

impl CpuMonitor {
    pub fn new() -> Self {
        let pid = Pid::from_u32(std::process::id());
        let mut system = System::new();
        // The first refresh only establishes a baseline.
        system.refresh_cpu();
        system.refresh_process(pid);
        Self {
            system,
            pid,
            cores: num_cpus::get().max(1) as f64,
            samples: 0,
            total: 0.0,
        }
    }

    /// CPU load since the previous reading, in percent of the machine.
    pub fn instant(&mut self) -> f64 {
        self.system.refresh_cpu();
        if !self.system.refresh_process(self.pid) {
            debug!("Process {} not found while sampling CPU", self.pid);
            return 0.0;
        }
        let usage = self
            .system
            .process(self.pid)
            .map_or(0.0, |process| process.cpu_usage() as f64);
        let percent = (usage / self.cores).clamp(0.0, 100.0);
        self.samples += 1;
        self.total += percent;
        percent
    }

    /// Mean of the readings taken since the last reset, or a fresh reading
    /// when none were taken.
    pub fn average(&mut self) -> f64 {
        if self.samples == 0 {
            return self.instant();
        }
        self.total / self.samples as f64
    }

    pub fn reset(&mut self) {
        self.samples = 0;
        self.total = 0.0;
    }
}

impl Default for CpuMonitor {
    fn default() -> Self {
        Self::new()
    }
}
