//! Process resource snapshot
//!
//! Collected with sysinfo on every heartbeat. The collector keeps one
//! `System` around so CPU usage is measured between two refreshes instead of
//! reading zero on a fresh instance.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessesToUpdate, System};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessSnapshot {
    pub pid: u32,
    /// Process CPU usage in percent (may exceed 100 on multi-core hosts).
    pub cpu_usage: f32,
    pub system_cpu_usage: f32,
    /// Resident memory of the process in bytes.
    pub memory_bytes: u64,
    pub system_total_memory: u64,
    pub system_used_memory: u64,
    pub thread_count: u32,
}

pub struct ProcessCollector {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl ProcessCollector {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            pid: sysinfo::get_current_pid().ok(),
        }
    }

    pub fn collect(&self) -> ProcessSnapshot {
        let mut system = self.system.lock();
        system.refresh_memory();
        system.refresh_cpu_usage();

        let mut snapshot = ProcessSnapshot {
            system_cpu_usage: system.global_cpu_usage(),
            system_total_memory: system.total_memory(),
            system_used_memory: system.used_memory(),
            thread_count: thread_count(),
            ..Default::default()
        };

        if let Some(pid) = self.pid {
            system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
            if let Some(process) = system.process(pid) {
                snapshot.pid = pid.as_u32();
                snapshot.cpu_usage = process.cpu_usage();
                snapshot.memory_bytes = process.memory();
            }
        }
        snapshot
    }
}

impl Default for ProcessCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "linux")]
fn thread_count() -> u32 {
    std::fs::read_dir("/proc/self/task")
        .map(|entries| entries.count() as u32)
        .unwrap_or(0)
}

#[cfg(not(target_os = "linux"))]
fn thread_count() -> u32 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_reports_own_process() {
        let collector = ProcessCollector::new();
        let snapshot = collector.collect();
        assert_eq!(snapshot.pid, std::process::id());
        assert!(snapshot.system_total_memory > 0);
        assert!(snapshot.system_used_memory <= snapshot.system_total_memory);
    }
}
