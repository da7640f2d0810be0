//! Host process table.
//!
//! The seam between the attribution pipeline and the operating system's
//! process listing. The production implementation wraps [`sysinfo`];
//! tests substitute in-memory tables so existence checks, lookups, and
//! keyword scans are deterministic.

use chrono::DateTime;
use chrono::Utc;
use sysinfo::Pid;
use sysinfo::ProcessesToUpdate;
use sysinfo::System;

/// Host-side facts about one live process.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessRecord {
    pub pid: u32,
    pub name: String,
    pub command: String,
    pub cpu_percent: f32,
    pub memory_bytes: u64,
    pub start_time: DateTime<Utc>,
}

/// Read-only view of the host process list for one poll.
pub trait ProcessTable {
    /// Whether `pid` names a process that exists on the host right now.
    fn exists(&self, pid: u32) -> bool;

    /// Full record for `pid`, `None` when the process has vanished.
    fn record(&self, pid: u32) -> Option<ProcessRecord>;

    /// Scans at most `limit` entries of the process list and returns the
    /// PIDs whose name or command line contains any of `keywords`
    /// (case-insensitive).
    fn scan_keywords(&self, keywords: &[String], limit: usize) -> Vec<u32>;
}

/// Production table backed by a [`sysinfo::System`] refreshed once per
/// poll. CPU percentages are deltas against the previous refresh, so the
/// instance must live across polls.
pub struct SystemProcessTable {
    sys: System,
}

impl SystemProcessTable {
    pub fn new() -> Self {
        Self {
            sys: System::new_all(),
        }
    }

    /// Refreshes the process list, dropping dead processes.
    pub fn refresh(&mut self) {
        self.sys.refresh_processes(ProcessesToUpdate::All, true);
    }
}

impl Default for SystemProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

fn record_of(pid: u32, process: &sysinfo::Process) -> ProcessRecord {
    ProcessRecord {
        pid,
        name: process.name().to_string_lossy().into_owned(),
        command: process
            .cmd()
            .iter()
            .map(|arg| arg.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" "),
        cpu_percent: process.cpu_usage(),
        memory_bytes: process.memory(),
        start_time: DateTime::from_timestamp(process.start_time() as i64, 0)
            .unwrap_or(DateTime::UNIX_EPOCH),
    }
}

impl ProcessTable for SystemProcessTable {
    fn exists(&self, pid: u32) -> bool {
        self.sys.process(Pid::from_u32(pid)).is_some()
    }

    fn record(&self, pid: u32) -> Option<ProcessRecord> {
        self.sys
            .process(Pid::from_u32(pid))
            .map(|process| record_of(pid, process))
    }

    fn scan_keywords(&self, keywords: &[String], limit: usize) -> Vec<u32> {
        let mut matches = Vec::new();
        for (pid, process) in self.sys.processes().iter().take(limit) {
            let haystack = format!(
                "{} {}",
                process.name().to_string_lossy(),
                process
                    .cmd()
                    .iter()
                    .map(|arg| arg.to_string_lossy())
                    .collect::<Vec<_>>()
                    .join(" ")
            )
            .to_lowercase();

            if keywords
                .iter()
                .any(|keyword| haystack.contains(&keyword.to_lowercase()))
            {
                matches.push(pid.as_u32());
            }
        }
        matches
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::testing::*;
    use super::*;

    #[test]
    fn mock_table_existence_and_lookup() {
        let table = MockTable::with_processes([record(42, "python", "python train.py")]);

        assert!(table.exists(42));
        assert!(!table.exists(43));
        assert_eq!(table.record(42).map(|r| r.name), Some("python".to_string()));
        assert!(table.record(43).is_none());
    }

    #[test]
    fn mock_table_scan_respects_limit_and_counts_calls() {
        let table = MockTable::default().scan_returning(vec![1, 2, 3, 4]);

        assert_eq!(table.scan_keywords(&[], 2), vec![1, 2]);
        assert_eq!(table.scan_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn system_table_sees_our_own_process() {
        let mut table = SystemProcessTable::new();
        table.refresh();

        let pid = std::process::id();
        assert!(table.exists(pid), "the test process itself must be listed");
        let record = table.record(pid).expect("own record");
        assert_eq!(record.pid, pid);
        assert!(!record.name.is_empty());
    }

    #[test]
    fn system_table_scan_finds_our_own_name() {
        let mut table = SystemProcessTable::new();
        table.refresh();

        let pid = std::process::id();
        let name = table.record(pid).expect("own record").name.to_lowercase();
        let matches = table.scan_keywords(&[name], usize::MAX);
        assert!(
            matches.contains(&pid),
            "keyword scan should match the test binary's own name"
        );
    }
}
