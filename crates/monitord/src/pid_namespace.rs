//! PID namespace resolver.
//!
//! Builds a bidirectional map between container-local and host-relative
//! process IDs by scanning every process's `status` pseudo-file for its
//! `NSpid:` record. The record lists the process's PID in each namespace
//! from outermost (host) to innermost (container); processes that only
//! live in the observer's namespace have a single entry and need no
//! translation.
//!
//! The map is rebuilt fresh on every poll and consumed read-only.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use tracing::debug;

/// Bidirectional container-PID ↔ host-PID map for one poll.
#[derive(Debug, Default, Clone)]
pub struct NamespaceMap {
    container_to_host: HashMap<u32, u32>,
    host_to_container: HashMap<u32, u32>,
}

impl NamespaceMap {
    /// Scans `proc_root` and records both directions for every process
    /// whose `NSpid:` record has at least two entries.
    ///
    /// Individual process read failures (permission denied, process
    /// exited mid-scan, malformed record) skip that process only. An
    /// unreadable `proc_root` yields an empty map, which is a valid
    /// result on a non-containerized host.
    pub fn build(proc_root: &Path) -> Self {
        let mut map = Self::default();

        let entries = match fs::read_dir(proc_root) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(proc_root = %proc_root.display(), error = %e, "cannot read proc root");
                return map;
            }
        };

        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.parse::<u32>().is_err() {
                continue;
            }

            let Ok(status) = fs::read_to_string(entry.path().join("status")) else {
                continue;
            };
            if let Some((host_pid, container_pid)) = parse_nspid(&status) {
                map.insert(container_pid, host_pid);
            }
        }

        debug!(mappings = map.len(), "built PID namespace map");
        map
    }

    /// Builds a map from explicit `(container_pid, host_pid)` pairs.
    pub fn from_pairs<I: IntoIterator<Item = (u32, u32)>>(pairs: I) -> Self {
        let mut map = Self::default();
        for (container_pid, host_pid) in pairs {
            map.insert(container_pid, host_pid);
        }
        map
    }

    fn insert(&mut self, container_pid: u32, host_pid: u32) {
        self.container_to_host.insert(container_pid, host_pid);
        self.host_to_container.insert(host_pid, container_pid);
    }

    /// Translates a container-relative PID to its host PID.
    pub fn host_pid_of(&self, container_pid: u32) -> Option<u32> {
        self.container_to_host.get(&container_pid).copied()
    }

    /// Translates a host PID to its container-relative PID.
    pub fn container_pid_of(&self, host_pid: u32) -> Option<u32> {
        self.host_to_container.get(&host_pid).copied()
    }

    /// Host PIDs of every namespaced process seen by the scan.
    pub fn namespaced_host_pids(&self) -> impl Iterator<Item = u32> + '_ {
        self.host_to_container.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.container_to_host.len()
    }

    pub fn is_empty(&self) -> bool {
        self.container_to_host.is_empty()
    }
}

/// Extracts `(host_pid, container_pid)` from a status file's `NSpid:`
/// line. The first entry is the outermost (host-relative) PID, the last
/// the innermost. Returns `None` for single-entry records (process not
/// namespaced) and for missing or malformed lines.
fn parse_nspid(status: &str) -> Option<(u32, u32)> {
    let line = status
        .lines()
        .find_map(|line| line.strip_prefix("NSpid:"))?;

    let pids: Vec<u32> = line
        .split_whitespace()
        .map(str::parse)
        .collect::<Result<_, _>>()
        .ok()?;

    match (pids.first(), pids.last()) {
        (Some(&host), Some(&container)) if pids.len() >= 2 => Some((host, container)),
        _ => None,
    }
}
