//! PID resolution engine.
//!
//! The accounting API reports process IDs that may be host-relative or
//! relative to a container's PID namespace, with no way to tell which
//! from the record itself. This engine resolves a raw PID to a host PID
//! through four strategies in strictly increasing cost and decreasing
//! confidence; the first success wins:
//!
//! 1. direct hit — the raw PID already exists on the host;
//! 2. namespace translation through the [`NamespaceMap`];
//! 3. verified reverse search — probe each namespaced host PID's own
//!    accelerator registration and accept a memory-footprint match;
//! 4. keyword-guided search over accelerator-affine processes, again
//!    accepting only a memory-footprint match.
//!
//! When all four miss, the raw record is dropped from the poll; it is
//! not retried.

use tracing::debug;

use crate::gpu_observer::AccountingProbe;
use crate::pid_namespace::NamespaceMap;
use crate::process_table::ProcessTable;

/// Accepted drift between the declared footprint and a probed one.
/// Registrations shift by a page or two between the two reads.
pub const MEMORY_MATCH_TOLERANCE_BYTES: u64 = 2 * 1024 * 1024;

/// Upper bound on host PIDs examined by the verified reverse search.
/// The underlying scan is O(namespaced processes) with one accounting
/// probe each; the cap keeps poll latency bounded.
pub const MAX_VERIFIED_CANDIDATES: usize = 64;

/// Upper bound on process-list entries examined by the keyword search.
pub const MAX_KEYWORD_CANDIDATES: usize = 256;

/// Which resolution strategy produced a host PID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionStrategy {
    Direct,
    Namespace,
    VerifiedSearch,
    KeywordSearch,
}

impl std::fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolutionStrategy::Direct => write!(f, "direct"),
            ResolutionStrategy::Namespace => write!(f, "namespace"),
            ResolutionStrategy::VerifiedSearch => write!(f, "verified-search"),
            ResolutionStrategy::KeywordSearch => write!(f, "keyword-search"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub host_pid: u32,
    pub strategy: ResolutionStrategy,
}

pub struct PidResolver {
    keywords: Vec<String>,
}

impl PidResolver {
    pub fn new(keywords: Vec<String>) -> Self {
        Self { keywords }
    }

    /// Resolves a raw accounting-API PID to a host PID, or `None` when
    /// every strategy misses.
    pub fn resolve(
        &self,
        raw_pid: u32,
        namespace_map: &NamespaceMap,
        declared_memory_bytes: u64,
        table: &dyn ProcessTable,
        probe: &dyn AccountingProbe,
    ) -> Option<Resolution> {
        if table.exists(raw_pid) {
            debug!(raw_pid, strategy = "direct", "resolved PID");
            return Some(Resolution {
                host_pid: raw_pid,
                strategy: ResolutionStrategy::Direct,
            });
        }

        if let Some(host_pid) = namespace_map.host_pid_of(raw_pid) {
            if table.exists(host_pid) {
                debug!(raw_pid, host_pid, strategy = "namespace", "resolved PID");
                return Some(Resolution {
                    host_pid,
                    strategy: ResolutionStrategy::Namespace,
                });
            }
        }

        // The namespace map can be stale by the time we get here, so a
        // candidate only counts when its own registration matches the
        // declared footprint.
        let mut examined = 0;
        for host_pid in namespace_map.namespaced_host_pids() {
            if examined >= MAX_VERIFIED_CANDIDATES {
                debug!(
                    raw_pid,
                    cap = MAX_VERIFIED_CANDIDATES,
                    "verified search truncated at candidate cap"
                );
                break;
            }
            examined += 1;

            if let Some(usage) = probe.query_pid(host_pid) {
                if memory_matches(usage.memory_bytes, declared_memory_bytes) {
                    debug!(
                        raw_pid,
                        host_pid,
                        strategy = "verified-search",
                        "resolved PID"
                    );
                    return Some(Resolution {
                        host_pid,
                        strategy: ResolutionStrategy::VerifiedSearch,
                    });
                }
            }
        }

        // A zero declared footprint would match every idle registration,
        // so the keyword pass only runs with a real figure to verify
        // against.
        if declared_memory_bytes > 0 {
            for candidate in table.scan_keywords(&self.keywords, MAX_KEYWORD_CANDIDATES) {
                if let Some(usage) = probe.query_pid(candidate) {
                    if memory_matches(usage.memory_bytes, declared_memory_bytes) {
                        debug!(
                            raw_pid,
                            host_pid = candidate,
                            strategy = "keyword-search",
                            "resolved PID"
                        );
                        return Some(Resolution {
                            host_pid: candidate,
                            strategy: ResolutionStrategy::KeywordSearch,
                        });
                    }
                }
            }
        }

        debug!(raw_pid, "PID resolution exhausted all strategies");
        None
    }
}

fn memory_matches(probed: u64, declared: u64) -> bool {
    probed.abs_diff(declared) <= MEMORY_MATCH_TOLERANCE_BYTES
}
