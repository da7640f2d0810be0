//! Process attribution merger.
//!
//! Top-level orchestrator for one poll: merges the accounting reader,
//! the diagnostic-text fallback, and the keyword scan into one
//! process-indexed result set, resolving namespace-ambiguous PIDs and
//! attaching container ownership. The result map is keyed by host PID,
//! so every poll's output holds at most one attribution per process.

use std::collections::BTreeMap;
use std::path::PathBuf;

use telemetry_types::DeviceSnapshot;
use telemetry_types::ProcessAttribution;
use telemetry_types::Provenance;
use telemetry_types::HOST_CONTAINER;
use telemetry_types::HOST_CONTAINER_SOURCE;
use tracing::debug;

use crate::container_index::build_index;
use crate::container_index::ContainerOwnershipIndex;
use crate::gpu_observer::AccountingProbe;
use crate::gpu_observer::GpuObserver;
use crate::gpu_observer::RawProcessRecord;
use crate::nvidia_smi::SmiProcessRecord;
use crate::nvidia_smi::SmiReader;
use crate::pid_namespace::NamespaceMap;
use crate::pid_resolver::PidResolver;
use crate::pid_resolver::MAX_KEYWORD_CANDIDATES;
use crate::process_table::ProcessTable;

pub struct EngineConfig {
    /// Root of the proc filesystem to scan, `/host/proc` when running
    /// containerized with the host's proc mounted.
    pub proc_root: PathBuf,
    /// Container runtime transport addresses, tried in order.
    pub docker_endpoints: Vec<String>,
    /// Accelerator-affinity keywords for the supplemental scan.
    pub keywords: Vec<String>,
}

pub struct AttributionEngine {
    gpu: GpuObserver,
    smi: SmiReader,
    resolver: PidResolver,
    config: EngineConfig,
}

impl AttributionEngine {
    pub fn new(gpu: GpuObserver, smi: SmiReader, config: EngineConfig) -> Self {
        let resolver = PidResolver::new(config.keywords.clone());
        Self {
            gpu,
            smi,
            resolver,
            config,
        }
    }

    /// Device snapshots from the accounting API, falling back to the
    /// diagnostic CLI. `None` when neither source is available.
    pub async fn device_snapshots(&self) -> Option<Vec<DeviceSnapshot>> {
        if let Some(snapshots) = self.gpu.device_snapshots() {
            return Some(snapshots);
        }
        self.smi.device_snapshots().await
    }

    /// One full attribution pass. Total accelerator absence yields an
    /// empty list, never an error.
    pub async fn collect(&self, table: &dyn ProcessTable) -> Vec<ProcessAttribution> {
        let namespace_map = NamespaceMap::build(&self.config.proc_root);
        let containers = build_index(&self.config.docker_endpoints).await;

        let accounting = self.gpu.raw_process_records();
        let mut results = BTreeMap::new();
        if let Some(records) = accounting.as_deref() {
            apply_accounting(
                &mut results,
                records,
                &namespace_map,
                &containers,
                table,
                &self.gpu,
                &self.resolver,
            );
        }

        // The diagnostic CLI is only worth a subprocess when the
        // accounting path produced nothing.
        if results.is_empty() {
            let diagnostic = self.smi.process_records().await;
            if let Some(records) = diagnostic.as_deref() {
                apply_diagnostic(&mut results, records, &containers, table);
            }
            if accounting.is_none() && diagnostic.is_none() {
                debug!("no GPU telemetry source available this poll");
                return Vec::new();
            }
        }

        apply_keyword_supplement(
            &mut results,
            &namespace_map,
            &containers,
            table,
            &self.gpu,
            &self.config.keywords,
        );

        results.into_values().collect()
    }
}

fn container_columns(pid: u32, containers: &ContainerOwnershipIndex) -> (String, String) {
    match containers.get(pid) {
        Some(info) => (info.name.clone(), info.source_label()),
        None => (
            HOST_CONTAINER.to_string(),
            HOST_CONTAINER_SOURCE.to_string(),
        ),
    }
}

/// Merges accounting-API records into the result map. Records whose PID
/// cannot be resolved, or whose process vanished before its host-side
/// facts could be read, are dropped from this poll.
pub(crate) fn apply_accounting(
    results: &mut BTreeMap<u32, ProcessAttribution>,
    records: &[RawProcessRecord],
    namespace_map: &NamespaceMap,
    containers: &ContainerOwnershipIndex,
    table: &dyn ProcessTable,
    probe: &dyn AccountingProbe,
    resolver: &PidResolver,
) {
    for raw in records {
        let Some(resolution) =
            resolver.resolve(raw.raw_pid, namespace_map, raw.memory_bytes, table, probe)
        else {
            continue;
        };
        let Some(host) = table.record(resolution.host_pid) else {
            continue;
        };

        let utilization = probe.accounting_utilization(raw.device_index, resolution.host_pid);
        let (container, container_source) = container_columns(resolution.host_pid, containers);

        results.insert(
            resolution.host_pid,
            ProcessAttribution {
                host_pid: resolution.host_pid,
                name: host.name,
                command: host.command,
                device_index: Some(raw.device_index),
                gpu_memory_bytes: raw.memory_bytes,
                gpu_utilization_percent: utilization,
                cpu_percent: host.cpu_percent,
                host_memory_bytes: host.memory_bytes,
                start_time: host.start_time,
                provenance: Provenance::Accounting {
                    device_index: raw.device_index,
                    device_name: raw.device_name.clone(),
                },
                container,
                container_source,
            },
        );
    }
}

/// Merges diagnostic-CLI rows. PIDs from this source are already
/// host-relative; entries already present keep their higher-confidence
/// accounting data.
pub(crate) fn apply_diagnostic(
    results: &mut BTreeMap<u32, ProcessAttribution>,
    records: &[SmiProcessRecord],
    containers: &ContainerOwnershipIndex,
    table: &dyn ProcessTable,
) {
    for record in records {
        if results.contains_key(&record.raw_pid) {
            continue;
        }
        let Some(host) = table.record(record.raw_pid) else {
            continue;
        };

        let (container, container_source) = container_columns(record.raw_pid, containers);
        results.insert(
            record.raw_pid,
            ProcessAttribution {
                host_pid: record.raw_pid,
                name: host.name,
                command: host.command,
                device_index: None,
                gpu_memory_bytes: record.memory_bytes,
                gpu_utilization_percent: 0,
                cpu_percent: host.cpu_percent,
                host_memory_bytes: host.memory_bytes,
                start_time: host.start_time,
                provenance: Provenance::DiagnosticText { kind: record.kind },
                container,
                container_source,
            },
        );
    }
}

/// Keyword-scan supplement for processes the accelerator APIs missed.
/// Each match is probed directly, trying both the literal PID and its
/// namespace-translated counterpart. Existing entries are never
/// overwritten; their GPU fields are upgraded only when the probe found
/// a strictly larger memory figure.
pub(crate) fn apply_keyword_supplement(
    results: &mut BTreeMap<u32, ProcessAttribution>,
    namespace_map: &NamespaceMap,
    containers: &ContainerOwnershipIndex,
    table: &dyn ProcessTable,
    probe: &dyn AccountingProbe,
    keywords: &[String],
) {
    for pid in table.scan_keywords(keywords, MAX_KEYWORD_CANDIDATES) {
        let usage = probe.query_pid(pid).or_else(|| {
            namespace_map
                .container_pid_of(pid)
                .and_then(|container_pid| probe.query_pid(container_pid))
        });

        if let Some(existing) = results.get_mut(&pid) {
            if let Some(usage) = usage {
                if usage.memory_bytes > existing.gpu_memory_bytes {
                    debug!(
                        pid,
                        memory_bytes = usage.memory_bytes,
                        "keyword probe found a larger footprint, upgrading GPU fields"
                    );
                    existing.gpu_memory_bytes = usage.memory_bytes;
                    existing.device_index = Some(usage.device_index);
                    if usage.utilization_percent > 0 {
                        existing.gpu_utilization_percent = usage.utilization_percent;
                    }
                }
            }
            continue;
        }

        let Some(host) = table.record(pid) else {
            continue;
        };
        let (container, container_source) = container_columns(pid, containers);

        let attribution = match usage {
            Some(usage) => ProcessAttribution {
                host_pid: pid,
                name: host.name,
                command: host.command,
                device_index: Some(usage.device_index),
                gpu_memory_bytes: usage.memory_bytes,
                gpu_utilization_percent: usage.utilization_percent,
                cpu_percent: host.cpu_percent,
                host_memory_bytes: host.memory_bytes,
                start_time: host.start_time,
                provenance: Provenance::Keyword { confirmed: true },
                container,
                container_source,
            },
            None => ProcessAttribution {
                host_pid: pid,
                name: host.name,
                command: host.command,
                device_index: None,
                gpu_memory_bytes: 0,
                gpu_utilization_percent: 0,
                cpu_percent: host.cpu_percent,
                host_memory_bytes: host.memory_bytes,
                start_time: host.start_time,
                provenance: Provenance::Keyword { confirmed: false },
                container,
                container_source,
            },
        };
        results.insert(pid, attribution);
    }
}

/// The heaviest GPU consumers first, truncated to `limit`.
pub fn top_by_gpu_memory(
    mut attributions: Vec<ProcessAttribution>,
    limit: usize,
) -> Vec<ProcessAttribution> {
    attributions.sort_by(|a, b| b.gpu_memory_bytes.cmp(&a.gpu_memory_bytes));
    attributions.truncate(limit);
    attributions
}
