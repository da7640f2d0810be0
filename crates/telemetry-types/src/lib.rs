//! Shared telemetry type definitions
//!
//! This crate contains the record types exchanged between the collectors,
//! the attribution engine, and the storage layer: per-device snapshots,
//! per-process GPU attributions, container ownership information, and the
//! flattened per-poll sample written to the time-series store.

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

/// Container column value for processes that do not belong to any container.
pub const HOST_CONTAINER: &str = "Host";

/// Container-source column value for host-owned processes.
pub const HOST_CONTAINER_SOURCE: &str = "主機";

/// Class of a GPU process as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessKind {
    Compute,
    Graphics,
    /// Listed by both the compute and graphics enumerations (`C+G`).
    Mixed,
    Unknown,
}

impl std::fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessKind::Compute => write!(f, "Compute"),
            ProcessKind::Graphics => write!(f, "Graphics"),
            ProcessKind::Mixed => write!(f, "Compute+Graphics"),
            ProcessKind::Unknown => write!(f, "Unknown"),
        }
    }
}

/// One accelerator device at one instant.
///
/// Created fresh on every poll and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    /// Stable 0-based device ordinal
    pub index: u32,
    /// Device UUID (absent when the snapshot came from the diagnostic CLI)
    pub uuid: Option<String>,
    /// Display name
    pub name: String,
    /// GPU utilization percentage, 0..=100
    pub utilization_percent: f64,
    /// Memory in use, bytes
    pub memory_used_bytes: u64,
    /// Total memory, bytes
    pub memory_total_bytes: u64,
    /// Core temperature, degrees Celsius
    pub temperature_c: u32,
    /// Current power draw, watts
    pub power_draw_watts: Option<f64>,
    /// Enforced power limit, watts
    pub power_limit_watts: Option<f64>,
    /// Fan speed percentage
    pub fan_speed_percent: Option<u32>,
    /// Graphics clock, MHz
    pub clock_graphics_mhz: Option<u32>,
    /// Memory clock, MHz
    pub clock_memory_mhz: Option<u32>,
    /// SM clock, MHz
    pub clock_sm_mhz: Option<u32>,
    /// Current PCIe link generation
    pub pcie_gen: Option<u32>,
    /// Current PCIe link width
    pub pcie_width: Option<u32>,
    /// PCIe transmit throughput, KB/s
    pub pcie_tx_kb_s: Option<f64>,
    /// PCIe receive throughput, KB/s
    pub pcie_rx_kb_s: Option<f64>,
    /// Performance state label, e.g. `P0`
    pub performance_state: Option<String>,
}

impl DeviceSnapshot {
    /// Enforces the snapshot invariants: utilization is clamped to
    /// 0..=100 and `memory_total_bytes` is never below `memory_used_bytes`.
    pub fn normalize(mut self) -> Self {
        self.utilization_percent = self.utilization_percent.clamp(0.0, 100.0);
        if self.memory_total_bytes < self.memory_used_bytes {
            self.memory_total_bytes = self.memory_used_bytes;
        }
        self
    }

    /// Memory usage percentage, 0 when total is unknown.
    pub fn memory_percent(&self) -> f64 {
        if self.memory_total_bytes == 0 {
            return 0.0;
        }
        self.memory_used_bytes as f64 / self.memory_total_bytes as f64 * 100.0
    }
}

/// Which detection path produced a [`ProcessAttribution`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Provenance {
    /// Resolved from the structured accounting API process list.
    Accounting { device_index: u32, device_name: String },
    /// Parsed from the diagnostic CLI process table.
    DiagnosticText { kind: ProcessKind },
    /// Found by the keyword scan; `confirmed` when a direct accounting
    /// probe backed the match with real memory/utilization figures.
    Keyword { confirmed: bool },
}

/// One (process, device) pairing at one instant.
///
/// The host PID always refers to a process that existed on the observing
/// host at poll time; records whose process vanished mid-poll are dropped
/// by the attribution engine before they get here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessAttribution {
    /// Host-relative process ID
    pub host_pid: u32,
    /// Process name
    pub name: String,
    /// Full command line
    pub command: String,
    /// Device ordinal, absent for unconfirmed keyword matches
    pub device_index: Option<u32>,
    /// GPU memory footprint, bytes (0 when unknown)
    pub gpu_memory_bytes: u64,
    /// GPU utilization attributed to this process, 0..=100 (0 when unsupported)
    pub gpu_utilization_percent: u32,
    /// Host CPU usage percentage
    pub cpu_percent: f32,
    /// Host resident memory, bytes
    pub host_memory_bytes: u64,
    /// Process start time
    pub start_time: DateTime<Utc>,
    /// Detection path that produced this record
    pub provenance: Provenance,
    /// Owning container name, or [`HOST_CONTAINER`]
    pub container: String,
    /// Composed container description, e.g. `name (image)`, or
    /// [`HOST_CONTAINER_SOURCE`]
    pub container_source: String,
}

impl ProcessAttribution {
    /// Human-readable tag describing the detection path and confidence,
    /// e.g. `GPU 0 (NVIDIA RTX 4090) - 35% GPU - 2048 MiB VRAM`.
    pub fn type_tag(&self) -> String {
        let mut tag = match &self.provenance {
            Provenance::Accounting {
                device_index,
                device_name,
            } => format!("GPU {device_index} ({device_name})"),
            Provenance::DiagnosticText { kind } => format!("NVIDIA {kind}"),
            Provenance::Keyword { confirmed: false } => {
                return "Potential GPU (keyword)".to_string();
            }
            Provenance::Keyword { confirmed: true } => match self.device_index {
                Some(index) => format!("GPU {index} (keyword confirmed)"),
                None => "GPU (keyword confirmed)".to_string(),
            },
        };
        if self.gpu_utilization_percent > 0 {
            tag.push_str(&format!(" - {}% GPU", self.gpu_utilization_percent));
        }
        if self.gpu_memory_bytes > 0 {
            tag.push_str(&format!(" - {} MiB VRAM", self.gpu_memory_bytes >> 20));
        }
        if self.gpu_utilization_percent == 0 && self.gpu_memory_bytes == 0 {
            tag.push_str(" - in use");
        }
        tag
    }
}

/// Ownership information for one running container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    /// Container name
    pub name: String,
    /// Image reference
    pub image: String,
    /// Runtime status, e.g. `running`
    pub status: String,
}

impl ContainerInfo {
    /// Composed description used in the `container_source` column.
    pub fn source_label(&self) -> String {
        format!("{} ({})", self.name, self.image)
    }
}

/// Host CPU/RAM/swap sample for one poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostSample {
    pub cpu_percent: f32,
    pub cpu_count: usize,
    pub load_avg: Option<[f64; 3]>,
    pub ram_used_bytes: u64,
    pub ram_total_bytes: u64,
    pub ram_percent: f32,
    pub swap_used_bytes: u64,
    pub swap_total_bytes: u64,
    pub swap_percent: f32,
}

/// Flattened per-poll record written to the time-series store.
///
/// The GPU columns are `None` when no accelerator was observable this
/// poll, which is distinct from a present-but-idle accelerator reporting
/// zeros.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f32,
    pub ram_percent: f32,
    pub ram_used_bytes: u64,
    pub ram_total_bytes: u64,
    pub gpu_utilization_percent: Option<f64>,
    pub gpu_memory_used_bytes: Option<u64>,
    pub gpu_memory_total_bytes: Option<u64>,
    pub gpu_temperature_c: Option<u32>,
}

impl TelemetryRecord {
    /// Builds one record from the host sample and the first device
    /// snapshot, when any device was observable.
    pub fn compose(
        timestamp: DateTime<Utc>,
        host: &HostSample,
        first_device: Option<&DeviceSnapshot>,
    ) -> Self {
        Self {
            timestamp,
            cpu_percent: host.cpu_percent,
            ram_percent: host.ram_percent,
            ram_used_bytes: host.ram_used_bytes,
            ram_total_bytes: host.ram_total_bytes,
            gpu_utilization_percent: first_device.map(|d| d.utilization_percent),
            gpu_memory_used_bytes: first_device.map(|d| d.memory_used_bytes),
            gpu_memory_total_bytes: first_device.map(|d| d.memory_total_bytes),
            gpu_temperature_c: first_device.map(|d| d.temperature_c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(used: u64, total: u64, utilization: f64) -> DeviceSnapshot {
        DeviceSnapshot {
            index: 0,
            uuid: Some("gpu-0000".to_string()),
            name: "Test GPU".to_string(),
            utilization_percent: utilization,
            memory_used_bytes: used,
            memory_total_bytes: total,
            temperature_c: 40,
            power_draw_watts: None,
            power_limit_watts: None,
            fan_speed_percent: None,
            clock_graphics_mhz: None,
            clock_memory_mhz: None,
            clock_sm_mhz: None,
            pcie_gen: None,
            pcie_width: None,
            pcie_tx_kb_s: None,
            pcie_rx_kb_s: None,
            performance_state: None,
        }
    }

    fn attribution(provenance: Provenance) -> ProcessAttribution {
        ProcessAttribution {
            host_pid: 42,
            name: "python".to_string(),
            command: "python train.py".to_string(),
            device_index: Some(0),
            gpu_memory_bytes: 0,
            gpu_utilization_percent: 0,
            cpu_percent: 1.5,
            host_memory_bytes: 1024,
            start_time: DateTime::UNIX_EPOCH,
            provenance,
            container: HOST_CONTAINER.to_string(),
            container_source: HOST_CONTAINER_SOURCE.to_string(),
        }
    }

    #[test]
    fn normalize_raises_total_to_used() {
        let snap = snapshot(2048, 1024, 50.0).normalize();
        assert_eq!(
            snap.memory_total_bytes, 2048,
            "total must never be below used"
        );
    }

    #[test]
    fn normalize_clamps_utilization() {
        let snap = snapshot(0, 1024, 250.0).normalize();
        assert_eq!(snap.utilization_percent, 100.0);

        let snap = snapshot(0, 1024, -3.0).normalize();
        assert_eq!(snap.utilization_percent, 0.0);
    }

    #[test]
    fn memory_percent_handles_zero_total() {
        let snap = snapshot(0, 0, 0.0);
        assert_eq!(snap.memory_percent(), 0.0, "zero total must not divide");

        let snap = snapshot(512, 1024, 0.0);
        assert_eq!(snap.memory_percent(), 50.0);
    }

    #[test]
    fn type_tag_for_accounting_path_includes_device_and_figures() {
        let mut attr = attribution(Provenance::Accounting {
            device_index: 0,
            device_name: "Test GPU".to_string(),
        });
        attr.gpu_utilization_percent = 35;
        attr.gpu_memory_bytes = 2048 << 20;

        let tag = attr.type_tag();
        assert!(tag.contains("GPU 0 (Test GPU)"), "unexpected tag: {tag}");
        assert!(tag.contains("35% GPU"), "unexpected tag: {tag}");
        assert!(tag.contains("2048 MiB VRAM"), "unexpected tag: {tag}");
    }

    #[test]
    fn type_tag_marks_idle_accounting_entries_as_in_use() {
        let attr = attribution(Provenance::Accounting {
            device_index: 1,
            device_name: "Test GPU".to_string(),
        });
        assert!(
            attr.type_tag().ends_with("- in use"),
            "zero util and zero memory should still read as in use"
        );
    }

    #[test]
    fn type_tag_for_diagnostic_path_names_the_process_kind() {
        let mut attr = attribution(Provenance::DiagnosticText {
            kind: ProcessKind::Compute,
        });
        attr.gpu_memory_bytes = 1024 << 20;
        assert!(attr.type_tag().starts_with("NVIDIA Compute"));
    }

    #[test]
    fn type_tag_for_unconfirmed_keyword_match_is_low_confidence() {
        let attr = attribution(Provenance::Keyword { confirmed: false });
        assert_eq!(attr.type_tag(), "Potential GPU (keyword)");
    }

    #[test]
    fn compose_without_device_leaves_gpu_columns_absent() {
        let host = HostSample {
            cpu_percent: 12.5,
            cpu_count: 8,
            load_avg: None,
            ram_used_bytes: 4 << 30,
            ram_total_bytes: 16 << 30,
            ram_percent: 25.0,
            swap_used_bytes: 0,
            swap_total_bytes: 0,
            swap_percent: 0.0,
        };

        let record = TelemetryRecord::compose(Utc::now(), &host, None);
        assert!(
            record.gpu_utilization_percent.is_none(),
            "absent GPU must be None, not zero"
        );
        assert_eq!(record.cpu_percent, 12.5);
    }

    #[test]
    fn compose_with_device_fills_gpu_columns() {
        let host = HostSample {
            cpu_percent: 0.0,
            cpu_count: 1,
            load_avg: None,
            ram_used_bytes: 0,
            ram_total_bytes: 0,
            ram_percent: 0.0,
            swap_used_bytes: 0,
            swap_total_bytes: 0,
            swap_percent: 0.0,
        };
        let snap = snapshot(1 << 30, 8 << 30, 75.0);

        let record = TelemetryRecord::compose(Utc::now(), &host, Some(&snap));
        assert_eq!(record.gpu_utilization_percent, Some(75.0));
        assert_eq!(record.gpu_memory_total_bytes, Some(8 << 30));
        assert_eq!(record.gpu_temperature_c, Some(40));
    }

    #[test]
    fn container_source_label_composes_name_and_image() {
        let info = ContainerInfo {
            name: "trainer".to_string(),
            image: "pytorch/pytorch:2.1".to_string(),
            status: "running".to_string(),
        };
        assert_eq!(info.source_label(), "trainer (pytorch/pytorch:2.1)");
    }
}
