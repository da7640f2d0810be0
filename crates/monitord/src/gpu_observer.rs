//! Accelerator accounting reader.
//!
//! Wraps the structured NVML management API. When NVML fails to
//! initialize at startup every query reports "unavailable" and the
//! attribution engine falls back to the diagnostic CLI entirely; when an
//! individual device or process query fails mid-poll, only that data
//! point degrades to its default.

use std::collections::HashSet;

use nvml_wrapper::enum_wrappers::device::Clock;
use nvml_wrapper::enum_wrappers::device::PcieUtilCounter;
use nvml_wrapper::enum_wrappers::device::TemperatureSensor;
use nvml_wrapper::enums::device::UsedGpuMemory;
use nvml_wrapper::Device;
use nvml_wrapper::Nvml;
use telemetry_types::DeviceSnapshot;
use telemetry_types::ProcessKind;
use tracing::debug;
use tracing::warn;

/// One process registered against one device, exactly as the accounting
/// API reported it. The PID may be host-relative or namespace-relative;
/// resolution is the PID resolution engine's job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawProcessRecord {
    pub device_index: u32,
    pub device_name: String,
    pub raw_pid: u32,
    pub memory_bytes: u64,
    pub kind: ProcessKind,
}

/// Result of a per-PID accounting probe across all devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidGpuUsage {
    pub device_index: u32,
    pub device_name: String,
    pub memory_bytes: u64,
    pub utilization_percent: u32,
}

/// Per-PID accounting query, the seam the PID resolution engine and the
/// keyword supplement probe through. Production implementation is
/// [`GpuObserver`]; tests substitute mocks.
pub trait AccountingProbe {
    /// Looks a PID up across every device's process registrations.
    fn query_pid(&self, pid: u32) -> Option<PidGpuUsage>;

    /// Accounting-derived utilization for a (device, pid) pair; 0 when
    /// accounting mode is disabled or the query is unsupported.
    fn accounting_utilization(&self, _device_index: u32, _pid: u32) -> u32 {
        0
    }
}

pub struct GpuObserver {
    nvml: Option<Nvml>,
}

impl GpuObserver {
    /// Initializes NVML, retrying with an explicit library path before
    /// giving up. A failed initialization is not an error: the observer
    /// stays in the "unavailable" state for the life of the process.
    pub fn init() -> Self {
        let nvml = match Nvml::init() {
            Ok(nvml) => Some(nvml),
            Err(_) => {
                warn!("standard NVML init failed, trying explicit library path");
                match Nvml::builder()
                    .lib_path(std::ffi::OsStr::new("libnvidia-ml.so.1"))
                    .init()
                {
                    Ok(nvml) => Some(nvml),
                    Err(e) => {
                        debug!(error = %e, "NVML unavailable");
                        None
                    }
                }
            }
        };
        if nvml.is_some() {
            debug!("NVML initialized");
        }
        Self { nvml }
    }

    /// An observer that reports "unavailable" for every query.
    pub fn disabled() -> Self {
        Self { nvml: None }
    }

    pub fn is_available(&self) -> bool {
        self.nvml.is_some()
    }

    /// Snapshots every device. `None` means the accounting subsystem is
    /// unavailable this poll, which is distinct from zero devices.
    pub fn device_snapshots(&self) -> Option<Vec<DeviceSnapshot>> {
        let nvml = self.nvml.as_ref()?;
        let count = match nvml.device_count() {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "device enumeration failed");
                return None;
            }
        };

        let mut snapshots = Vec::with_capacity(count as usize);
        for index in 0..count {
            let device = match nvml.device_by_index(index) {
                Ok(device) => device,
                Err(e) => {
                    warn!(index, error = %e, "skipping unreadable device");
                    continue;
                }
            };
            snapshots.push(snapshot_device(index, &device));
        }
        Some(snapshots)
    }

    /// Raw process records across every device, compute-class and
    /// graphics-class concatenated. Either enumeration may be
    /// unsupported on a given driver; that is treated as empty.
    pub fn raw_process_records(&self) -> Option<Vec<RawProcessRecord>> {
        let nvml = self.nvml.as_ref()?;
        let count = nvml.device_count().ok()?;

        let mut records = Vec::new();
        for index in 0..count {
            let Ok(device) = nvml.device_by_index(index) else {
                continue;
            };
            let name = device_name(&device, index);

            let mut seen = HashSet::new();
            let compute = device.running_compute_processes().unwrap_or_default();
            let graphics = device.running_graphics_processes().unwrap_or_default();

            for (info, kind) in compute
                .into_iter()
                .map(|p| (p, ProcessKind::Compute))
                .chain(graphics.into_iter().map(|p| (p, ProcessKind::Graphics)))
            {
                if !seen.insert(info.pid) {
                    continue;
                }
                records.push(RawProcessRecord {
                    device_index: index,
                    device_name: name.clone(),
                    raw_pid: info.pid,
                    memory_bytes: match info.used_gpu_memory {
                        UsedGpuMemory::Used(bytes) => bytes,
                        UsedGpuMemory::Unavailable => 0,
                    },
                    kind,
                });
            }
        }
        Some(records)
    }
}

impl AccountingProbe for GpuObserver {
    fn query_pid(&self, pid: u32) -> Option<PidGpuUsage> {
        let nvml = self.nvml.as_ref()?;
        let count = nvml.device_count().ok()?;

        for index in 0..count {
            let Ok(device) = nvml.device_by_index(index) else {
                continue;
            };

            let registered = device
                .running_compute_processes()
                .unwrap_or_default()
                .into_iter()
                .chain(device.running_graphics_processes().unwrap_or_default())
                .find(|info| info.pid == pid);

            if let Some(info) = registered {
                return Some(PidGpuUsage {
                    device_index: index,
                    device_name: device_name(&device, index),
                    memory_bytes: match info.used_gpu_memory {
                        UsedGpuMemory::Used(bytes) => bytes,
                        UsedGpuMemory::Unavailable => 0,
                    },
                    utilization_percent: self.accounting_utilization(index, pid),
                });
            }
        }
        None
    }

    fn accounting_utilization(&self, device_index: u32, pid: u32) -> u32 {
        let Some(nvml) = self.nvml.as_ref() else {
            return 0;
        };
        let Ok(device) = nvml.device_by_index(device_index) else {
            return 0;
        };
        if !device.is_accounting_enabled().unwrap_or(false) {
            return 0;
        }
        match device.accounting_stats_for(pid) {
            Ok(stats) if stats.is_running => stats.gpu_utilization.unwrap_or(0),
            _ => 0,
        }
    }
}

fn device_name(device: &Device<'_>, index: u32) -> String {
    device.name().unwrap_or_else(|_| format!("GPU {index}"))
}

/// Reads one device's snapshot, degrading each unsupported field to its
/// default instead of failing the device.
fn snapshot_device(index: u32, device: &Device<'_>) -> DeviceSnapshot {
    let (memory_used, memory_total) = device
        .memory_info()
        .map(|info| (info.used, info.total))
        .unwrap_or((0, 0));

    DeviceSnapshot {
        index,
        uuid: device.uuid().ok().map(|uuid| uuid.to_lowercase()),
        name: device_name(device, index),
        utilization_percent: device
            .utilization_rates()
            .map(|util| util.gpu as f64)
            .unwrap_or(0.0),
        memory_used_bytes: memory_used,
        memory_total_bytes: memory_total,
        temperature_c: device.temperature(TemperatureSensor::Gpu).unwrap_or(0),
        power_draw_watts: device.power_usage().ok().map(|mw| mw as f64 / 1000.0),
        power_limit_watts: device
            .power_management_limit()
            .ok()
            .map(|mw| mw as f64 / 1000.0),
        fan_speed_percent: device.fan_speed(0).ok(),
        clock_graphics_mhz: device.clock_info(Clock::Graphics).ok(),
        clock_memory_mhz: device.clock_info(Clock::Memory).ok(),
        clock_sm_mhz: device.clock_info(Clock::SM).ok(),
        pcie_gen: device.current_pcie_link_gen().ok(),
        pcie_width: device.current_pcie_link_width().ok(),
        pcie_tx_kb_s: device
            .pcie_throughput(PcieUtilCounter::Send)
            .ok()
            .map(|kb| kb as f64),
        pcie_rx_kb_s: device
            .pcie_throughput(PcieUtilCounter::Receive)
            .ok()
            .map(|kb| kb as f64),
        performance_state: device
            .performance_state()
            .ok()
            .map(|state| format!("P{}", state.as_c())),
    }
    .normalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_observer_reports_unavailable_everywhere() {
        let observer = GpuObserver::disabled();

        assert!(!observer.is_available());
        assert!(
            observer.device_snapshots().is_none(),
            "unavailable must be None, not an empty list"
        );
        assert!(observer.raw_process_records().is_none());
        assert!(observer.query_pid(1234).is_none());
        assert_eq!(observer.accounting_utilization(0, 1234), 0);
    }

    #[test]
    fn accounting_probe_default_utilization_is_zero() {
        struct Fixed;
        impl AccountingProbe for Fixed {
            fn query_pid(&self, _pid: u32) -> Option<PidGpuUsage> {
                None
            }
        }
        assert_eq!(Fixed.accounting_utilization(3, 42), 0);
    }
}
