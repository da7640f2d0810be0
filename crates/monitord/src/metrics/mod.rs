//! Metrics batching.
//!
//! Accumulates per-device and per-process figures across polls and
//! emits one averaged line per series every `batch_size` polls. The
//! lines are returned to the caller, which logs them through the
//! `metrics` tracing target so the metrics file layer picks them up.

use std::collections::HashMap;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use telemetry_types::DeviceSnapshot;
use telemetry_types::ProcessAttribution;

pub mod encoders;

use encoders::create_encoder;
use encoders::MetricsEncoder;

#[derive(Default)]
struct AccumulatedDeviceMetrics {
    utilization_percent: f64,
    temperature_c: f64,
    memory_bytes: u64,
    power_watts: f64,
    count: usize,
}

#[derive(Default)]
struct AccumulatedProcessMetrics {
    gpu_memory_bytes: u64,
    gpu_utilization_percent: f64,
    cpu_percent: f64,
    container: String,
    count: usize,
}

pub struct MetricsBatcher {
    encoder: Box<dyn MetricsEncoder + Send + Sync>,
    batch_size: usize,
    counter: usize,
    devices: HashMap<String, AccumulatedDeviceMetrics>,
    processes: HashMap<u32, AccumulatedProcessMetrics>,
}

impl MetricsBatcher {
    pub fn new(format: &str, batch_size: usize) -> Self {
        Self {
            encoder: create_encoder(format),
            batch_size: batch_size.max(1),
            counter: 0,
            devices: HashMap::new(),
            processes: HashMap::new(),
        }
    }

    /// Folds one poll into the accumulators. Returns the encoded lines
    /// when the batch window closed, `None` otherwise.
    pub fn observe(
        &mut self,
        devices: &[DeviceSnapshot],
        processes: &[ProcessAttribution],
    ) -> Option<Vec<String>> {
        for device in devices {
            let key = device
                .uuid
                .clone()
                .unwrap_or_else(|| format!("gpu-{}", device.index));
            let acc = self.devices.entry(key).or_default();
            acc.utilization_percent += device.utilization_percent;
            acc.temperature_c += device.temperature_c as f64;
            acc.memory_bytes += device.memory_used_bytes;
            acc.power_watts += device.power_draw_watts.unwrap_or(0.0);
            acc.count += 1;
        }

        for process in processes {
            let acc = self.processes.entry(process.host_pid).or_default();
            acc.gpu_memory_bytes += process.gpu_memory_bytes;
            acc.gpu_utilization_percent += process.gpu_utilization_percent as f64;
            acc.cpu_percent += process.cpu_percent as f64;
            acc.container = process.container.clone();
            acc.count += 1;
        }

        self.counter += 1;
        if self.counter >= self.batch_size {
            Some(self.flush())
        } else {
            None
        }
    }

    fn flush(&mut self) -> Vec<String> {
        let timestamp = current_time_nanos();
        let mut lines = Vec::new();

        for (key, acc) in &self.devices {
            if acc.count == 0 {
                continue;
            }
            lines.push(self.encoder.encode_device_metrics(
                key,
                acc.utilization_percent / acc.count as f64,
                acc.memory_bytes / acc.count as u64,
                acc.temperature_c / acc.count as f64,
                acc.power_watts / acc.count as f64,
                timestamp,
            ));
        }

        for (pid, acc) in &self.processes {
            if acc.count == 0 {
                continue;
            }
            lines.push(self.encoder.encode_process_metrics(
                *pid,
                &acc.container,
                acc.gpu_memory_bytes / acc.count as u64,
                acc.gpu_utilization_percent / acc.count as f64,
                acc.cpu_percent / acc.count as f64,
                timestamp,
            ));
        }

        self.devices.clear();
        self.processes.clear();
        self.counter = 0;
        lines
    }
}

fn current_time_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before epoch")
        .as_nanos() as i64
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;
    use telemetry_types::Provenance;

    use super::*;

    fn device(index: u32, utilization: f64, memory: u64) -> DeviceSnapshot {
        DeviceSnapshot {
            index,
            uuid: Some(format!("uuid-{index}")),
            name: "Test GPU".to_string(),
            utilization_percent: utilization,
            memory_used_bytes: memory,
            memory_total_bytes: memory * 2,
            temperature_c: 60,
            power_draw_watts: Some(100.0),
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

    fn process(pid: u32, gpu_memory: u64) -> ProcessAttribution {
        ProcessAttribution {
            host_pid: pid,
            name: "python".to_string(),
            command: "python".to_string(),
            device_index: Some(0),
            gpu_memory_bytes: gpu_memory,
            gpu_utilization_percent: 10,
            cpu_percent: 4.0,
            host_memory_bytes: 1 << 20,
            start_time: DateTime::UNIX_EPOCH,
            provenance: Provenance::Keyword { confirmed: false },
            container: "trainer".to_string(),
            container_source: "trainer (img)".to_string(),
        }
    }

    #[test]
    fn emits_nothing_until_the_batch_window_closes() {
        let mut batcher = MetricsBatcher::new("influx", 3);
        assert!(batcher.observe(&[device(0, 50.0, 100)], &[]).is_none());
        assert!(batcher.observe(&[device(0, 70.0, 200)], &[]).is_none());

        let lines = batcher
            .observe(&[device(0, 60.0, 300)], &[])
            .expect("third observe closes the window");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("device=uuid-0"));
        assert!(lines[0].contains("utilization_percent=60"), "{}", lines[0]);
        assert!(lines[0].contains("memory_bytes=200u"), "{}", lines[0]);
    }

    #[test]
    fn flush_resets_the_accumulators() {
        let mut batcher = MetricsBatcher::new("influx", 1);
        let first = batcher
            .observe(&[device(0, 80.0, 100)], &[])
            .expect("batch of one flushes every poll");
        assert!(first[0].contains("utilization_percent=80"));

        let second = batcher
            .observe(&[device(0, 20.0, 100)], &[])
            .expect("flush");
        assert!(
            second[0].contains("utilization_percent=20"),
            "previous window must not bleed in: {}",
            second[0]
        );
    }

    #[test]
    fn per_process_lines_are_tagged_with_the_container() {
        let mut batcher = MetricsBatcher::new("influx", 1);
        let lines = batcher
            .observe(&[], &[process(42, 1024), process(43, 2048)])
            .expect("flush");

        assert_eq!(lines.len(), 2);
        assert!(lines.iter().any(|l| l.contains("pid=42")));
        assert!(lines.iter().all(|l| l.contains("container=trainer")));
    }

    #[test]
    fn devices_without_uuid_key_by_ordinal() {
        let mut batcher = MetricsBatcher::new("influx", 1);
        let mut snap = device(2, 10.0, 50);
        snap.uuid = None;
        let lines = batcher.observe(&[snap], &[]).expect("flush");
        assert!(lines[0].contains("device=gpu-2"));
    }
}
