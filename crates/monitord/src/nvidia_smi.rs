//! Diagnostic CLI reader.
//!
//! Fallback telemetry source that invokes `nvidia-smi` and parses its
//! output: the fixed-column CSV query mode for device snapshots and the
//! human-oriented process table for process records. Every failure mode
//! (missing binary, non-zero exit, timeout) reports "no data" rather
//! than an error, and malformed rows are skipped individually.

use std::time::Duration;

use telemetry_types::DeviceSnapshot;
use telemetry_types::ProcessKind;
use tokio::process::Command;
use tracing::debug;

const SMI_TIMEOUT: Duration = Duration::from_secs(8);

const MIB: u64 = 1024 * 1024;

/// Columns requested from the CSV query mode. Older drivers stop after
/// the first five; the parser defaults the rest.
const QUERY_GPU_FIELDS: &str = "utilization.gpu,memory.used,memory.total,temperature.gpu,name,\
                                power.draw,power.limit,fan.speed,clocks.gr,clocks.mem";

/// One row of the diagnostic process table. PIDs from this source are
/// always host-relative; no namespace translation is needed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmiProcessRecord {
    pub raw_pid: u32,
    pub kind: ProcessKind,
    pub memory_bytes: u64,
}

pub struct SmiReader {
    binary: String,
}

impl Default for SmiReader {
    fn default() -> Self {
        Self::new("nvidia-smi")
    }
}

impl SmiReader {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Runs the CLI with a hard timeout. Timeout, non-zero exit, and a
    /// missing binary all map to `None`.
    async fn run(&self, args: &[&str]) -> Option<String> {
        let output = Command::new(&self.binary).args(args).output();
        let output = match tokio::time::timeout(SMI_TIMEOUT, output).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                debug!(binary = %self.binary, error = %e, "diagnostic CLI not runnable");
                return None;
            }
            Err(_) => {
                debug!(binary = %self.binary, "diagnostic CLI timed out");
                return None;
            }
        };

        if !output.status.success() {
            debug!(binary = %self.binary, status = %output.status, "diagnostic CLI failed");
            return None;
        }
        Some(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    pub async fn device_snapshots(&self) -> Option<Vec<DeviceSnapshot>> {
        let output = self
            .run(&[
                &format!("--query-gpu={QUERY_GPU_FIELDS}"),
                "--format=csv,noheader,nounits",
            ])
            .await?;
        Some(parse_device_csv(&output))
    }

    pub async fn process_records(&self) -> Option<Vec<SmiProcessRecord>> {
        let output = self.run(&[]).await?;
        Some(parse_process_table(&output))
    }
}

fn parse_u64(field: &str) -> Option<u64> {
    field.trim().parse::<f64>().ok().map(|value| value as u64)
}

fn parse_f64(field: &str) -> Option<f64> {
    field.trim().parse::<f64>().ok()
}

fn parse_u32(field: &str) -> Option<u32> {
    parse_u64(field).map(|value| value as u32)
}

/// Parses the `--query-gpu ... --format=csv,noheader,nounits` output.
/// Rows missing the five core columns are skipped; the extended columns
/// (absent on older drivers) default.
pub(crate) fn parse_device_csv(output: &str) -> Vec<DeviceSnapshot> {
    let mut snapshots = Vec::new();

    for (index, line) in output.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.split(',').map(str::trim).collect();
        if parts.len() < 5 {
            debug!(line, "skipping short device row");
            continue;
        }

        snapshots.push(
            DeviceSnapshot {
                index: index as u32,
                uuid: None,
                name: parts[4].to_string(),
                utilization_percent: parse_f64(parts[0]).unwrap_or(0.0),
                memory_used_bytes: parse_u64(parts[1]).unwrap_or(0) * MIB,
                memory_total_bytes: parse_u64(parts[2]).unwrap_or(0) * MIB,
                temperature_c: parse_u32(parts[3]).unwrap_or(0),
                power_draw_watts: parts.get(5).and_then(|p| parse_f64(p)),
                power_limit_watts: parts.get(6).and_then(|p| parse_f64(p)),
                fan_speed_percent: parts.get(7).and_then(|p| parse_u32(p)),
                clock_graphics_mhz: parts.get(8).and_then(|p| parse_u32(p)),
                clock_memory_mhz: parts.get(9).and_then(|p| parse_u32(p)),
                clock_sm_mhz: None,
                pcie_gen: None,
                pcie_width: None,
                pcie_tx_kb_s: None,
                pcie_rx_kb_s: None,
                performance_state: None,
            }
            .normalize(),
        );
    }
    snapshots
}

/// Parses the `Processes:` table from the default human-readable output.
/// The layout varies across driver generations (with and without GI/CI
/// columns), so rows are tokenized instead of sliced by position: the
/// PID is the digit token nearest before the type token (`C`, `G`,
/// `C+G`), the memory figure is the token ending in `MiB`.
pub(crate) fn parse_process_table(output: &str) -> Vec<SmiProcessRecord> {
    let mut records = Vec::new();
    let mut in_processes = false;

    for line in output.lines() {
        if line.starts_with("| Processes:") {
            in_processes = true;
            continue;
        }
        if !in_processes || !line.starts_with('|') {
            continue;
        }
        if line.contains("===")
            || line.contains("GPU")
            || line.contains("PID")
            || line.contains("No running processes")
        {
            continue;
        }

        let row = line.trim_matches('|').trim();
        if row.is_empty() {
            continue;
        }
        if let Some(record) = parse_process_row(row) {
            records.push(record);
        } else {
            debug!(row, "skipping malformed process row");
        }
    }
    records
}

fn parse_process_row(row: &str) -> Option<SmiProcessRecord> {
    let tokens: Vec<&str> = row.split_whitespace().collect();

    let kind_position = tokens
        .iter()
        .position(|token| matches!(*token, "C" | "G" | "C+G"));

    let pid = match kind_position {
        // The PID column sits immediately before the type column, with
        // the GPU (and MIG GI/CI) ordinals further left.
        Some(position) => tokens[..position]
            .iter()
            .rev()
            .find_map(|token| token.parse::<u32>().ok()),
        None => tokens
            .iter()
            .rev()
            .find_map(|token| token.parse::<u32>().ok()),
    }?;

    let kind = match kind_position.map(|position| tokens[position]) {
        Some("C") => ProcessKind::Compute,
        Some("G") => ProcessKind::Graphics,
        Some("C+G") => ProcessKind::Mixed,
        _ => ProcessKind::Unknown,
    };

    let memory_bytes = tokens
        .iter()
        .find_map(|token| token.strip_suffix("MiB"))
        .and_then(|mib| mib.parse::<u64>().ok())
        .map(|mib| mib * MIB)
        .unwrap_or(0);

    Some(SmiProcessRecord {
        raw_pid: pid,
        kind,
        memory_bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_device_csv_full_row() {
        let output = "45, 2048, 24576, 61, NVIDIA GeForce RTX 4090, 180.25, 450.00, 31, 2520, 10501\n";
        let snapshots = parse_device_csv(output);

        assert_eq!(snapshots.len(), 1);
        let snap = &snapshots[0];
        assert_eq!(snap.index, 0);
        assert_eq!(snap.name, "NVIDIA GeForce RTX 4090");
        assert_eq!(snap.utilization_percent, 45.0);
        assert_eq!(snap.memory_used_bytes, 2048 * MIB);
        assert_eq!(snap.memory_total_bytes, 24576 * MIB);
        assert_eq!(snap.temperature_c, 61);
        assert_eq!(snap.power_draw_watts, Some(180.25));
        assert_eq!(snap.power_limit_watts, Some(450.0));
        assert_eq!(snap.fan_speed_percent, Some(31));
        assert_eq!(snap.clock_graphics_mhz, Some(2520));
        assert_eq!(snap.clock_memory_mhz, Some(10501));
    }

    #[test]
    fn parse_device_csv_old_driver_without_extended_columns() {
        let output = "12, 512, 8192, 55, Tesla K80\n";
        let snapshots = parse_device_csv(output);

        assert_eq!(snapshots.len(), 1);
        let snap = &snapshots[0];
        assert_eq!(snap.memory_total_bytes, 8192 * MIB);
        assert!(snap.power_draw_watts.is_none(), "missing column defaults");
        assert!(snap.fan_speed_percent.is_none());
    }

    #[test]
    fn parse_device_csv_not_available_fields_default() {
        let output = "0, 128, 4096, 40, Quadro P400, [N/A], [N/A], [N/A], 139, 405\n";
        let snapshots = parse_device_csv(output);

        assert_eq!(snapshots.len(), 1);
        assert!(snapshots[0].power_draw_watts.is_none());
        assert_eq!(snapshots[0].clock_graphics_mhz, Some(139));
    }

    #[test]
    fn parse_device_csv_skips_short_rows_individually() {
        let output = "garbage\n30, 1024, 16384, 50, NVIDIA A100\n";
        let snapshots = parse_device_csv(output);
        assert_eq!(snapshots.len(), 1, "malformed row skipped, good row kept");
        assert_eq!(snapshots[0].name, "NVIDIA A100");
    }

    const MODERN_OUTPUT: &str = "\
+---------------------------------------------------------------------------------------+
| Processes:                                                                            |
|  GPU   GI   CI        PID   Type   Process name                            GPU Memory |
|        ID   ID                                                             Usage      |
|=======================================================================================|
|    0   N/A  N/A      1234      C   python                                    2048MiB |
|    0   N/A  N/A      5678      G   /usr/lib/xorg/Xorg                         128MiB |
+---------------------------------------------------------------------------------------+
";

    #[test]
    fn parse_process_table_modern_layout() {
        let records = parse_process_table(MODERN_OUTPUT);

        assert_eq!(records.len(), 2);
        assert_eq!(
            records[0],
            SmiProcessRecord {
                raw_pid: 1234,
                kind: ProcessKind::Compute,
                memory_bytes: 2048 * MIB,
            }
        );
        assert_eq!(records[1].raw_pid, 5678);
        assert_eq!(records[1].kind, ProcessKind::Graphics);
    }

    #[test]
    fn parse_process_table_legacy_layout() {
        let output = "\
| Processes:                                                       GPU Memory |
|  GPU       PID   Type   Process name                             Usage      |
|=============================================================================|
|    0      777      C   python                                       1024MiB |
";
        let records = parse_process_table(output);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].raw_pid, 777, "GPU ordinal must not win");
        assert_eq!(records[0].memory_bytes, 1024 * MIB);
    }

    #[test]
    fn parse_process_table_mig_ordinals_do_not_shadow_the_pid() {
        let output = "\
| Processes:                                                                  |
|    0    1    0      4321      C   trainer                           512MiB |
";
        let records = parse_process_table(output);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].raw_pid, 4321);
    }

    #[test]
    fn parse_process_table_mixed_kind_and_missing_memory() {
        let output = "\
| Processes:                                                                  |
|    0   N/A  N/A      2468    C+G   compositor                         N/A  |
";
        let records = parse_process_table(output);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, ProcessKind::Mixed);
        assert_eq!(records[0].memory_bytes, 0, "missing memory defaults to 0");
    }

    #[test]
    fn parse_process_table_no_running_processes() {
        let output = "\
| Processes:                                                                  |
|  No running processes found                                                 |
";
        assert!(parse_process_table(output).is_empty());
    }

    #[test]
    fn parse_process_table_ignores_text_outside_the_section() {
        let output = "\
| NVIDIA-SMI 550.54    Driver Version: 550.54    CUDA Version: 12.4          |
|    0  NVIDIA RTX 4090   On   | 00000000:01:00.0  On |                  Off |
| Processes:                                                                  |
|    0   N/A  N/A      1111      C   python                            64MiB |
";
        let records = parse_process_table(output);
        assert_eq!(records.len(), 1, "device banner rows must not parse");
        assert_eq!(records[0].raw_pid, 1111);
    }

    #[tokio::test]
    async fn missing_binary_reports_no_data() {
        let reader = SmiReader::new("definitely-not-nvidia-smi");
        assert!(reader.device_snapshots().await.is_none());
        assert!(reader.process_records().await.is_none());
    }
}
