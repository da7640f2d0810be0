//! Append-only JSON-lines store.
//!
//! Each record is one tagged JSON object per line. Every insert call
//! buffers its lines and appends them with a single write, and
//! malformed lines encountered during a query are skipped individually,
//! so a torn write can never poison the rest of the file.

use std::fs;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use telemetry_types::DeviceSnapshot;
use telemetry_types::ProcessAttribution;
use telemetry_types::TelemetryRecord;
use tracing::debug;

use super::MetricsStore;
use super::StoreError;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum StoredRecord {
    Sample(TelemetryRecord),
    Process {
        timestamp: DateTime<Utc>,
        process: ProcessAttribution,
    },
    Device {
        timestamp: DateTime<Utc>,
        device: DeviceSnapshot,
    },
}

pub struct JsonlStore {
    path: PathBuf,
    // Serializes appends when several inserts land in the same poll.
    write_lock: Mutex<()>,
}

impl JsonlStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, records: impl IntoIterator<Item = StoredRecord>) -> Result<(), StoreError> {
        let mut buffer = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buffer, &record)?;
            buffer.push(b'\n');
        }
        if buffer.is_empty() {
            return Ok(());
        }

        let _guard = self.write_lock.lock().expect("poisoned");
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&buffer)?;
        Ok(())
    }
}

impl MetricsStore for JsonlStore {
    fn insert_sample(&self, record: &TelemetryRecord) -> Result<(), StoreError> {
        self.append([StoredRecord::Sample(record.clone())])
    }

    fn insert_processes(
        &self,
        timestamp: DateTime<Utc>,
        processes: &[ProcessAttribution],
    ) -> Result<(), StoreError> {
        self.append(processes.iter().map(|process| StoredRecord::Process {
            timestamp,
            process: process.clone(),
        }))
    }

    fn insert_device_snapshots(
        &self,
        timestamp: DateTime<Utc>,
        devices: &[DeviceSnapshot],
    ) -> Result<(), StoreError> {
        self.append(devices.iter().map(|device| StoredRecord::Device {
            timestamp,
            device: device.clone(),
        }))
    }

    fn query_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TelemetryRecord>, StoreError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut samples = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<StoredRecord>(line) {
                Ok(StoredRecord::Sample(record)) => {
                    if record.timestamp >= start && record.timestamp < end {
                        samples.push(record);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, "skipping unreadable storage line");
                }
            }
        }
        Ok(samples)
    }
}
