//! Time-series storage contract.
//!
//! The collector treats storage as append-only: one flattened sample,
//! the device snapshots, and the process attributions per poll, read
//! back only through the time-range query. The poller hands a pass's
//! records to the store only after the whole pass completed, so a
//! cancelled pass persists nothing.

pub mod jsonl;

use chrono::DateTime;
use chrono::Utc;
use telemetry_types::DeviceSnapshot;
use telemetry_types::ProcessAttribution;
use telemetry_types::TelemetryRecord;
use thiserror::Error;

pub use jsonl::JsonlStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),
}

pub trait MetricsStore: Send + Sync {
    /// Appends one flattened per-poll sample.
    fn insert_sample(&self, record: &TelemetryRecord) -> Result<(), StoreError>;

    /// Appends one poll's process attributions.
    fn insert_processes(
        &self,
        timestamp: DateTime<Utc>,
        processes: &[ProcessAttribution],
    ) -> Result<(), StoreError>;

    /// Appends one poll's device snapshots.
    fn insert_device_snapshots(
        &self,
        timestamp: DateTime<Utc>,
        devices: &[DeviceSnapshot],
    ) -> Result<(), StoreError>;

    /// Samples with `start <= timestamp < end`, in insertion order.
    fn query_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TelemetryRecord>, StoreError>;
}
