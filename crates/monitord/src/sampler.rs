//! Poll loop.
//!
//! One full pass per tick: host sample, device snapshots, process
//! attributions, all gathered sequentially, then handed to the store.
//! The store writes are synchronous and happen only after the whole
//! pass completed, so a pass interrupted by shutdown discards its
//! partial result instead of persisting it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use telemetry_types::TelemetryRecord;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::attribution::AttributionEngine;
use crate::host_stats::HostStatsCollector;
use crate::metrics::MetricsBatcher;
use crate::process_table::SystemProcessTable;
use crate::storage::MetricsStore;

pub struct Sampler {
    engine: AttributionEngine,
    host: HostStatsCollector,
    table: SystemProcessTable,
    store: Arc<dyn MetricsStore>,
    batcher: MetricsBatcher,
    interval: Duration,
}

#[derive(Debug)]
struct PollStats {
    device_count: usize,
    process_count: usize,
    gpu_available: bool,
}

impl Sampler {
    pub fn new(
        engine: AttributionEngine,
        store: Arc<dyn MetricsStore>,
        batcher: MetricsBatcher,
        interval: Duration,
    ) -> Self {
        Self {
            engine,
            host: HostStatsCollector::new(),
            table: SystemProcessTable::new(),
            store,
            batcher,
            interval,
        }
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            "starting collection loop"
        );

        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("shutting down collection loop");
                    break;
                }
                _ = ticker.tick() => {
                    let started = Instant::now();
                    match self.poll_once().await {
                        Ok(stats) => {
                            debug!(
                                devices = stats.device_count,
                                processes = stats.process_count,
                                gpu_available = stats.gpu_available,
                                elapsed_ms = started.elapsed().as_millis() as u64,
                                "poll complete"
                            );
                        }
                        Err(e) => {
                            warn!(error = %e, "poll failed");
                        }
                    }
                }
            }
        }
    }

    async fn poll_once(&mut self) -> Result<PollStats> {
        self.table.refresh();
        let host = self.host.sample();
        let devices = self.engine.device_snapshots().await;
        let processes = self.engine.collect(&self.table).await;

        let timestamp = Utc::now();
        let record =
            TelemetryRecord::compose(timestamp, &host, devices.as_ref().and_then(|d| d.first()));
        self.store.insert_sample(&record)?;
        if let Some(devices) = &devices {
            self.store.insert_device_snapshots(timestamp, devices)?;
        }
        self.store.insert_processes(timestamp, &processes)?;

        let device_slice = devices.as_deref().unwrap_or(&[]);
        if let Some(lines) = self.batcher.observe(device_slice, &processes) {
            for line in lines {
                tracing::info!(target: "metrics", msg = %line);
            }
        }

        Ok(PollStats {
            device_count: device_slice.len(),
            process_count: processes.len(),
            gpu_available: devices.is_some(),
        })
    }
}
