mod attribution;
mod config;
mod container_index;
mod gpu_observer;
mod host_stats;
mod logging;
mod metrics;
mod nvidia_smi;
mod pid_namespace;
mod pid_resolver;
mod process_table;
mod sampler;
mod storage;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use crate::attribution::top_by_gpu_memory;
use crate::attribution::AttributionEngine;
use crate::config::Cli;
use crate::config::CollectArgs;
use crate::config::CollectorOpts;
use crate::config::Commands;
use crate::config::DaemonArgs;
use crate::gpu_observer::GpuObserver;
use crate::host_stats::HostStatsCollector;
use crate::metrics::MetricsBatcher;
use crate::nvidia_smi::SmiReader;
use crate::process_table::SystemProcessTable;
use crate::sampler::Sampler;
use crate::storage::JsonlStore;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon(daemon_args) => run_daemon(daemon_args).await,
        Commands::Collect(collect_args) => run_collect(collect_args).await,
    }
}

fn build_engine(opts: &CollectorOpts) -> AttributionEngine {
    let gpu = if opts.disable_accounting {
        GpuObserver::disabled()
    } else {
        GpuObserver::init()
    };
    AttributionEngine::new(gpu, SmiReader::default(), opts.engine_config())
}

async fn run_daemon(args: DaemonArgs) -> Result<()> {
    let _guard = logging::init(args.gpu_metrics_file.as_deref());

    tracing::info!("starting monitord daemon");

    let store = Arc::new(JsonlStore::open(&args.store_path)?);
    let engine = build_engine(&args.collector);
    let batcher = MetricsBatcher::new(&args.metrics_format, args.metrics_batch_size);
    let sampler = Sampler::new(
        engine,
        store,
        batcher,
        Duration::from_secs(args.interval_secs),
    );

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received interrupt");
            signal_token.cancel();
        }
    });

    sampler.run(shutdown).await;
    Ok(())
}

async fn run_collect(args: CollectArgs) -> Result<()> {
    let _guard = logging::init(None);

    let engine = build_engine(&args.collector);
    let mut host = HostStatsCollector::new();
    let mut table = SystemProcessTable::new();
    table.refresh();

    let sample = host.sample();
    let devices = engine.device_snapshots().await;
    let processes = engine.collect(&table).await;

    println!(
        "CPU: {:.2}% across {} cores",
        sample.cpu_percent, sample.cpu_count
    );
    println!(
        "RAM: {:.2}% ({:.2} GiB / {:.2} GiB)",
        sample.ram_percent,
        sample.ram_used_bytes as f64 / (1 << 30) as f64,
        sample.ram_total_bytes as f64 / (1 << 30) as f64,
    );

    match &devices {
        Some(devices) if !devices.is_empty() => {
            for device in devices {
                println!(
                    "GPU {} ({}): {:.1}% | VRAM {:.1}% ({} MiB / {} MiB) | {}°C",
                    device.index,
                    device.name,
                    device.utilization_percent,
                    device.memory_percent(),
                    device.memory_used_bytes >> 20,
                    device.memory_total_bytes >> 20,
                    device.temperature_c,
                );
            }
        }
        Some(_) => println!("GPU: no devices"),
        None => println!("GPU: unavailable"),
    }

    if processes.is_empty() {
        println!("No GPU processes detected");
        return Ok(());
    }

    println!("Top GPU processes:");
    for attribution in top_by_gpu_memory(processes, args.top) {
        println!(
            "  {:>7}  {:<20} {:>8} MiB  {:<12} {}",
            attribution.host_pid,
            attribution.name,
            attribution.gpu_memory_bytes >> 20,
            attribution.container,
            attribution.type_tag(),
        );
    }

    Ok(())
}
