use std::path::Path;
use std::path::PathBuf;

use clap::Parser;
use clap::Subcommand;

use crate::attribution::EngineConfig;
use crate::container_index::DEFAULT_ENDPOINTS;

/// Process names and command-line fragments that suggest accelerator
/// use. The original deployment cared about ML runtimes and a couple of
/// in-house tools riding on them.
pub const DEFAULT_GPU_KEYWORDS: &str = "torch,cuda,tensorflow,python,ncnn,uvr5";

#[derive(Parser)]
#[command(name = "monitord", version, about = "Host and GPU telemetry agent")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the periodic collection daemon
    Daemon(DaemonArgs),
    /// Run one collection pass and print the result
    Collect(CollectArgs),
}

#[derive(Parser, Clone)]
pub struct CollectorOpts {
    #[arg(
        long,
        env = "MONITOR_PROC_ROOT",
        value_hint = clap::ValueHint::DirPath,
        help = "Proc filesystem root; defaults to /host/proc when mounted, /proc otherwise"
    )]
    pub proc_root: Option<PathBuf>,

    #[arg(
        long,
        env = "MONITOR_DOCKER_ENDPOINTS",
        value_delimiter = ',',
        default_value = DEFAULT_ENDPOINTS,
        help = "Container runtime endpoints, tried in order until one answers"
    )]
    pub docker_endpoints: Vec<String>,

    #[arg(
        long,
        env = "MONITOR_GPU_KEYWORDS",
        value_delimiter = ',',
        default_value = DEFAULT_GPU_KEYWORDS,
        help = "Keywords marking a process as a likely accelerator user"
    )]
    pub gpu_keywords: Vec<String>,

    #[arg(
        long,
        default_value_t = false,
        action = clap::ArgAction::Set,
        help = "Skip the accounting API and rely on the diagnostic CLI only"
    )]
    pub disable_accounting: bool,
}

impl CollectorOpts {
    /// Containerized deployments mount the host's proc filesystem at
    /// /host/proc; prefer it when present so namespace records describe
    /// the host side.
    pub fn resolved_proc_root(&self) -> PathBuf {
        if let Some(root) = &self.proc_root {
            return root.clone();
        }
        let host_proc = Path::new("/host/proc");
        if host_proc.is_dir() {
            host_proc.to_path_buf()
        } else {
            PathBuf::from("/proc")
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            proc_root: self.resolved_proc_root(),
            docker_endpoints: self.docker_endpoints.clone(),
            keywords: self.gpu_keywords.clone(),
        }
    }
}

#[derive(Parser, Clone)]
pub struct DaemonArgs {
    #[command(flatten)]
    pub collector: CollectorOpts,

    #[arg(
        long,
        env = "MONITOR_INTERVAL_SECS",
        default_value = "10",
        help = "Seconds between collection passes"
    )]
    pub interval_secs: u64,

    #[arg(
        long,
        env = "MONITOR_STORE_PATH",
        default_value = "logs/monitor.jsonl",
        value_hint = clap::ValueHint::FilePath,
        help = "Append-only time-series store file"
    )]
    pub store_path: PathBuf,

    #[arg(
        long,
        env = "GPU_METRICS_FILE",
        value_hint = clap::ValueHint::FilePath,
        help = "Path for batched GPU metrics lines, e.g. logs/metrics.log"
    )]
    pub gpu_metrics_file: Option<PathBuf>,

    #[arg(
        long,
        env = "MONITOR_METRICS_FORMAT",
        default_value = "influx",
        help = "Metrics line format, either 'influx' or 'json'"
    )]
    pub metrics_format: String,

    #[arg(
        long,
        default_value = "10",
        help = "Number of polls aggregated into each batch of metrics lines"
    )]
    pub metrics_batch_size: usize,
}

#[derive(Parser, Clone)]
pub struct CollectArgs {
    #[command(flatten)]
    pub collector: CollectorOpts,

    #[arg(long, default_value = "10", help = "How many top GPU consumers to print")]
    pub top: usize,
}
