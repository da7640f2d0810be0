//! Host CPU/RAM collector.
//!
//! Single-call OS metric reads; no attribution logic lives here. CPU
//! percentages are computed against the previous refresh, so the
//! collector persists across polls.

use sysinfo::System;
use telemetry_types::HostSample;

pub struct HostStatsCollector {
    sys: System,
}

impl HostStatsCollector {
    pub fn new() -> Self {
        let mut sys = System::new();
        // Prime the CPU counters so the first real sample has a delta
        // window to measure against.
        sys.refresh_cpu_all();
        sys.refresh_memory();
        Self { sys }
    }

    pub fn sample(&mut self) -> HostSample {
        self.sys.refresh_cpu_all();
        self.sys.refresh_memory();

        let ram_total = self.sys.total_memory();
        let ram_used = self.sys.used_memory();
        let swap_total = self.sys.total_swap();
        let swap_used = self.sys.used_swap();
        let load = System::load_average();

        HostSample {
            cpu_percent: self.sys.global_cpu_usage(),
            cpu_count: self.sys.cpus().len(),
            load_avg: Some([load.one, load.five, load.fifteen]),
            ram_used_bytes: ram_used,
            ram_total_bytes: ram_total,
            ram_percent: percent(ram_used, ram_total),
            swap_used_bytes: swap_used,
            swap_total_bytes: swap_total,
            swap_percent: percent(swap_used, swap_total),
        }
    }
}

impl Default for HostStatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn percent(used: u64, total: u64) -> f32 {
    if total == 0 {
        return 0.0;
    }
    (used as f64 / total as f64 * 100.0) as f32
}
