//! Host metrics published by the sync daemon.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::System;

/// Point-in-time view of the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostSnapshot {
    pub timestamp: DateTime<Utc>,
    /// Global CPU usage, 0-100.
    pub cpu_percent: f32,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    /// One, five and fifteen minute load averages.
    pub load_average: [f64; 3],
    pub uptime_secs: u64,
}

/// Keeps a `sysinfo::System` around so CPU usage is measured between two samples.
pub struct HostSampler {
    system: System,
}

impl Default for HostSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl HostSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        Self { system }
    }

    pub fn sample(&mut self) -> HostSnapshot {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        let load = System::load_average();

        HostSnapshot {
            timestamp: Utc::now(),
            cpu_percent: self.system.global_cpu_usage(),
            memory_used_bytes: self.system.used_memory(),
            memory_total_bytes: self.system.total_memory(),
            load_average: [load.one, load.five, load.fifteen],
            uptime_secs: System::uptime(),
        }
    }
}
