use std::time::Instant;

use sysinfo::System;

/// Static host identity plus a rolling CPU/memory sampler.
///
/// `System` is refreshed in place on every call rather than re-created, the
/// same way the resource-governor style samplers elsewhere in this codebase
/// own one long-lived `System` instead of probing a fresh one per reading.
/// The first CPU reading `sysinfo` produces for a freshly constructed
/// `System` is always `0.0` (no prior sample to diff against), so callers
/// should discard it — [`HostMetrics::new`] does exactly that during
/// construction.
pub struct HostMetrics {
    system: System,
    started_at: Instant,
    hostname: String,
    os_info: String,
}

#[derive(Debug, Clone, Copy)]
pub struct Sample {
    pub uptime_secs: u64,
    pub cpu_percent: f32,
    pub mem_percent: f32,
}

impl HostMetrics {
    /// Builds the sampler and discards the meaningless first CPU reading.
    pub fn new() -> Self {
        let mut system = System::new_all();
        system.refresh_cpu_usage();
        system.refresh_memory();

        let hostname = System::host_name().unwrap_or_else(|| "unknown-host".to_string());
        let os_info = format!(
            "{} {}",
            System::name().unwrap_or_else(|| "unknown".to_string()),
            System::os_version().unwrap_or_default()
        );

        Self { system, started_at: Instant::now(), hostname, os_info: os_info.trim().to_string() }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn os_info(&self) -> &str {
        &self.os_info
    }

    /// Refreshes the rolling sampler and returns the current reading.
    pub fn sample(&mut self) -> Sample {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();

        let cpu_percent = self.system.global_cpu_usage();
        let total_mem = self.system.total_memory();
        let mem_percent = if total_mem == 0 {
            0.0
        } else {
            (self.system.used_memory() as f64 / total_mem as f64 * 100.0) as f32
        };

        Sample {
            uptime_secs: self.started_at.elapsed().as_secs(),
            cpu_percent,
            mem_percent,
        }
    }
}

impl Default for HostMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_reports_non_negative_percentages() {
        let mut metrics = HostMetrics::new();
        let sample = metrics.sample();
        assert!(sample.cpu_percent >= 0.0);
        assert!(sample.mem_percent >= 0.0);
        assert!(sample.mem_percent <= 100.0);
    }

    #[test]
    fn hostname_and_os_info_are_non_empty_or_fallback() {
        let metrics = HostMetrics::new();
        assert!(!metrics.hostname().is_empty());
    }
}
