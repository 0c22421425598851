// src/stats/reporter.rs
use crate::stats::counters::MiningStats;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use sysinfo::{Components, System};

/// Statistics related to hardware performance
#[derive(Debug, Clone)]
pub struct HardwareStats {
    /// Current CPU usage percentage (0-100)
    pub cpu_usage: f32,
    /// Memory currently in use (in bytes)
    pub memory_used: u64,
    /// Current CPU temperature in Celsius, 0 when unknown
    pub temperature: f32,
}

/// Periodically logs session and hardware statistics
pub struct StatsReporter {
    /// Interval at which stats are reported
    report_interval: Duration,
    /// System information collector
    system: System,
    /// Hardware component information collector
    components: Components,
}

impl StatsReporter {
    /// Creates a new StatsReporter with the specified reporting interval
    ///
    /// # Arguments
    /// * `report_interval` - How often to log statistics
    pub fn new(report_interval: Duration) -> Self {
        StatsReporter {
            report_interval,
            system: System::new_all(),
            components: Components::new_with_refreshed_list(),
        }
    }

    /// Gets the current hardware statistics
    ///
    /// This refreshes system information before returning the stats.
    pub fn get_hardware_stats(&mut self) -> HardwareStats {
        self.system.refresh_cpu_all();
        self.system.refresh_memory();
        self.components.refresh(true);

        let cpus = self.system.cpus();
        let cpu_usage = if cpus.is_empty() {
            0.0
        } else {
            cpus.iter().map(|c| c.cpu_usage()).sum::<f32>() / cpus.len() as f32
        };

        let temperature = self
            .components
            .iter()
            .find(|c| c.label().contains("CPU") || c.label().contains("Package"))
            .and_then(|c| c.temperature())
            .unwrap_or(0.0);

        HardwareStats {
            cpu_usage,
            memory_used: self.system.used_memory(),
            temperature,
        }
    }

    /// One log line for a stats snapshot
    pub fn format_line(stats: &MiningStats, hw: &HardwareStats) -> String {
        format!(
            "Hashrate: {:.2} H/s | Found/Accepted/Rejected: {}/{}/{} | Blocks: {} | CPU: {:.1}% | Temp: {:.1}°C",
            stats.hash_rate,
            stats.results_found,
            stats.shares_accepted,
            stats.shares_rejected,
            stats.blocks_found,
            hw.cpu_usage,
            hw.temperature
        )
    }

    /// Starts the periodic reporting of statistics
    ///
    /// Spawns a background thread that logs a line every interval until
    /// `stop` is set.
    ///
    /// # Arguments
    /// * `snapshot` - Reads the session statistics
    /// * `stop` - Ends the reporting thread when set
    pub fn start_reporting<F>(mut self, snapshot: F, stop: Arc<AtomicBool>) -> std::io::Result<JoinHandle<()>>
    where
        F: Fn() -> MiningStats + Send + 'static,
    {
        std::thread::Builder::new()
            .name("stats".into())
            .spawn(move || {
                let tick = Duration::from_millis(200);
                let mut waited = Duration::ZERO;
                while !stop.load(Ordering::Relaxed) {
                    std::thread::sleep(tick);
                    waited += tick;
                    if waited < self.report_interval {
                        continue;
                    }
                    waited = Duration::ZERO;
                    let stats = snapshot();
                    let hw = self.get_hardware_stats();
                    log::info!("{}", Self::format_line(&stats, &hw));
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_carries_session_numbers() {
        let stats = MiningStats {
            results_found: 4,
            shares_accepted: 3,
            shares_rejected: 1,
            blocks_found: 0,
            hash_rate: 41.257,
            ..MiningStats::default()
        };
        let hw = HardwareStats {
            cpu_usage: 50.0,
            memory_used: 0,
            temperature: 0.0,
        };
        let line = StatsReporter::format_line(&stats, &hw);
        assert!(line.starts_with("Hashrate: 41.26 H/s"));
        assert!(line.contains("4/3/1"));
    }

    #[test]
    fn reporter_thread_exits_on_stop() {
        let stop = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(crate::stats::ShareCounters::default());
        let handle = StatsReporter::new(Duration::from_millis(100))
            .start_reporting(move || counters.snapshot(1.0), stop.clone())
            .unwrap();
        std::thread::sleep(Duration::from_millis(300));
        stop.store(true, Ordering::Relaxed);
        handle.join().unwrap();
    }
}
