//! Node metrics producer.
//!
//! Samples host and workload figures and pushes a
//! [`NodeMetrics`](tdoa_json::NodeMetrics) document onto the event bus at a
//! fixed interval for the external node monitor. Host figures come from the
//! proc filesystem; workload figures come from the gauges that the other
//! subsystems update.

use crate::bus::{EventBus, PlatformEvent};
use crate::tiles::download::DownloadQueue;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Workload gauges fed by other subsystems.
#[derive(Debug, Default)]
pub struct LoadGauges {
    active_signals: AtomicU64,
    signal_load_centi_pct: AtomicU64,
}

impl LoadGauges {
    /// Creates zeroed gauges.
    pub fn new() -> LoadGauges {
        LoadGauges::default()
    }

    /// Sets the number of signals currently being processed.
    pub fn set_active_signals(&self, count: u64) {
        self.active_signals.store(count, Ordering::Relaxed);
    }

    /// Sets the signal processing load percentage.
    pub fn set_signal_load(&self, percent: f64) {
        let centi = (percent.clamp(0.0, 100.0) * 100.0) as u64;
        self.signal_load_centi_pct.store(centi, Ordering::Relaxed);
    }

    fn active_signals(&self) -> u64 {
        self.active_signals.load(Ordering::Relaxed)
    }

    fn signal_load(&self) -> f64 {
        self.signal_load_centi_pct.load(Ordering::Relaxed) as f64 / 100.0
    }
}

/// Parses the one-minute load average out of `/proc/loadavg` content.
fn parse_loadavg(content: &str) -> Option<f64> {
    content.split_whitespace().next()?.parse().ok()
}

/// Parses a `/proc/meminfo` document into a used-memory percentage.
fn parse_meminfo(content: &str) -> Option<f64> {
    let field = |name: &str| -> Option<f64> {
        content
            .lines()
            .find(|line| line.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    if total <= 0.0 {
        return None;
    }
    Some(((total - available) / total * 100.0).clamp(0.0, 100.0))
}

/// Sums received and transmitted bytes over every interface in a
/// `/proc/net/dev` document.
fn parse_netdev(content: &str) -> u64 {
    content
        .lines()
        .skip(2)
        .filter_map(|line| {
            let (_, fields) = line.split_once(':')?;
            let mut fields = fields.split_whitespace();
            let rx: u64 = fields.next()?.parse().ok()?;
            let tx: u64 = fields.nth(7)?.parse().ok()?;
            Some(rx + tx)
        })
        .sum()
}

/// Disk usage percentage of the filesystem containing `path`.
fn disk_usage_percent(path: &PathBuf) -> f64 {
    let Some(path) = path.to_str() else {
        return 0.0;
    };
    let Ok(path) = std::ffi::CString::new(path) else {
        return 0.0;
    };
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statvfs(path.as_ptr(), &mut stat) } != 0 || stat.f_blocks == 0 {
        return 0.0;
    }
    let used = stat.f_blocks.saturating_sub(stat.f_bavail);
    used as f64 / stat.f_blocks as f64 * 100.0
}

/// Periodic node metrics reporter.
#[derive(Debug)]
pub struct MetricsReporter {
    bus: EventBus,
    gauges: Arc<LoadGauges>,
    queue: Arc<DownloadQueue>,
    disk_path: PathBuf,
    interval: Duration,
    cancel: CancellationToken,
    last_net: Mutex<Option<(Instant, u64)>>,
}

impl MetricsReporter {
    /// Creates a reporter pushing onto `bus` every `interval`.
    ///
    /// `queue` supplies the queued-task figure and `disk_path` selects the
    /// filesystem whose usage is reported.
    pub fn new(
        bus: EventBus,
        gauges: Arc<LoadGauges>,
        queue: Arc<DownloadQueue>,
        disk_path: PathBuf,
        interval: Duration,
        cancel: CancellationToken,
    ) -> MetricsReporter {
        MetricsReporter {
            bus,
            gauges,
            queue,
            disk_path,
            interval,
            cancel,
            last_net: Mutex::new(None),
        }
    }

    /// Runs the sampling loop until cancelled.
    #[tracing::instrument(name = "metrics_reporter", skip_all)]
    pub async fn run(self) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.interval) => {}
            }
            let metrics = self.sample().await;
            tracing::debug!(cpu = metrics.cpu, memory = metrics.memory, "metrics push");
            self.bus.publish(PlatformEvent::Metrics(metrics));
        }
    }

    /// Takes one metrics sample.
    pub async fn sample(&self) -> tdoa_json::NodeMetrics {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1) as f64;
        let cpu = tokio::fs::read_to_string("/proc/loadavg")
            .await
            .ok()
            .as_deref()
            .and_then(parse_loadavg)
            .map(|load| (load / cores * 100.0).clamp(0.0, 100.0))
            .unwrap_or(0.0);
        let memory = tokio::fs::read_to_string("/proc/meminfo")
            .await
            .ok()
            .as_deref()
            .and_then(parse_meminfo)
            .unwrap_or(0.0);
        let network = match tokio::fs::read_to_string("/proc/net/dev").await {
            Ok(content) => self.network_rate(parse_netdev(&content)),
            Err(_) => 0.0,
        };
        tdoa_json::NodeMetrics {
            cpu,
            memory,
            disk: disk_usage_percent(&self.disk_path),
            network,
            signal_load: self.gauges.signal_load(),
            active_signals: self.gauges.active_signals(),
            queued_tasks: self.queue.len() as u64,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// Converts a cumulative byte counter into MB/s since the last sample.
    fn network_rate(&self, total_bytes: u64) -> f64 {
        let now = Instant::now();
        let mut last = self.last_net.lock().unwrap();
        let rate = match *last {
            Some((at, bytes)) => {
                let elapsed = now.duration_since(at).as_secs_f64();
                if elapsed > 0.0 {
                    total_bytes.saturating_sub(bytes) as f64 / elapsed / 1.0e6
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        *last = Some((now, total_bytes));
        rate
    }
}
