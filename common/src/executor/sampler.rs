// Child process resource sampling via procfs

use crate::config::ExecutorConfig;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Peak resource usage observed over one execution.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourcePeaks {
    pub peak_cpu_percent: Option<f64>,
    pub peak_memory_mb: Option<f64>,
}

/// Samples a child process on a fixed interval and keeps the peak CPU and
/// resident memory seen. Only procfs platforms produce samples; elsewhere the
/// peaks stay empty.
pub struct ResourceSampler {
    peaks: Arc<Mutex<ResourcePeaks>>,
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

impl ResourceSampler {
    pub fn spawn(pid: u32, task_id: i64, config: &ExecutorConfig) -> Self {
        let peaks = Arc::new(Mutex::new(ResourcePeaks::default()));
        let cancel = CancellationToken::new();
        let interval = Duration::from_secs(config.sample_interval_seconds.max(1));
        let cpu_warn = config.cpu_warn_percent;
        let memory_warn = config.memory_warn_mb;

        let handle = tokio::spawn({
            let peaks = Arc::clone(&peaks);
            let cancel = cancel.clone();
            async move {
                let mut last = read_cpu_ticks(pid).map(|ticks| (ticks, std::time::Instant::now()));
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {}
                    }

                    let cpu = read_cpu_ticks(pid).and_then(|ticks| {
                        let now = std::time::Instant::now();
                        let sample = last.replace((ticks, now)).map(|(prev_ticks, prev_at)| {
                            let elapsed = now.duration_since(prev_at).as_secs_f64();
                            if elapsed <= 0.0 {
                                return 0.0;
                            }
                            let used = ticks.saturating_sub(prev_ticks) as f64 / CLOCK_TICKS_PER_SEC;
                            used / elapsed * 100.0
                        });
                        sample
                    });
                    let memory = read_rss_mb(pid);

                    if cpu.is_none() && memory.is_none() {
                        // Process is gone; nothing left to sample.
                        break;
                    }

                    if let Some(cpu) = cpu {
                        if cpu > cpu_warn {
                            tracing::warn!(task_id, pid, cpu_percent = cpu, "High CPU usage for task process");
                        }
                    }
                    if let Some(memory) = memory {
                        if memory > memory_warn {
                            tracing::warn!(task_id, pid, memory_mb = memory, "High memory usage for task process");
                        }
                    }

                    let mut guard = peaks.lock().unwrap_or_else(|e| e.into_inner());
                    if let Some(cpu) = cpu {
                        guard.peak_cpu_percent =
                            Some(guard.peak_cpu_percent.map_or(cpu, |p| p.max(cpu)));
                    }
                    if let Some(memory) = memory {
                        guard.peak_memory_mb =
                            Some(guard.peak_memory_mb.map_or(memory, |p| p.max(memory)));
                    }
                }
            }
        });

        Self {
            peaks,
            cancel,
            handle,
        }
    }

    /// Stop sampling and return the observed peaks.
    pub async fn finish(self) -> ResourcePeaks {
        self.cancel.cancel();
        let _ = self.handle.await;
        *self.peaks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// Linux reports utime/stime in clock ticks, fixed at 100Hz on every
// mainstream distribution.
const CLOCK_TICKS_PER_SEC: f64 = 100.0;

#[cfg(target_os = "linux")]
fn read_cpu_ticks(pid: u32) -> Option<u64> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    // The comm field may contain spaces; everything after the closing paren
    // is fixed-position.
    let rest = stat.rsplit_once(')')?.1;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // Fields 14 and 15 of stat (utime, stime) are at offsets 11 and 12 after
    // the comm field.
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

#[cfg(target_os = "linux")]
fn read_rss_mb(pid: u32) -> Option<f64> {
    let status = std::fs::read_to_string(format!("/proc/{}/status", pid)).ok()?;
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: f64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb / 1024.0)
}

#[cfg(not(target_os = "linux"))]
fn read_cpu_ticks(_pid: u32) -> Option<u64> {
    None
}

#[cfg(not(target_os = "linux"))]
fn read_rss_mb(_pid: u32) -> Option<f64> {
    None
}
