// src/monitor.rs
//
// =============================================================================
// CRUCIBLE: RESOURCE SAMPLER
// =============================================================================
//
// Consumes the runtime's statistics frames for one sandbox and keeps two
// scalars: peak CPU percentage and peak resident memory. A frame that cannot
// be used (missing fields, zero system delta) is skipped; sampling never
// fails the job.

use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::Mutex;

/// One statistics frame, already lifted out of the runtime's wire encoding.
/// The runtime ships the previous frame's CPU totals alongside the current
/// ones so percentages can be computed without sampler-side history.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsFrame {
    pub cpu_total_ns: Option<u64>,
    pub precpu_total_ns: Option<u64>,
    pub system_cpu_ns: Option<u64>,
    pub presystem_cpu_ns: Option<u64>,
    pub online_cpus: Option<u64>,
    pub memory_usage_bytes: Option<u64>,
}

pub type StatsStream = BoxStream<'static, anyhow::Result<StatsFrame>>;

#[derive(Debug, Default)]
pub struct PeakTracker {
    peak_cpu_pct: f64,
    peak_memory_mb: f64,
}

impl PeakTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, frame: &StatsFrame) {
        if let Some(bytes) = frame.memory_usage_bytes {
            let mb = bytes as f64 / (1024.0 * 1024.0);
            self.peak_memory_mb = self.peak_memory_mb.max(mb);
        }

        if let Some(pct) = cpu_pct(frame) {
            self.peak_cpu_pct = self.peak_cpu_pct.max(pct);
        }
    }

    pub fn peak_cpu_pct(&self) -> f64 {
        self.peak_cpu_pct
    }

    pub fn peak_memory_mb(&self) -> f64 {
        self.peak_memory_mb
    }
}

/// CPU percentage for one frame:
/// `100 * online_cpus * delta(cpu_total) / delta(system_cpu)`.
/// None when a field is absent or the system delta is not positive.
fn cpu_pct(frame: &StatsFrame) -> Option<f64> {
    let cpu_now = frame.cpu_total_ns? as f64;
    let cpu_prev = frame.precpu_total_ns? as f64;
    let sys_now = frame.system_cpu_ns? as f64;
    let sys_prev = frame.presystem_cpu_ns? as f64;
    let cpus = frame.online_cpus? as f64;

    let sys_delta = sys_now - sys_prev;
    if sys_delta <= 0.0 {
        return None;
    }
    Some(100.0 * cpus * (cpu_now - cpu_prev) / sys_delta)
}

/// Sampler-task body: folds the stats stream into the shared tracker until
/// the runtime closes the stream. Frame errors are skipped, never raised.
pub async fn sample_stats(mut stream: StatsStream, tracker: Arc<Mutex<PeakTracker>>) {
    while let Some(item) = stream.next().await {
        match item {
            Ok(frame) => tracker.lock().await.observe(&frame),
            Err(e) => log::debug!("skipping unreadable stats frame: {}", e),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
