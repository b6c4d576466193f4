//! Per-stage latency samples with rolling percentiles.
//!
//! Each stage keeps at most `window` samples (oldest evicted first), so memory
//! stays bounded however long the process runs.  Percentiles use the
//! nearest-rank method: `p` of `n` sorted samples is the value at rank
//! `ceil(p / 100 * n)`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Aggregate view of one stage's window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageSummary {
    pub count: usize,
    pub min: Duration,
    pub max: Duration,
    pub mean: Duration,
    pub p50: Duration,
    pub p95: Duration,
}

#[derive(Debug)]
pub struct TimingDiagnostics {
    window: usize,
    stages: Mutex<HashMap<String, VecDeque<Duration>>>,
}

impl TimingDiagnostics {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            stages: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, VecDeque<Duration>>> {
        self.stages.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record(&self, stage: &str, duration: Duration) {
        let mut stages = self.lock();
        let samples = stages
            .entry(stage.to_string())
            .or_insert_with(|| VecDeque::with_capacity(self.window));
        if samples.len() == self.window {
            samples.pop_front();
        }
        samples.push_back(duration);
        log::debug!("timing: stage={stage} ms={}", duration.as_millis());
    }

    /// Nearest-rank percentile, `p` clamped to `0..=100`.  `None` when the
    /// stage has no samples.
    pub fn percentile(&self, stage: &str, p: f64) -> Option<Duration> {
        let mut sorted: Vec<Duration> = self.lock().get(stage)?.iter().copied().collect();
        sorted.sort_unstable();
        nearest_rank(&sorted, p)
    }

    pub fn count(&self, stage: &str) -> usize {
        self.lock().get(stage).map_or(0, VecDeque::len)
    }

    pub fn summary(&self, stage: &str) -> Option<StageSummary> {
        let mut sorted: Vec<Duration> = self.lock().get(stage)?.iter().copied().collect();
        if sorted.is_empty() {
            return None;
        }
        sorted.sort_unstable();
        let total: Duration = sorted.iter().sum();
        Some(StageSummary {
            count: sorted.len(),
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            mean: total / sorted.len() as u32,
            p50: nearest_rank(&sorted, 50.0)?,
            p95: nearest_rank(&sorted, 95.0)?,
        })
    }

    /// Stage names with at least one sample, sorted.
    pub fn stages(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// One `info` line per stage.
    pub fn log_summary(&self) {
        for stage in self.stages() {
            if let Some(s) = self.summary(&stage) {
                log::info!(
                    "timing: stage={stage} count={} min_ms={} mean_ms={} p50_ms={} p95_ms={} max_ms={}",
                    s.count,
                    s.min.as_millis(),
                    s.mean.as_millis(),
                    s.p50.as_millis(),
                    s.p95.as_millis(),
                    s.max.as_millis()
                );
            }
        }
    }
}

fn nearest_rank(sorted: &[Duration], p: f64) -> Option<Duration> {
    if sorted.is_empty() {
        return None;
    }
    let p = p.clamp(0.0, 100.0);
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    Some(sorted[rank.clamp(1, sorted.len()) - 1])
}

// ---------------------------------------------------------------------------
// StageTimer
// ---------------------------------------------------------------------------

/// Records the elapsed time for a stage when dropped, on every exit path.
pub struct StageTimer {
    diagnostics: Arc<TimingDiagnostics>,
    stage: &'static str,
    started: Instant,
}

impl StageTimer {
    pub fn start(diagnostics: &Arc<TimingDiagnostics>, stage: &'static str) -> Self {
        Self {
            diagnostics: Arc::clone(diagnostics),
            stage,
            started: Instant::now(),
        }
    }
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        self.diagnostics.record(self.stage, self.started.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn percentiles_over_one_to_hundred() {
        let t = TimingDiagnostics::new(200);
        for i in 1..=100 {
            t.record("playing", ms(i));
        }
        assert_eq!(t.percentile("playing", 50.0), Some(ms(50)));
        assert_eq!(t.percentile("playing", 95.0), Some(ms(95)));
        assert_eq!(t.percentile("playing", 100.0), Some(ms(100)));
        assert_eq!(t.percentile("playing", 0.0), Some(ms(1)));
    }

    #[test]
    fn unknown_stage_has_no_percentile() {
        let t = TimingDiagnostics::new(10);
        assert_eq!(t.percentile("capturing", 50.0), None);
        assert_eq!(t.count("capturing"), 0);
        assert!(t.summary("capturing").is_none());
    }

    #[test]
    fn window_evicts_oldest() {
        let t = TimingDiagnostics::new(3);
        for i in 1..=5 {
            t.record("capturing", ms(i * 10));
        }
        assert_eq!(t.count("capturing"), 3);
        let s = t.summary("capturing").unwrap();
        assert_eq!(s.min, ms(30));
        assert_eq!(s.max, ms(50));
        assert_eq!(s.mean, ms(40));
    }

    #[test]
    fn single_sample_summary() {
        let t = TimingDiagnostics::new(5);
        t.record("total", ms(1200));
        let s = t.summary("total").unwrap();
        assert_eq!((s.p50, s.p95, s.count), (ms(1200), ms(1200), 1));
        assert_eq!(t.stages(), vec!["total".to_string()]);
    }

    #[test]
    fn stage_timer_records_on_drop() {
        let t = Arc::new(TimingDiagnostics::new(5));
        {
            let _timer = StageTimer::start(&t, "processing");
            std::thread::sleep(ms(5));
        }
        assert_eq!(t.count("processing"), 1);
        assert!(t.percentile("processing", 50.0).unwrap() >= ms(5));
    }
}
