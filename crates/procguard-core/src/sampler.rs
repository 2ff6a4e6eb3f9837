//! Periodic metric sampling.
//!
//! One timer drives the whole daemon: each tick reads `/proc` for every
//! live process, fans the samples into the process mailboxes, broadcasts a
//! WebSocket frame and stamps the health heartbeat. Threshold detection
//! runs on rolling means with hysteresis so a metric hovering at the
//! threshold cannot flap alerts.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use procguard_types::{MetricSample, MetricsFrame};
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};

use crate::os;
use crate::supervisor::Supervisor;

/// Samples feeding each rolling mean (one minute at the default 10 s tick).
pub const ROLLING_WINDOW: usize = 6;

/// A cleared alert requires the mean to fall this many percentage points
/// below the threshold.
pub const CLEAR_MARGIN_PERCENT: f64 = 5.0;

/// Default ring capacity: an hour of samples at the default tick.
pub const DEFAULT_RING_CAPACITY: usize = 360;

/// Fixed-capacity circular buffer of samples. Pushing past capacity
/// overwrites the oldest entry without reallocating.
#[derive(Debug)]
pub struct SampleRing {
    buf: Vec<MetricSample>,
    next: usize,
    cap: usize,
}

impl SampleRing {
    pub fn new(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap.max(1)),
            next: 0,
            cap: cap.max(1),
        }
    }

    pub fn push(&mut self, sample: MetricSample) {
        if self.buf.len() < self.cap {
            self.buf.push(sample);
        } else {
            self.buf[self.next] = sample;
        }
        self.next = (self.next + 1) % self.cap;
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.next = 0;
    }

    pub fn latest(&self) -> Option<&MetricSample> {
        if self.buf.is_empty() {
            None
        } else if self.buf.len() < self.cap {
            self.buf.last()
        } else {
            Some(&self.buf[(self.next + self.cap - 1) % self.cap])
        }
    }

    /// Mean of `f` over the most recent `n` samples (fewer when the ring
    /// holds fewer).
    pub fn mean_last(&self, n: usize, f: impl Fn(&MetricSample) -> f64) -> f64 {
        let take = n.min(self.buf.len());
        if take == 0 {
            return 0.0;
        }
        let mut sum = 0.0;
        for k in 1..=take {
            let idx = if self.buf.len() < self.cap {
                self.buf.len() - k
            } else {
                (self.next + self.cap - k) % self.cap
            };
            sum += f(&self.buf[idx]);
        }
        sum / take as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Crossing {
    Raised,
    Cleared,
}

/// Latched threshold detector with hysteresis.
#[derive(Debug, Default)]
pub struct ThresholdWatch {
    active: bool,
}

impl ThresholdWatch {
    pub fn observe(&mut self, mean: f64, threshold: f64) -> Option<Crossing> {
        if !self.active && mean > threshold {
            self.active = true;
            Some(Crossing::Raised)
        } else if self.active && mean <= threshold - CLEAR_MARGIN_PERCENT {
            self.active = false;
            Some(Crossing::Cleared)
        } else {
            None
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

/// Heartbeat the `/health` endpoint checks: 200 iff the last tick ran
/// within twice the monitor interval.
#[derive(Debug)]
pub struct SamplerHealth {
    epoch: Instant,
    last_tick_ms: AtomicU64,
}

impl SamplerHealth {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_tick_ms: AtomicU64::new(u64::MAX),
        }
    }

    pub fn beat(&self) {
        let ms = self.epoch.elapsed().as_millis() as u64;
        self.last_tick_ms.store(ms, Ordering::Relaxed);
    }

    pub fn last_tick_age(&self) -> Duration {
        let at = self.last_tick_ms.load(Ordering::Relaxed);
        if at == u64::MAX {
            return Duration::MAX;
        }
        self.epoch
            .elapsed()
            .saturating_sub(Duration::from_millis(at))
    }
}

impl Default for SamplerHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Run the sampler loop until the supervisor shuts down.
pub fn spawn(
    supervisor: Supervisor,
    interval: Duration,
    frames: broadcast::Sender<MetricsFrame>,
    health: std::sync::Arc<SamplerHealth>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut host = os::HostSampler::default();
        // Previous cpu-tick reading per PID; a restarted process gets a
        // fresh slot because its PID changes.
        let mut prev_cpu: HashMap<u32, (u64, Instant)> = HashMap::new();

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let total_memory = os::total_memory_bytes();
            let mut frame_processes = BTreeMap::new();
            let mut live_pids: HashSet<u32> = HashSet::new();

            for proc in supervisor.live_snapshot() {
                live_pids.insert(proc.pid);
                match os::sample(proc.pid).await {
                    Ok(raw) => {
                        let now = Instant::now();
                        let cpu_percent = prev_cpu
                            .get(&proc.pid)
                            .map(|(ticks, at)| os::cpu_percent(*ticks, *at, raw.cpu_ticks, now))
                            .unwrap_or(0.0);
                        prev_cpu.insert(proc.pid, (raw.cpu_ticks, now));

                        let memory_percent = if total_memory > 0 {
                            raw.rss_bytes as f64 / total_memory as f64 * 100.0
                        } else {
                            0.0
                        };

                        let sample = MetricSample {
                            timestamp: chrono::Utc::now(),
                            cpu_percent,
                            rss_bytes: raw.rss_bytes,
                            memory_percent,
                            threads: raw.threads,
                            open_files: raw.open_files,
                            connections: raw.connections,
                            uptime_seconds: proc.uptime_seconds,
                        };
                        frame_processes.insert(proc.name.clone(), sample.clone());
                        supervisor.deliver_sample(&proc.name, sample);
                    }
                    Err(os::SampleError::NotFound) => {
                        supervisor.notify_disappeared(&proc.name);
                    }
                    Err(e) => {
                        tracing::warn!(process = %proc.name, error = %e, "sample failed");
                    }
                }
            }

            prev_cpu.retain(|pid, _| live_pids.contains(pid));

            let frame = MetricsFrame {
                timestamp: chrono::Utc::now(),
                system: host.sample(),
                processes: frame_processes,
                alerts: supervisor.alerts().active_snapshot(50),
            };
            let _ = frames.send(frame);
            health.beat();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(cpu: f64) -> MetricSample {
        MetricSample {
            timestamp: chrono::Utc::now(),
            cpu_percent: cpu,
            rss_bytes: 0,
            memory_percent: 0.0,
            threads: 1,
            open_files: 0,
            connections: 0,
            uptime_seconds: 0.0,
        }
    }

    #[test]
    fn ring_overwrites_oldest_when_full() {
        let mut ring = SampleRing::new(3);
        for cpu in [1.0, 2.0, 3.0, 4.0, 5.0] {
            ring.push(sample(cpu));
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.latest().unwrap().cpu_percent, 5.0);
        assert_eq!(ring.mean_last(3, |s| s.cpu_percent), 4.0);
    }

    #[test]
    fn mean_last_handles_partial_fill() {
        let mut ring = SampleRing::new(10);
        ring.push(sample(10.0));
        ring.push(sample(20.0));
        assert_eq!(ring.mean_last(6, |s| s.cpu_percent), 15.0);
    }

    #[test]
    fn empty_ring_mean_is_zero() {
        let ring = SampleRing::new(4);
        assert_eq!(ring.mean_last(6, |s| s.cpu_percent), 0.0);
        assert!(ring.latest().is_none());
    }

    #[test]
    fn threshold_raises_once_and_clears_with_margin() {
        let mut watch = ThresholdWatch::default();
        let threshold = 80.0;

        // Six high samples: exactly one raise.
        let mut raises = 0;
        for _ in 0..6 {
            if watch.observe(90.0, threshold) == Some(Crossing::Raised) {
                raises += 1;
            }
        }
        assert_eq!(raises, 1);
        assert!(watch.is_active());

        // 76% is below the threshold but inside the margin: no clear.
        assert_eq!(watch.observe(76.0, threshold), None);
        assert!(watch.is_active());

        // 74% is 6 points under: clears exactly once.
        let mut clears = 0;
        for _ in 0..6 {
            if watch.observe(74.0, threshold) == Some(Crossing::Cleared) {
                clears += 1;
            }
        }
        assert_eq!(clears, 1);
        assert!(!watch.is_active());
    }

    #[test]
    fn health_reports_tick_age() {
        let health = SamplerHealth::new();
        assert_eq!(health.last_tick_age(), Duration::MAX);
        health.beat();
        assert!(health.last_tick_age() < Duration::from_secs(1));
    }
}
