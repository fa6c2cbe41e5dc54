//! Progress multiplexing
//!
//! Transports report progress at their own granularity, which can be every
//! few kilobytes. The multiplexer turns that stream into registry updates at
//! a bounded rate (one per `progress_batch_ms` per transfer), annotated with
//! the throughput measured since the previous emitted sample. The first
//! sample and the final one (`bytes == total`) are never dropped.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::transfer::{TransferId, TransferRegistry};
use super::transport::OnProgress;

/// A sample that passed the throttle
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSample {
    pub bytes: u64,
    pub total: u64,
    /// `None` when no time elapsed since the previous emitted sample.
    pub speed: Option<f64>,
}

/// Per-transfer throttle state
#[derive(Debug)]
pub struct ProgressThrottle {
    interval: Duration,
    last_at: Instant,
    last_bytes: u64,
    emitted: bool,
    finished: bool,
}

impl ProgressThrottle {
    pub fn new(interval: Duration, started_at: Instant) -> Self {
        Self {
            interval,
            last_at: started_at,
            last_bytes: 0,
            emitted: false,
            finished: false,
        }
    }

    /// Decides whether a raw sample should be emitted.
    pub fn observe(&mut self, bytes: u64, total: u64, now: Instant) -> Option<ProgressSample> {
        if self.finished {
            return None;
        }

        let elapsed = now.saturating_duration_since(self.last_at);
        let is_final = total > 0 && bytes >= total;
        if self.emitted && !is_final && elapsed < self.interval {
            return None;
        }

        Some(self.emit(bytes, total, now, is_final))
    }

    /// Emits the final sample unless one was already emitted.
    pub fn flush(&mut self, total: u64, now: Instant) -> Option<ProgressSample> {
        if self.finished {
            return None;
        }
        Some(self.emit(total, total, now, true))
    }

    fn emit(&mut self, bytes: u64, total: u64, now: Instant, is_final: bool) -> ProgressSample {
        let elapsed = now.saturating_duration_since(self.last_at);
        let speed = if elapsed.is_zero() {
            None
        } else {
            Some(bytes.saturating_sub(self.last_bytes) as f64 / elapsed.as_secs_f64())
        };

        self.last_at = now;
        self.last_bytes = self.last_bytes.max(bytes);
        self.emitted = true;
        self.finished = is_final;

        ProgressSample { bytes, total, speed }
    }
}

/// Hands out per-transfer [`ProgressReporter`]s that write into the registry
#[derive(Debug, Clone)]
pub struct ProgressMultiplexer {
    registry: Arc<TransferRegistry>,
    interval: Duration,
}

impl ProgressMultiplexer {
    pub fn new(registry: Arc<TransferRegistry>, interval: Duration) -> Self {
        Self { registry, interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn reporter(&self, id: TransferId) -> ProgressReporter {
        ProgressReporter {
            id,
            registry: self.registry.clone(),
            throttle: Arc::new(Mutex::new(ProgressThrottle::new(self.interval, Instant::now()))),
        }
    }
}

/// Progress sink for one transfer
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    id: TransferId,
    registry: Arc<TransferRegistry>,
    throttle: Arc<Mutex<ProgressThrottle>>,
}

impl ProgressReporter {
    pub fn id(&self) -> TransferId {
        self.id
    }

    /// Feeds a raw sample; returns true if it was written to the registry.
    pub fn report(&self, bytes: u64, total: u64) -> bool {
        self.report_at(bytes, total, Instant::now())
    }

    pub fn report_at(&self, bytes: u64, total: u64, now: Instant) -> bool {
        // Held across the registry write so samples land in observation order.
        let mut throttle = self.throttle.lock();
        match throttle.observe(bytes, total, now) {
            Some(sample) => self.apply(sample),
            None => false,
        }
    }

    /// Guarantees the 100% sample is recorded once the transport reports success.
    pub fn finish(&self, total: u64) -> bool {
        let mut throttle = self.throttle.lock();
        match throttle.flush(total, Instant::now()) {
            Some(sample) => self.apply(sample),
            None => false,
        }
    }

    /// Adapts this reporter to the transport callback signature
    pub fn callback(&self) -> OnProgress {
        let reporter = self.clone();
        Arc::new(move |bytes, total| {
            reporter.report(bytes, total);
        })
    }

    fn apply(&self, sample: ProgressSample) -> bool {
        let file_size = (sample.total > 0).then_some(sample.total);
        match self
            .registry
            .update_progress(self.id, sample.bytes, file_size, sample.speed)
        {
            Ok(Some(record)) => {
                debug!(
                    transfer_id = %self.id,
                    bytes = record.bytes_transferred,
                    total = record.file_size,
                    speed = record.speed_bytes_per_second,
                    "Progress"
                );
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(transfer_id = %self.id, error = %e, "Dropping progress sample");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::events::TransferEvent;
    use crate::net::transfer::{TransferDirection, TransferStatus};
    use crate::net::transport::Locator;

    const INTERVAL: Duration = Duration::from_millis(100);

    // ==================== ProgressThrottle Tests ====================

    #[test]
    fn test_first_sample_always_emitted() {
        let start = Instant::now();
        let mut throttle = ProgressThrottle::new(INTERVAL, start);
        assert!(throttle.observe(1, 100, start).is_some());
        assert!(throttle.observe(2, 100, start + Duration::from_millis(1)).is_none());
    }

    #[test]
    fn test_interval_gates_emission() {
        let start = Instant::now();
        let mut throttle = ProgressThrottle::new(INTERVAL, start);
        throttle.observe(0, 1000, start).unwrap();

        assert!(throttle.observe(10, 1000, start + Duration::from_millis(99)).is_none());
        assert!(throttle.observe(20, 1000, start + Duration::from_millis(100)).is_some());
        assert!(throttle.observe(30, 1000, start + Duration::from_millis(150)).is_none());
        assert!(throttle.observe(40, 1000, start + Duration::from_millis(201)).is_some());
    }

    #[test]
    fn test_speed_between_emitted_samples() {
        let start = Instant::now();
        let mut throttle = ProgressThrottle::new(INTERVAL, start);

        let first = throttle.observe(0, 10_000, start).unwrap();
        assert_eq!(first.speed, None);

        let sample = throttle
            .observe(500, 10_000, start + Duration::from_millis(500))
            .unwrap();
        let speed = sample.speed.unwrap();
        assert!((speed - 1000.0).abs() < 1e-6);
    }

    #[test]
    fn test_burst_throttled_but_final_kept() {
        let start = Instant::now();
        let mut throttle = ProgressThrottle::new(INTERVAL, start);
        let total = 1000u64;

        // 1000 samples spread over 50ms
        let emitted: Vec<_> = (1..=total)
            .filter_map(|bytes| {
                let now = start + Duration::from_micros(bytes * 50);
                throttle.observe(bytes, total, now)
            })
            .collect();

        let bound = (50f64 / 100f64).ceil() as usize + 1;
        assert!(emitted.len() <= bound, "emitted {} samples", emitted.len());
        assert_eq!(emitted.last().unwrap().bytes, total);
    }

    #[test]
    fn test_nothing_after_final() {
        let start = Instant::now();
        let mut throttle = ProgressThrottle::new(INTERVAL, start);
        assert!(throttle.observe(10, 10, start).is_some());
        assert!(throttle.observe(10, 10, start + Duration::from_secs(1)).is_none());
        assert!(throttle.flush(10, start + Duration::from_secs(2)).is_none());
    }

    #[test]
    fn test_flush_emits_final_when_missing() {
        let start = Instant::now();
        let mut throttle = ProgressThrottle::new(INTERVAL, start);
        throttle.observe(4, 10, start).unwrap();
        assert!(throttle.observe(8, 10, start + Duration::from_millis(10)).is_none());

        let last = throttle.flush(10, start + Duration::from_millis(20)).unwrap();
        assert_eq!(last.bytes, 10);
        assert_eq!(last.total, 10);
    }

    // ==================== ProgressReporter Tests ====================

    #[test]
    fn test_reporter_writes_registry() {
        let registry = Arc::new(TransferRegistry::new(64));
        let id = registry.create(TransferDirection::Receive, "received_file", 0, Locator::from("l"));
        let mux = ProgressMultiplexer::new(registry.clone(), INTERVAL);
        let reporter = mux.reporter(id);

        assert!(reporter.report(3, 10));
        let record = registry.get(id).unwrap();
        assert_eq!(record.status, TransferStatus::InProgress);
        assert_eq!(record.bytes_transferred, 3);
        assert_eq!(record.file_size, 10);
    }

    #[tokio::test]
    async fn test_reporter_burst_events() {
        let registry = Arc::new(TransferRegistry::new(4096));
        let id = registry.create(TransferDirection::Receive, "a.bin", 1000, Locator::from("l"));
        let (_, mut sub) = registry.watch(id).unwrap();
        let reporter = ProgressMultiplexer::new(registry.clone(), INTERVAL).reporter(id);

        let start = Instant::now();
        for bytes in 1..=1000u64 {
            reporter.report_at(bytes, 1000, start + Duration::from_micros(bytes * 50));
        }
        registry.complete(id).unwrap();

        let mut progress = Vec::new();
        while let Some(event) = sub.next().await {
            if let TransferEvent::Progress(record) = event {
                progress.push(record.bytes_transferred);
            }
        }

        assert!(progress.len() <= 2);
        assert_eq!(progress.last(), Some(&1000));
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_reporter_ignores_finished_transfer() {
        let registry = Arc::new(TransferRegistry::new(64));
        let id = registry.create(TransferDirection::Send, "a.bin", 10, Locator::from("l"));
        registry.cancel(id).unwrap();

        let reporter = ProgressMultiplexer::new(registry.clone(), INTERVAL).reporter(id);
        assert!(!reporter.report(5, 10));
        assert!(!reporter.finish(10));
        assert_eq!(registry.get(id).unwrap().bytes_transferred, 0);
    }

    #[test]
    fn test_callback_feeds_reporter() {
        let registry = Arc::new(TransferRegistry::new(64));
        let id = registry.create(TransferDirection::Receive, "a.bin", 10, Locator::from("l"));
        let reporter = ProgressMultiplexer::new(registry.clone(), INTERVAL).reporter(id);

        let callback = reporter.callback();
        callback(10, 10);
        assert_eq!(registry.get(id).unwrap().bytes_transferred, 10);
    }
}
