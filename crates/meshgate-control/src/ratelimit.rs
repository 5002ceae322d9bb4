//! Per-channel token bucket
//!
//! `bytes_per_second = mbps * 1e6 / 8` and the bucket holds at most
//! `burst_bytes = (burst_mbps or mbps) * 1e6 / 8`. Chunks that fit the
//! available tokens are delivered at once; others queue until the bucket
//! refills. Queueing more than one burst worth of bytes closes the limiter.

use bytes::Bytes;
use meshgate_proto::{BandwidthLimit, ChannelId, IngressRule};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

type Deliver = Box<dyn FnOnce(Option<Bytes>) + Send>;

struct Queued {
    data: Bytes,
    deliver: Deliver,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
    queue: VecDeque<Queued>,
    queued_bytes: usize,
    flush_timer: Option<JoinHandle<()>>,
    last_delay: Duration,
    closed: bool,
}

struct Shared {
    channel_id: ChannelId,
    limit: Option<BandwidthLimit>,
    bytes_per_second: f64,
    burst_bytes: f64,
    /// Held while callbacks run so deliveries keep their order
    delivery: Mutex<()>,
    state: Mutex<BucketState>,
}

/// Token-bucket shaper for one channel
#[derive(Clone)]
pub struct RateLimiter {
    shared: Arc<Shared>,
}

/// Snapshot for periodic stats
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimiterStats {
    pub channel_id: ChannelId,
    pub bandwidth_limit: Option<BandwidthLimit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bandwidth: Option<BandwidthStats>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BandwidthStats {
    pub queued_bytes: usize,
    pub queue_length: usize,
    pub tokens: f64,
    pub burst_bytes: f64,
    pub throttled: bool,
    pub last_delay_ms: u64,
}

impl RateLimiter {
    /// Limiter shaped by the bandwidth limit of `rule`, if any
    pub fn new(channel_id: ChannelId, rule: Option<&IngressRule>) -> Self {
        let limit = rule
            .and_then(|r| r.bandwidth_limit)
            .filter(|l| l.mbps > 0.0);
        let (bytes_per_second, burst_bytes) = match &limit {
            Some(l) => (
                l.mbps * 1_000_000.0 / 8.0,
                l.burst_mbps.unwrap_or(l.mbps) * 1_000_000.0 / 8.0,
            ),
            None => (0.0, 0.0),
        };

        Self {
            shared: Arc::new(Shared {
                channel_id,
                limit,
                bytes_per_second,
                burst_bytes,
                delivery: Mutex::new(()),
                state: Mutex::new(BucketState {
                    tokens: burst_bytes,
                    last_refill: Instant::now(),
                    queue: VecDeque::new(),
                    queued_bytes: 0,
                    flush_timer: None,
                    last_delay: Duration::ZERO,
                    closed: false,
                }),
            }),
        }
    }

    /// Pass-through limiter
    pub fn unlimited(channel_id: ChannelId) -> Self {
        Self::new(channel_id, None)
    }

    pub fn is_limited(&self) -> bool {
        self.shared.limit.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Run `deliver` with `data` now or once enough tokens are available
    ///
    /// Returns false when the limiter is closed, including when this chunk
    /// pushed the queue past one burst and closed it. `data == None` is a
    /// flush request and is never shaped.
    pub fn handle<F>(&self, data: Option<Bytes>, deliver: F) -> bool
    where
        F: FnOnce(Option<Bytes>) + Send + 'static,
    {
        let shared = &self.shared;
        let _delivery = shared.delivery.lock();
        let mut state = shared.state.lock();
        if state.closed {
            return false;
        }

        let data = match data {
            Some(data) if shared.limit.is_some() => data,
            data => {
                drop(state);
                deliver(data);
                return true;
            }
        };

        let size = data.len();
        shared.refill(&mut state, Instant::now());

        if state.queue.is_empty() && state.tokens >= size as f64 {
            state.tokens = (state.tokens - size as f64).max(0.0);
            drop(state);
            deliver(Some(data));
            return true;
        }

        state.queue.push_back(Queued {
            data,
            deliver: Box::new(deliver),
        });
        state.queued_bytes += size;

        if state.queued_bytes as f64 > shared.burst_bytes {
            warn!(
                channel_id = shared.channel_id,
                "Rate limit queue exceeded burst ({} bytes queued)", state.queued_bytes
            );
            shared.close_locked(&mut state);
            return false;
        }

        self.schedule_flush(&mut state);
        true
    }

    fn schedule_flush(&self, state: &mut BucketState) {
        if state.closed || state.flush_timer.is_some() {
            return;
        }
        let delay = self.shared.next_delay(state);
        state.last_delay = delay;

        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        state.flush_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = weak.upgrade() {
                RateLimiter { shared }.flush();
            }
        }));
    }

    fn flush(&self) {
        let shared = &self.shared;
        let _delivery = shared.delivery.lock();
        let ready = {
            let mut state = shared.state.lock();
            state.flush_timer = None;
            if state.closed {
                return;
            }
            shared.refill(&mut state, Instant::now());

            let mut ready = Vec::new();
            while let Some(head) = state.queue.front() {
                let size = head.data.len();
                if state.tokens < size as f64 {
                    break;
                }
                state.tokens -= size as f64;
                state.queued_bytes -= size;
                if let Some(item) = state.queue.pop_front() {
                    ready.push(item);
                }
            }

            if !state.queue.is_empty() {
                self.schedule_flush(&mut state);
            }
            ready
        };

        for item in ready {
            if self.is_closed() {
                break;
            }
            (item.deliver)(Some(item.data));
        }
    }

    /// Cancel the flush timer and drop everything queued; later calls fail
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        self.shared.close_locked(&mut state);
    }

    pub fn stats(&self) -> RateLimiterStats {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        shared.refill(&mut state, Instant::now());

        RateLimiterStats {
            channel_id: shared.channel_id,
            bandwidth_limit: shared.limit,
            bandwidth: shared.limit.as_ref().map(|_| BandwidthStats {
                queued_bytes: state.queued_bytes,
                queue_length: state.queue.len(),
                tokens: state.tokens,
                burst_bytes: shared.burst_bytes,
                throttled: !state.queue.is_empty(),
                last_delay_ms: state.last_delay.as_millis() as u64,
            }),
        }
    }
}

impl Shared {
    fn refill(&self, state: &mut BucketState, now: Instant) {
        if self.limit.is_none() {
            return;
        }
        let elapsed = now.saturating_duration_since(state.last_refill);
        if elapsed.is_zero() {
            return;
        }
        state.tokens =
            (state.tokens + elapsed.as_secs_f64() * self.bytes_per_second).min(self.burst_bytes);
        state.last_refill = now;
    }

    /// Time until the queue head fits, at least 1ms
    fn next_delay(&self, state: &BucketState) -> Duration {
        let Some(head) = state.queue.front() else {
            return Duration::ZERO;
        };
        let deficit = (head.data.len() as f64 - state.tokens).max(1.0);
        let millis = (deficit / self.bytes_per_second * 1000.0).ceil().max(1.0);
        Duration::from_millis(millis as u64)
    }

    fn close_locked(&self, state: &mut BucketState) {
        if let Some(timer) = state.flush_timer.take() {
            timer.abort();
        }
        if !state.closed {
            debug!(channel_id = self.channel_id, "Rate limiter closed");
        }
        state.closed = true;
        state.queue.clear();
        state.queued_bytes = 0;
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("channel_id", &self.shared.channel_id)
            .field("limit", &self.shared.limit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    /// 8 Mbps: one million bytes per second, one million bytes of burst
    fn eight_mbps() -> IngressRule {
        IngressRule::allowing().with_bandwidth(8.0, None)
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> Box<dyn FnOnce(Option<Bytes>) + Send>) {
        let delivered = Arc::new(AtomicUsize::new(0));
        let sink = delivered.clone();
        let make = move || {
            let sink = sink.clone();
            Box::new(move |data: Option<Bytes>| {
                sink.fetch_add(data.map_or(0, |d| d.len()), Ordering::SeqCst);
            }) as Box<dyn FnOnce(Option<Bytes>) + Send>
        };
        (delivered, make)
    }

    fn chunk(size: usize) -> Option<Bytes> {
        Some(Bytes::from(vec![0u8; size]))
    }

    #[tokio::test]
    async fn test_no_limit_passes_through() {
        let limiter = RateLimiter::new(1, Some(&IngressRule::allowing()));
        assert!(!limiter.is_limited());

        let (delivered, make) = counter();
        for _ in 0..10 {
            assert!(limiter.handle(chunk(10_000_000), make()));
        }
        assert_eq!(delivered.load(Ordering::SeqCst), 100_000_000);
        assert!(limiter.stats().bandwidth.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_chunk_waits_for_refill() {
        let limiter = RateLimiter::new(2, Some(&eight_mbps()));
        let (delivered, make) = counter();

        assert!(limiter.handle(chunk(1_000_000), make()));
        assert_eq!(delivered.load(Ordering::SeqCst), 1_000_000);

        assert!(limiter.handle(chunk(500_000), make()));
        assert_eq!(delivered.load(Ordering::SeqCst), 1_000_000);
        let stats = limiter.stats().bandwidth.unwrap();
        assert!(stats.throttled);
        assert_eq!(stats.last_delay_ms, 500);

        sleep(Duration::from_millis(499)).await;
        assert_eq!(delivered.load(Ordering::SeqCst), 1_000_000);

        sleep(Duration::from_millis(2)).await;
        assert_eq!(delivered.load(Ordering::SeqCst), 1_500_000);
        assert!(!limiter.stats().bandwidth.unwrap().throttled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunk_larger_than_burst_closes() {
        let limiter = RateLimiter::new(3, Some(&eight_mbps()));
        let (delivered, make) = counter();

        assert!(!limiter.handle(chunk(1_000_001), make()));
        assert!(limiter.is_closed());
        assert!(!limiter.handle(chunk(1), make()));
        assert!(!limiter.handle(None, make()));
        assert_eq!(delivered.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_stays_within_bucket_bounds() {
        let limiter = RateLimiter::new(4, Some(&IngressRule::allowing().with_bandwidth(8.0, Some(4.0))));
        let (delivered, make) = counter();

        // Burst of 500k bytes, sustained 1M bytes/s
        for _ in 0..5 {
            assert!(limiter.handle(chunk(100_000), make()));
        }
        assert_eq!(delivered.load(Ordering::SeqCst), 500_000);

        let start = Instant::now();
        let mut offered = 500_000;
        while start.elapsed() < Duration::from_secs(2) {
            if limiter.stats().bandwidth.unwrap().queued_bytes < 400_000 {
                assert!(limiter.handle(chunk(100_000), make()));
                offered += 100_000;
            }
            sleep(Duration::from_millis(10)).await;
        }

        let window = start.elapsed().as_secs_f64();
        let total = delivered.load(Ordering::SeqCst) as f64;
        assert!(total <= 500_000.0 + 1_000_000.0 * window + 1.0);
        assert!(total >= 1_000_000.0);
        assert!(offered as f64 >= total);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_drops_queue() {
        let limiter = RateLimiter::new(5, Some(&eight_mbps()));
        let (delivered, make) = counter();

        assert!(limiter.handle(chunk(900_000), make()));
        assert!(limiter.handle(chunk(200_000), make()));
        limiter.close();

        sleep(Duration::from_secs(5)).await;
        assert_eq!(delivered.load(Ordering::SeqCst), 900_000);
        assert_eq!(limiter.stats().bandwidth.unwrap().queued_bytes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_request_bypasses_queue() {
        let limiter = RateLimiter::new(6, Some(&eight_mbps()));
        let calls = Arc::new(AtomicUsize::new(0));
        let hits = calls.clone();
        assert!(limiter.handle(None, move |data| {
            assert!(data.is_none());
            hits.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
