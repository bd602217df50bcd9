use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

/// Fixed-bucket latency histogram. Buckets are upper bounds in
/// milliseconds; the last bucket is unbounded.
const LATENCY_BUCKETS_MS: [u64; 7] = [5, 10, 25, 50, 100, 250, 1000];

struct Histogram {
    buckets: [AtomicU64; LATENCY_BUCKETS_MS.len() + 1],
    sum_ms: AtomicU64,
    count: AtomicU64,
}

impl Default for Histogram {
    fn default() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            sum_ms: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }
}

impl Histogram {
    fn observe(&self, elapsed: Duration) {
        let ms = elapsed.as_millis() as u64;
        let idx = LATENCY_BUCKETS_MS
            .iter()
            .position(|bound| ms <= *bound)
            .unwrap_or(LATENCY_BUCKETS_MS.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.sum_ms.fetch_add(ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> HistogramSnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let sum_ms = self.sum_ms.load(Ordering::Relaxed);
        HistogramSnapshot {
            count,
            avg_ms: if count == 0 {
                0.0
            } else {
                sum_ms as f64 / count as f64
            },
            buckets: self
                .buckets
                .iter()
                .map(|b| b.load(Ordering::Relaxed))
                .collect(),
        }
    }
}

#[derive(Serialize)]
pub struct HistogramSnapshot {
    count: u64,
    avg_ms: f64,
    buckets: Vec<u64>,
}

/// Process-wide counters and histograms for the gateway, per the
/// observability component. Exposed as a JSON snapshot at
/// `GET /api/v1/metrics` rather than pushed to an external sink -- no new
/// metrics crate is introduced for this.
#[derive(Default)]
pub struct GatewayMetrics {
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    close_by_code: Mutex<HashMap<u16, u64>>,
    messages_in: AtomicU64,
    messages_out: AtomicU64,
    errors_by_code: Mutex<HashMap<u32, u64>>,
    subscribes_by_topic: Mutex<HashMap<String, u64>>,
    unsubscribes_by_topic: Mutex<HashMap<String, u64>>,
    rate_limit_drops: AtomicU64,
    slow_consumer_disconnects: AtomicU64,
    broadcast_drops: AtomicU64,
    request_latency: Histogram,
    write_queue_depth: Histogram,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self, close_code: u16) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
        let mut map = self.close_by_code.lock().expect("close_by_code lock");
        *map.entry(close_code).or_insert(0) += 1;
    }

    pub fn message_in(&self) {
        self.messages_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_out(&self) {
        self.messages_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn error(&self, code: u32) {
        let mut map = self.errors_by_code.lock().expect("errors_by_code lock");
        *map.entry(code).or_insert(0) += 1;
    }

    pub fn subscribe(&self, topic: &str) {
        let mut map = self
            .subscribes_by_topic
            .lock()
            .expect("subscribes_by_topic lock");
        *map.entry(topic.to_owned()).or_insert(0) += 1;
    }

    pub fn unsubscribe(&self, topic: &str) {
        let mut map = self
            .unsubscribes_by_topic
            .lock()
            .expect("unsubscribes_by_topic lock");
        *map.entry(topic.to_owned()).or_insert(0) += 1;
    }

    pub fn rate_limit_drop(&self) {
        self.rate_limit_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn slow_consumer_disconnect(&self) {
        self.slow_consumer_disconnects
            .fetch_add(1, Ordering::Relaxed);
    }

    /// A fan-out enqueue dropped for one subscriber because its outbound
    /// queue was full. Distinct from `slow_consumer_disconnect`, which
    /// tracks the connection actually being closed for staying full too
    /// long.
    pub fn broadcast_drop(&self) {
        self.broadcast_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_latency(&self, elapsed: Duration) {
        self.request_latency.observe(elapsed);
    }

    pub fn write_queue_depth_at_enqueue(&self, depth: usize) {
        self.write_queue_depth
            .observe(Duration::from_millis(depth as u64));
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            close_by_code: self.close_by_code.lock().expect("close_by_code lock").clone(),
            messages_in: self.messages_in.load(Ordering::Relaxed),
            messages_out: self.messages_out.load(Ordering::Relaxed),
            errors_by_code: self
                .errors_by_code
                .lock()
                .expect("errors_by_code lock")
                .clone(),
            subscribes_by_topic: self
                .subscribes_by_topic
                .lock()
                .expect("subscribes_by_topic lock")
                .clone(),
            unsubscribes_by_topic: self
                .unsubscribes_by_topic
                .lock()
                .expect("unsubscribes_by_topic lock")
                .clone(),
            rate_limit_drops: self.rate_limit_drops.load(Ordering::Relaxed),
            slow_consumer_disconnects: self.slow_consumer_disconnects.load(Ordering::Relaxed),
            broadcast_drops: self.broadcast_drops.load(Ordering::Relaxed),
            request_latency_ms: self.request_latency.snapshot(),
            write_queue_depth: self.write_queue_depth.snapshot(),
        }
    }
}

#[derive(Serialize)]
pub struct MetricsSnapshot {
    connections_opened: u64,
    connections_closed: u64,
    close_by_code: HashMap<u16, u64>,
    messages_in: u64,
    messages_out: u64,
    errors_by_code: HashMap<u32, u64>,
    subscribes_by_topic: HashMap<String, u64>,
    unsubscribes_by_topic: HashMap<String, u64>,
    rate_limit_drops: u64,
    slow_consumer_disconnects: u64,
    broadcast_drops: u64,
    request_latency_ms: HistogramSnapshot,
    write_queue_depth: HistogramSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_across_calls() {
        let metrics = GatewayMetrics::new();
        metrics.connection_opened();
        metrics.connection_opened();
        metrics.connection_closed(1000);
        metrics.message_in();
        metrics.error(4010);
        metrics.error(4010);
        metrics.subscribe("market-data");
        metrics.rate_limit_drop();

        let snap = metrics.snapshot();
        assert_eq!(snap.connections_opened, 2);
        assert_eq!(snap.connections_closed, 1);
        assert_eq!(snap.close_by_code.get(&1000), Some(&1));
        assert_eq!(snap.messages_in, 1);
        assert_eq!(snap.errors_by_code.get(&4010), Some(&2));
        assert_eq!(snap.subscribes_by_topic.get("market-data"), Some(&1));
        assert_eq!(snap.rate_limit_drops, 1);
    }

    #[test]
    fn histogram_buckets_latency_into_the_right_bucket() {
        let metrics = GatewayMetrics::new();
        metrics.request_latency(Duration::from_millis(3));
        metrics.request_latency(Duration::from_millis(2000));

        let snap = metrics.snapshot();
        assert_eq!(snap.request_latency_ms.count, 2);
        assert_eq!(snap.request_latency_ms.buckets[0], 1);
        assert_eq!(
            *snap.request_latency_ms.buckets.last().unwrap(),
            1
        );
    }
}
