// SPDX-License-Identifier: MIT OR Apache-2.0

//! Metrics for the factory, channel cache and registration lifecycle.
//!
//! Every component records through the [`MetricsSink`] trait. The sink is
//! chosen once at construction: [`AtomicMetrics`] keeps Prometheus-compatible
//! counters in-process, [`NoopMetrics`] compiles every call down to nothing.
//! Timed operations execute either way.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

/// Why a channel left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EvictionReason {
    TtlExpired,
    Manual,
    SizeLimit,
    ProcessShutdown,
}

impl EvictionReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            EvictionReason::TtlExpired => "ttl_expired",
            EvictionReason::Manual => "manual",
            EvictionReason::SizeLimit => "size_limit",
            EvictionReason::ProcessShutdown => "process_shutdown",
        }
    }
}

/// Sink for counters, gauges and timers. All methods default to no-ops so a
/// backend only implements what it stores.
pub trait MetricsSink: Send + Sync {
    fn client_created(&self, _service: &str) {}
    fn channel_created(&self, _service: &str) {}
    fn channel_evicted(&self, _service: &str, _reason: EvictionReason) {}
    fn cache_hit(&self, _service: &str) {}
    fn cache_miss(&self, _service: &str) {}
    fn discovery_attempt(&self, _service: &str, _result: &str) {}
    fn exception(&self, _exception: &str, _service: &str, _operation: &str) {}
    fn set_active_channels(&self, _count: u64) {}
    fn set_cache_size(&self, _size: u64) {}
    fn operation_duration(&self, _operation: &str, _duration: Duration) {}
}

/// The absent-backend sink.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {}

/// Run `fut` and record its wall-clock duration under `operation`.
pub async fn timed<T, F>(sink: &dyn MetricsSink, operation: &str, fut: F) -> T
where
    F: std::future::Future<Output = T>,
{
    let start = tokio::time::Instant::now();
    let out = fut.await;
    sink.operation_duration(operation, start.elapsed());
    out
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CounterKey {
    name: &'static str,
    labels: Vec<(&'static str, String)>,
}

#[derive(Debug)]
struct DurationStat {
    count: AtomicU64,
    // Nanoseconds.
    sum: AtomicU64,
    max: AtomicU64,
}

impl DurationStat {
    fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            max: AtomicU64::new(0),
        }
    }

    fn observe(&self, duration: Duration) {
        let nanos = duration.as_nanos() as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(nanos, Ordering::Relaxed);
        self.max.fetch_max(nanos, Ordering::Relaxed);
    }
}

/// In-process sink with atomic counters and a Prometheus text export.
#[derive(Debug)]
pub struct AtomicMetrics {
    namespace: String,
    counters: RwLock<HashMap<CounterKey, AtomicU64>>,
    durations: RwLock<HashMap<String, DurationStat>>,
    active_channels: AtomicU64,
    cache_size: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl AtomicMetrics {
    #[must_use]
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            counters: RwLock::new(HashMap::new()),
            durations: RwLock::new(HashMap::new()),
            active_channels: AtomicU64::new(0),
            cache_size: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new("dynamic_grpc")
    }

    fn bump(&self, key: CounterKey) {
        {
            let counters = self.counters.read().expect("lock poisoned");
            if let Some(counter) = counters.get(&key) {
                counter.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        let mut counters = self.counters.write().expect("lock poisoned");
        counters
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Sum of a counter across all label sets; mostly used by tests and the
    /// snapshot.
    #[must_use]
    pub fn counter_total(&self, name: &str) -> u64 {
        let counters = self.counters.read().expect("lock poisoned");
        counters
            .iter()
            .filter(|(key, _)| key.name == name)
            .map(|(_, value)| value.load(Ordering::Relaxed))
            .sum()
    }

    /// Value of a counter for one exact label set.
    #[must_use]
    pub fn counter_with(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let counters = self.counters.read().expect("lock poisoned");
        counters
            .iter()
            .filter(|(key, _)| {
                key.name == name
                    && key.labels.len() == labels.len()
                    && key
                        .labels
                        .iter()
                        .zip(labels)
                        .all(|((ka, va), (kb, vb))| ka == kb && va == vb)
            })
            .map(|(_, value)| value.load(Ordering::Relaxed))
            .sum()
    }

    /// Hit rate over the lifetime of the sink, 0.0 when nothing was looked
    /// up yet.
    #[must_use]
    pub fn cache_hit_rate(&self) -> f64 {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            clients_created: self.counter_total("client_created_total"),
            channels_created: self.counter_total("channel_created_total"),
            channels_evicted: self.counter_total("channel_evicted_total"),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache_hit_rate: self.cache_hit_rate(),
            active_channels: self.active_channels.load(Ordering::Relaxed),
            cache_size: self.cache_size.load(Ordering::Relaxed),
            exceptions: self.counter_total("exceptions_total"),
        }
    }

    /// Export everything in Prometheus text format.
    #[must_use]
    pub fn to_prometheus_text(&self) -> String {
        let mut output = String::new();
        let ns = &self.namespace;

        {
            let counters = self.counters.read().expect("lock poisoned");
            let mut names: Vec<&'static str> = counters.keys().map(|k| k.name).collect();
            names.sort_unstable();
            names.dedup();
            for name in names {
                output.push_str(&format!("# TYPE {ns}_{name} counter\n"));
                for (key, value) in counters.iter().filter(|(k, _)| k.name == name) {
                    let labels = key
                        .labels
                        .iter()
                        .map(|(k, v)| format!("{k}=\"{v}\""))
                        .collect::<Vec<_>>()
                        .join(",");
                    if labels.is_empty() {
                        output.push_str(&format!(
                            "{ns}_{name} {}\n",
                            value.load(Ordering::Relaxed)
                        ));
                    } else {
                        output.push_str(&format!(
                            "{ns}_{name}{{{labels}}} {}\n",
                            value.load(Ordering::Relaxed)
                        ));
                    }
                }
            }
        }

        output.push_str(&format!("# TYPE {ns}_channels_active gauge\n"));
        output.push_str(&format!(
            "{ns}_channels_active {}\n",
            self.active_channels.load(Ordering::Relaxed)
        ));
        output.push_str(&format!("# TYPE {ns}_cache_size gauge\n"));
        output.push_str(&format!(
            "{ns}_cache_size {}\n",
            self.cache_size.load(Ordering::Relaxed)
        ));
        output.push_str(&format!("# TYPE {ns}_cache_hit_rate gauge\n"));
        output.push_str(&format!("{ns}_cache_hit_rate {}\n", self.cache_hit_rate()));

        {
            let durations = self.durations.read().expect("lock poisoned");
            output.push_str(&format!("# TYPE {ns}_operation_duration_seconds summary\n"));
            for (operation, stat) in durations.iter() {
                let count = stat.count.load(Ordering::Relaxed);
                let sum = stat.sum.load(Ordering::Relaxed) as f64 / 1_000_000_000.0;
                output.push_str(&format!(
                    "{ns}_operation_duration_seconds_count{{operation=\"{operation}\"}} {count}\n"
                ));
                output.push_str(&format!(
                    "{ns}_operation_duration_seconds_sum{{operation=\"{operation}\"}} {sum}\n"
                ));
            }
        }

        output
    }
}

impl Default for AtomicMetrics {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl MetricsSink for AtomicMetrics {
    fn client_created(&self, service: &str) {
        self.bump(CounterKey {
            name: "client_created_total",
            labels: vec![("service", service.to_string())],
        });
    }

    fn channel_created(&self, service: &str) {
        self.bump(CounterKey {
            name: "channel_created_total",
            labels: vec![("service", service.to_string())],
        });
    }

    fn channel_evicted(&self, service: &str, reason: EvictionReason) {
        self.bump(CounterKey {
            name: "channel_evicted_total",
            labels: vec![
                ("service", service.to_string()),
                ("reason", reason.as_str().to_string()),
            ],
        });
    }

    fn cache_hit(&self, service: &str) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        self.bump(CounterKey {
            name: "cache_hit_total",
            labels: vec![("service", service.to_string())],
        });
    }

    fn cache_miss(&self, service: &str) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        self.bump(CounterKey {
            name: "cache_miss_total",
            labels: vec![("service", service.to_string())],
        });
    }

    fn discovery_attempt(&self, service: &str, result: &str) {
        self.bump(CounterKey {
            name: "discovery_attempts_total",
            labels: vec![
                ("service", service.to_string()),
                ("result", result.to_string()),
            ],
        });
    }

    fn exception(&self, exception: &str, service: &str, operation: &str) {
        self.bump(CounterKey {
            name: "exceptions_total",
            labels: vec![
                ("exception", exception.to_string()),
                ("service", service.to_string()),
                ("operation", operation.to_string()),
            ],
        });
    }

    fn set_active_channels(&self, count: u64) {
        self.active_channels.store(count, Ordering::Relaxed);
    }

    fn set_cache_size(&self, size: u64) {
        self.cache_size.store(size, Ordering::Relaxed);
    }

    fn operation_duration(&self, operation: &str, duration: Duration) {
        {
            let durations = self.durations.read().expect("lock poisoned");
            if let Some(stat) = durations.get(operation) {
                stat.observe(duration);
                return;
            }
        }
        let mut durations = self.durations.write().expect("lock poisoned");
        durations
            .entry(operation.to_string())
            .or_insert_with(DurationStat::new)
            .observe(duration);
    }
}

/// Point-in-time view for programmatic access.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub clients_created: u64,
    pub channels_created: u64,
    pub channels_evicted: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate: f64,
    pub active_channels: u64,
    pub cache_size: u64,
    pub exceptions: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_hits_and_misses() {
        let metrics = AtomicMetrics::with_defaults();
        metrics.cache_hit("orders");
        metrics.cache_hit("orders");
        metrics.cache_miss("billing");

        assert_eq!(metrics.counter_total("cache_hit_total"), 2);
        assert_eq!(metrics.counter_total("cache_miss_total"), 1);
        assert!((metrics.cache_hit_rate() - 2.0 / 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn eviction_reasons_are_labeled() {
        let metrics = AtomicMetrics::with_defaults();
        metrics.channel_evicted("orders", EvictionReason::SizeLimit);
        metrics.channel_evicted("orders", EvictionReason::SizeLimit);
        metrics.channel_evicted("orders", EvictionReason::TtlExpired);

        assert_eq!(
            metrics.counter_with(
                "channel_evicted_total",
                &[("service", "orders"), ("reason", "size_limit")]
            ),
            2
        );
        assert_eq!(
            metrics.counter_with(
                "channel_evicted_total",
                &[("service", "orders"), ("reason", "ttl_expired")]
            ),
            1
        );
    }

    #[test]
    fn gauges_are_stored() {
        let metrics = AtomicMetrics::with_defaults();
        metrics.set_active_channels(3);
        metrics.set_cache_size(3);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.active_channels, 3);
        assert_eq!(snapshot.cache_size, 3);
    }

    #[test]
    fn prometheus_text_contains_everything() {
        let metrics = AtomicMetrics::new("test");
        metrics.channel_created("orders");
        metrics.cache_miss("orders");
        metrics.operation_duration("get_channel", Duration::from_millis(12));

        let output = metrics.to_prometheus_text();
        assert!(output.contains("# TYPE test_channel_created_total counter"));
        assert!(output.contains("test_channel_created_total{service=\"orders\"} 1"));
        assert!(output.contains("test_cache_hit_rate 0"));
        assert!(output
            .contains("test_operation_duration_seconds_count{operation=\"get_channel\"} 1"));
    }

    #[tokio::test]
    async fn timed_runs_with_noop_sink() {
        let sink = NoopMetrics;
        let value = timed(&sink, "op", async { 41 + 1 }).await;
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn timed_records_duration() {
        let sink = AtomicMetrics::with_defaults();
        let _ = timed(&sink, "op", async { "done" }).await;
        let durations = sink.durations.read().unwrap();
        assert_eq!(durations["op"].count.load(Ordering::Relaxed), 1);
    }
}
