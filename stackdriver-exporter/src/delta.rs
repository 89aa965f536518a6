//! Accumulation of DELTA metrics into monotonic series.
//!
//! The Monitoring API reports a DELTA point as the change over its interval.
//! Prometheus counters must be cumulative, so each new point is folded into a
//! running total that lives for the lifetime of the process. Totals restart
//! from zero when the exporter restarts.
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tracing::debug;

use crate::api::MetricDescriptor;
use crate::metrics::{ConstMetric, HistogramMetric};

/// Keeps running totals of DELTA samples per descriptor and label set.
pub trait DeltaStore<M>: fmt::Debug + Send + Sync {
    /// Folds `value` into the running total of its series.
    ///
    /// Samples that are not newer than the stored one are ignored, so the
    /// same point seen in overlapping query windows is only counted once.
    fn increment(&self, descriptor: &MetricDescriptor, value: M);

    /// Returns a snapshot of all running totals of a descriptor type.
    fn list_metrics(&self, descriptor_type: &str) -> Vec<M>;
}

/// Store for scalar DELTA metrics.
pub type DeltaCounterStore = dyn DeltaStore<ConstMetric>;
/// Store for distribution DELTA metrics.
pub type DeltaHistogramStore = dyn DeltaStore<HistogramMetric>;

/// Identity of a series inside its descriptor: the metric name plus its
/// labels sorted by key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DeltaKey {
    fq_name: String,
    labels: Vec<(String, String)>,
}

impl DeltaKey {
    fn new(fq_name: &str, keys: &[String], values: &[String]) -> Self {
        let mut labels: Vec<(String, String)> = keys
            .iter()
            .cloned()
            .zip(values.iter().cloned())
            .collect();
        labels.sort();
        DeltaKey {
            fq_name: fq_name.to_string(),
            labels,
        }
    }
}

impl fmt::Display for DeltaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{{", self.fq_name)?;
        for (i, (key, value)) in self.labels.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{key}={value:?}")?;
        }
        f.write_str("}")
    }
}

/// A sample that can be folded into a running total.
pub trait DeltaMetric: Clone + Send + Sync + fmt::Debug + 'static {
    /// Identity of the series inside its descriptor.
    fn delta_key(&self) -> DeltaKey;
    fn report_time(&self) -> chrono::DateTime<chrono::Utc>;
    /// Adds the previous running total into this (newer) sample.
    fn accumulate(&mut self, previous: &Self);
}

impl DeltaMetric for ConstMetric {
    fn delta_key(&self) -> DeltaKey {
        DeltaKey::new(&self.fq_name, &self.label_keys, &self.label_values)
    }

    fn report_time(&self) -> chrono::DateTime<chrono::Utc> {
        self.report_time
    }

    fn accumulate(&mut self, previous: &Self) {
        self.value += previous.value;
    }
}

impl DeltaMetric for HistogramMetric {
    fn delta_key(&self) -> DeltaKey {
        DeltaKey::new(&self.fq_name, &self.label_keys, &self.label_values)
    }

    fn report_time(&self) -> chrono::DateTime<chrono::Utc> {
        self.report_time
    }

    fn accumulate(&mut self, previous: &Self) {
        let same_layout = self.buckets.len() == previous.buckets.len()
            && self
                .buckets
                .iter()
                .zip(&previous.buckets)
                .all(|((a, _), (b, _))| a == b);
        if !same_layout {
            debug!(
                name: "DeltaHistogramLayoutChanged",
                fq_name = %self.fq_name,
                message = "bucket bounds changed, restarting the running total"
            );
            return;
        }

        for ((_, count), (_, prev)) in self.buckets.iter_mut().zip(&previous.buckets) {
            *count += prev;
        }
        self.count += previous.count;
        self.sum += previous.sum;
    }
}

struct Collected<M> {
    metric: M,
    last_collected_at: Instant,
}

type Entry<M> = Arc<Mutex<HashMap<DeltaKey, Collected<M>>>>;

/// In-memory [DeltaStore].
///
/// Series that have not been updated for `ttl` are dropped the next time
/// their descriptor is listed. A zero `ttl` keeps series forever.
pub struct InMemoryDeltaStore<M> {
    ttl: Duration,
    store: Mutex<HashMap<String, Entry<M>>>,
}

impl<M> InMemoryDeltaStore<M> {
    pub fn new(ttl: Duration) -> Self {
        InMemoryDeltaStore {
            ttl,
            store: Mutex::new(HashMap::new()),
        }
    }

    fn entry(&self, descriptor_type: &str) -> Entry<M> {
        let mut store = self.store.lock().unwrap_or_else(|err| err.into_inner());
        Arc::clone(store.entry(descriptor_type.to_string()).or_default())
    }

    fn existing_entry(&self, descriptor_type: &str) -> Option<Entry<M>> {
        let store = self.store.lock().unwrap_or_else(|err| err.into_inner());
        store.get(descriptor_type).map(Arc::clone)
    }
}

impl<M> fmt::Debug for InMemoryDeltaStore<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryDeltaStore")
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl<M: DeltaMetric> DeltaStore<M> for InMemoryDeltaStore<M> {
    fn increment(&self, descriptor: &MetricDescriptor, mut value: M) {
        let entry = self.entry(&descriptor.metric_type);
        let key = value.delta_key();
        let mut collected = entry.lock().unwrap_or_else(|err| err.into_inner());

        match collected.get_mut(&key) {
            None => {
                debug!(name: "DeltaStore.TrackNew", key = %key);
                collected.insert(
                    key,
                    Collected {
                        metric: value,
                        last_collected_at: Instant::now(),
                    },
                );
            }
            Some(existing) if existing.metric.report_time() < value.report_time() => {
                debug!(name: "DeltaStore.Increment", key = %key);
                value.accumulate(&existing.metric);
                existing.metric = value;
                existing.last_collected_at = Instant::now();
            }
            Some(existing) => {
                debug!(
                    name: "DeltaStore.IgnoreOldSample",
                    key = %key,
                    stored = %existing.metric.report_time(),
                    incoming = %value.report_time()
                );
            }
        }
    }

    fn list_metrics(&self, descriptor_type: &str) -> Vec<M> {
        let Some(entry) = self.existing_entry(descriptor_type) else {
            return Vec::new();
        };
        let mut collected = entry.lock().unwrap_or_else(|err| err.into_inner());

        if !self.ttl.is_zero() {
            let ttl = self.ttl;
            collected.retain(|key, c| {
                let keep = c.last_collected_at.elapsed() <= ttl;
                if !keep {
                    debug!(name: "DeltaStore.Evict", key = %key);
                }
                keep
            });
        }

        collected.values().map(|c| c.metric.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::ValueKind;
    use chrono::{TimeZone, Utc};
    use std::thread;

    fn descriptor() -> MetricDescriptor {
        MetricDescriptor {
            metric_type: "pubsub.googleapis.com/topic/send_request_count".to_string(),
            ..Default::default()
        }
    }

    fn counter(value: f64, report_secs: i64, zone: &str) -> ConstMetric {
        ConstMetric {
            fq_name: "stackdriver_pubsub_topic_send_request_count".to_string(),
            help: String::new(),
            label_keys: vec!["unit".to_string(), "zone".to_string()],
            label_values: vec!["1".to_string(), zone.to_string()],
            value_kind: ValueKind::Counter,
            value,
            report_time: Utc.timestamp_opt(report_secs, 0).unwrap(),
            collection_time: Utc::now(),
        }
    }

    fn histogram(
        buckets: Vec<(f64, u64)>,
        count: u64,
        sum: f64,
        report_secs: i64,
    ) -> HistogramMetric {
        HistogramMetric {
            fq_name: "stackdriver_latencies".to_string(),
            help: String::new(),
            label_keys: vec!["unit".to_string()],
            label_values: vec!["ms".to_string()],
            count,
            sum,
            buckets,
            report_time: Utc.timestamp_opt(report_secs, 0).unwrap(),
            collection_time: Utc::now(),
        }
    }

    #[test]
    fn running_total_of_sequential_deltas() {
        let store = InMemoryDeltaStore::new(Duration::from_secs(600));
        store.increment(&descriptor(), counter(5.0, 60, "a"));
        store.increment(&descriptor(), counter(7.0, 120, "a"));

        let metrics = store.list_metrics(&descriptor().metric_type);
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].value, 12.0);
        assert_eq!(metrics[0].report_time, Utc.timestamp_opt(120, 0).unwrap());
    }

    #[test]
    fn repeated_point_is_counted_once() {
        let store = InMemoryDeltaStore::new(Duration::from_secs(600));
        store.increment(&descriptor(), counter(5.0, 60, "a"));
        store.increment(&descriptor(), counter(5.0, 60, "a"));
        store.increment(&descriptor(), counter(3.0, 30, "a"));

        assert_eq!(store.list_metrics(&descriptor().metric_type)[0].value, 5.0);
    }

    #[test]
    fn label_sets_are_tracked_separately() {
        let store = InMemoryDeltaStore::new(Duration::from_secs(600));
        store.increment(&descriptor(), counter(1.0, 60, "a"));
        store.increment(&descriptor(), counter(2.0, 60, "b"));
        store.increment(&descriptor(), counter(4.0, 120, "b"));

        let mut values: Vec<f64> = store
            .list_metrics(&descriptor().metric_type)
            .into_iter()
            .map(|m| m.value)
            .collect();
        values.sort_by(f64::total_cmp);
        assert_eq!(values, vec![1.0, 6.0]);
    }

    fn labeled(value: f64, labels: &[(&str, &str)]) -> ConstMetric {
        let mut metric = counter(value, 60, "a");
        metric.label_keys = labels.iter().map(|(k, _)| k.to_string()).collect();
        metric.label_values = labels.iter().map(|(_, v)| v.to_string()).collect();
        metric
    }

    #[test]
    fn delta_key_ignores_label_order() {
        let a = labeled(1.0, &[("a", "1"), ("b", "2")]);
        let b = labeled(1.0, &[("b", "2"), ("a", "1")]);
        assert_eq!(a.delta_key(), b.delta_key());

        let mut renamed = a.clone();
        renamed.fq_name = "stackdriver_other".to_string();
        assert_ne!(a.delta_key(), renamed.delta_key());
    }

    #[test]
    fn separators_in_label_values_do_not_merge_series() {
        let store = InMemoryDeltaStore::new(Duration::from_secs(600));
        store.increment(&descriptor(), labeled(3.0, &[("a", "1|b:2")]));
        store.increment(&descriptor(), labeled(5.0, &[("a", "1"), ("b", "2")]));
        store.increment(&descriptor(), labeled(7.0, &[("a", "1,b=\"2\"")]));

        let mut values: Vec<f64> = store
            .list_metrics(&descriptor().metric_type)
            .into_iter()
            .map(|m| m.value)
            .collect();
        values.sort_by(f64::total_cmp);
        assert_eq!(values, vec![3.0, 5.0, 7.0]);
    }

    #[test]
    fn unknown_descriptor_lists_nothing() {
        let store = InMemoryDeltaStore::<ConstMetric>::new(Duration::from_secs(600));
        assert!(store.list_metrics("nope").is_empty());
    }

    #[test]
    fn stale_series_are_evicted() {
        let store = InMemoryDeltaStore::new(Duration::from_millis(20));
        store.increment(&descriptor(), counter(1.0, 60, "a"));
        thread::sleep(Duration::from_millis(50));
        assert!(store.list_metrics(&descriptor().metric_type).is_empty());
    }

    #[test]
    fn histogram_deltas_accumulate_per_bucket() {
        let store = InMemoryDeltaStore::new(Duration::from_secs(600));
        store.increment(
            &descriptor(),
            histogram(vec![(1.0, 1), (f64::INFINITY, 2)], 2, 3.0, 60),
        );
        store.increment(
            &descriptor(),
            histogram(vec![(1.0, 0), (f64::INFINITY, 3)], 3, 9.0, 120),
        );

        let h = &store.list_metrics(&descriptor().metric_type)[0];
        assert_eq!(h.buckets, vec![(1.0, 1), (f64::INFINITY, 5)]);
        assert_eq!(h.count, 5);
        assert_eq!(h.sum, 12.0);
    }

    #[test]
    fn histogram_layout_change_restarts_total() {
        let store = InMemoryDeltaStore::new(Duration::from_secs(600));
        store.increment(&descriptor(), histogram(vec![(1.0, 1), (f64::INFINITY, 2)], 2, 3.0, 60));
        store.increment(&descriptor(), histogram(vec![(5.0, 1), (f64::INFINITY, 1)], 1, 2.0, 120));

        let h = &store.list_metrics(&descriptor().metric_type)[0];
        assert_eq!(h.buckets, vec![(5.0, 1), (f64::INFINITY, 1)]);
        assert_eq!(h.count, 1);
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let store = InMemoryDeltaStore::new(Duration::from_secs(600));
        thread::scope(|s| {
            for t in 0..8 {
                let store = &store;
                s.spawn(move || {
                    for i in 0..50 {
                        // distinct series per thread so every sample is newer than the last
                        store.increment(&descriptor(), counter(1.0, i + 1, &format!("z{t}")));
                    }
                });
            }
        });
        let total: f64 = store
            .list_metrics(&descriptor().metric_type)
            .iter()
            .map(|m| m.value)
            .sum();
        assert_eq!(total, 400.0);
    }
}
