//! Translated samples and their Prometheus representation.
use chrono::{DateTime, Utc};
use prometheus::proto::{self, LabelPair, MetricFamily, MetricType};
use std::collections::BTreeSet;

use crate::histogram::Buckets;
use crate::utils::sanitize_label_name;

/// How a sample is exposed to Prometheus.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueKind {
    Gauge,
    Counter,
}

/// A scalar sample ready to be exposed.
#[derive(Clone, Debug, PartialEq)]
pub struct ConstMetric {
    pub fq_name: String,
    pub help: String,
    pub label_keys: Vec<String>,
    pub label_values: Vec<String>,
    pub value_kind: ValueKind,
    pub value: f64,
    /// End of the point interval the value was taken from.
    pub report_time: DateTime<Utc>,
    /// When the exporter observed the value.
    pub collection_time: DateTime<Utc>,
}

/// A histogram sample ready to be exposed.
#[derive(Clone, Debug, PartialEq)]
pub struct HistogramMetric {
    pub fq_name: String,
    pub help: String,
    pub label_keys: Vec<String>,
    pub label_values: Vec<String>,
    pub count: u64,
    pub sum: f64,
    pub buckets: Buckets,
    pub report_time: DateTime<Utc>,
    pub collection_time: DateTime<Utc>,
}

/// Common access to the label set of translated samples.
pub(crate) trait LabeledMetric {
    fn labels(&self) -> (&[String], &[String]);
    fn push_label(&mut self, key: String, value: String);
}

macro_rules! impl_labeled_metric {
    ($ty:ty) => {
        impl LabeledMetric for $ty {
            fn labels(&self) -> (&[String], &[String]) {
                (&self.label_keys, &self.label_values)
            }

            fn push_label(&mut self, key: String, value: String) {
                self.label_keys.push(key);
                self.label_values.push(value);
            }
        }
    };
}

impl_labeled_metric!(ConstMetric);
impl_labeled_metric!(HistogramMetric);

impl ConstMetric {
    pub(crate) fn to_metric_family(&self) -> MetricFamily {
        let mut pm = proto::Metric::default();
        pm.set_label(label_pairs(&self.label_keys, &self.label_values));
        pm.set_timestamp_ms(self.report_time.timestamp_millis());

        let metric_type = match self.value_kind {
            ValueKind::Counter => {
                let mut c = proto::Counter::default();
                c.set_value(self.value);
                pm.set_counter(c);
                MetricType::COUNTER
            }
            ValueKind::Gauge => {
                let mut g = proto::Gauge::default();
                g.set_value(self.value);
                pm.set_gauge(g);
                MetricType::GAUGE
            }
        };

        let mut mf = MetricFamily::default();
        mf.set_name(self.fq_name.clone());
        mf.set_help(self.help.clone());
        mf.set_field_type(metric_type);
        mf.set_metric(vec![pm]);
        mf
    }
}

impl HistogramMetric {
    pub(crate) fn to_metric_family(&self) -> MetricFamily {
        let bucket = self
            .buckets
            .iter()
            .map(|(bound, count)| {
                let mut b = proto::Bucket::default();
                b.set_upper_bound(*bound);
                b.set_cumulative_count(*count);
                b
            })
            .collect();

        let mut h = proto::Histogram::default();
        h.set_sample_sum(self.sum);
        h.set_sample_count(self.count);
        h.set_bucket(bucket);

        let mut pm = proto::Metric::default();
        pm.set_label(label_pairs(&self.label_keys, &self.label_values));
        pm.set_timestamp_ms(self.report_time.timestamp_millis());
        pm.set_histogram(h);

        let mut mf = MetricFamily::default();
        mf.set_name(self.fq_name.clone());
        mf.set_help(self.help.clone());
        mf.set_field_type(MetricType::HISTOGRAM);
        mf.set_metric(vec![pm]);
        mf
    }
}

fn label_pairs(keys: &[String], values: &[String]) -> Vec<LabelPair> {
    keys.iter()
        .zip(values)
        .map(|(key, value)| {
            let mut lp = LabelPair::default();
            lp.set_name(sanitize_label_name(key).into_owned());
            lp.set_value(value.clone());
            lp
        })
        .collect()
}

/// Pads samples sharing a name so that all of them carry the same label keys.
///
/// Prometheus rejects a family whose members have different label names;
/// missing keys are appended in sorted order with an empty value.
pub(crate) fn fill_missing_labels<M: LabeledMetric>(metrics: &mut [M]) {
    let all_keys: BTreeSet<String> = {
        let key_sets: Vec<BTreeSet<&str>> = metrics
            .iter()
            .map(|m| m.labels().0.iter().map(String::as_str).collect())
            .collect();
        if key_sets.windows(2).all(|w| w[0] == w[1]) {
            return;
        }
        key_sets
            .iter()
            .flatten()
            .map(|key| key.to_string())
            .collect()
    };

    for metric in metrics.iter_mut() {
        let missing: Vec<String> = all_keys
            .iter()
            .filter(|key| !metric.labels().0.contains(*key))
            .cloned()
            .collect();
        for key in missing {
            metric.push_label(key, String::new());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn const_metric(name: &str, labels: &[(&str, &str)], value: f64) -> ConstMetric {
        ConstMetric {
            fq_name: name.to_string(),
            help: "help".to_string(),
            label_keys: labels.iter().map(|(k, _)| k.to_string()).collect(),
            label_values: labels.iter().map(|(_, v)| v.to_string()).collect(),
            value_kind: ValueKind::Gauge,
            value,
            report_time: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            collection_time: Utc.timestamp_opt(1_700_000_010, 0).unwrap(),
        }
    }

    #[test]
    fn const_metric_family() {
        let mut m = const_metric("stackdriver_x", &[("unit", "s"), ("zone", "a")], 1.5);
        m.value_kind = ValueKind::Counter;
        let mf = m.to_metric_family();
        assert_eq!(mf.name(), "stackdriver_x");
        assert_eq!(mf.get_field_type(), MetricType::COUNTER);
        let metric = &mf.get_metric()[0];
        assert_eq!(metric.get_counter().value(), 1.5);
        assert_eq!(metric.timestamp_ms(), 1_700_000_000_000);
        let labels: Vec<(&str, &str)> = metric
            .get_label()
            .iter()
            .map(|lp| (lp.name(), lp.value()))
            .collect();
        assert_eq!(labels, vec![("unit", "s"), ("zone", "a")]);
    }

    #[test]
    fn histogram_metric_family() {
        let m = HistogramMetric {
            fq_name: "stackdriver_latency".to_string(),
            help: String::new(),
            label_keys: vec!["unit".to_string()],
            label_values: vec!["ms".to_string()],
            count: 6,
            sum: 15.0,
            buckets: vec![(1.0, 1), (2.0, 3), (f64::INFINITY, 6)],
            report_time: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            collection_time: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        };
        let mf = m.to_metric_family();
        assert_eq!(mf.get_field_type(), MetricType::HISTOGRAM);
        let h = mf.get_metric()[0].get_histogram();
        assert_eq!(h.get_sample_count(), 6);
        assert_eq!(h.get_sample_sum(), 15.0);
        let bounds: Vec<(f64, u64)> = h
            .get_bucket()
            .iter()
            .map(|b| (b.upper_bound(), b.cumulative_count()))
            .collect();
        assert_eq!(bounds, vec![(1.0, 1), (2.0, 3), (f64::INFINITY, 6)]);
    }

    #[test]
    fn label_names_are_sanitized() {
        let m = const_metric("x", &[("system.name", "vm")], 1.0);
        let mf = m.to_metric_family();
        assert_eq!(mf.get_metric()[0].get_label()[0].name(), "system_name");
    }

    #[test]
    fn fill_pads_missing_keys() {
        let mut metrics = vec![
            const_metric("x", &[("unit", ""), ("zone", "a")], 1.0),
            const_metric("x", &[("unit", ""), ("instance", "i-1")], 2.0),
        ];
        fill_missing_labels(&mut metrics);
        assert_eq!(metrics[0].label_keys, vec!["unit", "zone", "instance"]);
        assert_eq!(metrics[0].label_values, vec!["", "a", ""]);
        assert_eq!(metrics[1].label_keys, vec!["unit", "instance", "zone"]);
        assert_eq!(metrics[1].label_values, vec!["", "i-1", ""]);
    }

    #[test]
    fn fill_leaves_consistent_sets_alone() {
        let mut metrics = vec![
            const_metric("x", &[("a", "1"), ("b", "2")], 1.0),
            const_metric("x", &[("b", "3"), ("a", "4")], 2.0),
        ];
        let before = metrics.clone();
        fill_missing_labels(&mut metrics);
        assert_eq!(metrics, before);
    }
}
