//! Translation of Monitoring time series pages into Prometheus samples.
//!
//! A [TimeSeriesTranslator] lives for one descriptor of one scrape. Pages are
//! fed through [TimeSeriesTranslator::translate_page] as they arrive and
//! [TimeSeriesTranslator::complete] flushes buffered and aggregated samples
//! once the last page was seen.
use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use prometheus::proto::MetricFamily;
use std::collections::BTreeMap;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error};

use crate::api::{
    Distribution, ListTimeSeriesResponse, MetricDescriptor, MetricKind, Point, TimeSeries,
    ValueType,
};
use crate::delta::{DeltaCounterStore, DeltaHistogramStore};
use crate::error::{Error, Result};
use crate::histogram::generate_histogram_buckets;
use crate::metrics::{fill_missing_labels, ConstMetric, HistogramMetric, ValueKind};
use crate::utils::{build_fq_name, normalize_metric_name, sanitize_label_name};

/// Channel the translated families are sent into.
pub type MetricSender = UnboundedSender<MetricFamily>;

const NAMESPACE: &str = "stackdriver";

/// Per collector translation switches.
#[derive(Clone, Debug, Default)]
pub struct TranslatorSettings {
    /// Project the collector scrapes; used by the delegated project filter.
    pub project_id: String,
    /// Pad samples sharing a name to a common label key set.
    pub fill_missing_labels: bool,
    /// Skip series whose `project_id` label names another project.
    pub drop_delegated_projects: bool,
    /// Expose DELTA series as running counters.
    pub aggregate_deltas: bool,
}

/// Translates the time series of one descriptor.
#[derive(Debug)]
pub struct TimeSeriesTranslator<'a> {
    descriptor: &'a MetricDescriptor,
    settings: &'a TranslatorSettings,
    counter_store: &'a DeltaCounterStore,
    histogram_store: &'a DeltaHistogramStore,
    sink: &'a MetricSender,
    const_metrics: BTreeMap<String, Vec<ConstMetric>>,
    histogram_metrics: BTreeMap<String, Vec<HistogramMetric>>,
}

impl<'a> TimeSeriesTranslator<'a> {
    pub fn new(
        descriptor: &'a MetricDescriptor,
        settings: &'a TranslatorSettings,
        counter_store: &'a DeltaCounterStore,
        histogram_store: &'a DeltaHistogramStore,
        sink: &'a MetricSender,
    ) -> Self {
        TimeSeriesTranslator {
            descriptor,
            settings,
            counter_store,
            histogram_store,
            sink,
            const_metrics: BTreeMap::new(),
            histogram_metrics: BTreeMap::new(),
        }
    }

    /// Translates every series of a page.
    ///
    /// Fails only when a point carries an unparseable end time; all other
    /// problems skip the offending series.
    pub fn translate_page(&mut self, page: &ListTimeSeriesResponse) -> Result<()> {
        for series in &page.time_series {
            self.translate_series(series)?;
        }
        Ok(())
    }

    fn translate_series(&mut self, series: &TimeSeries) -> Result<()> {
        let Some((report_time, point)) = latest_point(&series.points)? else {
            debug!(
                name: "TimeSeriesWithoutPoints",
                metric = %series.metric.metric_type,
                resource = %series.resource.resource_type
            );
            return Ok(());
        };

        let (label_keys, label_values) = self.series_labels(series);

        if self.settings.drop_delegated_projects && self.is_delegated(&label_keys, &label_values)
        {
            debug!(
                name: "DropDelegatedProjectSeries",
                metric = %series.metric.metric_type
            );
            return Ok(());
        }

        let value_kind = match series.metric_kind {
            MetricKind::Gauge => ValueKind::Gauge,
            MetricKind::Cumulative => ValueKind::Counter,
            MetricKind::Delta if self.settings.aggregate_deltas => ValueKind::Counter,
            MetricKind::Delta => ValueKind::Gauge,
            MetricKind::Unspecified => {
                debug!(
                    name: "DiscardUnknownMetricKind",
                    metric = %series.metric.metric_type
                );
                return Ok(());
            }
        };

        let fq_name = build_fq_name(
            NAMESPACE,
            &normalize_metric_name(&series.resource.resource_type),
            &normalize_metric_name(&series.metric.metric_type),
        );

        let value = &point.value;
        let scalar = match series.value_type {
            ValueType::Bool => value.bool_value.map(|b| if b { 1.0 } else { 0.0 }),
            ValueType::Int64 => value.int64_value.map(|v| v as f64),
            ValueType::Double => value.double_value,
            ValueType::Distribution => {
                match &value.distribution_value {
                    Some(dist) => self.collect_histogram(
                        series,
                        fq_name,
                        label_keys,
                        label_values,
                        dist,
                        report_time,
                    ),
                    None => debug!(
                        name: "DiscardMissingValue",
                        metric = %series.metric.metric_type,
                        value_type = ?series.value_type
                    ),
                }
                return Ok(());
            }
            ValueType::Unspecified => {
                debug!(
                    name: "DiscardUnknownValueType",
                    metric = %series.metric.metric_type
                );
                return Ok(());
            }
        };

        let Some(value) = scalar else {
            debug!(
                name: "DiscardMissingValue",
                metric = %series.metric.metric_type,
                value_type = ?series.value_type
            );
            return Ok(());
        };

        let metric = ConstMetric {
            fq_name,
            help: self.descriptor.description.clone(),
            label_keys,
            label_values,
            value_kind,
            value,
            report_time,
            collection_time: Utc::now(),
        };

        if series.metric_kind == MetricKind::Delta && self.settings.aggregate_deltas {
            self.counter_store.increment(self.descriptor, metric);
        } else if self.settings.fill_missing_labels {
            self.const_metrics
                .entry(metric.fq_name.clone())
                .or_default()
                .push(metric);
        } else {
            self.send(metric.to_metric_family());
        }
        Ok(())
    }

    fn collect_histogram(
        &mut self,
        series: &TimeSeries,
        fq_name: String,
        label_keys: Vec<String>,
        label_values: Vec<String>,
        dist: &Distribution,
        report_time: DateTime<Utc>,
    ) {
        let buckets = match generate_histogram_buckets(dist) {
            Ok(buckets) => buckets,
            Err(err) => {
                debug!(
                    name: "DiscardDistribution",
                    metric = %series.metric.metric_type,
                    resource = %series.resource.resource_type,
                    error = %err
                );
                return;
            }
        };

        let metric = HistogramMetric {
            fq_name,
            help: self.descriptor.description.clone(),
            label_keys,
            label_values,
            count: u64::try_from(dist.count).unwrap_or(0),
            sum: dist.mean * dist.count as f64,
            buckets,
            report_time,
            collection_time: Utc::now(),
        };

        if series.metric_kind == MetricKind::Delta && self.settings.aggregate_deltas {
            self.histogram_store.increment(self.descriptor, metric);
        } else if self.settings.fill_missing_labels {
            self.histogram_metrics
                .entry(metric.fq_name.clone())
                .or_default()
                .push(metric);
        } else {
            self.send(metric.to_metric_family());
        }
    }

    /// Builds the label set: `unit`, then metric, resource and system labels.
    /// Keys are sanitized first; the first occurrence of a sanitized key wins.
    fn series_labels(&self, series: &TimeSeries) -> (Vec<String>, Vec<String>) {
        let mut keys = vec!["unit".to_string()];
        let mut values = vec![self.descriptor.unit.clone()];

        let mut add = |raw: &str, value: &str| {
            let key = sanitize_label_name(raw);
            if keys.iter().any(|k| k.as_str() == key.as_ref()) {
                debug!(name: "DuplicateLabelKey", key = %raw, sanitized = %key);
                return;
            }
            keys.push(key.into_owned());
            values.push(value.to_string());
        };

        for (key, value) in &series.metric.labels {
            add(key, value);
        }
        for (key, value) in &series.resource.labels {
            add(key, value);
        }

        if let Some(raw) = series
            .metadata
            .as_ref()
            .and_then(|m| m.system_labels.as_ref())
        {
            match serde_json::from_value::<BTreeMap<String, String>>(raw.clone()) {
                Ok(system_labels) => {
                    for (key, value) in &system_labels {
                        add(key, value);
                    }
                }
                Err(err) => error!(
                    name: "SystemLabelsDecodeFailed",
                    metric = %series.metric.metric_type,
                    error = %err
                ),
            }
        }

        (keys, values)
    }

    fn is_delegated(&self, keys: &[String], values: &[String]) -> bool {
        keys.iter()
            .zip(values)
            .any(|(k, v)| k == "project_id" && *v != self.settings.project_id)
    }

    /// Flushes the descriptor.
    ///
    /// Exposes every running total the delta stores hold for the descriptor
    /// and emits buffered samples, padding label sets when enabled.
    /// `reporting_start` is the instant the scrape began.
    pub fn complete(mut self, reporting_start: DateTime<Utc>) {
        let now = Utc::now()
            .duration_trunc(TimeDelta::minutes(1))
            .unwrap_or_else(|_| Utc::now());

        for mut metric in self.counter_store.list_metrics(&self.descriptor.metric_type) {
            refresh_stale_report_time(
                &mut metric.report_time,
                metric.collection_time,
                reporting_start,
                now,
            );
            if self.settings.fill_missing_labels {
                self.const_metrics
                    .entry(metric.fq_name.clone())
                    .or_default()
                    .push(metric);
            } else {
                self.send(metric.to_metric_family());
            }
        }

        for mut metric in self
            .histogram_store
            .list_metrics(&self.descriptor.metric_type)
        {
            refresh_stale_report_time(
                &mut metric.report_time,
                metric.collection_time,
                reporting_start,
                now,
            );
            if self.settings.fill_missing_labels {
                self.histogram_metrics
                    .entry(metric.fq_name.clone())
                    .or_default()
                    .push(metric);
            } else {
                self.send(metric.to_metric_family());
            }
        }

        for mut metrics in std::mem::take(&mut self.const_metrics).into_values() {
            fill_missing_labels(&mut metrics);
            for metric in &metrics {
                self.send(metric.to_metric_family());
            }
        }
        for mut metrics in std::mem::take(&mut self.histogram_metrics).into_values() {
            fill_missing_labels(&mut metrics);
            for metric in &metrics {
                self.send(metric.to_metric_family());
            }
        }
    }

    fn send(&self, family: MetricFamily) {
        if self.sink.send(family).is_err() {
            debug!(
                name: "MetricReceiverDropped",
                descriptor = %self.descriptor.metric_type
            );
        }
    }
}

/// Selects the point with the latest end time. Ties keep the earlier point.
fn latest_point(points: &[Point]) -> Result<Option<(DateTime<Utc>, &Point)>> {
    let mut latest: Option<(DateTime<Utc>, &Point)> = None;
    for point in points {
        let end_time = parse_timestamp(&point.interval.end_time)?;
        if latest.map_or(true, |(newest, _)| end_time > newest) {
            latest = Some((end_time, point));
        }
    }
    Ok(latest)
}

pub(crate) fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|source| Error::Timestamp {
            value: value.to_string(),
            source,
        })
}

/// A running total that was not refreshed during this scrape keeps its
/// reporting lag relative to the current minute, so it does not go stale.
fn refresh_stale_report_time(
    report_time: &mut DateTime<Utc>,
    collection_time: DateTime<Utc>,
    reporting_start: DateTime<Utc>,
    now: DateTime<Utc>,
) {
    if reporting_start <= collection_time {
        return;
    }
    let lag = TimeDelta::minutes((collection_time - *report_time).num_minutes());
    *report_time = now - lag;
}
