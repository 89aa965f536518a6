//! The scrape pipeline of one Google Cloud project.
use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use prometheus::{core::Collector as _, proto::MetricFamily, Counter, Gauge, Opts};
use std::{
    collections::{BTreeMap, HashSet},
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{sync::mpsc, task::JoinSet};
use tracing::{debug, error, info};

use crate::api::{
    Aggregation, ListMetricDescriptorsRequest, ListTimeSeriesRequest, MetricDescriptor,
    MonitoringClient,
};
use crate::config::CollectorOptions;
use crate::delta::{DeltaCounterStore, DeltaHistogramStore, InMemoryDeltaStore};
use crate::descriptor_cache::{new_descriptor_cache, DescriptorCache};
use crate::error::{Error, Result};
use crate::metrics::{ConstMetric, HistogramMetric};
use crate::translator::{MetricSender, TimeSeriesTranslator, TranslatorSettings};
use crate::utils::project_resource;

const META_NAMESPACE: &str = "stackdriver";
const META_SUBSYSTEM: &str = "monitoring";

/// Builder for [MonitoringCollector].
pub struct MonitoringCollectorBuilder {
    project_id: String,
    client: Arc<dyn MonitoringClient>,
    options: CollectorOptions,
    counter_store: Option<Arc<DeltaCounterStore>>,
    histogram_store: Option<Arc<DeltaHistogramStore>>,
    descriptor_cache: Option<Box<dyn DescriptorCache>>,
}

impl fmt::Debug for MonitoringCollectorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitoringCollectorBuilder")
            .field("project_id", &self.project_id)
            .field("options", &self.options)
            .finish()
    }
}

impl MonitoringCollectorBuilder {
    /// Replaces the collector options.
    pub fn with_options(mut self, options: CollectorOptions) -> Self {
        self.options = options;
        self
    }

    /// Uses the given store for scalar DELTA running totals.
    ///
    /// By default an in-memory store evicting after
    /// [CollectorOptions::aggregate_deltas_ttl] is created.
    pub fn with_counter_store(mut self, store: Arc<DeltaCounterStore>) -> Self {
        self.counter_store = Some(store);
        self
    }

    /// Uses the given store for distribution DELTA running totals.
    pub fn with_histogram_store(mut self, store: Arc<DeltaHistogramStore>) -> Self {
        self.histogram_store = Some(store);
        self
    }

    /// Uses the given descriptor cache instead of the one selected by
    /// [CollectorOptions::descriptor_cache_ttl].
    pub fn with_descriptor_cache(mut self, cache: Box<dyn DescriptorCache>) -> Self {
        self.descriptor_cache = Some(cache);
        self
    }

    /// Creates the collector.
    ///
    /// Fails when no metric type prefix is configured or the project id is
    /// empty.
    pub fn build(self) -> Result<MonitoringCollector> {
        if self.project_id.is_empty() {
            return Err(Error::Config("project id must not be empty".to_string()));
        }
        if self.options.metric_type_prefixes.is_empty() {
            return Err(Error::Config(
                "at least one metric type prefix is required".to_string(),
            ));
        }

        let ttl = self.options.aggregate_deltas_ttl;
        let counter_store: Arc<DeltaCounterStore> = match self.counter_store {
            Some(store) => store,
            None => Arc::new(InMemoryDeltaStore::<ConstMetric>::new(ttl)),
        };
        let histogram_store: Arc<DeltaHistogramStore> = match self.histogram_store {
            Some(store) => store,
            None => Arc::new(InMemoryDeltaStore::<HistogramMetric>::new(ttl)),
        };
        let descriptor_cache = self.descriptor_cache.unwrap_or_else(|| {
            new_descriptor_cache(
                self.options.descriptor_cache_ttl,
                self.options.descriptor_cache_only_google,
            )
        });

        let settings = TranslatorSettings {
            project_id: self.project_id.clone(),
            fill_missing_labels: self.options.fill_missing_labels,
            drop_delegated_projects: self.options.drop_delegated_projects,
            aggregate_deltas: self.options.aggregate_deltas,
        };

        Ok(MonitoringCollector {
            inner: Arc::new(Inner {
                meta: ScrapeMetrics::new(&self.project_id)?,
                project_id: self.project_id,
                client: self.client,
                options: self.options,
                settings,
                descriptor_cache,
                counter_store,
                histogram_store,
            }),
        })
    }
}

/// Scrapes the Monitoring API of one project and translates the result into
/// Prometheus metric families.
///
/// Cloning is cheap; clones share caches, delta stores and meta-metrics.
#[derive(Clone, Debug)]
pub struct MonitoringCollector {
    inner: Arc<Inner>,
}

impl MonitoringCollector {
    /// Starts building a collector for `project_id`.
    pub fn builder(
        project_id: impl Into<String>,
        client: Arc<dyn MonitoringClient>,
    ) -> MonitoringCollectorBuilder {
        MonitoringCollectorBuilder {
            project_id: project_id.into(),
            client,
            options: CollectorOptions::default(),
            counter_store: None,
            histogram_store: None,
            descriptor_cache: None,
        }
    }

    /// The project this collector scrapes.
    pub fn project_id(&self) -> &str {
        &self.inner.project_id
    }

    /// Runs one scrape and returns every translated family followed by the
    /// scrape meta-metrics.
    ///
    /// A failing scrape still returns the samples of all units that
    /// succeeded; the failure is reflected in `last_scrape_error`.
    pub async fn collect(&self) -> Vec<MetricFamily> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (_, mut families) = tokio::join!(self.scrape(tx), async move {
            let mut families = Vec::new();
            while let Some(mf) = rx.recv().await {
                families.push(mf);
            }
            families
        });

        families.extend(self.inner.meta.collect());
        families
    }

    /// Runs one scrape, sending translated families into `sink`, and
    /// updates the meta-metrics.
    ///
    /// Returns the first error any unit reported.
    pub async fn scrape(&self, sink: MetricSender) -> Result<()> {
        let begun = Instant::now();
        let begun_at = Utc::now();

        let result = Arc::clone(&self.inner).scrape(sink, begun_at).await;

        let meta = &self.inner.meta;
        if let Err(err) = &result {
            meta.scrape_errors_total.inc();
            error!(
                name: "ScrapeFailed",
                project_id = %self.inner.project_id,
                error = %err
            );
        }
        meta.scrapes_total.inc();
        meta.last_scrape_error
            .set(if result.is_err() { 1.0 } else { 0.0 });
        meta.last_scrape_timestamp.set(Utc::now().timestamp() as f64);
        meta.last_scrape_duration_seconds
            .set(begun.elapsed().as_secs_f64());

        info!(
            name: "ScrapeFinished",
            project_id = %self.inner.project_id,
            duration_ms = begun.elapsed().as_millis() as u64,
            success = result.is_ok()
        );
        result
    }
}

struct Inner {
    project_id: String,
    client: Arc<dyn MonitoringClient>,
    options: CollectorOptions,
    settings: TranslatorSettings,
    descriptor_cache: Box<dyn DescriptorCache>,
    counter_store: Arc<DeltaCounterStore>,
    histogram_store: Arc<DeltaHistogramStore>,
    meta: ScrapeMetrics,
}

impl fmt::Debug for Inner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inner")
            .field("project_id", &self.project_id)
            .field("client", &self.client)
            .field("options", &self.options)
            .field("descriptor_cache", &self.descriptor_cache)
            .finish()
    }
}

impl Inner {
    async fn scrape(self: Arc<Self>, sink: MetricSender, begun: DateTime<Utc>) -> Result<()> {
        let mut prefixes = JoinSet::new();
        for prefix in &self.options.metric_type_prefixes {
            let inner = Arc::clone(&self);
            let sink = sink.clone();
            let prefix = prefix.clone();
            prefixes.spawn(async move { inner.scrape_prefix(prefix, sink, begun).await });
        }
        drop(sink);
        first_error(prefixes).await
    }

    async fn scrape_prefix(
        self: Arc<Self>,
        prefix: String,
        sink: MetricSender,
        begun: DateTime<Utc>,
    ) -> Result<()> {
        let mut units = JoinSet::new();
        let mut seen = HashSet::new();

        if let Some(cached) = self.descriptor_cache.lookup(&prefix) {
            debug!(
                name: "DescriptorCacheHit",
                project_id = %self.project_id,
                prefix = %prefix,
                descriptors = cached.len()
            );
            self.spawn_descriptors(&mut units, &mut seen, cached, &sink, begun);
            return first_error(units).await;
        }

        debug!(
            name: "ListMetricDescriptors",
            project_id = %self.project_id,
            prefix = %prefix
        );
        let mut request = ListMetricDescriptorsRequest {
            name: project_resource(&self.project_id),
            filter: descriptor_filter(&self.options, &self.project_id, &prefix),
            page_token: None,
        };
        let mut listed = Vec::new();
        let listing = loop {
            self.meta.api_calls_total.inc();
            match self.client.list_metric_descriptors(&request).await {
                Ok(page) => {
                    listed.extend_from_slice(&page.metric_descriptors);
                    self.spawn_descriptors(
                        &mut units,
                        &mut seen,
                        page.metric_descriptors,
                        &sink,
                        begun,
                    );
                    if page.next_page_token.is_empty() {
                        break Ok(());
                    }
                    request.page_token = Some(page.next_page_token);
                }
                Err(err) => {
                    error!(
                        name: "ListMetricDescriptorsFailed",
                        project_id = %self.project_id,
                        prefix = %prefix,
                        filter = %request.filter,
                        error = %err
                    );
                    break Err(err);
                }
            }
        };

        let units = first_error(units).await;
        listing?;
        self.descriptor_cache.store(&prefix, listed);
        units
    }

    /// Starts one unit per descriptor type not seen before for this prefix.
    fn spawn_descriptors(
        self: &Arc<Self>,
        units: &mut JoinSet<Result<()>>,
        seen: &mut HashSet<String>,
        descriptors: Vec<MetricDescriptor>,
        sink: &MetricSender,
        begun: DateTime<Utc>,
    ) {
        let unique: BTreeMap<String, MetricDescriptor> = descriptors
            .into_iter()
            .filter(|d| !seen.contains(&d.metric_type))
            .map(|d| (d.metric_type.clone(), d))
            .collect();

        for (metric_type, descriptor) in unique {
            seen.insert(metric_type);
            let inner = Arc::clone(self);
            let sink = sink.clone();
            units.spawn(async move { inner.scrape_descriptor(descriptor, sink, begun).await });
        }
    }

    async fn scrape_descriptor(
        &self,
        descriptor: MetricDescriptor,
        sink: MetricSender,
        begun: DateTime<Utc>,
    ) -> Result<()> {
        let (start, end) = match request_window(&self.options, &descriptor, Utc::now()) {
            Ok(window) => window,
            Err(err) => {
                error!(
                    name: "RequestWindowInvalid",
                    project_id = %self.project_id,
                    descriptor = %descriptor.metric_type,
                    error = %err
                );
                return Err(err);
            }
        };

        let mut request = ListTimeSeriesRequest {
            name: project_resource(&self.project_id),
            filter: time_series_filter(&self.options, &self.project_id, &descriptor.metric_type),
            start_time: start.to_rfc3339_opts(SecondsFormat::Nanos, true),
            end_time: end.to_rfc3339_opts(SecondsFormat::Nanos, true),
            aggregation: aggregation_for(&self.options, &descriptor.metric_type),
            page_token: None,
        };
        debug!(
            name: "ListTimeSeries",
            project_id = %self.project_id,
            descriptor = %descriptor.metric_type,
            filter = %request.filter
        );

        let mut translator = TimeSeriesTranslator::new(
            &descriptor,
            &self.settings,
            self.counter_store.as_ref(),
            self.histogram_store.as_ref(),
            &sink,
        );

        let result = loop {
            self.meta.api_calls_total.inc();
            let page = match self.client.list_time_series(&request).await {
                Ok(page) => page,
                Err(err) => {
                    error!(
                        name: "ListTimeSeriesFailed",
                        project_id = %self.project_id,
                        descriptor = %descriptor.metric_type,
                        filter = %request.filter,
                        error = %err
                    );
                    break Err(err);
                }
            };
            if let Err(err) = translator.translate_page(&page) {
                error!(
                    name: "TranslateTimeSeriesFailed",
                    project_id = %self.project_id,
                    descriptor = %descriptor.metric_type,
                    error = %err
                );
                break Err(err);
            }
            if page.next_page_token.is_empty() {
                break Ok(());
            }
            request.page_token = Some(page.next_page_token);
        };

        // pages translated before a failure are still exposed
        translator.complete(begun);
        result
    }
}

/// Waits for every unit and returns the first error to arrive.
async fn first_error(mut units: JoinSet<Result<()>>) -> Result<()> {
    let mut first = None;
    while let Some(joined) = units.join_next().await {
        let result = joined
            .unwrap_or_else(|err| Err(Error::Other(format!("scrape task failed: {err}"))));
        if let Err(err) = result {
            first.get_or_insert(err);
        }
    }
    first.map_or(Ok(()), Err)
}

pub(crate) fn descriptor_filter(
    options: &CollectorOptions,
    project_id: &str,
    prefix: &str,
) -> String {
    if options.drop_delegated_projects {
        format!("project = \"{project_id}\" AND metric.type = starts_with(\"{prefix}\")")
    } else {
        format!("metric.type = starts_with(\"{prefix}\")")
    }
}

pub(crate) fn time_series_filter(
    options: &CollectorOptions,
    project_id: &str,
    metric_type: &str,
) -> String {
    let mut filter = if options.drop_delegated_projects {
        format!("project=\"{project_id}\" AND metric.type=\"{metric_type}\"")
    } else {
        format!("metric.type=\"{metric_type}\"")
    };
    for extra in options
        .extra_filters
        .iter()
        .filter(|f| metric_type.starts_with(&f.targeted_metric_prefix))
    {
        filter.push_str(" AND (");
        filter.push_str(&extra.filter_query);
        filter.push(')');
    }
    filter
}

pub(crate) fn aggregation_for(
    options: &CollectorOptions,
    metric_type: &str,
) -> Option<Aggregation> {
    options
        .aggregations
        .iter()
        .find(|a| metric_type.starts_with(&a.targeted_metric_prefix))
        .map(|a| a.to_aggregation())
}

/// Computes the `(start, end)` of the time series request for a descriptor.
pub(crate) fn request_window(
    options: &CollectorOptions,
    descriptor: &MetricDescriptor,
    now: DateTime<Utc>,
) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let mut end = shift_back(now, options.request_offset)?;
    let mut start = shift_back(end, options.request_interval)?;

    if options.ingest_delay {
        if let Some(delay) = descriptor.ingest_delay() {
            let delay = parse_ingest_delay(delay)?;
            debug!(
                name: "ApplyIngestDelay",
                descriptor = %descriptor.metric_type,
                delay = ?delay
            );
            end = shift_back(end, delay)?;
            start = shift_back(start, delay)?;
        }
    }
    Ok((start, end))
}

/// Parses a protobuf JSON duration such as `"180s"` or `"0.5s"`.
pub(crate) fn parse_ingest_delay(value: &str) -> Result<Duration> {
    value
        .strip_suffix('s')
        .and_then(|secs| secs.parse::<f64>().ok())
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .ok_or_else(|| Error::IngestDelay(value.to_string()))
}

/// Moves `t` back by `d`, failing instead of overflowing the calendar.
fn shift_back(t: DateTime<Utc>, d: Duration) -> Result<DateTime<Utc>> {
    TimeDelta::from_std(d)
        .ok()
        .and_then(|delta| t.checked_sub_signed(delta))
        .ok_or_else(|| Error::Config(format!("cannot move {t} back by {d:?}")))
}

/// Self-monitoring of the scrape pipeline.
struct ScrapeMetrics {
    api_calls_total: Counter,
    scrapes_total: Counter,
    scrape_errors_total: Counter,
    last_scrape_error: Gauge,
    last_scrape_timestamp: Gauge,
    last_scrape_duration_seconds: Gauge,
}

impl ScrapeMetrics {
    fn new(project_id: &str) -> Result<Self> {
        let opts = |name: &str, help: &str| {
            Opts::new(name, help)
                .namespace(META_NAMESPACE)
                .subsystem(META_SUBSYSTEM)
                .const_label("project_id", project_id)
        };

        Ok(ScrapeMetrics {
            api_calls_total: Counter::with_opts(opts(
                "api_calls_total",
                "Total number of Google Stackdriver Monitoring API calls made.",
            ))?,
            scrapes_total: Counter::with_opts(opts(
                "scrapes_total",
                "Total number of Google Stackdriver Monitoring metrics scrapes.",
            ))?,
            scrape_errors_total: Counter::with_opts(opts(
                "scrape_errors_total",
                "Total number of Google Stackdriver Monitoring metrics scrape errors.",
            ))?,
            last_scrape_error: Gauge::with_opts(opts(
                "last_scrape_error",
                "Whether the last metrics scrape from Google Stackdriver Monitoring resulted in an error (1 for error, 0 for success).",
            ))?,
            last_scrape_timestamp: Gauge::with_opts(opts(
                "last_scrape_timestamp",
                "Number of seconds since 1970 since last metrics scrape from Google Stackdriver Monitoring.",
            ))?,
            last_scrape_duration_seconds: Gauge::with_opts(opts(
                "last_scrape_duration_seconds",
                "Duration of the last metrics scrape from Google Stackdriver Monitoring.",
            ))?,
        })
    }

    fn collect(&self) -> Vec<MetricFamily> {
        [
            self.api_calls_total.collect(),
            self.scrapes_total.collect(),
            self.scrape_errors_total.collect(),
            self.last_scrape_error.collect(),
            self.last_scrape_timestamp.collect(),
            self.last_scrape_duration_seconds.collect(),
        ]
        .concat()
    }
}
