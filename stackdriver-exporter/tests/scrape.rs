use async_trait::async_trait;
use prometheus::proto::{MetricFamily, MetricType};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use stackdriver_exporter::{
    api::{
        ListMetricDescriptorsRequest, ListMetricDescriptorsResponse, ListTimeSeriesRequest,
        ListTimeSeriesResponse, Metric, MetricDescriptor, MetricKind, MonitoredResource,
        MonitoringClient, Point, TimeInterval, TimeSeries, TypedValue, ValueType,
    },
    CollectorOptions, Error, MonitoringCollector, Result,
};

const PROJECT: &str = "test-project";
const PREFIX: &str = "custom.googleapis.com/test";

/// An in-memory Monitoring API.
#[derive(Debug, Default)]
struct FakeClient {
    /// Descriptor pages, served in order for every listing.
    descriptor_pages: Vec<Vec<MetricDescriptor>>,
    fail_listing: bool,
    /// Time series pages per metric type.
    series: Mutex<HashMap<String, Vec<ListTimeSeriesResponse>>>,
    /// Metric types whose time series call fails.
    failing: Vec<String>,
    descriptor_calls: AtomicUsize,
    series_calls: Mutex<HashMap<String, usize>>,
}

impl FakeClient {
    fn set_series(&self, metric_type: &str, pages: Vec<ListTimeSeriesResponse>) {
        self.series
            .lock()
            .unwrap()
            .insert(metric_type.to_string(), pages);
    }

    fn series_calls(&self, metric_type: &str) -> usize {
        self.series_calls
            .lock()
            .unwrap()
            .get(metric_type)
            .copied()
            .unwrap_or(0)
    }

    fn metric_type_of(filter: &str) -> String {
        let start = filter.find("metric.type=\"").unwrap() + "metric.type=\"".len();
        let end = filter[start..].find('"').unwrap() + start;
        filter[start..end].to_string()
    }
}

fn page_index(token: &Option<String>) -> usize {
    token.as_deref().map_or(0, |t| t.parse().unwrap())
}

#[async_trait]
impl MonitoringClient for FakeClient {
    async fn list_metric_descriptors(
        &self,
        request: &ListMetricDescriptorsRequest,
    ) -> Result<ListMetricDescriptorsResponse> {
        self.descriptor_calls.fetch_add(1, Ordering::SeqCst);
        assert_eq!(request.name, format!("projects/{PROJECT}"));
        if self.fail_listing {
            return Err(Error::Api {
                status: 503,
                message: "unavailable".to_string(),
            });
        }

        let index = page_index(&request.page_token);
        let next = index + 1;
        Ok(ListMetricDescriptorsResponse {
            metric_descriptors: self.descriptor_pages.get(index).cloned().unwrap_or_default(),
            next_page_token: if next < self.descriptor_pages.len() {
                next.to_string()
            } else {
                String::new()
            },
        })
    }

    async fn list_time_series(
        &self,
        request: &ListTimeSeriesRequest,
    ) -> Result<ListTimeSeriesResponse> {
        let metric_type = Self::metric_type_of(&request.filter);
        *self
            .series_calls
            .lock()
            .unwrap()
            .entry(metric_type.clone())
            .or_default() += 1;

        if self.failing.contains(&metric_type) {
            return Err(Error::Api {
                status: 500,
                message: "internal".to_string(),
            });
        }

        let series = self.series.lock().unwrap();
        let pages = series.get(&metric_type).cloned().unwrap_or_default();
        let index = page_index(&request.page_token);
        let mut page = pages.get(index).cloned().unwrap_or_default();
        if index + 1 < pages.len() {
            page.next_page_token = (index + 1).to_string();
        }
        Ok(page)
    }
}

fn descriptor(name: &str, kind: MetricKind, value_type: ValueType) -> MetricDescriptor {
    MetricDescriptor {
        name: format!("projects/{PROJECT}/metricDescriptors/{PREFIX}/{name}"),
        metric_type: format!("{PREFIX}/{name}"),
        metric_kind: kind,
        value_type,
        unit: "1".to_string(),
        description: format!("Test metric {name}."),
        ..Default::default()
    }
}

fn series(
    name: &str,
    kind: MetricKind,
    instance: &str,
    end_time: &str,
    value: i64,
) -> TimeSeries {
    TimeSeries {
        metric: Metric {
            metric_type: format!("{PREFIX}/{name}"),
            labels: [("instance".to_string(), instance.to_string())].into(),
        },
        resource: MonitoredResource {
            resource_type: "global".to_string(),
            labels: Default::default(),
        },
        metric_kind: kind,
        value_type: ValueType::Int64,
        points: vec![Point {
            interval: TimeInterval {
                start_time: end_time.to_string(),
                end_time: end_time.to_string(),
            },
            value: TypedValue {
                int64_value: Some(value),
                ..Default::default()
            },
        }],
        ..Default::default()
    }
}

fn page(series: Vec<TimeSeries>) -> ListTimeSeriesResponse {
    ListTimeSeriesResponse {
        time_series: series,
        next_page_token: String::new(),
    }
}

fn family_name(name: &str) -> String {
    format!("stackdriver_global_custom_googleapis_com_test_{name}")
}

fn find<'a>(families: &'a [MetricFamily], name: &str) -> Option<&'a MetricFamily> {
    families.iter().find(|mf| mf.name() == name)
}

/// Collects the sample values of every family with the given name.
fn values(families: &[MetricFamily], name: &str) -> Vec<f64> {
    families
        .iter()
        .filter(|mf| mf.name() == name)
        .flat_map(|mf| mf.get_metric())
        .map(|m| match m.get_counter().value() {
            v if v != 0.0 => v,
            _ => m.get_gauge().value(),
        })
        .collect()
}

fn meta_value(families: &[MetricFamily], name: &str) -> f64 {
    let mf = find(families, &format!("stackdriver_monitoring_{name}")).unwrap();
    let m = &mf.get_metric()[0];
    match mf.get_field_type() {
        MetricType::COUNTER => m.get_counter().value(),
        _ => m.get_gauge().value(),
    }
}

fn options() -> CollectorOptions {
    CollectorOptions {
        metric_type_prefixes: vec![PREFIX.to_string()],
        descriptor_cache_ttl: Duration::ZERO,
        ..Default::default()
    }
}

fn collector(client: Arc<FakeClient>, options: CollectorOptions) -> MonitoringCollector {
    MonitoringCollector::builder(PROJECT, client)
        .with_options(options)
        .build()
        .unwrap()
}

#[tokio::test]
async fn fetches_each_descriptor_once() {
    let a = descriptor("a", MetricKind::Gauge, ValueType::Int64);
    let b = descriptor("b", MetricKind::Gauge, ValueType::Int64);
    let client = Arc::new(FakeClient {
        descriptor_pages: vec![vec![a.clone(), a.clone(), b.clone()], vec![a.clone()]],
        ..Default::default()
    });
    client.set_series(
        &a.metric_type,
        vec![page(vec![series("a", MetricKind::Gauge, "i1", "2024-01-01T00:00:00Z", 3)])],
    );

    let families = collector(client.clone(), options()).collect().await;

    assert_eq!(client.descriptor_calls.load(Ordering::SeqCst), 2);
    assert_eq!(client.series_calls(&a.metric_type), 1);
    assert_eq!(client.series_calls(&b.metric_type), 1);
    assert_eq!(values(&families, &family_name("a")), vec![3.0]);
    // two descriptor pages plus one time series call per descriptor
    assert_eq!(meta_value(&families, "api_calls_total"), 4.0);
    assert_eq!(meta_value(&families, "last_scrape_error"), 0.0);
}

#[tokio::test]
async fn follows_time_series_pages() {
    let a = descriptor("a", MetricKind::Gauge, ValueType::Int64);
    let client = Arc::new(FakeClient {
        descriptor_pages: vec![vec![a.clone()]],
        ..Default::default()
    });
    client.set_series(
        &a.metric_type,
        vec![
            page(vec![series("a", MetricKind::Gauge, "i1", "2024-01-01T00:00:00Z", 1)]),
            page(vec![series("a", MetricKind::Gauge, "i2", "2024-01-01T00:00:00Z", 2)]),
        ],
    );

    let families = collector(client.clone(), options()).collect().await;

    assert_eq!(client.series_calls(&a.metric_type), 2);
    let mut found = values(&families, &family_name("a"));
    found.sort_by(f64::total_cmp);
    assert_eq!(found, vec![1.0, 2.0]);
}

#[tokio::test]
async fn failing_descriptor_does_not_hide_others() {
    let ok = descriptor("ok", MetricKind::Gauge, ValueType::Int64);
    let broken = descriptor("broken", MetricKind::Gauge, ValueType::Int64);
    let client = Arc::new(FakeClient {
        descriptor_pages: vec![vec![ok.clone(), broken.clone()]],
        failing: vec![broken.metric_type.clone()],
        ..Default::default()
    });
    client.set_series(
        &ok.metric_type,
        vec![page(vec![series("ok", MetricKind::Gauge, "i1", "2024-01-01T00:00:00Z", 7)])],
    );

    let collector = collector(client, options());
    let families = collector.collect().await;

    assert_eq!(values(&families, &family_name("ok")), vec![7.0]);
    assert!(find(&families, &family_name("broken")).is_none());
    assert_eq!(meta_value(&families, "last_scrape_error"), 1.0);
    assert_eq!(meta_value(&families, "scrape_errors_total"), 1.0);
    assert_eq!(meta_value(&families, "scrapes_total"), 1.0);
}

#[tokio::test]
async fn scrape_reports_listing_failure() {
    let client = Arc::new(FakeClient {
        fail_listing: true,
        ..Default::default()
    });
    let collector = collector(client, options());

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let err = collector.scrape(tx).await.unwrap_err();

    assert!(matches!(err, Error::Api { status: 503, .. }));
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn aggregates_deltas_across_scrapes() {
    let d = descriptor("requests", MetricKind::Delta, ValueType::Int64);
    let client = Arc::new(FakeClient {
        descriptor_pages: vec![vec![d.clone()]],
        ..Default::default()
    });
    let collector = collector(
        client.clone(),
        CollectorOptions {
            aggregate_deltas: true,
            ..options()
        },
    );

    client.set_series(
        &d.metric_type,
        vec![page(vec![series("requests", MetricKind::Delta, "i1", "2024-01-01T00:01:00Z", 5)])],
    );
    let first = collector.collect().await;
    let mf = find(&first, &family_name("requests")).unwrap();
    assert_eq!(mf.get_field_type(), MetricType::COUNTER);
    assert_eq!(values(&first, &family_name("requests")), vec![5.0]);

    client.set_series(
        &d.metric_type,
        vec![page(vec![series("requests", MetricKind::Delta, "i1", "2024-01-01T00:02:00Z", 7)])],
    );
    let second = collector.collect().await;
    assert_eq!(values(&second, &family_name("requests")), vec![12.0]);

    // the same point reported again is not counted twice
    let third = collector.collect().await;
    assert_eq!(values(&third, &family_name("requests")), vec![12.0]);

    // no new points: the running total is still exposed
    client.set_series(&d.metric_type, vec![]);
    let fourth = collector.collect().await;
    assert_eq!(values(&fourth, &family_name("requests")), vec![12.0]);
}

#[tokio::test]
async fn raw_deltas_are_gauges() {
    let d = descriptor("requests", MetricKind::Delta, ValueType::Int64);
    let client = Arc::new(FakeClient {
        descriptor_pages: vec![vec![d.clone()]],
        ..Default::default()
    });
    let collector = collector(client.clone(), options());

    for (end, value) in [("2024-01-01T00:01:00Z", 5), ("2024-01-01T00:02:00Z", 7)] {
        client.set_series(
            &d.metric_type,
            vec![page(vec![series("requests", MetricKind::Delta, "i1", end, value)])],
        );
        let families = collector.collect().await;
        let mf = find(&families, &family_name("requests")).unwrap();
        assert_eq!(mf.get_field_type(), MetricType::GAUGE);
        assert_eq!(values(&families, &family_name("requests")), vec![value as f64]);
    }
}

#[tokio::test]
async fn cached_descriptors_skip_listing() {
    let a = descriptor("a", MetricKind::Gauge, ValueType::Int64);
    let client = Arc::new(FakeClient {
        descriptor_pages: vec![vec![a.clone()]],
        ..Default::default()
    });
    client.set_series(
        &a.metric_type,
        vec![page(vec![series("a", MetricKind::Gauge, "i1", "2024-01-01T00:00:00Z", 1)])],
    );
    let collector = collector(
        client.clone(),
        CollectorOptions {
            descriptor_cache_ttl: Duration::from_secs(600),
            ..options()
        },
    );

    collector.collect().await;
    let families = collector.collect().await;

    assert_eq!(client.descriptor_calls.load(Ordering::SeqCst), 1);
    assert_eq!(client.series_calls(&a.metric_type), 2);
    assert_eq!(values(&families, &family_name("a")), vec![1.0]);
}

#[tokio::test]
async fn failed_listing_is_not_cached() {
    let client = Arc::new(FakeClient {
        fail_listing: true,
        ..Default::default()
    });
    let collector = collector(
        client.clone(),
        CollectorOptions {
            descriptor_cache_ttl: Duration::from_secs(600),
            ..options()
        },
    );

    collector.collect().await;
    collector.collect().await;

    assert_eq!(client.descriptor_calls.load(Ordering::SeqCst), 2);
}

#[test]
fn build_rejects_missing_prefixes() {
    let err = MonitoringCollector::builder(PROJECT, Arc::new(FakeClient::default()))
        .build()
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}
