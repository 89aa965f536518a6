//! Exporter configuration.
//!
//! Everything is read once at startup from `STACKDRIVER_EXPORTER_*`
//! environment variables. Durations use the `humantime` syntax (`5m`, `90s`).
use std::{env, net::SocketAddr, str::FromStr, time::Duration};

use crate::api::{Aggregation, DEFAULT_ENDPOINT};
use crate::error::{Error, Result};

const PROJECT_IDS_NAME: &str = "STACKDRIVER_EXPORTER_GOOGLE_PROJECT_IDS";
const METRICS_PREFIXES_NAME: &str = "STACKDRIVER_EXPORTER_MONITORING_METRICS_PREFIXES";
const METRICS_INTERVAL_NAME: &str = "STACKDRIVER_EXPORTER_MONITORING_METRICS_INTERVAL";
const METRICS_OFFSET_NAME: &str = "STACKDRIVER_EXPORTER_MONITORING_METRICS_OFFSET";
const METRICS_INGEST_DELAY_NAME: &str = "STACKDRIVER_EXPORTER_MONITORING_METRICS_INGEST_DELAY";
const FILTERS_NAME: &str = "STACKDRIVER_EXPORTER_MONITORING_FILTERS";
const AGGREGATIONS_NAME: &str = "STACKDRIVER_EXPORTER_MONITORING_AGGREGATIONS";
const FILL_MISSING_LABELS_NAME: &str = "STACKDRIVER_EXPORTER_COLLECTOR_FILL_MISSING_LABELS";
const DROP_DELEGATED_PROJECTS_NAME: &str =
    "STACKDRIVER_EXPORTER_MONITORING_DROP_DELEGATED_PROJECTS";
const AGGREGATE_DELTAS_NAME: &str = "STACKDRIVER_EXPORTER_MONITORING_AGGREGATE_DELTAS";
const AGGREGATE_DELTAS_TTL_NAME: &str = "STACKDRIVER_EXPORTER_MONITORING_AGGREGATE_DELTAS_TTL";
const DESCRIPTOR_CACHE_TTL_NAME: &str = "STACKDRIVER_EXPORTER_MONITORING_DESCRIPTOR_CACHE_TTL";
const DESCRIPTOR_CACHE_ONLY_GOOGLE_NAME: &str =
    "STACKDRIVER_EXPORTER_MONITORING_DESCRIPTOR_CACHE_ONLY_GOOGLE";
const LISTEN_ADDRESS_NAME: &str = "STACKDRIVER_EXPORTER_WEB_LISTEN_ADDRESS";
const TELEMETRY_PATH_NAME: &str = "STACKDRIVER_EXPORTER_WEB_TELEMETRY_PATH";
const API_ENDPOINT_NAME: &str = "STACKDRIVER_EXPORTER_API_ENDPOINT";
const HTTP_TIMEOUT_NAME: &str = "STACKDRIVER_EXPORTER_HTTP_TIMEOUT";
const ACCESS_TOKEN_NAME: &str = "STACKDRIVER_EXPORTER_ACCESS_TOKEN";

const DEFAULT_INTERVAL: Duration = Duration::from_secs(5 * 60);
const DEFAULT_AGGREGATE_DELTAS_TTL: Duration = Duration::from_secs(30 * 60);
const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:9255";
const DEFAULT_TELEMETRY_PATH: &str = "/metrics";
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// An extra time series filter for metric types starting with a prefix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricFilter {
    pub targeted_metric_prefix: String,
    /// Monitoring filter expression, ANDed to the time series filter.
    pub filter_query: String,
}

impl FromStr for MetricFilter {
    type Err = Error;

    /// Parses `<prefix>:<query>`. The query may itself contain `:`.
    fn from_str(s: &str) -> Result<Self> {
        let (prefix, query) = s
            .split_once(':')
            .ok_or_else(|| Error::Config(format!("metric filter `{s}` is not `prefix:query`")))?;
        let (prefix, query) = (prefix.trim(), query.trim());
        if prefix.is_empty() || query.is_empty() {
            return Err(Error::Config(format!(
                "metric filter `{s}` has an empty prefix or query"
            )));
        }
        Ok(MetricFilter {
            targeted_metric_prefix: prefix.to_string(),
            filter_query: query.to_string(),
        })
    }
}

/// Server side aggregation for metric types starting with a prefix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricAggregationConfig {
    pub targeted_metric_prefix: String,
    pub alignment_period: Duration,
    /// e.g. `REDUCE_SUM`
    pub cross_series_reducer: String,
    pub group_by_fields: Vec<String>,
    /// e.g. `ALIGN_DELTA`
    pub per_series_aligner: String,
}

impl MetricAggregationConfig {
    /// Parses `<prefix>:<reducer>:<field>,<field>:<aligner>`.
    pub fn parse(s: &str, alignment_period: Duration) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').map(str::trim).collect();
        let [prefix, reducer, fields, aligner] = parts[..] else {
            return Err(Error::Config(format!(
                "aggregation `{s}` is not `prefix:reducer:fields:aligner`"
            )));
        };
        if prefix.is_empty() {
            return Err(Error::Config(format!("aggregation `{s}` has an empty prefix")));
        }
        Ok(MetricAggregationConfig {
            targeted_metric_prefix: prefix.to_string(),
            alignment_period,
            cross_series_reducer: reducer.to_string(),
            group_by_fields: fields
                .split(',')
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(String::from)
                .collect(),
            per_series_aligner: aligner.to_string(),
        })
    }

    pub(crate) fn to_aggregation(&self) -> Aggregation {
        Aggregation {
            alignment_period: format!("{}s", self.alignment_period.as_secs()),
            cross_series_reducer: self.cross_series_reducer.clone(),
            group_by_fields: self.group_by_fields.clone(),
            per_series_aligner: self.per_series_aligner.clone(),
        }
    }
}

/// Settings of one [MonitoringCollector](crate::MonitoringCollector).
#[derive(Clone, Debug, PartialEq)]
pub struct CollectorOptions {
    /// Metric type prefixes to scrape, e.g. `compute.googleapis.com/instance/cpu`.
    pub metric_type_prefixes: Vec<String>,
    pub extra_filters: Vec<MetricFilter>,
    /// Only the first matching entry applies to a metric type.
    pub aggregations: Vec<MetricAggregationConfig>,
    /// Width of the requested time window.
    pub request_interval: Duration,
    /// How far the window end lies in the past.
    pub request_offset: Duration,
    /// Shift the window back by each descriptor's declared ingest delay.
    pub ingest_delay: bool,
    pub fill_missing_labels: bool,
    pub drop_delegated_projects: bool,
    pub aggregate_deltas: bool,
    /// Running totals not refreshed for this long are dropped. Zero keeps them forever.
    pub aggregate_deltas_ttl: Duration,
    /// Zero disables descriptor caching.
    pub descriptor_cache_ttl: Duration,
    pub descriptor_cache_only_google: bool,
}

impl Default for CollectorOptions {
    fn default() -> Self {
        CollectorOptions {
            metric_type_prefixes: Vec::new(),
            extra_filters: Vec::new(),
            aggregations: Vec::new(),
            request_interval: DEFAULT_INTERVAL,
            request_offset: Duration::ZERO,
            ingest_delay: false,
            fill_missing_labels: true,
            drop_delegated_projects: false,
            aggregate_deltas: false,
            aggregate_deltas_ttl: DEFAULT_AGGREGATE_DELTAS_TTL,
            descriptor_cache_ttl: Duration::ZERO,
            descriptor_cache_only_google: true,
        }
    }
}

/// Process level configuration of the exporter binary.
#[derive(Clone, PartialEq)]
pub struct Config {
    /// One collector is created per project.
    pub project_ids: Vec<String>,
    pub collector: CollectorOptions,
    pub listen_address: SocketAddr,
    pub telemetry_path: String,
    pub api_endpoint: String,
    pub http_timeout: Duration,
    /// Static bearer token; application default credentials are used when unset.
    pub access_token: Option<String>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("project_ids", &self.project_ids)
            .field("collector", &self.collector)
            .field("listen_address", &self.listen_address)
            .field("telemetry_path", &self.telemetry_path)
            .field("api_endpoint", &self.api_endpoint)
            .field("http_timeout", &self.http_timeout)
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Config {
    /// Loads the configuration from the environment.
    pub fn from_env() -> Result<Self> {
        let project_ids = env_list(PROJECT_IDS_NAME);
        if project_ids.is_empty() {
            return Err(Error::Config(format!("{PROJECT_IDS_NAME} must be set")));
        }

        let metric_type_prefixes = parse_metric_type_prefixes(env_list(METRICS_PREFIXES_NAME));
        if metric_type_prefixes.is_empty() {
            return Err(Error::Config(format!("{METRICS_PREFIXES_NAME} must be set")));
        }

        let request_interval = env_duration(METRICS_INTERVAL_NAME, DEFAULT_INTERVAL)?;

        let extra_filters = env_entries(FILTERS_NAME)
            .iter()
            .map(|s| s.parse())
            .collect::<Result<Vec<MetricFilter>>>()?;
        let aggregations = env_entries(AGGREGATIONS_NAME)
            .iter()
            .map(|s| MetricAggregationConfig::parse(s, request_interval))
            .collect::<Result<Vec<_>>>()?;

        let collector = CollectorOptions {
            metric_type_prefixes,
            extra_filters,
            aggregations,
            request_interval,
            request_offset: env_duration(METRICS_OFFSET_NAME, Duration::ZERO)?,
            ingest_delay: env_bool(METRICS_INGEST_DELAY_NAME, false)?,
            fill_missing_labels: env_bool(FILL_MISSING_LABELS_NAME, true)?,
            drop_delegated_projects: env_bool(DROP_DELEGATED_PROJECTS_NAME, false)?,
            aggregate_deltas: env_bool(AGGREGATE_DELTAS_NAME, false)?,
            aggregate_deltas_ttl: env_duration(
                AGGREGATE_DELTAS_TTL_NAME,
                DEFAULT_AGGREGATE_DELTAS_TTL,
            )?,
            descriptor_cache_ttl: env_duration(DESCRIPTOR_CACHE_TTL_NAME, Duration::ZERO)?,
            descriptor_cache_only_google: env_bool(DESCRIPTOR_CACHE_ONLY_GOOGLE_NAME, true)?,
        };

        let listen_address = env_value(LISTEN_ADDRESS_NAME)
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDRESS.to_string());
        let listen_address = listen_address.parse().map_err(|err| {
            Error::Config(format!(
                "{LISTEN_ADDRESS_NAME}: invalid address `{listen_address}`: {err}"
            ))
        })?;

        let telemetry_path =
            env_value(TELEMETRY_PATH_NAME).unwrap_or_else(|| DEFAULT_TELEMETRY_PATH.to_string());
        if !telemetry_path.starts_with('/') {
            return Err(Error::Config(format!(
                "{TELEMETRY_PATH_NAME} must start with `/`, got `{telemetry_path}`"
            )));
        }

        Ok(Config {
            project_ids,
            collector,
            listen_address,
            telemetry_path,
            api_endpoint: env_value(API_ENDPOINT_NAME)
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            http_timeout: env_duration(HTTP_TIMEOUT_NAME, DEFAULT_HTTP_TIMEOUT)?,
            access_token: env_value(ACCESS_TOKEN_NAME),
        })
    }
}

/// Sorts and deduplicates prefixes and drops those covered by a shorter one.
pub fn parse_metric_type_prefixes(mut prefixes: Vec<String>) -> Vec<String> {
    prefixes.sort();
    prefixes.dedup();

    let mut result: Vec<String> = Vec::with_capacity(prefixes.len());
    for prefix in prefixes {
        if result.last().is_some_and(|last| prefix.starts_with(last.as_str())) {
            continue;
        }
        result.push(prefix);
    }
    result
}

fn env_value(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_list(name: &str) -> Vec<String> {
    split_list(env_value(name).as_deref().unwrap_or_default(), ',')
}

fn env_entries(name: &str) -> Vec<String> {
    split_list(env_value(name).as_deref().unwrap_or_default(), ';')
}

fn split_list(value: &str, separator: char) -> Vec<String> {
    value
        .split(separator)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
        .collect()
}

fn env_duration(name: &str, default: Duration) -> Result<Duration> {
    match env_value(name) {
        None => Ok(default),
        Some(v) => humantime::parse_duration(&v)
            .map_err(|err| Error::Config(format!("{name}: invalid duration `{v}`: {err}"))),
    }
}

fn env_bool(name: &str, default: bool) -> Result<bool> {
    match env_value(name) {
        None => Ok(default),
        Some(v) => match v.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(Error::Config(format!("{name}: invalid boolean `{v}`"))),
        },
    }
}
