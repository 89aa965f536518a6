//! Cloud Monitoring v3 REST resources, as far as the exporter reads them.
//!
//! Field names follow the protobuf JSON mapping used by
//! `monitoring.googleapis.com`. 64-bit integers arrive as JSON strings.
//!
//! See <https://cloud.google.com/monitoring/api/ref_v3/rest>.
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;

/// `MetricDescriptor.metricKind`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetricKind {
    /// An instantaneous measurement.
    Gauge,
    /// The change in a value during a time interval.
    Delta,
    /// A value accumulated over a time interval.
    Cumulative,
    /// Unset or not understood by this exporter.
    #[default]
    #[serde(other)]
    Unspecified,
}

/// `MetricDescriptor.valueType`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueType {
    /// `boolValue`
    Bool,
    /// `int64Value`
    Int64,
    /// `doubleValue`
    Double,
    /// `distributionValue`
    Distribution,
    /// `STRING`, `MONEY` or unset.
    #[default]
    #[serde(other)]
    Unspecified,
}

/// Metadata describing how a metric is collected.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetricDescriptorMetadata {
    /// Delay after which data for this metric is available, e.g. `"180s"`.
    pub ingest_delay: Option<String>,
    /// Sampling period, e.g. `"60s"`.
    pub sample_period: Option<String>,
}

/// Describes one metric type.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetricDescriptor {
    /// Resource name, `projects/<id>/metricDescriptors/<type>`.
    pub name: String,
    /// Metric type, e.g. `compute.googleapis.com/instance/cpu/usage_time`.
    #[serde(rename = "type")]
    pub metric_type: String,
    pub metric_kind: MetricKind,
    pub value_type: ValueType,
    pub unit: String,
    pub description: String,
    pub display_name: String,
    pub metadata: Option<MetricDescriptorMetadata>,
}

impl MetricDescriptor {
    /// Returns the declared ingest delay, if any and non-empty.
    pub fn ingest_delay(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.ingest_delay.as_deref())
            .filter(|d| !d.is_empty())
    }
}

/// Response of `projects.metricDescriptors.list`.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListMetricDescriptorsResponse {
    pub metric_descriptors: Vec<MetricDescriptor>,
    pub next_page_token: String,
}

/// The metric part of a time series.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Metric {
    #[serde(rename = "type")]
    pub metric_type: String,
    pub labels: BTreeMap<String, String>,
}

/// The monitored resource a time series belongs to.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct MonitoredResource {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub labels: BTreeMap<String, String>,
}

/// Auxiliary metadata of a time series.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MonitoredResourceMetadata {
    /// Arbitrary JSON object; decoded lazily because values are not
    /// guaranteed to be strings.
    pub system_labels: Option<serde_json::Value>,
}

/// A time interval.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeInterval {
    pub start_time: String,
    pub end_time: String,
}

/// `BucketOptions.linearBuckets`
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Linear {
    pub num_finite_buckets: i32,
    #[serde(deserialize_with = "f64_from_number_or_string")]
    pub width: f64,
    #[serde(deserialize_with = "f64_from_number_or_string")]
    pub offset: f64,
}

/// `BucketOptions.exponentialBuckets`
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Exponential {
    pub num_finite_buckets: i32,
    #[serde(deserialize_with = "f64_from_number_or_string")]
    pub growth_factor: f64,
    #[serde(deserialize_with = "f64_from_number_or_string")]
    pub scale: f64,
}

/// `BucketOptions.explicitBuckets`
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Explicit {
    pub bounds: Vec<f64>,
}

/// Bucket layout of a distribution. At most one variant is set.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BucketOptions {
    pub linear_buckets: Option<Linear>,
    pub exponential_buckets: Option<Exponential>,
    pub explicit_buckets: Option<Explicit>,
}

/// A histogram-valued point.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Distribution {
    #[serde(deserialize_with = "i64_from_number_or_string")]
    pub count: i64,
    #[serde(deserialize_with = "f64_from_number_or_string")]
    pub mean: f64,
    pub bucket_options: BucketOptions,
    #[serde(deserialize_with = "vec_i64_from_number_or_string")]
    pub bucket_counts: Vec<i64>,
}

/// A typed value; exactly one field is set for a well formed point.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TypedValue {
    pub bool_value: Option<bool>,
    #[serde(deserialize_with = "opt_i64_from_number_or_string")]
    pub int64_value: Option<i64>,
    #[serde(deserialize_with = "opt_f64_from_number_or_string")]
    pub double_value: Option<f64>,
    pub string_value: Option<String>,
    pub distribution_value: Option<Distribution>,
}

/// A single data point of a time series.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Point {
    pub interval: TimeInterval,
    pub value: TypedValue,
}

/// One labeled stream of points.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeSeries {
    pub metric: Metric,
    pub resource: MonitoredResource,
    pub metadata: Option<MonitoredResourceMetadata>,
    pub metric_kind: MetricKind,
    pub value_type: ValueType,
    pub points: Vec<Point>,
    pub unit: String,
}

/// Response of `projects.timeSeries.list`.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListTimeSeriesResponse {
    pub time_series: Vec<TimeSeries>,
    pub next_page_token: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString<T> {
    Number(T),
    String(String),
}

fn parse_i64<E: serde::de::Error>(v: NumberOrString<i64>) -> Result<i64, E> {
    match v {
        NumberOrString::Number(n) => Ok(n),
        NumberOrString::String(s) => s.parse().map_err(E::custom),
    }
}

fn parse_f64<E: serde::de::Error>(v: NumberOrString<f64>) -> Result<f64, E> {
    match v {
        NumberOrString::Number(n) => Ok(n),
        // protobuf JSON spells the special values as strings
        NumberOrString::String(s) => match s.as_str() {
            "NaN" => Ok(f64::NAN),
            "Infinity" => Ok(f64::INFINITY),
            "-Infinity" => Ok(f64::NEG_INFINITY),
            _ => s.parse().map_err(E::custom),
        },
    }
}

fn i64_from_number_or_string<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    parse_i64(NumberOrString::deserialize(d)?)
}

fn opt_i64_from_number_or_string<'de, D: Deserializer<'de>>(
    d: D,
) -> Result<Option<i64>, D::Error> {
    Option::<NumberOrString<i64>>::deserialize(d)?
        .map(parse_i64)
        .transpose()
}

fn vec_i64_from_number_or_string<'de, D: Deserializer<'de>>(
    d: D,
) -> Result<Vec<i64>, D::Error> {
    Vec::<NumberOrString<i64>>::deserialize(d)?
        .into_iter()
        .map(parse_i64)
        .collect()
}

fn f64_from_number_or_string<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    parse_f64(NumberOrString::deserialize(d)?)
}

fn opt_f64_from_number_or_string<'de, D: Deserializer<'de>>(
    d: D,
) -> Result<Option<f64>, D::Error> {
    Option::<NumberOrString<f64>>::deserialize(d)?
        .map(parse_f64)
        .transpose()
}
