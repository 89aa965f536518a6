//! Access to the Cloud Monitoring API.
//!
//! The collector only depends on [`MonitoringClient`]; [`HttpMonitoringClient`]
//! is the production implementation.
use async_trait::async_trait;
use std::fmt::Debug;

use crate::error::Result;

mod auth;
mod rest;
mod types;

#[cfg(feature = "gcp-authorizer")]
pub use auth::GcpAuthorizer;
pub use auth::{Authorizer, StaticTokenAuthorizer, MONITORING_READ_SCOPE};
pub use rest::{HttpMonitoringClient, DEFAULT_ENDPOINT};
pub use types::*;

/// Aggregation parameters of a time series query.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Aggregation {
    pub alignment_period: String,
    pub cross_series_reducer: String,
    pub group_by_fields: Vec<String>,
    pub per_series_aligner: String,
}

/// One page request of `projects.metricDescriptors.list`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ListMetricDescriptorsRequest {
    /// `projects/<id>`
    pub name: String,
    pub filter: String,
    pub page_token: Option<String>,
}

/// One page request of `projects.timeSeries.list`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ListTimeSeriesRequest {
    /// `projects/<id>`
    pub name: String,
    pub filter: String,
    /// RFC 3339 interval start.
    pub start_time: String,
    /// RFC 3339 interval end.
    pub end_time: String,
    pub aggregation: Option<Aggregation>,
    pub page_token: Option<String>,
}

/// A minimal interface to the two Monitoring API list calls the exporter uses.
///
/// Each call fetches exactly one page; callers follow `next_page_token`
/// themselves. Transport, authorization and API failures are reported as
/// errors, an empty page is a successful response.
#[async_trait]
pub trait MonitoringClient: Debug + Send + Sync {
    /// Fetch one page of metric descriptors.
    async fn list_metric_descriptors(
        &self,
        request: &ListMetricDescriptorsRequest,
    ) -> Result<ListMetricDescriptorsResponse>;

    /// Fetch one page of time series.
    async fn list_time_series(
        &self,
        request: &ListTimeSeriesRequest,
    ) -> Result<ListTimeSeriesResponse>;
}
