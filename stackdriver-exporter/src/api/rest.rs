use async_trait::async_trait;
use http::HeaderMap;
use serde::de::DeserializeOwned;
use std::{sync::Arc, time::Duration};
use tracing::debug;

use super::{
    Authorizer, ListMetricDescriptorsRequest, ListMetricDescriptorsResponse,
    ListTimeSeriesRequest, ListTimeSeriesResponse, MonitoringClient, MONITORING_READ_SCOPE,
};
use crate::error::{Error, Result};

/// Default base URL of the Cloud Monitoring API.
pub const DEFAULT_ENDPOINT: &str = "https://monitoring.googleapis.com";

/// [MonitoringClient] speaking the v3 REST/JSON protocol over `reqwest`.
#[derive(Clone, Debug)]
pub struct HttpMonitoringClient {
    client: reqwest::Client,
    endpoint: String,
    authorizer: Arc<dyn Authorizer>,
}

impl HttpMonitoringClient {
    /// Creates a client for the given API base URL, e.g. [DEFAULT_ENDPOINT].
    ///
    /// `timeout` bounds each request including reading the body.
    pub fn new(
        endpoint: impl Into<String>,
        timeout: Duration,
        authorizer: Arc<dyn Authorizer>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("stackdriver-exporter/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Transport(e.into()))?;
        let mut endpoint = endpoint.into();
        while endpoint.ends_with('/') {
            endpoint.pop();
        }
        Ok(HttpMonitoringClient {
            client,
            endpoint,
            authorizer,
        })
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: String,
        query: Vec<(&'static str, String)>,
    ) -> Result<T> {
        let mut headers = HeaderMap::new();
        self.authorizer
            .authorize(&mut headers, &[MONITORING_READ_SCOPE])
            .await?;

        let url = format!("{}/v3/{}", self.endpoint, path);
        debug!(name: "MonitoringClient.Send", url = %url);
        let response = self
            .client
            .get(&url)
            .headers(headers)
            .query(&query)
            .send()
            .await?;

        let status = response.status();
        let body = response.bytes().await?;
        if !status.is_success() {
            return Err(Error::Api {
                status: status.as_u16(),
                message: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        Ok(serde_json::from_slice(&body)?)
    }
}

#[async_trait]
impl MonitoringClient for HttpMonitoringClient {
    async fn list_metric_descriptors(
        &self,
        request: &ListMetricDescriptorsRequest,
    ) -> Result<ListMetricDescriptorsResponse> {
        let mut query = vec![("filter", request.filter.clone())];
        if let Some(token) = &request.page_token {
            query.push(("pageToken", token.clone()));
        }
        self.get(format!("{}/metricDescriptors", request.name), query)
            .await
    }

    async fn list_time_series(
        &self,
        request: &ListTimeSeriesRequest,
    ) -> Result<ListTimeSeriesResponse> {
        let mut query = vec![
            ("filter", request.filter.clone()),
            ("interval.startTime", request.start_time.clone()),
            ("interval.endTime", request.end_time.clone()),
            ("view", "FULL".to_string()),
        ];
        if let Some(aggregation) = &request.aggregation {
            query.push((
                "aggregation.alignmentPeriod",
                aggregation.alignment_period.clone(),
            ));
            query.push((
                "aggregation.crossSeriesReducer",
                aggregation.cross_series_reducer.clone(),
            ));
            for field in &aggregation.group_by_fields {
                query.push(("aggregation.groupByFields", field.clone()));
            }
            query.push((
                "aggregation.perSeriesAligner",
                aggregation.per_series_aligner.clone(),
            ));
        }
        if let Some(token) = &request.page_token {
            query.push(("pageToken", token.clone()));
        }
        self.get(format!("{}/timeSeries", request.name), query).await
    }
}
