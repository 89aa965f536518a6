//! A [Prometheus] exporter for [Google Cloud Monitoring] (formerly
//! Stackdriver) metrics.
//!
//! A [MonitoringCollector] scrapes one project: it lists the metric
//! descriptors matching the configured type prefixes, fetches the most recent
//! point of every time series of each descriptor and translates them into
//! Prometheus metric families. Descriptor listings can be cached, and DELTA
//! metrics can be folded into monotonic counters.
//!
//! [Prometheus]: https://prometheus.io
//! [Google Cloud Monitoring]: https://cloud.google.com/monitoring
//!
//! ```no_run
//! use std::{sync::Arc, time::Duration};
//! use stackdriver_exporter::{
//!     api::{HttpMonitoringClient, StaticTokenAuthorizer, DEFAULT_ENDPOINT},
//!     exposition, CollectorOptions, MonitoringCollector,
//! };
//!
//! # async fn run() -> stackdriver_exporter::Result<()> {
//! let authorizer = Arc::new(StaticTokenAuthorizer::new("ya29.token")?);
//! let client = HttpMonitoringClient::new(DEFAULT_ENDPOINT, Duration::from_secs(10), authorizer)?;
//!
//! let collector = MonitoringCollector::builder("my-project", Arc::new(client))
//!     .with_options(CollectorOptions {
//!         metric_type_prefixes: vec!["pubsub.googleapis.com/topic".to_string()],
//!         ..Default::default()
//!     })
//!     .build()?;
//!
//! let (_content_type, body) = exposition::encode_text(collector.collect().await)?;
//! println!("{}", String::from_utf8_lossy(&body));
//! # Ok(())
//! # }
//! ```
#![warn(
    future_incompatible,
    missing_debug_implementations,
    nonstandard_style,
    rust_2018_idioms,
    unused
)]
#![cfg_attr(
    docsrs,
    feature(doc_cfg, doc_auto_cfg),
    deny(rustdoc::broken_intra_doc_links)
)]

pub mod api;
mod collector;
pub mod config;
pub mod delta;
pub mod descriptor_cache;
mod error;
pub mod exposition;
mod histogram;
mod metrics;
pub mod translator;
mod utils;

pub use collector::{MonitoringCollector, MonitoringCollectorBuilder};
pub use config::{CollectorOptions, Config, MetricAggregationConfig, MetricFilter};
pub use error::{Error, Result};
pub use metrics::{ConstMetric, HistogramMetric, ValueKind};
pub use translator::MetricSender;
