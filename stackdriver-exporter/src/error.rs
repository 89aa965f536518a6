use std::result;
use thiserror::Error;

/// A specialized `Result` type for exporter operations.
pub type Result<T> = result::Result<T, Error>;

/// Errors returned while configuring the exporter or scraping the Monitoring API.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The authorizer could not produce credentials for a request.
    #[error("authorizer error: {0}")]
    Authorizer(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// The request could not be sent or its response could not be read.
    #[error("transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// The Monitoring API answered with a non-success status.
    #[error("monitoring API returned status {status}: {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body, as returned by the API.
        message: String,
    },
    /// A response body did not match the expected wire format.
    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
    /// A metric descriptor declared an ingest delay that is not a valid duration.
    #[error("invalid ingest delay `{0}`")]
    IngestDelay(String),
    /// A time series point carried a timestamp that is not RFC 3339.
    #[error("invalid point interval end time `{value}`: {source}")]
    Timestamp {
        /// The raw timestamp.
        value: String,
        /// Parse failure.
        #[source]
        source: chrono::ParseError,
    },
    /// A distribution used bucket options that are not explicit, linear or exponential.
    #[error("unknown distribution buckets")]
    UnknownBuckets,
    /// Invalid configuration.
    #[error("config error: {0}")]
    Config(String),
    /// The prometheus client rejected a metric definition.
    #[error(transparent)]
    Prometheus(#[from] prometheus::Error),
    /// Other errors not covered by specific cases.
    #[error("{0}")]
    Other(String),
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => Error::Api {
                status: status.as_u16(),
                message: err.to_string(),
            },
            None => Error::Transport(err.into()),
        }
    }
}
