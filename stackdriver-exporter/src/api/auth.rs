use async_trait::async_trait;
use http::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use std::fmt;
#[cfg(feature = "gcp-authorizer")]
use std::sync::Arc;

use crate::error::{Error, Result};

/// OAuth scope sufficient for every call the exporter makes.
pub const MONITORING_READ_SCOPE: &str = "https://www.googleapis.com/auth/monitoring.read";

/// Supplies credentials for Monitoring API requests.
#[async_trait]
pub trait Authorizer: fmt::Debug + Send + Sync + 'static {
    /// Add authorization headers for the given scopes to an outgoing request.
    async fn authorize(&self, headers: &mut HeaderMap, scopes: &[&str]) -> Result<()>;
}

/// Sends a fixed bearer token, e.g. one minted by `gcloud auth print-access-token`.
#[derive(Clone)]
pub struct StaticTokenAuthorizer {
    header: HeaderValue,
}

impl StaticTokenAuthorizer {
    pub fn new(token: impl AsRef<str>) -> Result<Self> {
        let mut header = HeaderValue::from_str(&format!("Bearer {}", token.as_ref()))
            .map_err(|e| Error::Authorizer(e.into()))?;
        header.set_sensitive(true);
        Ok(StaticTokenAuthorizer { header })
    }
}

impl fmt::Debug for StaticTokenAuthorizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticTokenAuthorizer")
            .field("header", &"(elided)")
            .finish()
    }
}

#[async_trait]
impl Authorizer for StaticTokenAuthorizer {
    async fn authorize(&self, headers: &mut HeaderMap, _scopes: &[&str]) -> Result<()> {
        headers.insert(AUTHORIZATION, self.header.clone());
        Ok(())
    }
}

/// Uses Google application default credentials: the metadata server, a
/// service account key from `GOOGLE_APPLICATION_CREDENTIALS`, or the local
/// `gcloud` configuration.
#[cfg(feature = "gcp-authorizer")]
pub struct GcpAuthorizer {
    provider: Arc<dyn gcp_auth::TokenProvider>,
}

#[cfg(feature = "gcp-authorizer")]
impl GcpAuthorizer {
    pub async fn new() -> Result<Self> {
        let provider = gcp_auth::provider()
            .await
            .map_err(|e| Error::Authorizer(e.into()))?;
        Ok(GcpAuthorizer { provider })
    }
}

#[cfg(feature = "gcp-authorizer")]
impl fmt::Debug for GcpAuthorizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GcpAuthorizer")
            .field("provider", &"(elided)")
            .finish()
    }
}

#[cfg(feature = "gcp-authorizer")]
#[async_trait]
impl Authorizer for GcpAuthorizer {
    async fn authorize(&self, headers: &mut HeaderMap, scopes: &[&str]) -> Result<()> {
        let token = self
            .provider
            .token(scopes)
            .await
            .map_err(|e| Error::Authorizer(e.into()))?;
        let mut value = HeaderValue::from_str(&format!("Bearer {}", token.as_str()))
            .map_err(|e| Error::Authorizer(e.into()))?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
        Ok(())
    }
}
