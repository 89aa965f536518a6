//! Caching of metric descriptor listings per metric type prefix.
use std::{
    collections::HashMap,
    fmt,
    sync::Mutex,
    time::{Duration, Instant},
};

use crate::api::MetricDescriptor;
use crate::utils::is_google_metric;

/// Stores the descriptors found for a metric type prefix.
pub trait DescriptorCache: fmt::Debug + Send + Sync {
    /// Returns the cached descriptors for `prefix`, or `None` on a miss.
    fn lookup(&self, prefix: &str) -> Option<Vec<MetricDescriptor>>;

    /// Caches the descriptors for `prefix`, replacing any previous entry.
    fn store(&self, prefix: &str, descriptors: Vec<MetricDescriptor>);
}

/// Picks the cache implementation for the given settings.
///
/// A zero `ttl` disables caching. With `only_google` set, only prefixes in a
/// `googleapis.com` namespace are cached.
pub fn new_descriptor_cache(ttl: Duration, only_google: bool) -> Box<dyn DescriptorCache> {
    if ttl.is_zero() {
        Box::new(NoopDescriptorCache)
    } else if only_google {
        Box::new(GoogleDescriptorCache::new(ttl))
    } else {
        Box::new(TtlDescriptorCache::new(ttl))
    }
}

/// A cache that never holds anything.
#[derive(Debug, Default)]
pub struct NoopDescriptorCache;

impl DescriptorCache for NoopDescriptorCache {
    fn lookup(&self, _prefix: &str) -> Option<Vec<MetricDescriptor>> {
        None
    }

    fn store(&self, _prefix: &str, _descriptors: Vec<MetricDescriptor>) {}
}

#[derive(Debug)]
struct CacheEntry {
    descriptors: Vec<MetricDescriptor>,
    expiry: Instant,
}

/// Keeps each prefix's descriptors for a fixed time after they were stored.
#[derive(Debug)]
pub struct TtlDescriptorCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl TtlDescriptorCache {
    pub fn new(ttl: Duration) -> Self {
        TtlDescriptorCache {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl DescriptorCache for TtlDescriptorCache {
    fn lookup(&self, prefix: &str) -> Option<Vec<MetricDescriptor>> {
        let entries = self.entries.lock().unwrap_or_else(|err| err.into_inner());
        entries
            .get(prefix)
            .filter(|entry| Instant::now() < entry.expiry && !entry.descriptors.is_empty())
            .map(|entry| entry.descriptors.clone())
    }

    fn store(&self, prefix: &str, descriptors: Vec<MetricDescriptor>) {
        let entry = CacheEntry {
            descriptors,
            expiry: Instant::now() + self.ttl,
        };
        self.entries
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .insert(prefix.to_string(), entry);
    }
}

/// A [TtlDescriptorCache] that ignores prefixes outside Google namespaces.
///
/// Descriptors of user defined metrics change more often, so they are always
/// listed fresh.
#[derive(Debug)]
pub struct GoogleDescriptorCache {
    inner: TtlDescriptorCache,
}

impl GoogleDescriptorCache {
    pub fn new(ttl: Duration) -> Self {
        GoogleDescriptorCache {
            inner: TtlDescriptorCache::new(ttl),
        }
    }
}

impl DescriptorCache for GoogleDescriptorCache {
    fn lookup(&self, prefix: &str) -> Option<Vec<MetricDescriptor>> {
        if !is_google_metric(prefix) {
            return None;
        }
        self.inner.lookup(prefix)
    }

    fn store(&self, prefix: &str, descriptors: Vec<MetricDescriptor>) {
        if !is_google_metric(prefix) {
            return;
        }
        self.inner.store(prefix, descriptors)
    }
}
