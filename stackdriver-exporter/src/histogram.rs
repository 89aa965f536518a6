//! Conversion of Monitoring distributions into Prometheus histogram buckets.
//!
//! A Monitoring distribution carries one independent count per bucket, where
//! bucket `i` covers `[bound(i-1), bound(i))`. Prometheus expects every bucket
//! to start at zero, i.e. each upper bound carries the cumulative count of all
//! observations at or below it.
//!
//! See <https://cloud.google.com/monitoring/api/ref_v3/rest/v3/TypedValue#bucketoptions>.
use crate::api::{BucketOptions, Distribution};
use crate::error::{Error, Result};

/// Upper bounds with their cumulative counts, in ascending bound order. The
/// last bound is always `+Inf`.
pub type Buckets = Vec<(f64, u64)>;

/// Builds cumulative Prometheus buckets for a distribution.
///
/// Fails with [Error::UnknownBuckets] when no bucket layout is set.
pub(crate) fn generate_histogram_buckets(dist: &Distribution) -> Result<Buckets> {
    let bounds = bucket_bounds(&dist.bucket_options)?;

    let mut last = 0u64;
    let buckets = bounds
        .into_iter()
        .enumerate()
        .map(|(i, bound)| {
            // Missing trailing counts mean the bucket is empty.
            if let Some(count) = dist.bucket_counts.get(i) {
                last += u64::try_from(*count).unwrap_or(0);
            }
            (bound, last)
        })
        .collect();

    Ok(buckets)
}

fn bucket_bounds(opts: &BucketOptions) -> Result<Vec<f64>> {
    let mut bounds = if let Some(explicit) = &opts.explicit_buckets {
        let mut bounds = Vec::with_capacity(explicit.bounds.len() + 1);
        bounds.extend_from_slice(&explicit.bounds);
        bounds
    } else if let Some(linear) = &opts.linear_buckets {
        // num_finite_buckets is inclusive, so there are num + 2 buckets
        let num = linear.num_finite_buckets.max(0);
        (0..=num)
            .map(|i| linear.offset + f64::from(i) * linear.width)
            .collect()
    } else if let Some(exponential) = &opts.exponential_buckets {
        let num = exponential.num_finite_buckets.max(0);
        (0..=num)
            .map(|i| exponential.scale * exponential.growth_factor.powi(i))
            .collect()
    } else {
        return Err(Error::UnknownBuckets);
    };

    // The last bucket is always the overflow bucket.
    bounds.push(f64::INFINITY);
    Ok(bounds)
}
