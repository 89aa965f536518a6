//! Merging and encoding of collected families for the `/metrics` endpoint.
use prometheus::{
    proto::{Metric, MetricFamily},
    Encoder, TextEncoder,
};
use std::collections::{BTreeMap, HashSet};
use tracing::warn;

use crate::error::Result;

/// Merges families sharing a name into one family per name, sorted by name.
///
/// The first family seen for a name decides its type and help text; later
/// families of another type are dropped. A series whose label set was
/// already seen under the same name is dropped as well.
pub fn merge_families(families: impl IntoIterator<Item = MetricFamily>) -> Vec<MetricFamily> {
    let mut merged: BTreeMap<String, (MetricFamily, HashSet<Vec<(String, String)>>)> =
        BTreeMap::new();

    for mut family in families {
        let metrics = family.take_metric();
        let (existing, seen) = merged
            .entry(family.name().to_string())
            .or_insert_with(|| (family.clone(), HashSet::new()));

        if existing.get_field_type() != family.get_field_type() {
            warn!(
                name: "MetricTypeConflict",
                message = "type conflict, using existing type definition",
                metric = %family.name(),
                existing = ?existing.get_field_type(),
                dropped = ?family.get_field_type()
            );
            continue;
        }

        for metric in metrics {
            if seen.insert(label_set(&metric)) {
                existing.mut_metric().push(metric);
            } else {
                warn!(
                    name: "DuplicateSeries",
                    message = "series collected twice with the same labels, dropping",
                    metric = %family.name()
                );
            }
        }
    }

    merged
        .into_values()
        .map(|(family, _)| family)
        .filter(|family| !family.get_metric().is_empty())
        .collect()
}

fn label_set(metric: &Metric) -> Vec<(String, String)> {
    let mut labels: Vec<(String, String)> = metric
        .get_label()
        .iter()
        .map(|lp| (lp.name().to_string(), lp.value().to_string()))
        .collect();
    labels.sort();
    labels
}

/// Merges `families` and renders them in the Prometheus text format.
pub fn encode_text(families: impl IntoIterator<Item = MetricFamily>) -> Result<(String, Vec<u8>)> {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    encoder.encode(&merge_families(families), &mut buf)?;
    Ok((encoder.format_type().to_string(), buf))
}
