use std::borrow::Cow;

/// Returns the API resource name of a project.
pub(crate) fn project_resource(project_id: &str) -> String {
    format!("projects/{project_id}")
}

/// Whether a metric type (or prefix) lives in a Google owned namespace, e.g.
/// `compute.googleapis.com/...`.
pub(crate) fn is_google_metric(name: &str) -> bool {
    name.split('/')
        .next()
        .is_some_and(|domain| domain.contains("googleapis.com"))
}

/// Converts a monitored resource or metric type into a Prometheus name
/// fragment.
///
/// `compute.googleapis.com/instance/cpu/usage_time` becomes
/// `compute_googleapis_com_instance_cpu_usage_time`.
pub(crate) fn normalize_metric_name(name: &str) -> String {
    name.split(['.', '/', '_', '-'])
        .map(|word| {
            word.trim()
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
                .collect::<String>()
        })
        .filter_map(|word| {
            let word = word.trim_matches('_');
            (!word.is_empty()).then(|| word.to_string())
        })
        .collect::<Vec<_>>()
        .join("_")
}

/// Joins non-empty name parts with `_`.
pub(crate) fn build_fq_name(namespace: &str, subsystem: &str, name: &str) -> String {
    [namespace, subsystem, name]
        .into_iter()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

/// Makes a label key valid for Prometheus, leaving valid keys untouched.
pub(crate) fn sanitize_label_name(s: &str) -> Cow<'_, str> {
    let valid = s
        .char_indices()
        .all(|(i, c)| c == '_' || c.is_ascii_alphabetic() || (i > 0 && c.is_ascii_digit()));
    if valid && !s.is_empty() {
        return Cow::Borrowed(s);
    }

    let prefix = if s.chars().next().map_or(true, |c| c.is_ascii_digit()) {
        "_"
    } else {
        ""
    };
    Cow::Owned(
        prefix
            .chars()
            .chain(s.chars().map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' {
                    c
                } else {
                    '_'
                }
            }))
            .collect(),
    )
}
