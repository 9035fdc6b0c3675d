//! Metrics contract and the in-memory gauge registry behind `/metrics`.

use std::collections::BTreeMap;

use parking_lot::RwLock;

#[derive(Debug, thiserror::Error)]
#[error("metrics error: {0}")]
pub struct MetricsError(pub String);

/// Gauge sink; errors are best-effort and ignored by callers.
pub trait Metrics: Send + Sync {
    fn set_gauge(
        &self,
        name: &str,
        labels: &[(&str, &str)],
        value: f64,
    ) -> Result<(), MetricsError>;

    fn add_gauge(
        &self,
        name: &str,
        labels: &[(&str, &str)],
        value: f64,
    ) -> Result<(), MetricsError>;

    fn increment_gauge(&self, name: &str, labels: &[(&str, &str)]) -> Result<(), MetricsError>;
}

type GaugeKey = (String, Vec<(String, String)>);

/// Labeled gauges keyed by `(name, label set)`, rendered in Prometheus
/// text exposition format.
#[derive(Default)]
pub struct GaugeRegistry {
    gauges: RwLock<BTreeMap<GaugeKey, f64>>,
}

fn key(name: &str, labels: &[(&str, &str)]) -> GaugeKey {
    (
        name.to_owned(),
        labels
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect(),
    )
}

impl GaugeRegistry {
    /// Prometheus exposition of every gauge, prefixed `strata_`.
    pub fn render(&self) -> String {
        let gauges = self.gauges.read();
        let mut out = String::new();
        let mut last_name: Option<&str> = None;

        for ((name, labels), value) in gauges.iter() {
            if last_name != Some(name.as_str()) {
                out.push_str(&format!("# TYPE strata_{name} gauge\n"));
                last_name = Some(name.as_str());
            }
            if labels.is_empty() {
                out.push_str(&format!("strata_{name} {value}\n"));
            } else {
                let rendered: Vec<String> = labels
                    .iter()
                    .map(|(k, v)| format!("{k}=\"{v}\""))
                    .collect();
                out.push_str(&format!("strata_{name}{{{}}} {value}\n", rendered.join(",")));
            }
        }

        out
    }
}

impl Metrics for GaugeRegistry {
    fn set_gauge(
        &self,
        name: &str,
        labels: &[(&str, &str)],
        value: f64,
    ) -> Result<(), MetricsError> {
        self.gauges.write().insert(key(name, labels), value);
        Ok(())
    }

    fn add_gauge(
        &self,
        name: &str,
        labels: &[(&str, &str)],
        value: f64,
    ) -> Result<(), MetricsError> {
        *self.gauges.write().entry(key(name, labels)).or_insert(0.0) += value;
        Ok(())
    }

    fn increment_gauge(&self, name: &str, labels: &[(&str, &str)]) -> Result<(), MetricsError> {
        self.add_gauge(name, labels, 1.0)
    }
}
