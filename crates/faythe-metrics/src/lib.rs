//! faythe-metrics — metric backend adapters.
//!
//! Workers decide whether a rule's condition holds by running its query
//! against the provider's time-series backend. The query expression
//! encodes the comparison (`avg(cpu) > 0.8`), so a backend answers with
//! the matching samples and an empty result means the condition does not
//! hold.

pub mod mock;
pub mod prometheus;

pub use mock::MockBackend;
pub use prometheus::PrometheusBackend;

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;

/// Result type alias for metric queries.
pub type MetricResult<T> = Result<T, MetricError>;

/// Errors from a metric backend.
#[derive(Debug, Error, Clone)]
pub enum MetricError {
    #[error("metric request failed: {0}")]
    Request(String),

    #[error("metric backend returned status {0}")]
    Status(u16),

    #[error("metric response malformed: {0}")]
    Decode(String),
}

/// One labeled sample from an instant query.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub labels: BTreeMap<String, String>,
    pub value: f64,
}

impl Sample {
    /// The host this sample describes, if labeled. Checks `instance`
    /// then `host`, stripping any port from `instance`.
    pub fn host(&self) -> Option<&str> {
        if let Some(instance) = self.labels.get("instance") {
            return Some(instance.split(':').next().unwrap_or(instance));
        }
        self.labels.get("host").map(String::as_str)
    }
}

/// An instant-query capable time-series backend.
#[async_trait]
pub trait MetricBackend: Send + Sync + 'static {
    /// Evaluate `expr` now and return the matching samples.
    async fn query(&self, expr: &str) -> MetricResult<Vec<Sample>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_host_prefers_instance_and_strips_port() {
        let sample = Sample {
            labels: BTreeMap::from([
                ("instance".to_string(), "compute-01:9100".to_string()),
                ("host".to_string(), "ignored".to_string()),
            ]),
            value: 0.0,
        };
        assert_eq!(sample.host(), Some("compute-01"));
    }

    #[test]
    fn sample_host_falls_back_to_host_label() {
        let sample = Sample {
            labels: BTreeMap::from([("host".to_string(), "compute-02".to_string())]),
            value: 0.0,
        };
        assert_eq!(sample.host(), Some("compute-02"));
    }

    #[test]
    fn sample_without_host_labels() {
        let sample = Sample {
            labels: BTreeMap::new(),
            value: 1.0,
        };
        assert_eq!(sample.host(), None);
    }
}
