//! Prometheus instant-query adapter.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::{MetricBackend, MetricError, MetricResult, Sample};

/// Default query timeout.
const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Backend over a Prometheus-compatible HTTP API.
pub struct PrometheusBackend {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct ApiResponse {
    status: String,
    #[serde(default)]
    data: Option<ApiData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct ApiData {
    #[serde(rename = "resultType")]
    result_type: String,
    #[serde(default)]
    result: Vec<VectorSample>,
}

#[derive(Deserialize)]
struct VectorSample {
    metric: BTreeMap<String, String>,
    /// `[unix_seconds, "value"]`
    value: (f64, String),
}

impl PrometheusBackend {
    /// Adapter for the backend at `base_url`, e.g.
    /// `http://prom.internal:9090`.
    pub fn new(base_url: &str) -> MetricResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(QUERY_TIMEOUT)
            .build()
            .map_err(|e| MetricError::Request(e.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl MetricBackend for PrometheusBackend {
    async fn query(&self, expr: &str) -> MetricResult<Vec<Sample>> {
        let url = format!("{}/api/v1/query", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&[("query", expr)])
            .send()
            .await
            .map_err(|e| MetricError::Request(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(MetricError::Status(status.as_u16()));
        }

        let body: ApiResponse = resp
            .json()
            .await
            .map_err(|e| MetricError::Decode(e.to_string()))?;

        if body.status != "success" {
            return Err(MetricError::Request(
                body.error.unwrap_or_else(|| "query failed".to_string()),
            ));
        }
        let data = body
            .data
            .ok_or_else(|| MetricError::Decode("missing data field".to_string()))?;
        if data.result_type != "vector" {
            return Err(MetricError::Decode(format!(
                "unsupported result type {:?}",
                data.result_type
            )));
        }

        let samples = data
            .result
            .into_iter()
            .filter_map(|s| {
                let parsed = s.value.1.parse::<f64>();
                match parsed {
                    Ok(value) => Some(Sample {
                        labels: s.metric,
                        value,
                    }),
                    Err(_) => {
                        debug!(raw = %s.value.1, "dropping unparsable sample value");
                        None
                    }
                }
            })
            .collect();
        Ok(samples)
    }
}
