//! Programmable backend for worker and manager tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::{MetricBackend, MetricResult, Sample};

/// Scripted metric backend.
///
/// Queued responses are consumed in order; once drained, every query
/// answers with the default response (initially empty, i.e. condition
/// false).
pub struct MockBackend {
    queue: Mutex<VecDeque<MetricResult<Vec<Sample>>>>,
    default: Mutex<MetricResult<Vec<Sample>>>,
    queries: Mutex<Vec<String>>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            default: Mutex::new(Ok(Vec::new())),
            queries: Mutex::new(Vec::new()),
        }
    }

    /// Queue one response.
    pub fn push(&self, response: MetricResult<Vec<Sample>>) {
        self.queue.lock().unwrap().push_back(response);
    }

    /// Set the response used once the queue drains.
    pub fn set_default(&self, response: MetricResult<Vec<Sample>>) {
        *self.default.lock().unwrap() = response;
    }

    /// Expressions queried so far.
    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }

    /// Number of queries answered so far.
    pub fn query_count(&self) -> usize {
        self.queries.lock().unwrap().len()
    }

    /// A single unlabeled sample, for scaler-style conditions.
    pub fn firing() -> Vec<Sample> {
        vec![Sample {
            labels: BTreeMap::new(),
            value: 1.0,
        }]
    }

    /// Samples labeled with the given hosts, for healer-style conditions.
    pub fn hosts(names: &[&str]) -> Vec<Sample> {
        names
            .iter()
            .map(|name| Sample {
                labels: BTreeMap::from([("instance".to_string(), format!("{name}:9100"))]),
                value: 0.0,
            })
            .collect()
    }
}

#[async_trait]
impl MetricBackend for MockBackend {
    async fn query(&self, expr: &str) -> MetricResult<Vec<Sample>> {
        self.queries.lock().unwrap().push(expr.to_string());
        if let Some(next) = self.queue.lock().unwrap().pop_front() {
            return next;
        }
        self.default.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn queue_then_default() {
        let mock = MockBackend::new();
        mock.push(Ok(MockBackend::firing()));
        mock.push(Err(MetricError::Status(500)));

        assert_eq!(mock.query("x").await.unwrap().len(), 1);
        assert!(mock.query("x").await.is_err());
        // Drained: default is condition-false.
        assert!(mock.query("x").await.unwrap().is_empty());
        assert_eq!(mock.query_count(), 3);
    }
}
