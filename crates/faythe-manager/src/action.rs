//! Outbound HTTP action dispatch.
//!
//! When a rule fires, its actions fan out concurrently. A failed action
//! is counted and logged but never blocks the worker's state machine;
//! delivery is at-least-one-attempt, observable through the exporter.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, warn};

use faythe_model::ActionHttp;

/// Per-action request timeout.
pub const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared dispatcher for a node's workers.
pub struct ActionDispatcher {
    client: reqwest::Client,
    cluster_id: String,
}

impl ActionDispatcher {
    /// Build a dispatcher whose requests time out after `timeout`.
    pub fn new(cluster_id: &str, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            cluster_id: cluster_id.to_string(),
        }
    }

    /// Fan out every action concurrently and wait for all attempts.
    ///
    /// `host` fills the `{{host}}` template placeholder for healer
    /// remediations.
    pub async fn dispatch_all(
        &self,
        rule_id: &str,
        host: Option<&str>,
        actions: &BTreeMap<String, ActionHttp>,
    ) {
        let attempts = actions
            .iter()
            .map(|(name, action)| self.dispatch_one(name, action, rule_id, host));
        futures::future::join_all(attempts).await;
    }

    async fn dispatch_one(
        &self,
        name: &str,
        action: &ActionHttp,
        rule_id: &str,
        host: Option<&str>,
    ) {
        let url = render(&action.url, rule_id, host);
        let method = match reqwest::Method::from_bytes(
            action.method.to_ascii_uppercase().as_bytes(),
        ) {
            Ok(m) => m,
            Err(_) => {
                warn!(action = name, method = %action.method, "unsupported action method");
                faythe_exporter::report_action_failure(&self.cluster_id, &url);
                return;
            }
        };

        let mut request = self.client.request(method, &url);
        for (key, value) in &action.headers {
            request = request.header(key, value);
        }
        if let Some(body) = &action.body {
            request = request.body(render(body, rule_id, host));
        }

        match request.send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!(action = name, %url, status = %resp.status(), "action dispatched");
            }
            Ok(resp) => {
                warn!(action = name, %url, status = %resp.status(), "action rejected");
                faythe_exporter::report_action_failure(&self.cluster_id, &url);
            }
            Err(e) => {
                warn!(action = name, %url, error = %e, "action request failed");
                faythe_exporter::report_action_failure(&self.cluster_id, &url);
            }
        }
    }
}

/// Substitute template placeholders in URLs and bodies.
fn render(template: &str, rule_id: &str, host: Option<&str>) -> String {
    template
        .replace("{{rule_id}}", rule_id)
        .replace("{{host}}", host.unwrap_or(""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn action(url: String) -> ActionHttp {
        ActionHttp {
            url,
            method: "POST".to_string(),
            headers: BTreeMap::from([("x-auth".to_string(), "token".to_string())]),
            body: Some(r#"{"host":"{{host}}","rule":"{{rule_id}}"}"#.to_string()),
            delay_type: "fixed".to_string(),
            max_retries: 0,
        }
    }

    #[test]
    fn render_substitutes_placeholders() {
        assert_eq!(
            render("http://x/{{host}}/{{rule_id}}", "r1", Some("compute-01")),
            "http://x/compute-01/r1"
        );
        assert_eq!(render("{{host}}", "r1", None), "");
    }

    #[tokio::test]
    async fn dispatch_posts_rendered_body_and_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("x-auth", "token"))
            .and(body_string(r#"{"host":"compute-01","rule":"r1"}"#))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let dispatcher = ActionDispatcher::new("c1", Duration::from_secs(2));
        let actions = BTreeMap::from([("heal".to_string(), action(format!("{}/hook", server.uri())))]);
        dispatcher.dispatch_all("r1", Some("compute-01"), &actions).await;
    }

    #[tokio::test]
    async fn all_actions_attempted_despite_failures() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bad"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/good"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let dispatcher = ActionDispatcher::new("c1", Duration::from_secs(2));
        let actions = BTreeMap::from([
            ("a_bad".to_string(), action(format!("{}/bad", server.uri()))),
            ("b_good".to_string(), action(format!("{}/good", server.uri()))),
        ]);
        dispatcher.dispatch_all("r1", None, &actions).await;
    }

    #[tokio::test]
    async fn unreachable_endpoint_does_not_panic() {
        let dispatcher = ActionDispatcher::new("c1", Duration::from_millis(200));
        let actions = BTreeMap::from([(
            "a".to_string(),
            action("http://127.0.0.1:1/hook".to_string()),
        )]);
        dispatcher.dispatch_all("r1", None, &actions).await;
    }
}
