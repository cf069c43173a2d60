//! Scaler and healer rule records as persisted in the keyspace.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::alert::AlertState;
use crate::duration::parse_duration;
use crate::{hash_id, ModelError, ModelResult};

/// An outbound HTTP action executed when a rule fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionHttp {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// Body template; `{{host}}` and `{{rule_id}}` are substituted at
    /// dispatch time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default = "default_delay_type")]
    pub delay_type: String,
    #[serde(default)]
    pub max_retries: u32,
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_delay_type() -> String {
    "fixed".to_string()
}

impl ActionHttp {
    /// Check URL and method sanity.
    pub fn validate(&self, name: &str) -> ModelResult<()> {
        if !self.url.starts_with("http://") && !self.url.starts_with("https://") {
            return Err(ModelError::InvalidAction {
                name: name.to_string(),
                reason: format!("url {:?} is not http(s)", self.url),
            });
        }
        match self.method.to_ascii_uppercase().as_str() {
            "GET" | "POST" | "PUT" | "DELETE" | "PATCH" => Ok(()),
            other => Err(ModelError::InvalidAction {
                name: name.to_string(),
                reason: format!("unsupported method {other:?}"),
            }),
        }
    }
}

/// A user-defined autoscaling rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalerRule {
    /// Metric expression; the expression encodes the firing comparison,
    /// so a non-empty result set means the condition holds.
    pub query: String,
    /// How long the condition must hold before firing.
    pub duration: String,
    /// Evaluation period.
    pub interval: String,
    /// Minimum gap between successive firings.
    #[serde(default)]
    pub cooldown: String,
    #[serde(default)]
    pub actions: BTreeMap<String, ActionHttp>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default = "default_active")]
    pub active: bool,
    /// Server-computed MD5 of `query`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// Alert state checkpointed on graceful shutdown.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert: Option<AlertState>,
}

fn default_active() -> bool {
    true
}

impl ScalerRule {
    /// Validate fields, fill defaults, and compute the rule ID.
    ///
    /// The ID overwrites whatever the caller sent.
    pub fn validate(&mut self) -> ModelResult<()> {
        if self.query.trim().is_empty() {
            return Err(ModelError::MissingField("query"));
        }
        for (name, action) in &self.actions {
            action.validate(name)?;
        }
        check_duration("duration", &self.duration)?;
        check_duration("interval", &self.interval)?;
        if self.cooldown.is_empty() {
            self.cooldown = crate::DEFAULT_COOLDOWN.to_string();
        }
        check_duration("cooldown", &self.cooldown)?;
        self.id = hash_id(&self.query);
        Ok(())
    }
}

/// A user-defined autohealing rule.
///
/// Same lifecycle as a scaler, but the query's result carries host
/// labels and remediation is tracked per host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealerRule {
    pub query: String,
    #[serde(default)]
    pub duration: String,
    #[serde(default)]
    pub interval: String,
    #[serde(default)]
    pub cooldown: String,
    #[serde(default)]
    pub actions: BTreeMap<String, ActionHttp>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// Cap on hosts remediated in one batch; a wider failure is treated
    /// as infrastructure trouble, not something to heal host-by-host.
    #[serde(default = "default_max_instances")]
    pub max_instances: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert: Option<AlertState>,
}

fn default_max_instances() -> u32 {
    crate::DEFAULT_MAX_INSTANCES
}

impl HealerRule {
    /// Validate fields, fill healer defaults, and compute the rule ID.
    pub fn validate(&mut self) -> ModelResult<()> {
        if self.query.trim().is_empty() {
            return Err(ModelError::MissingField("query"));
        }
        for (name, action) in &self.actions {
            action.validate(name)?;
        }
        if self.duration.is_empty() {
            self.duration = crate::DEFAULT_HEALER_DURATION.to_string();
        }
        check_duration("duration", &self.duration)?;
        if self.interval.is_empty() {
            self.interval = crate::DEFAULT_HEALER_INTERVAL.to_string();
        }
        check_duration("interval", &self.interval)?;
        if self.cooldown.is_empty() {
            self.cooldown = crate::DEFAULT_COOLDOWN.to_string();
        }
        check_duration("cooldown", &self.cooldown)?;
        if self.max_instances == 0 {
            self.max_instances = crate::DEFAULT_MAX_INSTANCES;
        }
        self.id = hash_id(&self.query);
        Ok(())
    }
}

fn check_duration(field: &'static str, value: &str) -> ModelResult<()> {
    parse_duration(value)
        .map(|_| ())
        .ok_or_else(|| ModelError::InvalidDuration {
            field,
            value: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink_action() -> ActionHttp {
        ActionHttp {
            url: "http://sink.example/hook".to_string(),
            method: "POST".to_string(),
            headers: BTreeMap::new(),
            body: None,
            delay_type: "fixed".to_string(),
            max_retries: 0,
        }
    }

    fn valid_scaler() -> ScalerRule {
        ScalerRule {
            query: "avg(cpu_usage) > 0.8".to_string(),
            duration: "3m".to_string(),
            interval: "30s".to_string(),
            cooldown: String::new(),
            actions: BTreeMap::from([("scale_out".to_string(), sink_action())]),
            tags: vec![],
            description: String::new(),
            active: true,
            id: String::new(),
            alert: None,
        }
    }

    #[test]
    fn scaler_validate_fills_defaults_and_id() {
        let mut rule = valid_scaler();
        rule.validate().unwrap();
        assert_eq!(rule.cooldown, "600s");
        assert_eq!(rule.id, crate::hash_id("avg(cpu_usage) > 0.8"));
    }

    #[test]
    fn scaler_id_overwritten_on_validate() {
        let mut rule = valid_scaler();
        rule.id = "spoofed".to_string();
        rule.validate().unwrap();
        assert_ne!(rule.id, "spoofed");
    }

    #[test]
    fn scaler_rejects_empty_query() {
        let mut rule = valid_scaler();
        rule.query = "  ".to_string();
        assert!(matches!(
            rule.validate(),
            Err(ModelError::MissingField("query"))
        ));
    }

    #[test]
    fn scaler_rejects_bad_duration() {
        let mut rule = valid_scaler();
        rule.duration = "three minutes".to_string();
        assert!(matches!(
            rule.validate(),
            Err(ModelError::InvalidDuration { field: "duration", .. })
        ));
    }

    #[test]
    fn action_rejects_non_http_url() {
        let mut action = sink_action();
        action.url = "ftp://sink".to_string();
        assert!(action.validate("a1").is_err());
    }

    #[test]
    fn action_rejects_unknown_method() {
        let mut action = sink_action();
        action.method = "BREW".to_string();
        assert!(action.validate("a1").is_err());
    }

    #[test]
    fn healer_defaults_applied() {
        let mut rule = HealerRule {
            query: "up{job=~\".*compute.*\"} < 1".to_string(),
            duration: String::new(),
            interval: String::new(),
            cooldown: String::new(),
            actions: BTreeMap::new(),
            tags: vec![],
            description: String::new(),
            active: true,
            id: String::new(),
            max_instances: 0,
            alert: None,
        };
        rule.validate().unwrap();
        assert_eq!(rule.duration, "3m");
        assert_eq!(rule.interval, "18s");
        assert_eq!(rule.max_instances, 3);
    }

    #[test]
    fn rule_json_roundtrip_keeps_alert_state() {
        let mut rule = valid_scaler();
        rule.validate().unwrap();
        rule.alert = Some(AlertState::default());
        let json = serde_json::to_string(&rule).unwrap();
        let back: ScalerRule = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rule);
    }

    #[test]
    fn rule_json_accepts_minimal_payload() {
        let raw = r#"{"query":"up == 0","duration":"2s","interval":"500ms"}"#;
        let mut rule: ScalerRule = serde_json::from_str(raw).unwrap();
        rule.validate().unwrap();
        assert!(rule.active);
        assert!(rule.actions.is_empty());
    }
}
