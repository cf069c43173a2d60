//! Cloud provider records at `/clouds/<providerID>`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{hash_id, ModelError, ModelResult};

/// A registered cloud provider.
///
/// The managers only read `monitor.address` out of this record to build
/// the metric backend for the provider's rules; the rest is carried for
/// the API surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudProvider {
    /// Provider kind, e.g. `"openstack"`.
    pub provider: String,
    /// Server-computed ID (MD5 of the auth URL).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// Identity endpoint of the cloud itself.
    pub auth_url: String,
    /// Metric backend serving this cloud's telemetry.
    pub monitor: MonitorEndpoint,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

/// Address and kind of a provider's metric backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorEndpoint {
    /// Backend kind, e.g. `"prometheus"`.
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Base URL, e.g. `"http://prom.internal:9090"`.
    pub address: String,
}

fn default_backend() -> String {
    "prometheus".to_string()
}

impl CloudProvider {
    /// Validate the record and compute its ID.
    pub fn validate(&mut self) -> ModelResult<()> {
        if self.provider.trim().is_empty() {
            return Err(ModelError::MissingField("provider"));
        }
        if self.auth_url.trim().is_empty() {
            return Err(ModelError::MissingField("auth_url"));
        }
        if self.monitor.address.trim().is_empty() {
            return Err(ModelError::MissingField("monitor.address"));
        }
        self.id = hash_id(&self.auth_url);
        Ok(())
    }
}
