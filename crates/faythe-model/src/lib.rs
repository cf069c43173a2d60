//! faythe-model — data model shared by every Faythe component.
//!
//! Rules, alert state, HTTP actions, cloud providers, and silences are
//! all JSON-serialized into the shared keyspace. Validation lives next
//! to the types so the HTTP layer and the managers agree on what a
//! well-formed record is.

pub mod alert;
pub mod cloud;
pub mod duration;
pub mod rule;
pub mod silence;

pub use alert::{AlertState, RuleState, Transition};
pub use cloud::CloudProvider;
pub use duration::parse_duration;
pub use rule::{ActionHttp, HealerRule, ScalerRule};
pub use silence::Silence;

use thiserror::Error;

/// Result type alias for model validation.
pub type ModelResult<T> = Result<T, ModelError>;

/// Errors produced while validating user-supplied records.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("required field {0} is missing or empty")]
    MissingField(&'static str),

    #[error("invalid duration {field} = {value:?}")]
    InvalidDuration { field: &'static str, value: String },

    #[error("invalid action {name}: {reason}")]
    InvalidAction { name: String, reason: String },

    #[error("invalid silence pattern {0:?}: {1}")]
    InvalidPattern(String, String),
}

/// Keyspace prefix for cloud provider records.
pub const CLOUD_PREFIX: &str = "/clouds";
/// Keyspace prefix for scaler rules.
pub const SCALER_PREFIX: &str = "/scalers";
/// Keyspace prefix for healer rules.
pub const HEALER_PREFIX: &str = "/healers";
/// Keyspace prefix for silences.
pub const SILENCE_PREFIX: &str = "/silences";
/// Keyspace prefix for node-resolver records (reserved).
pub const NRESOLVER_PREFIX: &str = "/nresolvers";
/// Keyspace prefix for cluster membership.
pub const CLUSTER_PREFIX: &str = "/cluster";

/// Default cooldown between successive firings of one rule.
pub const DEFAULT_COOLDOWN: &str = "600s";
/// Default healer evaluation interval.
pub const DEFAULT_HEALER_INTERVAL: &str = "18s";
/// Default healer hysteresis duration.
pub const DEFAULT_HEALER_DURATION: &str = "3m";
/// Default cap on hosts remediated in one batch.
pub const DEFAULT_MAX_INSTANCES: u32 = 3;

/// Join keyspace segments with `/`, keeping a single leading slash.
pub fn key_path(segments: &[&str]) -> String {
    let mut out = String::new();
    for seg in segments {
        let seg = seg.trim_matches('/');
        if seg.is_empty() {
            continue;
        }
        out.push('/');
        out.push_str(seg);
    }
    out
}

/// Hex MD5 digest, used for rule and silence IDs.
pub fn hash_id(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_path_joins_segments() {
        assert_eq!(key_path(&[SCALER_PREFIX, "os1", "abc"]), "/scalers/os1/abc");
        assert_eq!(key_path(&["/clouds/", "os1"]), "/clouds/os1");
        assert_eq!(key_path(&["", "x"]), "/x");
    }

    #[test]
    fn hash_id_is_stable_hex() {
        let a = hash_id("up == 0");
        let b = hash_id("up == 0");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
