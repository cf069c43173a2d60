//! Silences suppress healer remediation for matching hosts.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use crate::duration::parse_duration;
use crate::{hash_id, ModelError, ModelResult};

/// A silence record at `/silences/<providerID>/<silenceID>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Silence {
    /// Regex matched against host names.
    pub pattern: String,
    /// Lifetime from creation, e.g. `"2h"`.
    pub ttl: String,
    /// Absolute expiry, computed from `ttl` at validation time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expired_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub created_by: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
}

impl Silence {
    /// Validate the pattern and ttl, compute expiry and ID.
    pub fn validate(&mut self, now: DateTime<Utc>) -> ModelResult<()> {
        if self.pattern.trim().is_empty() {
            return Err(ModelError::MissingField("pattern"));
        }
        // The healer compiles the pattern on every check; reject broken
        // ones at the door instead.
        regex_syntax_check(&self.pattern)?;
        let ttl = parse_duration(&self.ttl).ok_or_else(|| ModelError::InvalidDuration {
            field: "ttl",
            value: self.ttl.clone(),
        })?;
        let ttl = ChronoDuration::from_std(ttl).map_err(|_| ModelError::InvalidDuration {
            field: "ttl",
            value: self.ttl.clone(),
        })?;
        self.expired_at = Some(now + ttl);
        self.id = hash_id(&format!("{}{}", self.pattern, self.ttl));
        Ok(())
    }

    /// Whether this silence is still in effect.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expired_at.map(|at| now < at).unwrap_or(false)
    }
}

// Minimal structural check without pulling a regex engine into the model
// crate: balanced classes/groups and no trailing escape. The healer's
// real compile is the authority; this rejects the obvious cases early.
fn regex_syntax_check(pattern: &str) -> ModelResult<()> {
    let mut depth = 0i32;
    let mut class = false;
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if chars.next().is_none() {
                    return Err(ModelError::InvalidPattern(
                        pattern.to_string(),
                        "trailing escape".to_string(),
                    ));
                }
            }
            '[' if !class => class = true,
            ']' if class => class = false,
            '(' if !class => depth += 1,
            ')' if !class => depth -= 1,
            _ => {}
        }
        if depth < 0 {
            break;
        }
    }
    if depth != 0 || class {
        return Err(ModelError::InvalidPattern(
            pattern.to_string(),
            "unbalanced group or class".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn silence() -> Silence {
        Silence {
            pattern: "compute-[0-9]+".to_string(),
            ttl: "2h".to_string(),
            expired_at: None,
            description: String::new(),
            created_by: "ops".to_string(),
            id: String::new(),
        }
    }

    #[test]
    fn validate_sets_expiry_and_id() {
        let now = Utc::now();
        let mut s = silence();
        s.validate(now).unwrap();
        let expiry = s.expired_at.unwrap();
        assert_eq!((expiry - now).num_seconds(), 7200);
        assert!(!s.id.is_empty());
    }

    #[test]
    fn active_until_expiry() {
        let now = Utc::now();
        let mut s = silence();
        s.validate(now).unwrap();
        assert!(s.is_active(now));
        assert!(!s.is_active(now + ChronoDuration::hours(3)));
    }

    #[test]
    fn rejects_bad_ttl() {
        let mut s = silence();
        s.ttl = "forever".to_string();
        assert!(s.validate(Utc::now()).is_err());
    }

    #[test]
    fn rejects_broken_pattern() {
        let mut s = silence();
        s.pattern = "compute-(".to_string();
        assert!(s.validate(Utc::now()).is_err());
        s.pattern = "host\\".to_string();
        assert!(s.validate(Utc::now()).is_err());
    }
}
