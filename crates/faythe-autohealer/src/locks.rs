//! Process-wide per-host remediation locks.
//!
//! Two healer rules matching the same host must not remediate it
//! concurrently; every dispatch path takes the host's lock first.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;

static LOCKS: Lazy<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// The lock guarding remediation of `host`.
pub fn host_lock(host: &str) -> Arc<tokio::sync::Mutex<()>> {
    let mut locks = LOCKS.lock().unwrap();
    Arc::clone(
        locks
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
    )
}
