//! faythe-autohealer — per-rule host remediation workers.
//!
//! A [`Healer`] runs the same tick/hysteresis/cooldown shape as a
//! scaler, but its query returns unhealthy hosts and state is tracked
//! per host. Remediation for one host is serialized process-wide, a
//! batch cap refuses to heal infrastructure-scale failures, and active
//! silences suppress matching hosts.

pub mod healer;
pub mod locks;

pub use healer::{Healer, HealerFactory};
pub use locks::host_lock;
