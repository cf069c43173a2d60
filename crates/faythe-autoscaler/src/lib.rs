//! faythe-autoscaler — per-rule scaling workers.
//!
//! A [`Scaler`] evaluates one rule's metric query on its interval,
//! walks the alert state machine (hysteresis before firing, cooldown
//! after), and fans the rule's actions out when it fires.

pub mod scaler;

pub use scaler::{Scaler, ScalerFactory};
