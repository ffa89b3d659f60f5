//! Utility functions for the matchmaking engine

use chrono::{DateTime, Duration, Utc};
use std::sync::RwLock;
use uuid::Uuid;

/// Generate a new unique match ID
pub fn generate_match_id() -> String {
    Uuid::new_v4().to_string()
}

/// Get the current UTC timestamp
pub fn current_timestamp() -> DateTime<Utc> {
    Utc::now()
}

/// Absolute distance between two attribute values
pub fn attribute_distance(a: f64, b: f64) -> f64 {
    (a - b).abs()
}

/// Check if `value` lies inside `[center - tolerance, center + tolerance]`
pub fn within_tolerance(center: f64, value: f64, tolerance: f64) -> bool {
    value >= center - tolerance && value <= center + tolerance
}

/// Source of "now" for flexing and region expansion.
///
/// Every time-dependent computation takes the clock explicitly so tests can
/// travel in time without touching global state.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        current_timestamp()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: RwLock<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        if let Ok(mut guard) = self.now.write() {
            *guard = now;
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut guard) = self.now.write() {
            *guard += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now
            .read()
            .map(|guard| *guard)
            .unwrap_or_else(|poisoned| *poisoned.into_inner())
    }
}
