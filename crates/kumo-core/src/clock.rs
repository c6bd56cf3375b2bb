//! Wall-clock abstraction.
//!
//! Token expiry and the reboot throttle both compare against "now". Routing that
//! through a trait lets tests move time forward without sleeping.

use std::fmt::Debug;

use chrono::{DateTime, Utc};

/// Source of the current time.
pub trait Clock: Send + Sync + Debug {
    /// Returns the current UTC time.
    fn now(&self) -> DateTime<Utc>;
}

/// [`Clock`] backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
