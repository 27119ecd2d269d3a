//! Injectable time source
//!
//! Penalty expiry is computed lazily on read, so every availability check is a
//! pure function of the current clock. Components take an `Arc<dyn Clock>` so
//! tests can drive time explicitly.

use chrono::{DateTime, Utc};
use std::fmt::Debug;

/// Source of "now" for all availability and scheduling decisions.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock implementation used outside of tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
