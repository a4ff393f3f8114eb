//! Wall-clock abstraction for testability
//!
//! Token lifetimes are expressed in epoch seconds by the identity provider,
//! so everything that compares "now" against an expiry goes through a
//! [`Clock`]. Production code uses [`SystemClock`]; tests pin time with
//! [`MockClock`].
//!
//! # Examples
//!
//! ```
//! use std::time::Duration;
//!
//! use tether_common::time::{Clock, MockClock};
//!
//! let clock = MockClock::at_secs(1_000);
//! clock.advance(Duration::from_secs(5));
//! assert_eq!(clock.now_secs(), 1_005);
//! assert_eq!(clock.now_millis(), 1_005_000);
//! ```

use std::fmt::Debug;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

/// Source of wall-clock time
pub trait Clock: Send + Sync + Debug {
    /// Milliseconds since the UNIX epoch
    fn now_millis(&self) -> i64;

    /// Seconds since the UNIX epoch
    fn now_secs(&self) -> i64 {
        self.now_millis().div_euclid(1000)
    }
}

/// Real system clock backed by `chrono::Utc`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Manually driven clock for deterministic tests
///
/// Clones share the same underlying instant, so a test can hand one clone to
/// the code under test and advance the other.
#[derive(Debug, Clone, Default)]
pub struct MockClock {
    millis: Arc<AtomicI64>,
}

impl MockClock {
    /// Create a mock clock starting at the real current time
    #[must_use]
    pub fn new() -> Self {
        Self::at_millis(Utc::now().timestamp_millis())
    }

    /// Create a mock clock pinned to `secs` since the epoch
    #[must_use]
    pub fn at_secs(secs: i64) -> Self {
        Self::at_millis(secs.saturating_mul(1000))
    }

    /// Create a mock clock pinned to `millis` since the epoch
    #[must_use]
    pub fn at_millis(millis: i64) -> Self {
        Self { millis: Arc::new(AtomicI64::new(millis)) }
    }

    /// Move the clock forward
    pub fn advance(&self, duration: Duration) {
        let delta = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        self.millis.fetch_add(delta, Ordering::SeqCst);
    }

    /// Jump to an absolute epoch second
    pub fn set_secs(&self, secs: i64) {
        self.millis.store(secs.saturating_mul(1000), Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn now_millis(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}
