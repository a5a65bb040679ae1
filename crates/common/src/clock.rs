//! Injectable clocks.
//!
//! Queue scheduling and rate-limit windows read time through
//! [`mockable::Clock`] so tests can move time explicitly.

use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Duration, Local, Utc};
use mockable::DefaultClock;

pub use mockable::Clock;

/// Shared clock handle.
pub type SharedClock = Arc<dyn Clock + Send + Sync>;

/// The wall clock.
#[must_use]
pub fn system_clock() -> SharedClock {
    Arc::new(DefaultClock)
}

/// A clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<RwLock<DateTime<Utc>>>,
}

impl ManualClock {
    /// Create a clock frozen at `now`.
    #[must_use]
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(RwLock::new(now)),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.write().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }

    /// Set the clock to an absolute instant.
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.write().unwrap_or_else(PoisonError::into_inner) = to;
    }
}

impl Clock for ManualClock {
    fn local(&self) -> DateTime<Local> {
        self.utc().with_timezone(&Local)
    }

    fn utc(&self) -> DateTime<Utc> {
        *self.now.read().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        assert_eq!(clock.utc(), start);

        clock.advance(Duration::seconds(61));
        assert_eq!(clock.utc(), start + Duration::seconds(61));

        let shared: SharedClock = Arc::new(clock.clone());
        clock.advance(Duration::seconds(1));
        assert_eq!(shared.utc(), start + Duration::seconds(62));
    }
}
