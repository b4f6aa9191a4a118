//! Time source abstraction.
//!
//! Invocation budgets and async-job staleness are both measured against a
//! `Clock` so that tests can drive time forward explicitly.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Mutex;
use std::time::Duration;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock implementation used in production.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now = due_after(*now, by);
    }

    pub fn set(&self, to: DateTime<Utc>) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Wall-clock budget for a single invocation.
#[derive(Debug, Clone, Copy)]
pub struct InvocationBudget {
    started_at: DateTime<Utc>,
    budget: Duration,
}

impl InvocationBudget {
    pub fn start(clock: &dyn Clock, budget: Duration) -> Self {
        Self {
            started_at: clock.now(),
            budget,
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn elapsed(&self, clock: &dyn Clock) -> Duration {
        (clock.now() - self.started_at).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn remaining(&self, clock: &dyn Clock) -> Duration {
        self.budget.saturating_sub(self.elapsed(clock))
    }

    /// Whether a stage expected to take `estimate` may still be started.
    pub fn can_start(&self, clock: &dyn Clock, estimate: Duration) -> bool {
        self.remaining(clock) > estimate
    }
}

pub(crate) fn to_chrono(duration: Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or(ChronoDuration::MAX)
}

/// `now + delay`, saturating at the latest representable instant.
pub fn due_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    now.checked_add_signed(to_chrono(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
