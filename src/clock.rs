//! Deterministic time for tests: an injected [`Clock`] in front of
//! `chrono::Utc::now()`, grounded on the teacher's dependency-injected
//! collaborator idiom (the client/tool seams `Agent` was built around) —
//! the same pattern applied to wall-clock time so a fixed instant can be
//! asserted against instead of "sometime after the test started".

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The real clock. Default for every production constructor.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Always returns the same instant it was built with.
pub struct TestClock(pub DateTime<Utc>);

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_never_advances() {
        let fixed = Utc::now();
        let clock = TestClock(fixed);
        assert_eq!(clock.now(), fixed);
        assert_eq!(clock.now(), fixed);
    }
}
