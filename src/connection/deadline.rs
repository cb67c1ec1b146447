//! Connect deadlines

use std::time::{Duration, Instant};

/// Absolute point in time by which the pipe must be connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Deadline {
    /// Wait as long as it takes
    #[default]
    Infinite,
    /// Give up at this instant
    At(Instant),
}

impl Deadline {
    /// Deadline `timeout` from now
    pub fn after(timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(at) => Deadline::At(at),
            None => Deadline::Infinite,
        }
    }

    /// Time left before the deadline, `None` for an infinite wait.
    ///
    /// A deadline in the past yields `Some(Duration::ZERO)`, never an
    /// infinite wait.
    pub fn remaining(&self) -> Option<Duration> {
        match self {
            Deadline::Infinite => None,
            Deadline::At(at) => Some(at.saturating_duration_since(Instant::now())),
        }
    }

    /// Whether the deadline has passed
    pub fn is_expired(&self) -> bool {
        self.remaining() == Some(Duration::ZERO)
    }
}

impl From<Option<Duration>> for Deadline {
    fn from(timeout: Option<Duration>) -> Self {
        timeout.map_or(Deadline::Infinite, Deadline::after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infinite_has_no_remaining() {
        assert_eq!(Deadline::Infinite.remaining(), None);
        assert!(!Deadline::Infinite.is_expired());
    }

    #[test]
    fn test_past_deadline_clamps_to_zero() {
        let past = Instant::now()
            .checked_sub(Duration::from_secs(5))
            .unwrap_or_else(Instant::now);
        let deadline = Deadline::At(past);
        assert_eq!(deadline.remaining(), Some(Duration::ZERO));
        assert!(deadline.is_expired());
    }

    #[test]
    fn test_future_deadline_is_bounded() {
        let deadline = Deadline::after(Duration::from_secs(60));
        let remaining = deadline.remaining().expect("finite deadline");
        assert!(remaining <= Duration::from_secs(60));
        assert!(remaining > Duration::from_secs(50));
    }

    #[test]
    fn test_from_optional_timeout() {
        assert_eq!(Deadline::from(None), Deadline::Infinite);
        assert!(matches!(
            Deadline::from(Some(Duration::from_millis(50))),
            Deadline::At(_)
        ));
    }
}
