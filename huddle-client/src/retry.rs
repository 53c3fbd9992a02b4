//! Reconnect backoff policy
//!
//! Exponential schedule built on `backon`. The schedule is finite: once
//! `max_attempts` delays have been handed out the caller gives up.

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    #[serde(with = "millis")]
    pub initial_delay: Duration,
    #[serde(with = "millis")]
    pub max_delay: Duration,
    pub factor: f32,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A fresh delay schedule; start a new one after every successful connect
    #[must_use]
    pub fn backoff(&self) -> ExponentialBackoff {
        let builder = ExponentialBuilder::default()
            .with_min_delay(self.initial_delay)
            .with_max_delay(self.max_delay)
            .with_factor(self.factor)
            .with_max_times(self.max_attempts);

        if self.jitter {
            builder.with_jitter().build()
        } else {
            builder.build()
        }
    }
}

/// Durations as integer milliseconds in config files
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: usize) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            factor: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn test_schedule_is_exponential_and_capped() {
        let delays: Vec<Duration> = policy(5).backoff().collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(500),
                Duration::from_millis(500),
            ]
        );
    }

    #[test]
    fn test_schedule_is_finite() {
        assert_eq!(policy(3).backoff().count(), 3);
        assert_eq!(policy(0).backoff().count(), 0);
    }

    #[test]
    fn test_jitter_stays_bounded() {
        let policy = RetryPolicy {
            jitter: true,
            ..policy(4)
        };
        let delays: Vec<Duration> = policy.backoff().collect();
        assert_eq!(delays.len(), 4);
        assert!(delays[0] >= Duration::from_millis(100));
    }

    #[test]
    fn test_fresh_schedule_restarts() {
        let policy = policy(2);
        let mut first = policy.backoff();
        first.next();
        first.next();
        assert!(first.next().is_none());
        assert_eq!(policy.backoff().next(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_deserialize_millis() {
        let policy: RetryPolicy =
            serde_json::from_str(r#"{"max_attempts": 3, "initial_delay": 250}"#).unwrap();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_delay, Duration::from_millis(250));
        assert_eq!(policy.max_delay, Duration::from_secs(30));
    }
}
