//! Inter-attempt delay schedule.
//!
//! One delay per attempt, indexed by the zero-based attempt index. The first
//! attempt's delay is always zero, so backoff only ever precedes a retry.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::humantime_serde;

/// Backoff configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffConfig {
    /// Explicit delays; entry `i` precedes attempt `i`. Entry 0 must be zero.
    /// Attempts past the end of the list reuse the last entry.
    Schedule {
        /// Delays, non-decreasing, starting at zero.
        #[serde(with = "humantime_serde::list")]
        delays: Vec<Duration>,
    },

    /// Exponential backoff.
    Exponential {
        /// Delay before attempt 1 (the first retry).
        #[serde(with = "humantime_serde")]
        initial_delay: Duration,

        /// Upper bound for any delay.
        #[serde(with = "humantime_serde")]
        max_delay: Duration,

        /// Multiplier for each retry (default: 2.0).
        #[serde(default = "default_multiplier")]
        multiplier: f64,
    },
}

const fn default_multiplier() -> f64 {
    2.0
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::Schedule {
            delays: vec![
                Duration::ZERO,
                Duration::from_millis(200),
                Duration::from_millis(500),
            ],
        }
    }
}

impl BackoffConfig {
    /// Delay applied before the attempt with the given zero-based index.
    ///
    /// Attempt 0 is never delayed.
    #[must_use]
    pub fn delay_before_attempt(&self, attempt_index: u32) -> Duration {
        if attempt_index == 0 {
            return Duration::ZERO;
        }
        match self {
            Self::Schedule { delays } => {
                let index = usize::try_from(attempt_index).unwrap_or(usize::MAX);
                delays
                    .get(index)
                    .or_else(|| delays.last())
                    .copied()
                    .unwrap_or(Duration::ZERO)
            },
            Self::Exponential {
                initial_delay,
                max_delay,
                multiplier,
            } => {
                #[allow(clippy::cast_possible_wrap)] // attempt count is bounded by max_attempts
                let secs =
                    initial_delay.as_secs_f64() * multiplier.powi((attempt_index - 1) as i32);
                Duration::try_from_secs_f64(secs)
                    .unwrap_or(*max_delay)
                    .min(*max_delay)
            },
        }
    }

    /// Sum of the delays a run of `max_attempts` attempts would wait.
    #[must_use]
    pub fn total_delay(&self, max_attempts: u32) -> Duration {
        (0..max_attempts)
            .map(|attempt_index| self.delay_before_attempt(attempt_index))
            .sum()
    }

    /// Checks that the schedule is usable.
    ///
    /// # Errors
    ///
    /// Returns a description of the first violation.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Schedule { delays } => {
                let Some(first) = delays.first() else {
                    return Err("backoff schedule must contain at least one delay".to_string());
                };
                if !first.is_zero() {
                    return Err(format!(
                        "backoff schedule entry 0 is the first attempt's delay and must be 0ms, got {first:?}"
                    ));
                }
                if let Some(pos) = delays.windows(2).position(|w| w[1] < w[0]) {
                    return Err(format!(
                        "backoff schedule must be non-decreasing: entry {} ({:?}) < entry {} ({:?})",
                        pos + 1,
                        delays[pos + 1],
                        pos,
                        delays[pos]
                    ));
                }
                Ok(())
            },
            Self::Exponential {
                initial_delay,
                max_delay,
                multiplier,
            } => {
                if !multiplier.is_finite() || *multiplier < 1.0 {
                    return Err(format!(
                        "backoff multiplier must be a finite value >= 1.0, got {multiplier}"
                    ));
                }
                if max_delay < initial_delay {
                    return Err(format!(
                        "backoff max_delay ({max_delay:?}) is below initial_delay ({initial_delay:?})"
                    ));
                }
                Ok(())
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn first_attempt_is_never_delayed() {
        let config = BackoffConfig::Exponential {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
        };
        assert_eq!(config.delay_before_attempt(0), Duration::ZERO);
        assert_eq!(config.delay_before_attempt(1), Duration::from_millis(100));
    }

    #[test]
    fn default_schedule_uses_one_entry_per_attempt() {
        let config = BackoffConfig::default();
        assert_eq!(config.delay_before_attempt(0), Duration::ZERO);
        assert_eq!(config.delay_before_attempt(1), Duration::from_millis(200));
        assert_eq!(config.delay_before_attempt(2), Duration::from_millis(500));
        // Past the end of the list the last entry repeats.
        assert_eq!(config.delay_before_attempt(7), Duration::from_millis(500));
        assert_eq!(config.total_delay(3), Duration::from_millis(700));
    }

    #[test]
    fn validate_rejects_delayed_first_attempt() {
        let config = BackoffConfig::Schedule {
            delays: vec![Duration::from_millis(100), Duration::from_millis(200)],
        };
        assert!(config.validate().unwrap_err().contains("entry 0"));
    }

    #[test]
    fn test_exponential_backoff() {
        let config = BackoffConfig::Exponential {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            multiplier: 2.0,
        };

        assert_eq!(config.delay_before_attempt(1), Duration::from_millis(100));
        assert_eq!(config.delay_before_attempt(2), Duration::from_millis(200));
        assert_eq!(config.delay_before_attempt(3), Duration::from_millis(400));
        assert_eq!(config.delay_before_attempt(4), Duration::from_millis(800));

        // Should cap at max_delay
        assert_eq!(config.delay_before_attempt(10), Duration::from_millis(1000));
    }

    #[test]
    fn validate_rejects_decreasing_schedule() {
        let config = BackoffConfig::Schedule {
            delays: vec![
                Duration::ZERO,
                Duration::from_millis(300),
                Duration::from_millis(100),
            ],
        };
        assert!(config.validate().unwrap_err().contains("non-decreasing"));
        assert!(
            BackoffConfig::Schedule { delays: vec![] }
                .validate()
                .is_err()
        );
    }

    #[test]
    fn validate_rejects_shrinking_multiplier() {
        let config = BackoffConfig::Exponential {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 0.5,
        };
        assert!(config.validate().is_err());
    }

    proptest! {
        #[test]
        fn valid_configs_are_non_decreasing(
            mut millis in prop::collection::vec(0u64..5_000, 1..6),
            initial in 0u64..1_000,
            cap in 1_000u64..10_000,
            multiplier in 1.0f64..4.0,
        ) {
            millis.sort_unstable();
            millis.insert(0, 0);
            let schedule = BackoffConfig::Schedule {
                delays: millis.into_iter().map(Duration::from_millis).collect(),
            };
            let exponential = BackoffConfig::Exponential {
                initial_delay: Duration::from_millis(initial),
                max_delay: Duration::from_millis(cap),
                multiplier,
            };
            for config in [schedule, exponential] {
                prop_assert!(config.validate().is_ok());
                prop_assert_eq!(config.delay_before_attempt(0), Duration::ZERO);
                for attempt in 0..10 {
                    prop_assert!(config.delay_before_attempt(attempt) <= config.delay_before_attempt(attempt + 1));
                }
            }
        }
    }
}
