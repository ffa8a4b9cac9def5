//! Coherence specifications
//!
//! How fresh a shadowed replica must be kept, and therefore when the probe
//! feeding it runs next.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Initial delay of the default adaptive specification (1 hour)
pub const DEFAULT_ADAPTIVE_CURRENT_MS: u64 = 3_600_000;
/// Upper bound of the default adaptive specification (1 week)
pub const DEFAULT_ADAPTIVE_MAX_MS: u64 = 604_800_000;
/// Delay used after a change or a failure (10 minutes)
pub const DEFAULT_ADAPTIVE_FALLBACK_MS: u64 = 600_000;
pub const DEFAULT_ADAPTIVE_FACTOR: f64 = 1.1;

/// Result of one probe run, as far as scheduling is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    SuccessNoChange,
    SuccessWithChange,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CoherenceSpecification {
    /// Run once, never again
    OneTimeOnly,
    /// Run every `delay_ms`, whatever the outcome
    Periodic { delay_ms: u64 },
    /// Back off while nothing changes, fall back after a change or failure
    AdaptivePeriodic {
        current_ms: u64,
        max_ms: u64,
        fallback_ms: u64,
        factor: f64,
    },
}

impl Default for CoherenceSpecification {
    fn default() -> Self {
        Self::default_adaptive()
    }
}

impl CoherenceSpecification {
    pub fn periodic(delay_ms: u64) -> Self {
        Self::Periodic { delay_ms }
    }

    pub fn default_adaptive() -> Self {
        Self::AdaptivePeriodic {
            current_ms: DEFAULT_ADAPTIVE_CURRENT_MS,
            max_ms: DEFAULT_ADAPTIVE_MAX_MS,
            fallback_ms: DEFAULT_ADAPTIVE_FALLBACK_MS,
            factor: DEFAULT_ADAPTIVE_FACTOR,
        }
    }

    /// The delay this specification asks for right now. `None` for a
    /// one-time schedule.
    pub fn current_delay(&self) -> Option<Duration> {
        match self {
            CoherenceSpecification::OneTimeOnly => None,
            CoherenceSpecification::Periodic { delay_ms } => Some(Duration::from_millis(*delay_ms)),
            CoherenceSpecification::AdaptivePeriodic { current_ms, .. } => {
                Some(Duration::from_millis(*current_ms))
            }
        }
    }

    /// Delay until the next run after a run with `outcome`, without changing
    /// this specification. `None` means no further run.
    pub fn next_delay(&self, outcome: RunOutcome) -> Option<Duration> {
        self.clone().advance(outcome)
    }

    /// Fold the outcome of a run into this specification and return the
    /// delay until the next run
    pub fn advance(&mut self, outcome: RunOutcome) -> Option<Duration> {
        match self {
            CoherenceSpecification::OneTimeOnly => None,
            CoherenceSpecification::Periodic { delay_ms } => Some(Duration::from_millis(*delay_ms)),
            CoherenceSpecification::AdaptivePeriodic {
                current_ms,
                max_ms,
                fallback_ms,
                factor,
            } => {
                *current_ms = match outcome {
                    RunOutcome::SuccessNoChange => {
                        let grown = (*current_ms as f64 * *factor) as u64;
                        grown.min(*max_ms)
                    }
                    RunOutcome::SuccessWithChange | RunOutcome::Failed => *fallback_ms,
                };
                Some(Duration::from_millis(*current_ms))
            }
        }
    }

    /// Forget any backoff accumulated by an adaptive specification
    pub fn reset(&mut self) {
        if let CoherenceSpecification::AdaptivePeriodic { current_ms, .. } = self {
            *current_ms = DEFAULT_ADAPTIVE_CURRENT_MS;
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match self {
            CoherenceSpecification::OneTimeOnly => Ok(()),
            CoherenceSpecification::Periodic { delay_ms } => {
                if *delay_ms == 0 {
                    return Err("periodic delay must be > 0".to_string());
                }
                Ok(())
            }
            CoherenceSpecification::AdaptivePeriodic {
                current_ms,
                max_ms,
                fallback_ms,
                factor,
            } => {
                if *current_ms == 0 || *max_ms == 0 || *fallback_ms == 0 {
                    return Err("adaptive delays must be > 0".to_string());
                }
                if !factor.is_finite() || *factor < 1.0 {
                    return Err(format!("adaptive growth factor must be >= 1.0, got {}", factor));
                }
                if current_ms > max_ms || fallback_ms > max_ms {
                    return Err("adaptive delays must not exceed the maximum".to_string());
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for CoherenceSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoherenceSpecification::OneTimeOnly => write!(f, "one-time"),
            CoherenceSpecification::Periodic { delay_ms } => write!(f, "periodic:{}", delay_ms),
            CoherenceSpecification::AdaptivePeriodic {
                current_ms,
                max_ms,
                fallback_ms,
                factor,
            } => write!(
                f,
                "adaptive:{}:{}:{}:{}",
                current_ms, max_ms, fallback_ms, factor
            ),
        }
    }
}

impl std::str::FromStr for CoherenceSpecification {
    type Err = String;

    /// Accepts `one-time`, `periodic:<ms>`, `adaptive` and
    /// `adaptive:<current>:<max>:<fallback>:<factor>`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        let number = |v: &str| {
            v.parse::<u64>()
                .map_err(|_| format!("invalid delay '{}' in '{}'", v, s))
        };
        let spec = match parts.as_slice() {
            ["one-time"] | ["onetime"] => CoherenceSpecification::OneTimeOnly,
            ["periodic", delay] => CoherenceSpecification::Periodic {
                delay_ms: number(*delay)?,
            },
            ["adaptive"] => CoherenceSpecification::default_adaptive(),
            ["adaptive", current, max, fallback, factor] => {
                CoherenceSpecification::AdaptivePeriodic {
                    current_ms: number(*current)?,
                    max_ms: number(*max)?,
                    fallback_ms: number(*fallback)?,
                    factor: factor
                        .parse::<f64>()
                        .map_err(|_| format!("invalid factor '{}' in '{}'", factor, s))?,
                }
            }
            _ => return Err(format!("unknown coherence specification '{}'", s)),
        };
        spec.validate()?;
        Ok(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_adaptive_grows_without_change() {
        let mut spec = CoherenceSpecification::default_adaptive();
        let delay = spec.advance(RunOutcome::SuccessNoChange).unwrap();
        assert_eq!(delay, Duration::from_millis(3_960_000));
    }

    #[test]
    fn test_adaptive_falls_back_on_change_or_failure() {
        let mut spec = CoherenceSpecification::default_adaptive();
        assert_eq!(
            spec.advance(RunOutcome::SuccessWithChange),
            Some(Duration::from_millis(600_000))
        );
        let mut spec = CoherenceSpecification::default_adaptive();
        assert_eq!(
            spec.advance(RunOutcome::Failed),
            Some(Duration::from_millis(600_000))
        );
    }

    #[test]
    fn test_adaptive_is_capped() {
        let mut spec = CoherenceSpecification::AdaptivePeriodic {
            current_ms: 900,
            max_ms: 1000,
            fallback_ms: 100,
            factor: 2.0,
        };
        assert_eq!(
            spec.advance(RunOutcome::SuccessNoChange),
            Some(Duration::from_millis(1000))
        );
        assert_eq!(
            spec.advance(RunOutcome::SuccessNoChange),
            Some(Duration::from_millis(1000))
        );
    }

    #[test]
    fn test_periodic_and_one_time() {
        let spec = CoherenceSpecification::periodic(3000);
        for outcome in [
            RunOutcome::SuccessNoChange,
            RunOutcome::SuccessWithChange,
            RunOutcome::Failed,
        ] {
            assert_eq!(spec.next_delay(outcome), Some(Duration::from_millis(3000)));
        }
        assert_eq!(
            CoherenceSpecification::OneTimeOnly.next_delay(RunOutcome::SuccessNoChange),
            None
        );
    }

    #[test]
    fn test_next_delay_does_not_mutate() {
        let spec = CoherenceSpecification::default_adaptive();
        let _ = spec.next_delay(RunOutcome::SuccessNoChange);
        assert_eq!(spec, CoherenceSpecification::default_adaptive());
    }

    #[test]
    fn test_parse_and_display() {
        let spec: CoherenceSpecification = "periodic:3000".parse().unwrap();
        assert_eq!(spec, CoherenceSpecification::periodic(3000));
        assert_eq!(spec.to_string(), "periodic:3000");

        let spec: CoherenceSpecification = "adaptive".parse().unwrap();
        assert_eq!(spec, CoherenceSpecification::default_adaptive());
        let reparsed: CoherenceSpecification = spec.to_string().parse().unwrap();
        assert_eq!(reparsed, spec);

        assert!("periodic:0".parse::<CoherenceSpecification>().is_err());
        assert!("adaptive:10:100:5:0.5".parse::<CoherenceSpecification>().is_err());
        assert!("sometimes".parse::<CoherenceSpecification>().is_err());
    }

    proptest! {
        #[test]
        fn prop_adaptive_law(
            current in 1u64..1_000_000_000,
            max in 1u64..1_000_000_000,
            fallback in 1u64..1_000_000_000,
            factor in 1.0f64..4.0,
            changed in any::<bool>(),
            failed in any::<bool>(),
        ) {
            let mut spec = CoherenceSpecification::AdaptivePeriodic {
                current_ms: current,
                max_ms: max,
                fallback_ms: fallback,
                factor,
            };
            let outcome = if failed {
                RunOutcome::Failed
            } else if changed {
                RunOutcome::SuccessWithChange
            } else {
                RunOutcome::SuccessNoChange
            };
            let delay = spec.advance(outcome).unwrap().as_millis() as u64;
            match outcome {
                RunOutcome::SuccessNoChange => {
                    prop_assert_eq!(delay, ((current as f64 * factor) as u64).min(max));
                    prop_assert!(delay <= max);
                }
                _ => prop_assert_eq!(delay, fallback),
            }
        }
    }
}
