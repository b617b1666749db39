//! Retry strategies for individual async invocations.
//!
//! After every attempt the driver asks the configured
//! [`RetryStrategy`] whether the outcome deserves another try and how
//! long to back off first. Whether there is time left for that retry
//! is the driver's call, not the strategy's: a retry is only scheduled
//! if it would start before the overall timeout.

use std::fmt::Debug;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::config::millis;
use crate::errors::AsyncWaitError;
use crate::function::Outcome;

/// Decides if and when an attempt is retried.
pub trait RetryStrategy<O> {
    /// Should the attempt numbered `attempt` (starting at 1) with this
    /// outcome be followed by another attempt?
    fn should_retry(&self, attempt: u32, outcome: &Outcome<O>) -> bool;

    /// How long to wait after the attempt numbered `attempt` before
    /// starting the next one.
    fn backoff_before(&self, attempt: u32) -> Duration;

    /// `false` only for the designated no-retry strategy. Used to
    /// reject retrying without an overall timeout.
    fn is_enabled(&self) -> bool {
        true
    }
}

impl<O, S> RetryStrategy<O> for Box<S>
where
    S: RetryStrategy<O> + ?Sized,
{
    fn should_retry(&self, attempt: u32, outcome: &Outcome<O>) -> bool {
        (**self).should_retry(attempt, outcome)
    }

    fn backoff_before(&self, attempt: u32) -> Duration {
        (**self).backoff_before(attempt)
    }

    fn is_enabled(&self) -> bool {
        (**self).is_enabled()
    }
}

/// Which outcomes are worth retrying.
pub enum RetryPredicate<O> {
    /// Succeeded, but produced no output.
    EmptyResult,
    Error,
    EmptyResultOrError,
    Custom(Box<dyn Fn(&Outcome<O>) -> bool + Send + Sync>),
}

impl<O> RetryPredicate<O> {
    pub fn custom(f: impl Fn(&Outcome<O>) -> bool + Send + Sync + 'static) -> Self {
        Self::Custom(Box::new(f))
    }

    pub fn matches(&self, outcome: &Outcome<O>) -> bool {
        match self {
            Self::EmptyResult => matches!(outcome, Ok(values) if values.is_empty()),
            Self::Error => outcome.is_err(),
            Self::EmptyResultOrError => match outcome {
                Ok(values) => values.is_empty(),
                Err(_) => true,
            },
            Self::Custom(f) => f(outcome),
        }
    }
}

impl<O> Debug for RetryPredicate<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyResult => f.write_str("EmptyResult"),
            Self::Error => f.write_str("Error"),
            Self::EmptyResultOrError => f.write_str("EmptyResultOrError"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

fn within_budget(max_attempts: Option<u32>, attempt: u32) -> bool {
    max_attempts.map_or(true, |max| attempt <= max)
}

/// Never retry. Every first outcome is final.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl<O> RetryStrategy<O> for NoRetry {
    fn should_retry(&self, _attempt: u32, _outcome: &Outcome<O>) -> bool {
        false
    }

    fn backoff_before(&self, _attempt: u32) -> Duration {
        Duration::ZERO
    }

    fn is_enabled(&self) -> bool {
        false
    }
}

/// Retry with the same delay every time.
#[derive(Debug)]
pub struct FixedDelay<O> {
    /// Number of retries after the first attempt. `None` retries until
    /// the overall timeout.
    pub max_attempts: Option<u32>,
    pub backoff: Duration,
    pub predicate: RetryPredicate<O>,
}

impl<O> FixedDelay<O> {
    pub fn new(max_attempts: Option<u32>, backoff: Duration, predicate: RetryPredicate<O>) -> Self {
        Self {
            max_attempts,
            backoff,
            predicate,
        }
    }
}

impl<O> RetryStrategy<O> for FixedDelay<O> {
    fn should_retry(&self, attempt: u32, outcome: &Outcome<O>) -> bool {
        within_budget(self.max_attempts, attempt) && self.predicate.matches(outcome)
    }

    fn backoff_before(&self, _attempt: u32) -> Duration {
        self.backoff
    }
}

/// Retry with a delay that grows by `multiplier` each time, capped at
/// `max_delay`.
#[derive(Debug)]
pub struct ExponentialBackoff<O> {
    pub max_attempts: Option<u32>,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub predicate: RetryPredicate<O>,
}

impl<O> ExponentialBackoff<O> {
    pub fn new(
        max_attempts: Option<u32>,
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
        predicate: RetryPredicate<O>,
    ) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
            multiplier,
            predicate,
        }
    }
}

impl<O> RetryStrategy<O> for ExponentialBackoff<O> {
    fn should_retry(&self, attempt: u32, outcome: &Outcome<O>) -> bool {
        within_budget(self.max_attempts, attempt) && self.predicate.matches(outcome)
    }

    fn backoff_before(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exp);
        Duration::try_from_secs_f64(secs)
            .map(|delay| delay.min(self.max_delay))
            .unwrap_or(self.max_delay)
    }
}

/// Which outcomes a configured strategy retries on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryOn {
    #[serde(default)]
    pub empty_result: bool,
    #[serde(default)]
    pub error: bool,
}

impl RetryOn {
    fn predicate<O>(&self) -> Result<RetryPredicate<O>, AsyncWaitError> {
        match (self.empty_result, self.error) {
            (true, true) => Ok(RetryPredicate::EmptyResultOrError),
            (true, false) => Ok(RetryPredicate::EmptyResult),
            (false, true) => Ok(RetryPredicate::Error),
            (false, false) => Err(AsyncWaitError::invalid(
                "retry_on must enable at least one of empty_result or error",
            )),
        }
    }
}

impl Default for RetryOn {
    fn default() -> Self {
        Self {
            empty_result: false,
            error: true,
        }
    }
}

/// Serializable description of a retry strategy.
///
/// ```json
/// {"type": "fixed_delay", "max_attempts": 3, "backoff_ms": 100,
///  "retry_on": {"empty_result": true}}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RetryStrategyConfig {
    #[default]
    NoRetry,
    FixedDelay {
        #[serde(default)]
        max_attempts: Option<u32>,
        #[serde(rename = "backoff_ms", with = "millis")]
        backoff: Duration,
        #[serde(default)]
        retry_on: RetryOn,
    },
    ExponentialBackoff {
        #[serde(default)]
        max_attempts: Option<u32>,
        #[serde(rename = "initial_delay_ms", with = "millis")]
        initial_delay: Duration,
        #[serde(rename = "max_delay_ms", with = "millis")]
        max_delay: Duration,
        multiplier: f64,
        #[serde(default)]
        retry_on: RetryOn,
    },
}

impl RetryStrategyConfig {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::NoRetry)
    }

    pub(crate) fn validate(&self) -> Result<(), AsyncWaitError> {
        match self {
            Self::NoRetry => Ok(()),
            Self::FixedDelay { retry_on, .. } => retry_on.predicate::<()>().map(|_| ()),
            Self::ExponentialBackoff {
                initial_delay,
                max_delay,
                multiplier,
                retry_on,
                ..
            } => {
                if !multiplier.is_finite() || *multiplier < 1.0 {
                    return Err(AsyncWaitError::invalid(format!(
                        "exponential backoff multiplier must be at least 1.0; got {multiplier}"
                    )));
                }
                if initial_delay > max_delay {
                    return Err(AsyncWaitError::invalid(format!(
                        "exponential backoff initial delay {initial_delay:?} \
                         exceeds max delay {max_delay:?}"
                    )));
                }
                retry_on.predicate::<()>().map(|_| ())
            }
        }
    }

    /// Build the strategy this describes.
    pub fn build<O: 'static>(&self) -> Result<Box<dyn RetryStrategy<O>>, AsyncWaitError> {
        self.validate()?;
        let strategy: Box<dyn RetryStrategy<O>> = match self {
            Self::NoRetry => Box::new(NoRetry),
            Self::FixedDelay {
                max_attempts,
                backoff,
                retry_on,
            } => Box::new(FixedDelay::new(
                *max_attempts,
                *backoff,
                retry_on.predicate()?,
            )),
            Self::ExponentialBackoff {
                max_attempts,
                initial_delay,
                max_delay,
                multiplier,
                retry_on,
            } => Box::new(ExponentialBackoff::new(
                *max_attempts,
                *initial_delay,
                *max_delay,
                *multiplier,
                retry_on.predicate()?,
            )),
        };
        Ok(strategy)
    }
}

#[cfg(test)]
use crate::errors::InvocationError;

#[test]
fn predicates_classify_outcomes() {
    let empty: Outcome<u8> = Ok(vec![]);
    let full: Outcome<u8> = Ok(vec![1]);
    let err: Outcome<u8> = Err(InvocationError::new("boom"));

    assert!(RetryPredicate::EmptyResult.matches(&empty));
    assert!(!RetryPredicate::EmptyResult.matches(&full));
    assert!(!RetryPredicate::EmptyResult.matches(&err));

    assert!(RetryPredicate::Error.matches(&err));
    assert!(!RetryPredicate::Error.matches(&empty));

    assert!(RetryPredicate::EmptyResultOrError.matches(&err));
    assert!(RetryPredicate::EmptyResultOrError.matches(&empty));
    assert!(!RetryPredicate::EmptyResultOrError.matches(&full));

    let custom = RetryPredicate::custom(|outcome: &Outcome<u8>| {
        matches!(outcome, Ok(values) if values.contains(&0))
    });
    assert!(custom.matches(&Ok(vec![0])));
    assert!(!custom.matches(&full));
}

#[test]
fn fixed_delay_counts_retries() {
    let strategy = FixedDelay::new(
        Some(2),
        Duration::from_millis(10),
        RetryPredicate::EmptyResult,
    );
    let empty: Outcome<u8> = Ok(vec![]);

    assert!(strategy.should_retry(1, &empty));
    assert!(strategy.should_retry(2, &empty));
    assert!(!strategy.should_retry(3, &empty));
    assert!(!strategy.should_retry(1, &Ok(vec![1])));
    assert_eq!(strategy.backoff_before(2), Duration::from_millis(10));
}

#[test]
fn exponential_backoff_grows_and_caps() {
    let strategy: ExponentialBackoff<u8> = ExponentialBackoff::new(
        None,
        Duration::from_millis(100),
        Duration::from_millis(500),
        2.0,
        RetryPredicate::Error,
    );

    assert_eq!(strategy.backoff_before(1), Duration::from_millis(100));
    assert_eq!(strategy.backoff_before(2), Duration::from_millis(200));
    assert_eq!(strategy.backoff_before(3), Duration::from_millis(400));
    assert_eq!(strategy.backoff_before(4), Duration::from_millis(500));
    assert_eq!(strategy.backoff_before(u32::MAX), Duration::from_millis(500));
    assert!(strategy.should_retry(1_000, &Err(InvocationError::new("x"))));
}

#[test]
fn no_retry_is_disabled() {
    let strategy = NoRetry;
    assert!(!<NoRetry as RetryStrategy<u8>>::is_enabled(&strategy));
    assert!(!strategy.should_retry(1, &Ok::<Vec<u8>, _>(vec![])));
}

#[test]
fn config_parses_from_json() {
    let config: RetryStrategyConfig = serde_json::from_str(
        r#"{"type": "fixed_delay", "max_attempts": 3, "backoff_ms": 250,
            "retry_on": {"empty_result": true}}"#,
    )
    .unwrap();
    let expected = RetryStrategyConfig::FixedDelay {
        max_attempts: Some(3),
        backoff: Duration::from_millis(250),
        retry_on: RetryOn {
            empty_result: true,
            error: false,
        },
    };
    assert_eq!(config, expected);

    let strategy = config.build::<u8>().unwrap();
    assert!(strategy.is_enabled());
    assert!(strategy.should_retry(3, &Ok(vec![])));
    assert!(!strategy.should_retry(3, &Err(InvocationError::new("x"))));
}

#[test]
fn config_rejects_nothing_to_retry_on() {
    let config = RetryStrategyConfig::FixedDelay {
        max_attempts: None,
        backoff: Duration::from_millis(1),
        retry_on: RetryOn {
            empty_result: false,
            error: false,
        },
    };
    assert!(matches!(
        config.build::<u8>(),
        Err(AsyncWaitError::ConfigurationInvalid(_))
    ));
}

#[test]
fn config_rejects_shrinking_backoff() {
    let config = RetryStrategyConfig::ExponentialBackoff {
        max_attempts: None,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(10),
        multiplier: 0.5,
        retry_on: RetryOn::default(),
    };
    assert!(config.validate().is_err());
}
