//! Construction-time configuration of an async wait stage.
//!
//! Everything that can be described as data lives here and can be
//! loaded from JSON. Pieces that are code (the fallback, a custom
//! retry strategy, the clock) are handed to
//! [`crate::AsyncWaitBuilder`] instead.

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::errors::AsyncWaitError;
use crate::recovery::StepId;
use crate::retry::RetryStrategyConfig;

/// How completed entries are released downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// Emit in input order. A slow head holds back everything behind
    /// it.
    #[default]
    Ordered,
    /// Emit records in completion order, but never across a
    /// watermark.
    Unordered,
}

fn default_capacity() -> usize {
    100
}

/// ```json
/// {"step_id": "lookup", "mode": "unordered", "capacity": 10,
///  "timeout_ms": 5000,
///  "retry": {"type": "fixed_delay", "max_attempts": 3, "backoff_ms": 100}}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncWaitConfig {
    #[serde(default)]
    pub step_id: StepId,
    #[serde(default)]
    pub mode: OutputMode,
    /// Maximum entries in flight, watermarks included.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Overall timeout per entry, from its first attempt to its final
    /// resolution. `None` or zero means entries never time out.
    #[serde(default, rename = "timeout_ms", with = "opt_millis")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub retry: RetryStrategyConfig,
}

impl Default for AsyncWaitConfig {
    fn default() -> Self {
        Self {
            step_id: StepId::default(),
            mode: OutputMode::default(),
            capacity: default_capacity(),
            timeout: None,
            retry: RetryStrategyConfig::default(),
        }
    }
}

impl AsyncWaitConfig {
    pub fn new(step_id: impl Into<String>, mode: OutputMode) -> Self {
        Self {
            step_id: StepId::new(step_id),
            mode,
            ..Self::default()
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryStrategyConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn from_json(json: &str) -> Result<Self, AsyncWaitError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|err| AsyncWaitError::invalid(format!("unable to parse config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// The timeout if one is actually in effect.
    pub fn effective_timeout(&self) -> Option<Duration> {
        self.timeout.filter(|timeout| !timeout.is_zero())
    }

    /// Check everything that can be checked without the stage's code
    /// pieces.
    pub fn validate(&self) -> Result<(), AsyncWaitError> {
        self.check_capacity()?;
        self.retry.validate()?;
        check_retry_timeout(&self.step_id, self.retry.is_enabled(), self.effective_timeout())
    }

    pub(crate) fn check_capacity(&self) -> Result<(), AsyncWaitError> {
        if self.capacity == 0 {
            Err(AsyncWaitError::invalid(format!(
                "capacity of step {} must be positive",
                self.step_id
            )))
        } else {
            Ok(())
        }
    }
}

/// Retrying without a bound would retry forever.
pub(crate) fn check_retry_timeout(
    step_id: &StepId,
    retry_enabled: bool,
    timeout: Option<Duration>,
) -> Result<(), AsyncWaitError> {
    if retry_enabled && timeout.is_none() {
        Err(AsyncWaitError::invalid(format!(
            "step {step_id} enables retry, which requires a positive timeout"
        )))
    } else {
        Ok(())
    }
}

/// (De)serialize a [`Duration`] as integer milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    pub(crate) fn serialize<S: Serializer>(duration: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

pub(crate) mod opt_millis {
    use std::time::Duration;

    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    pub(crate) fn serialize<S: Serializer>(
        duration: &Option<Duration>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        match duration {
            Some(duration) => super::millis::serialize(duration, s),
            None => s.serialize_none(),
        }
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|ms| ms.map(Duration::from_millis))
    }
}

#[test]
fn config_defaults() {
    let config = AsyncWaitConfig::from_json("{}").unwrap();
    assert_eq!(config, AsyncWaitConfig::default());
    assert_eq!(config.capacity, 100);
    assert_eq!(config.mode, OutputMode::Ordered);
    assert_eq!(config.step_id, StepId::new("async_wait"));
    assert_eq!(config.effective_timeout(), None);
}

#[test]
fn config_from_json() {
    let config = AsyncWaitConfig::from_json(
        r#"{"step_id": "lookup", "mode": "unordered", "capacity": 10,
            "timeout_ms": 5000,
            "retry": {"type": "fixed_delay", "max_attempts": 3, "backoff_ms": 100}}"#,
    )
    .unwrap();
    assert_eq!(config.step_id, StepId::new("lookup"));
    assert_eq!(config.mode, OutputMode::Unordered);
    assert_eq!(config.capacity, 10);
    assert_eq!(config.effective_timeout(), Some(Duration::from_secs(5)));
    assert!(config.retry.is_enabled());
}

#[test]
fn config_rejects_zero_capacity() {
    let config = AsyncWaitConfig::default().with_capacity(0);
    assert!(matches!(
        config.validate(),
        Err(AsyncWaitError::ConfigurationInvalid(_))
    ));
}

#[test]
fn config_rejects_retry_without_timeout() {
    let retry = RetryStrategyConfig::FixedDelay {
        max_attempts: Some(1),
        backoff: Duration::from_millis(1),
        retry_on: Default::default(),
    };
    let unbounded = AsyncWaitConfig::default().with_retry(retry.clone());
    assert!(unbounded.validate().is_err());

    let zero = unbounded.clone().with_timeout(Duration::ZERO);
    assert!(zero.validate().is_err());

    let bounded = unbounded.with_timeout(Duration::from_secs(1));
    assert!(bounded.validate().is_ok());
}

#[test]
fn config_round_trips_through_json() {
    let config = AsyncWaitConfig::new("x", OutputMode::Unordered).with_timeout(Duration::from_millis(1500));
    let json = serde_json::to_string(&config).unwrap();
    let found: AsyncWaitConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(found, config);
}
