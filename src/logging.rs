//! Logging setup.
//!
//! The stage logs through [`tracing`] macros under the `async_wait`
//! target and never installs a subscriber on its own. Call
//! [`setup_tracing`] from a binary or test that wants the logs
//! printed.
//!
//! The `ASYNC_WAIT_LOG` environment variable, if set, takes priority
//! over the configured level and accepts any [`EnvFilter`] directive,
//! e.g. `ASYNC_WAIT_LOG=async_wait::operator=trace`.

use serde::Deserialize;
use serde::Serialize;
use tracing::level_filters::LevelFilter;
use tracing::Subscriber;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::Registry;

use crate::errors::AsyncWaitError;

/// Environment variable overriding [`TracingConfig::log_level`].
pub const LOG_ENV_VAR: &str = "ASYNC_WAIT_LOG";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TracingConfig {
    /// One of `trace`, `debug`, `info`, `warn` or `error`. Defaults to
    /// `error`.
    #[serde(default)]
    pub log_level: Option<String>,
}

fn get_log_level(level: Option<&str>) -> Result<LevelFilter, AsyncWaitError> {
    if let Some(level) = level {
        match level.to_lowercase().as_str() {
            "trace" => Ok(LevelFilter::TRACE),
            "debug" => Ok(LevelFilter::DEBUG),
            "info" => Ok(LevelFilter::INFO),
            "warn" => Ok(LevelFilter::WARN),
            "error" => Ok(LevelFilter::ERROR),
            level => Err(AsyncWaitError::invalid(format!("Wrong log level: {level}"))),
        }
    } else {
        Ok(LevelFilter::ERROR)
    }
}

/// Install a global subscriber printing this crate's logs to stdout.
///
/// Installing twice in the same process keeps the first subscriber
/// and logs a warning.
pub fn setup_tracing(config: &TracingConfig) -> Result<(), AsyncWaitError> {
    set_global_subscriber(build_subscriber(config)?);
    Ok(())
}

fn build_subscriber(
    config: &TracingConfig,
) -> Result<impl Subscriber + Send + Sync + 'static, AsyncWaitError> {
    let log_level = get_log_level(config.log_level.as_deref())?;

    let logs = tracing_subscriber::fmt::Layer::default()
        .compact()
        // Show source file
        .with_file(true)
        // Display source code line numbers
        .with_line_number(true)
        // Display the thread ID an event was recorded on
        .with_thread_ids(true);

    let logs = match std::env::var(LOG_ENV_VAR) {
        Ok(directives) => {
            let filter = EnvFilter::try_new(&directives).map_err(|err| {
                AsyncWaitError::invalid(format!("bad {LOG_ENV_VAR} directives {directives:?}: {err}"))
            })?;
            logs.with_filter(filter).boxed()
        }
        Err(_) => {
            let filter = Targets::new().with_target("async_wait", log_level);
            logs.with_filter(filter).boxed()
        }
    };
    Ok(Registry::default().with(logs))
}

// Utility function used to try to set a global default subscriber,
// logging the error without panicking if it was already set
fn set_global_subscriber<S>(subscriber: S)
where
    S: Subscriber + Send + Sync + 'static,
{
    // This can fail if tracing was already initialized, which happens
    // when several tests in one process each set it up.
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        tracing::warn!("{err}");
    }
}

#[test]
fn log_levels_parse() {
    assert_eq!(get_log_level(None).unwrap(), LevelFilter::ERROR);
    assert_eq!(get_log_level(Some("DEBUG")).unwrap(), LevelFilter::DEBUG);
    assert!(matches!(
        get_log_level(Some("loud")),
        Err(AsyncWaitError::ConfigurationInvalid(_))
    ));
}

#[test]
fn subscriber_rejects_bad_level() {
    let config = TracingConfig {
        log_level: Some("loud".to_owned()),
    };
    assert!(build_subscriber(&config).is_err());
}

#[test]
fn subscriber_is_scoped_to_the_caller() {
    let config = TracingConfig {
        log_level: Some("info".to_owned()),
    };
    let subscriber = build_subscriber(&config).unwrap();
    tracing::subscriber::with_default(subscriber, || {
        tracing::info!("scoped to this closure");
    });
}

#[test]
fn second_global_subscriber_only_warns() {
    // A silent subscriber keeps other tests in this binary quiet.
    set_global_subscriber(tracing::subscriber::NoSubscriber::default());
    set_global_subscriber(tracing::subscriber::NoSubscriber::default());
}
