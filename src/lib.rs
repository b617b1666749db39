//! An async wait stage for a streaming dataflow.
//!
//! The stage applies an asynchronous function to every record that
//! flows through it while keeping a bounded number of calls in
//! flight. Results are released downstream either in input order or
//! in completion order, and in both modes watermarks are never
//! overtaken. Failed or empty calls can be retried with a backoff,
//! every record can be given an overall timeout, and the records
//! still in flight can be checkpointed and re-invoked after a
//! restart.
//!
//! The stage is driven from a single thread. See [`operator`] for how
//! a driver turn works and [`recovery`] for what a checkpoint
//! contains.

#[macro_use]
pub(crate) mod macros;

pub mod clock;
pub mod config;
pub mod element;
pub mod errors;
pub mod function;
pub mod handle;
pub mod logging;
pub(crate) mod mailbox;
pub(crate) mod metrics;
pub mod operator;
pub mod output;
pub mod queue;
pub mod recovery;
pub mod retry;
pub(crate) mod timers;

pub use clock::Clock;
pub use clock::SystemClock;
pub use clock::TestingClock;
pub use config::AsyncWaitConfig;
pub use config::OutputMode;
pub use element::StreamElement;
pub use element::StreamRecord;
pub use element::StreamStatus;
pub use element::Watermark;
pub use errors::AsyncWaitError;
pub use errors::EntryError;
pub use errors::InvocationError;
pub use errors::RecoveryError;
pub use function::AsyncFunction;
pub use function::CancelSignal;
pub use function::FutureFunction;
pub use function::Outcome;
pub use function::ResultFuture;
pub use handle::EntryState;
pub use operator::Admission;
pub use operator::AsyncWaitBuilder;
pub use operator::AsyncWaitOperator;
pub use operator::FallbackEvent;
pub use output::CollectingOutput;
pub use output::Output;
pub use recovery::CheckpointId;
pub use recovery::CheckpointStore;
pub use recovery::StateBytes;
pub use recovery::StepId;
pub use retry::ExponentialBackoff;
pub use retry::FixedDelay;
pub use retry::NoRetry;
pub use retry::RetryPredicate;
pub use retry::RetryStrategy;
pub use retry::RetryStrategyConfig;
