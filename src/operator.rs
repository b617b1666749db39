//! The emission driver.
//!
//! [`AsyncWaitOperator`] owns the in-flight queue and is the only
//! thing that ever mutates it. Everything else reaches it as an
//! event:
//!
//! - Upstream calls [`AsyncWaitOperator::process_element`] and
//!   friends.
//!
//! - Completions from the async function arrive in the mailbox from
//!   whatever thread they finished on.
//!
//! - Deadline and retry timers come due in processing time.
//!
//! Each call into the operator runs one or more turns. A turn applies
//! every waiting completion, fires every due timer, then emits
//! whatever the queue's ordering discipline allows. The driver only
//! blocks when upstream hands it input while the queue is full, or
//! when waiting out [`AsyncWaitOperator::finish`]; it then parks on
//! the mailbox until a completion arrives or the next timer is due.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::clock::saturating_add;
use crate::clock::to_chrono;
use crate::clock::Clock;
use crate::clock::SystemClock;
use crate::config::check_retry_timeout;
use crate::config::AsyncWaitConfig;
use crate::config::OutputMode;
use crate::element::StreamElement;
use crate::element::StreamRecord;
use crate::element::StreamStatus;
use crate::element::Watermark;
use crate::errors::AsyncWaitError;
use crate::errors::EntryError;
use crate::function::AsyncFunction;
use crate::function::CancelSignal;
use crate::function::ResultFuture;
use crate::handle::RecordEntry;
use crate::handle::ResultSlot;
use crate::mailbox::Mail;
use crate::mailbox::Mailbox;
use crate::metrics::AsyncWaitMetrics;
use crate::output::Output;
use crate::queue::EntryId;
use crate::queue::OrderedQueue;
use crate::queue::QueueEntry;
use crate::queue::StreamElementQueue;
use crate::queue::UnorderedQueue;
use crate::recovery::CheckpointId;
use crate::recovery::CheckpointStore;
use crate::recovery::PendingElements;
use crate::recovery::StateBytes;
use crate::recovery::StepId;
use crate::retry::RetryStrategy;
use crate::timers::TimerQueue;
use crate::timers::TimerTarget;

/// Longest the driver parks on the mailbox before re-checking timers.
const MAX_PARK: Duration = Duration::from_millis(50);

/// Result of non-blocking admission.
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission<I> {
    Accepted,
    /// The queue is at capacity. Here's your record back; try again
    /// after the stage has made progress.
    Full(StreamRecord<I>),
}

/// A failed entry that was replaced by fallback output.
#[derive(Debug)]
pub struct FallbackEvent<'a, I> {
    pub step_id: &'a StepId,
    pub input: &'a I,
    pub error: &'a EntryError,
    pub attempts: u32,
}

type Fallback<I, O> = Box<dyn Fn(&I, &EntryError) -> Vec<O>>;
type FallbackListener<I> = Box<dyn FnMut(&FallbackEvent<'_, I>)>;

/// Assembles an [`AsyncWaitOperator`].
///
/// ```no_run
/// use std::time::Duration;
///
/// use async_wait::*;
///
/// let rt = tokio::runtime::Runtime::new().unwrap();
/// let lookup = FutureFunction::new(rt.handle().clone(), |key: String| async move {
///     Ok::<_, InvocationError>(vec![key.len()])
/// });
///
/// let config = AsyncWaitConfig::new("lookup", OutputMode::Unordered)
///     .with_capacity(10)
///     .with_timeout(Duration::from_secs(5));
/// let mut op = AsyncWaitBuilder::new(config)
///     .with_fallback(|_key: &String, _err| vec![0])
///     .build(lookup, CollectingOutput::new())
///     .unwrap();
///
/// op.process_element(StreamRecord::new("hello".to_owned())).unwrap();
/// op.finish().unwrap();
/// assert_eq!(op.output().values(), vec![&5]);
/// ```
pub struct AsyncWaitBuilder<I, O> {
    config: AsyncWaitConfig,
    retry: Option<Box<dyn RetryStrategy<O>>>,
    fallback: Option<Fallback<I, O>>,
    fallback_listener: Option<FallbackListener<I>>,
    clock: Box<dyn Clock>,
}

impl<I, O> AsyncWaitBuilder<I, O>
where
    I: 'static,
    O: 'static,
{
    pub fn new(config: AsyncWaitConfig) -> Self {
        Self {
            config,
            retry: None,
            fallback: None,
            fallback_listener: None,
            clock: Box::new(SystemClock::new()),
        }
    }

    /// Use this strategy instead of the one described in the config.
    pub fn with_retry_strategy(mut self, strategy: impl RetryStrategy<O> + 'static) -> Self {
        self.retry = Some(Box::new(strategy));
        self
    }

    /// Emit this instead of failing the stage when an entry fails
    /// terminally.
    pub fn with_fallback(mut self, fallback: impl Fn(&I, &EntryError) -> Vec<O> + 'static) -> Self {
        self.fallback = Some(Box::new(fallback));
        self
    }

    /// Be told about every fallback substitution.
    pub fn with_fallback_listener(
        mut self,
        listener: impl FnMut(&FallbackEvent<'_, I>) + 'static,
    ) -> Self {
        self.fallback_listener = Some(Box::new(listener));
        self
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Validate the configuration and start an empty stage.
    pub fn build<F, Out>(
        self,
        function: F,
        output: Out,
    ) -> Result<AsyncWaitOperator<I, O, F, Out>, AsyncWaitError>
    where
        F: AsyncFunction<I, O>,
        Out: Output<O>,
    {
        let Self {
            config,
            retry,
            fallback,
            fallback_listener,
            clock,
        } = self;
        config.check_capacity()?;
        let retry = match retry {
            Some(retry) => retry,
            None => config.retry.build()?,
        };
        let timeout = config.effective_timeout();
        check_retry_timeout(&config.step_id, retry.is_enabled(), timeout)?;

        let queue: Box<dyn StreamElementQueue<I, O>> = match config.mode {
            OutputMode::Ordered => Box::new(OrderedQueue::new(config.capacity)),
            OutputMode::Unordered => Box::new(UnorderedQueue::new(config.capacity)),
        };
        let mailbox = Mailbox::new();
        let metrics = AsyncWaitMetrics::new(&config.step_id);

        tracing::info!(
            "Starting step {} in {:?} mode with capacity {} and timeout {timeout:?}",
            config.step_id,
            config.mode,
            config.capacity
        );
        Ok(AsyncWaitOperator {
            step_id: config.step_id,
            function,
            output,
            in_flight: InFlight {
                queue,
                timers: TimerQueue::new(),
            },
            retry,
            retry_enabled: true,
            timeout,
            mailbox,
            clock,
            fallback,
            fallback_listener,
            next_entry_id: 0,
            running: true,
            metrics,
        })
    }
}

impl<I, O> AsyncWaitBuilder<I, O>
where
    I: Debug + DeserializeOwned + 'static,
    O: 'static,
{
    /// Start a stage from a snapshot taken with
    /// [`AsyncWaitOperator::snapshot`].
    ///
    /// Every captured record is invoked again from scratch.
    pub fn restore<F, Out>(
        self,
        function: F,
        output: Out,
        state: &StateBytes,
    ) -> Result<AsyncWaitOperator<I, O, F, Out>, AsyncWaitError>
    where
        F: AsyncFunction<I, O>,
        Out: Output<O>,
    {
        let pending = PendingElements::<I>::from_state_bytes(state)?;
        let mut op = self.build(function, output)?;
        op.resubmit(pending)?;
        Ok(op)
    }

    /// Start a stage from the newest checkpoint of this step in a
    /// store, or empty if there is none.
    pub fn restore_from<F, Out>(
        self,
        store: &mut impl CheckpointStore,
        function: F,
        output: Out,
    ) -> Result<AsyncWaitOperator<I, O, F, Out>, AsyncWaitError>
    where
        F: AsyncFunction<I, O>,
        Out: Output<O>,
    {
        match store.read_latest(&self.config.step_id)? {
            Some((checkpoint, state)) => {
                tracing::info!(
                    "Restoring step {} from checkpoint {checkpoint}",
                    self.config.step_id
                );
                self.restore(function, output, &state)
            }
            None => {
                tracing::info!(
                    "No checkpoint for step {}; starting empty",
                    self.config.step_id
                );
                self.build(function, output)
            }
        }
    }
}

/// The queue and the timers pointing into it.
///
/// Dropping this cancels every outstanding attempt.
struct InFlight<I, O> {
    queue: Box<dyn StreamElementQueue<I, O>>,
    timers: TimerQueue,
}

impl<I, O> InFlight<I, O> {
    /// Discard everything without emitting. Returns how many entries
    /// were discarded.
    fn cancel_all(&mut self) -> usize {
        self.timers.clear();
        let mut discarded = 0;
        for entry in self.queue.clear() {
            if let QueueEntry::Record(mut entry) = entry {
                entry.cancel_attempt();
            }
            discarded += 1;
        }
        discarded
    }
}

impl<I, O> Drop for InFlight<I, O> {
    fn drop(&mut self) {
        let discarded = self.cancel_all();
        if discarded > 0 {
            tracing::debug!("Dropped stage with {discarded} entries in flight");
        }
    }
}

/// Applies an async function to every record, with bounded
/// concurrency, retries, timeouts and checkpointing.
///
/// Build one with [`AsyncWaitBuilder`].
pub struct AsyncWaitOperator<I, O, F, Out> {
    step_id: StepId,
    function: F,
    output: Out,
    in_flight: InFlight<I, O>,
    retry: Box<dyn RetryStrategy<O>>,
    /// Turned off by [`Self::finish`].
    retry_enabled: bool,
    timeout: Option<Duration>,
    mailbox: Mailbox<O>,
    clock: Box<dyn Clock>,
    fallback: Option<Fallback<I, O>>,
    fallback_listener: Option<FallbackListener<I>>,
    next_entry_id: EntryId,
    /// `false` once closed or failed.
    running: bool,
    metrics: AsyncWaitMetrics,
}

impl<I, O, F, Out> AsyncWaitOperator<I, O, F, Out> {
    pub fn step_id(&self) -> &StepId {
        &self.step_id
    }

    /// Entries in flight, watermarks included.
    pub fn len(&self) -> usize {
        self.in_flight.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.in_flight.queue.capacity()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Current entries in insertion order.
    pub fn entries(&self) -> impl Iterator<Item = &QueueEntry<I, O>> {
        self.in_flight.queue.entries()
    }

    pub fn output(&self) -> &Out {
        &self.output
    }

    pub fn output_mut(&mut self) -> &mut Out {
        &mut self.output
    }

    /// Tear the stage down and take what was emitted.
    pub fn into_output(mut self) -> Out {
        self.close();
        self.output
    }

    /// Tear the stage down: cancel every outstanding attempt and
    /// timer and discard every entry without emitting it.
    ///
    /// Calling this again does nothing. Dropping the stage does the
    /// same.
    pub fn close(&mut self) {
        if self.running {
            tracing::info!(
                "Closing step {} with {} entries and {} timers in flight",
                self.step_id,
                self.len(),
                self.in_flight.timers.len()
            );
            self.teardown();
        }
    }

    fn teardown(&mut self) {
        self.running = false;
        let discarded = self.in_flight.cancel_all();
        self.metrics
            .in_flight
            .add(-(discarded as i64), &self.metrics.labels);
    }

    fn ensure_running(&self) -> Result<(), AsyncWaitError> {
        if self.running {
            Ok(())
        } else {
            Err(AsyncWaitError::Closed {
                step_id: self.step_id.clone(),
            })
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

impl<I, O, F, Out> AsyncWaitOperator<I, O, F, Out>
where
    I: Debug,
    F: AsyncFunction<I, O>,
    Out: Output<O>,
{
    /// Admit a record, blocking while the queue is full.
    ///
    /// While blocked the stage keeps applying completions, firing
    /// timers and emitting, so this returns as soon as space frees up.
    pub fn process_element(&mut self, record: StreamRecord<I>) -> Result<(), AsyncWaitError> {
        let mut record = record;
        loop {
            match self.try_process_element(record)? {
                Admission::Accepted => return Ok(()),
                Admission::Full(rejected) => {
                    record = rejected;
                    self.park()?;
                }
            }
        }
    }

    /// Admit a record if there is room, without blocking.
    pub fn try_process_element(
        &mut self,
        record: StreamRecord<I>,
    ) -> Result<Admission<I>, AsyncWaitError> {
        self.ensure_running()?;
        self.turn()?;

        let id = self.next_entry_id;
        let entry = RecordEntry::new(id, record, self.now());
        match self.in_flight.queue.try_put_record(entry) {
            Ok(()) => {
                self.next_entry_id += 1;
                self.metrics.in_flight.add(1, &self.metrics.labels);
                self.start_attempt(id);
                self.turn()?;
                Ok(Admission::Accepted)
            }
            Err(entry) => {
                tracing::trace!("Step {} is full; backpressuring", self.step_id);
                Ok(Admission::Full(entry.record))
            }
        }
    }

    /// Admit a watermark, blocking while the queue is full.
    ///
    /// It is emitted once the ordering discipline allows.
    pub fn process_watermark(&mut self, watermark: Watermark) -> Result<(), AsyncWaitError> {
        loop {
            self.ensure_running()?;
            self.turn()?;

            let id = self.next_entry_id;
            match self
                .in_flight
                .queue
                .try_put(QueueEntry::Watermark { id, watermark })
            {
                Ok(()) => {
                    self.next_entry_id += 1;
                    self.metrics.in_flight.add(1, &self.metrics.labels);
                    self.turn()?;
                    return Ok(());
                }
                Err(_) => self.park()?,
            }
        }
    }

    /// Status markers skip the queue and are forwarded right away.
    pub fn process_status(&mut self, status: StreamStatus) -> Result<(), AsyncWaitError> {
        self.ensure_running()?;
        self.output.emit_status(status);
        Ok(())
    }

    /// Run one turn without blocking: apply completions, fire due
    /// timers and emit what is ready.
    pub fn poll(&mut self) -> Result<(), AsyncWaitError> {
        self.ensure_running()?;
        self.turn()
    }

    /// End of input. Stop retrying and wait until every entry has been
    /// emitted.
    ///
    /// Entries waiting out a retry backoff resolve right away with the
    /// outcome of their last attempt. Entries with an attempt still
    /// outstanding are waited on, bounded by the overall timeout if
    /// there is one.
    pub fn finish(&mut self) -> Result<(), AsyncWaitError> {
        self.ensure_running()?;
        if self.retry_enabled {
            tracing::debug!("Step {} finishing; no further retries", self.step_id);
            self.retry_enabled = false;
        }

        let waiting: Vec<EntryId> = self
            .in_flight
            .queue
            .entries()
            .filter_map(|entry| match entry {
                QueueEntry::Record(entry) if entry.retry.is_waiting() => Some(entry.id),
                _ => None,
            })
            .collect();
        for id in waiting {
            let outcome = match self.in_flight.queue.get_mut(id) {
                Some(entry) => {
                    let (timer, outcome) = entry.retry.take_waiting();
                    if let Some(timer) = timer {
                        self.in_flight.timers.cancel(timer);
                    }
                    outcome.unwrap_or_else(|| Ok(Vec::new()))
                }
                None => continue,
            };
            self.resolve(id, outcome.map_err(EntryError::from))?;
        }

        loop {
            self.turn()?;
            if self.in_flight.queue.is_empty() {
                break;
            }
            self.park()?;
        }
        tracing::info!("Step {} finished", self.step_id);
        Ok(())
    }

    /// Capture the inputs still in flight, flush what can be emitted
    /// first, write them to the store and drop older checkpoints.
    pub fn checkpoint(
        &mut self,
        checkpoint: CheckpointId,
        store: &mut impl CheckpointStore,
    ) -> Result<(), AsyncWaitError>
    where
        I: Clone + Serialize,
    {
        self.poll()?;
        let state = self.snapshot()?;
        tracing::debug!(
            "Step {} checkpoint {checkpoint}: {} entries in {} bytes",
            self.step_id,
            self.len(),
            state.len()
        );
        store.write(&self.step_id, checkpoint, state)?;
        let discarded = store.discard_before(&self.step_id, checkpoint)?;
        tracing::trace!("Discarded {discarded} old snapshots of {}", self.step_id);
        Ok(())
    }

    fn resubmit(&mut self, pending: PendingElements<I>) -> Result<(), AsyncWaitError> {
        tracing::info!(
            "Step {} resubmitting {} records from snapshot",
            self.step_id,
            pending.record_count()
        );
        for element in pending {
            match element {
                StreamElement::Record(record) => self.process_element(record)?,
                StreamElement::Watermark(watermark) => self.process_watermark(watermark)?,
            }
        }
        Ok(())
    }

    fn turn(&mut self) -> Result<(), AsyncWaitError> {
        while let Some(mail) = self.mailbox.try_recv() {
            self.apply(mail)?;
        }
        let now = self.now();
        while let Some(target) = self.in_flight.timers.pop_due(now) {
            match target {
                TimerTarget::Retry(id) => self.start_retry(id),
                TimerTarget::Deadline(id) => self.expire(id, now)?,
            }
        }
        self.emit_ready();
        Ok(())
    }

    /// Wait for a completion, or until the next timer is due.
    fn park(&mut self) -> Result<(), AsyncWaitError> {
        let wait = match self.in_flight.timers.next_fire() {
            Some(fire_at) => (fire_at - self.now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(MAX_PARK),
            None => MAX_PARK,
        };
        if let Some(mail) = self.mailbox.recv_timeout(wait)? {
            self.apply(mail)?;
        }
        Ok(())
    }

    fn start_attempt(&mut self, id: EntryId) {
        let now = self.now();
        let Some(entry) = self.in_flight.queue.get_mut(id) else {
            return;
        };
        entry.retry.attempts += 1;
        entry.retry.attempt_started = Some(now);
        if entry.retry.first_attempt.is_none() {
            entry.retry.first_attempt = Some(now);
            if let Some(timeout) = self.timeout {
                let deadline = saturating_add(now, to_chrono(timeout));
                let timer = self
                    .in_flight
                    .timers
                    .schedule(deadline, TimerTarget::Deadline(id));
                entry.deadline_timer = Some(timer);
            }
        }

        let cancel = Arc::new(CancelSignal::new());
        entry.cancel = Some(cancel.clone());
        let attempt = entry.retry.attempts;
        tracing::trace!("Step {} invoking entry {id} attempt {attempt}", self.step_id);
        self.metrics.invocations.add(1, &self.metrics.labels);
        let result = ResultFuture::new(id, attempt, self.mailbox.sender(), cancel);
        self.function.async_invoke(&entry.record.value, result);
    }

    fn start_retry(&mut self, id: EntryId) {
        if let Some(entry) = self.in_flight.queue.get_mut(id) {
            // The timer already fired, so there's nothing to cancel.
            entry.retry.take_waiting();
            self.start_attempt(id);
        }
    }

    fn expire(&mut self, id: EntryId, now: DateTime<Utc>) -> Result<(), AsyncWaitError> {
        let Some(entry) = self.in_flight.queue.get_mut(id) else {
            return Ok(());
        };
        entry.deadline_timer = None;
        if entry.is_done() {
            return Ok(());
        }
        entry.cancel_attempt();
        let elapsed = entry
            .retry
            .first_attempt
            .and_then(|first| (now - first).to_std().ok())
            .unwrap_or(Duration::ZERO);
        let attempts = entry.retry.attempts;
        self.metrics.timeouts.add(1, &self.metrics.labels);
        tracing::debug!(
            "Step {} entry {id} timed out after {elapsed:?} and {attempts} attempt(s)",
            self.step_id
        );
        self.resolve(id, Err(EntryError::Timeout { elapsed, attempts }))
    }

    fn apply(&mut self, mail: Mail<O>) -> Result<(), AsyncWaitError> {
        let Mail::Completed {
            entry: id,
            attempt,
            outcome,
        } = mail;
        let now = self.now();
        let Some(entry) = self.in_flight.queue.get_mut(id) else {
            tracing::trace!("Ignoring completion of removed entry {id}");
            return Ok(());
        };
        if !entry.accepts(attempt) {
            tracing::trace!("Ignoring stale completion of entry {id} attempt {attempt}");
            return Ok(());
        }
        entry.cancel = None;
        if let Some(started) = entry.retry.attempt_started {
            let secs = (now - started)
                .to_std()
                .map(|took| took.as_secs_f64())
                .unwrap_or(0.0);
            self.metrics
                .invocation_histogram
                .record(secs, &self.metrics.labels);
        }

        if self.retry_enabled && self.retry.should_retry(attempt, &outcome) {
            let backoff = self.retry.backoff_before(attempt);
            let elapsed = now - entry.retry.first_attempt.unwrap_or(now);
            let in_time = self.timeout.map_or(false, |timeout| {
                elapsed
                    .checked_add(&to_chrono(backoff))
                    .map_or(false, |total| total < to_chrono(timeout))
            });
            if in_time {
                let fire_at = saturating_add(now, to_chrono(backoff));
                let timer = self
                    .in_flight
                    .timers
                    .schedule(fire_at, TimerTarget::Retry(id));
                entry.retry.next_retry_at = Some(fire_at);
                entry.retry.retry_timer = Some(timer);
                entry.retry.last_outcome = Some(outcome);
                self.metrics.retries.add(1, &self.metrics.labels);
                tracing::debug!(
                    "Step {} retrying entry {id} after attempt {attempt} in {backoff:?}",
                    self.step_id
                );
                return Ok(());
            }
            tracing::debug!(
                "Step {} has no time left to retry entry {id}; keeping attempt {attempt}",
                self.step_id
            );
        }

        self.resolve(id, outcome.map_err(EntryError::from))
    }

    /// Give an entry its final result.
    ///
    /// A failure without a fallback tears the stage down.
    fn resolve(&mut self, id: EntryId, result: Result<Vec<O>, EntryError>) -> Result<(), AsyncWaitError> {
        let Some(entry) = self.in_flight.queue.get_mut(id) else {
            return Ok(());
        };
        if let Some(timer) = entry.deadline_timer.take() {
            self.in_flight.timers.cancel(timer);
        }
        if let Some(timer) = entry.retry.take_waiting().0 {
            self.in_flight.timers.cancel(timer);
        }
        let attempts = entry.retry.attempts;

        match result {
            Ok(values) => {
                tracing::trace!(
                    "Step {} entry {id} completed after {attempts} attempt(s) with {} values",
                    self.step_id,
                    values.len()
                );
                entry.slot = ResultSlot::Completed(values);
            }
            Err(error) => {
                let substitute = self
                    .fallback
                    .as_ref()
                    .map(|fallback| fallback(&entry.record.value, &error));
                match substitute {
                    Some(values) => {
                        tracing::warn!(
                            "Step {} substituted fallback output for entry {id} after {attempts} attempt(s): {error}",
                            self.step_id
                        );
                        if let Some(listener) = self.fallback_listener.as_mut() {
                            listener(&FallbackEvent {
                                step_id: &self.step_id,
                                input: &entry.record.value,
                                error: &error,
                                attempts,
                            });
                        }
                        self.metrics.fallbacks.add(1, &self.metrics.labels);
                        entry.slot = ResultSlot::Completed(values);
                    }
                    None => {
                        let input = format!("{:?}", entry.record.value);
                        entry.slot = ResultSlot::Failed(error.clone());
                        tracing::error!(
                            "Step {} failed processing input {input} after {attempts} attempt(s): {error}",
                            self.step_id
                        );
                        let err = AsyncWaitError::EntryFailed {
                            step_id: self.step_id.clone(),
                            input,
                            source: error,
                        };
                        self.teardown();
                        return Err(err);
                    }
                }
            }
        }
        self.in_flight.queue.mark_completed(id);
        Ok(())
    }

    fn emit_ready(&mut self) {
        if !self.in_flight.queue.has_completed_head() {
            return;
        }
        for entry in self.in_flight.queue.drain_ready() {
            self.metrics.in_flight.add(-1, &self.metrics.labels);
            match entry {
                QueueEntry::Watermark { watermark, .. } => {
                    tracing::trace!("Step {} emitting {watermark:?}", self.step_id);
                    self.output.emit_watermark(watermark);
                }
                QueueEntry::Record(entry) => match entry.slot {
                    ResultSlot::Completed(values) => {
                        self.metrics
                            .item_out_count
                            .add(values.len() as u64, &self.metrics.labels);
                        for value in values {
                            self.output.collect(entry.record.replace(value));
                        }
                    }
                    ResultSlot::Pending | ResultSlot::Failed(_) => {
                        tracing::warn!(
                            "Step {} dropping unresolved entry {}",
                            self.step_id,
                            entry.id
                        );
                    }
                },
            }
        }
    }
}

impl<I, O, F, Out> AsyncWaitOperator<I, O, F, Out>
where
    I: Clone,
{
    /// The inputs still in flight, in queue order.
    pub fn snapshot_state(&self) -> PendingElements<I> {
        PendingElements::capture(self.in_flight.queue.entries())
    }

    /// [`Self::snapshot_state`] as bytes for a checkpoint store.
    pub fn snapshot(&self) -> Result<StateBytes, AsyncWaitError>
    where
        I: Serialize,
    {
        let state = with_timer!(
            self.metrics.snapshot_histogram,
            self.metrics.labels,
            self.snapshot_state().to_state_bytes()
        )?;
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use chrono::TimeZone;

    use super::*;
    use crate::clock::TestingClock;
    use crate::errors::InvocationError;
    use crate::handle::EntryState;
    use crate::output::CollectingOutput;
    use crate::recovery::InMemStore;
    use crate::retry::FixedDelay;
    use crate::retry::RetryPredicate;

    /// Holds on to every attempt so the test decides when and how it
    /// completes.
    #[derive(Clone, Default)]
    struct Manual {
        calls: Rc<RefCell<Vec<(String, ResultFuture<String>)>>>,
        history: Rc<RefCell<Vec<String>>>,
    }

    impl AsyncFunction<String, String> for Manual {
        fn async_invoke(&self, input: &String, result: ResultFuture<String>) {
            self.history
                .borrow_mut()
                .push(format!("{input}#{}", result.attempt()));
            self.calls.borrow_mut().push((input.clone(), result));
        }
    }

    impl Manual {
        fn take(&self, input: &str) -> ResultFuture<String> {
            let mut calls = self.calls.borrow_mut();
            let idx = calls
                .iter()
                .position(|(x, _)| x == input)
                .unwrap_or_else(|| panic!("no outstanding call for {input}"));
            calls.remove(idx).1
        }

        fn cancel_signal_of(&self, input: &str) -> Arc<CancelSignal> {
            let calls = self.calls.borrow();
            let (_, result) = calls.iter().find(|(x, _)| x == input).unwrap();
            result.cancel_signal()
        }

        fn complete(&self, input: &str) {
            self.take(input).complete(vec![input.to_uppercase()]);
        }

        fn outstanding(&self) -> usize {
            self.calls.borrow().len()
        }

        /// Every attempt started, as `input#attempt`.
        fn history(&self) -> Vec<String> {
            self.history.borrow().clone()
        }
    }

    type TestOp = AsyncWaitOperator<String, String, Manual, CollectingOutput<String>>;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap()
    }

    fn rec(value: &str) -> StreamRecord<String> {
        StreamRecord::new(value.to_owned())
    }

    fn build(config: AsyncWaitConfig) -> (TestOp, Manual) {
        let function = Manual::default();
        let op = AsyncWaitBuilder::new(config)
            .with_clock(TestingClock::new(start()))
            .build(function.clone(), CollectingOutput::new())
            .unwrap();
        (op, function)
    }

    fn retrying(max_attempts: u32, backoff_ms: u64, timeout_ms: u64) -> (TestOp, Manual, TestingClock) {
        let clock = TestingClock::new(start());
        let function = Manual::default();
        let config = AsyncWaitConfig::new("test", OutputMode::Ordered)
            .with_timeout(Duration::from_millis(timeout_ms));
        let op = AsyncWaitBuilder::new(config)
            .with_retry_strategy(FixedDelay::new(
                Some(max_attempts),
                Duration::from_millis(backoff_ms),
                RetryPredicate::EmptyResult,
            ))
            .with_clock(clock.clone())
            .build(function.clone(), CollectingOutput::new())
            .unwrap();
        (op, function, clock)
    }

    fn values(op: &TestOp) -> Vec<&str> {
        op.output()
            .values()
            .into_iter()
            .map(String::as_str)
            .collect()
    }

    fn admit(op: &mut TestOp, input: &str) {
        assert_eq!(
            op.try_process_element(rec(input)).unwrap(),
            Admission::Accepted
        );
    }

    #[test]
    fn ordered_emits_in_input_order() {
        let (mut op, function) = build(AsyncWaitConfig::new("test", OutputMode::Ordered));
        admit(&mut op, "a");
        admit(&mut op, "b");
        admit(&mut op, "c");

        function.complete("c");
        function.complete("b");
        op.poll().unwrap();
        assert!(values(&op).is_empty());

        function.complete("a");
        op.poll().unwrap();
        assert_eq!(values(&op), vec!["A", "B", "C"]);
        assert!(op.is_empty());
    }

    #[test]
    fn ordered_random_completion_order() {
        let mut rng = fastrand::Rng::with_seed(7);
        let inputs = ["a", "b", "c", "d", "e", "f", "g", "h"];
        for _ in 0..20 {
            let (mut op, function) = build(AsyncWaitConfig::new("test", OutputMode::Ordered));
            for input in inputs {
                admit(&mut op, input);
            }
            let mut order = inputs.to_vec();
            rng.shuffle(&mut order);
            for input in order {
                function.complete(input);
                op.poll().unwrap();
            }
            assert_eq!(values(&op), vec!["A", "B", "C", "D", "E", "F", "G", "H"]);
        }
    }

    #[test]
    fn ordered_backpressure_scenario() {
        let config = AsyncWaitConfig::new("test", OutputMode::Ordered).with_capacity(2);
        let (mut op, function) = build(config);
        admit(&mut op, "a");
        admit(&mut op, "b");
        let found = op.try_process_element(rec("c")).unwrap();
        assert_eq!(found, Admission::Full(rec("c")));

        // Finishing an entry behind the head frees nothing.
        function.complete("b");
        let found = op.try_process_element(rec("c")).unwrap();
        assert_eq!(found, Admission::Full(rec("c")));

        function.complete("a");
        admit(&mut op, "c");
        function.complete("c");
        op.poll().unwrap();
        assert_eq!(values(&op), vec!["A", "B", "C"]);
    }

    #[test]
    fn unordered_backpressure_scenario() {
        let config = AsyncWaitConfig::new("test", OutputMode::Unordered).with_capacity(2);
        let (mut op, function) = build(config);
        admit(&mut op, "a");
        admit(&mut op, "b");
        assert!(matches!(
            op.try_process_element(rec("c")).unwrap(),
            Admission::Full(_)
        ));

        function.complete("b");
        admit(&mut op, "c");
        assert_eq!(values(&op), vec!["B"]);

        function.complete("c");
        function.complete("a");
        op.poll().unwrap();
        assert_eq!(values(&op), vec!["B", "C", "A"]);
    }

    #[test]
    fn completed_entries_release_their_deadlines() {
        let config = AsyncWaitConfig::new("test", OutputMode::Unordered)
            .with_capacity(2)
            .with_timeout(Duration::from_secs(3600));
        let (mut op, function) = build(config);
        admit(&mut op, "stuck");

        for n in 0..1000 {
            let input = n.to_string();
            admit(&mut op, &input);
            function.complete(&input);
            op.poll().unwrap();
            assert!(op.in_flight.timers.len() <= op.len());
        }
        assert_eq!(op.len(), 1);
        assert_eq!(op.in_flight.timers.len(), 1);
        assert_eq!(op.output().len(), 1000);
    }

    #[test]
    fn unordered_watermark_is_a_barrier() {
        let (mut op, function) = build(AsyncWaitConfig::new("test", OutputMode::Unordered));
        let wm = Watermark(start());
        admit(&mut op, "a");
        op.process_watermark(wm).unwrap();
        admit(&mut op, "b");

        function.complete("b");
        op.poll().unwrap();
        assert!(op.output().is_empty());

        function.complete("a");
        op.poll().unwrap();
        assert_eq!(
            op.output().elements,
            vec![
                StreamElement::Record(rec("A")),
                StreamElement::Watermark(wm),
                StreamElement::Record(rec("B")),
            ]
        );
    }

    #[test]
    fn outputs_keep_input_timestamp() {
        let (mut op, function) = build(AsyncWaitConfig::new("test", OutputMode::Ordered));
        let at = start() + chrono::Duration::minutes(3);
        op.process_element(StreamRecord::with_timestamp("a".to_owned(), at))
            .unwrap();
        function
            .take("a")
            .complete(vec!["x".to_owned(), "y".to_owned()]);
        op.poll().unwrap();

        let found: Vec<_> = op.output().records().cloned().collect();
        assert_eq!(
            found,
            vec![
                StreamRecord::with_timestamp("x".to_owned(), at),
                StreamRecord::with_timestamp("y".to_owned(), at),
            ]
        );
    }

    #[test]
    fn empty_result_emits_nothing() {
        let (mut op, function) = build(AsyncWaitConfig::new("test", OutputMode::Ordered));
        admit(&mut op, "a");
        function.take("a").complete(vec![]);
        op.poll().unwrap();
        assert!(op.output().is_empty());
        assert!(op.is_empty());
    }

    #[test]
    fn status_is_forwarded_immediately() {
        let (mut op, _function) = build(AsyncWaitConfig::new("test", OutputMode::Ordered));
        admit(&mut op, "a");
        op.process_status(StreamStatus::Idle).unwrap();
        assert_eq!(op.output().statuses, vec![StreamStatus::Idle]);
        assert_eq!(op.len(), 1);
    }

    #[test]
    fn retries_on_empty_with_backoff() {
        let (mut op, function, clock) = retrying(2, 100, 10_000);
        admit(&mut op, "a");

        function.take("a").complete(vec![]);
        op.poll().unwrap();
        assert_eq!(function.outstanding(), 0);
        assert!(matches!(
            op.entries().next(),
            Some(QueueEntry::Record(entry)) if entry.state() == EntryState::Retrying
        ));

        clock.advance(chrono::Duration::milliseconds(99));
        op.poll().unwrap();
        assert_eq!(function.outstanding(), 0);

        clock.advance(chrono::Duration::milliseconds(1));
        op.poll().unwrap();
        assert_eq!(function.outstanding(), 1);
        function.take("a").complete(vec![]);
        op.poll().unwrap();

        clock.advance(chrono::Duration::milliseconds(99));
        op.poll().unwrap();
        assert_eq!(function.outstanding(), 0);

        clock.advance(chrono::Duration::milliseconds(1));
        op.poll().unwrap();
        function.complete("a");
        op.poll().unwrap();

        assert_eq!(function.history(), vec!["a#1", "a#2", "a#3"]);
        assert_eq!(values(&op), vec!["A"]);
    }

    #[test]
    fn retries_exhausted_keeps_last_outcome() {
        let (mut op, function, clock) = retrying(1, 10, 10_000);
        admit(&mut op, "a");
        function.take("a").complete(vec![]);
        op.poll().unwrap();

        clock.advance(chrono::Duration::milliseconds(10));
        op.poll().unwrap();
        function.take("a").complete(vec![]);
        op.poll().unwrap();

        assert_eq!(function.history(), vec!["a#1", "a#2"]);
        assert!(op.output().is_empty());
        assert!(op.is_empty());
    }

    #[test]
    fn no_retry_past_timeout() {
        let (mut op, function, clock) = retrying(5, 100, 150);
        admit(&mut op, "a");
        clock.advance(chrono::Duration::milliseconds(60));
        function.take("a").complete(vec![]);
        op.poll().unwrap();

        // 60ms elapsed plus 100ms of backoff would start past the
        // timeout.
        assert_eq!(function.history(), vec!["a#1"]);
        assert!(op.is_empty());
    }

    #[test]
    fn timeout_fails_stage_no_earlier_than_deadline() {
        let clock = TestingClock::new(start());
        let function = Manual::default();
        let config = AsyncWaitConfig::new("lookup", OutputMode::Ordered)
            .with_timeout(Duration::from_secs(1));
        let mut op: TestOp = AsyncWaitBuilder::new(config)
            .with_clock(clock.clone())
            .build(function.clone(), CollectingOutput::new())
            .unwrap();
        admit(&mut op, "a");
        let cancel = function.cancel_signal_of("a");

        clock.advance(chrono::Duration::milliseconds(999));
        op.poll().unwrap();
        assert!(!cancel.is_cancelled());

        clock.advance(chrono::Duration::milliseconds(1));
        let err = op.poll().unwrap_err();
        assert!(err.entry_error().map_or(false, EntryError::is_timeout));
        assert!(err.to_string().contains("\"a\""));
        assert!(cancel.is_cancelled());

        assert!(matches!(op.poll(), Err(AsyncWaitError::Closed { .. })));
        assert!(!op.is_running());
        assert!(op.is_empty());
    }

    #[test]
    fn error_without_fallback_is_fatal() {
        let (mut op, function) = build(AsyncWaitConfig::new("lookup", OutputMode::Ordered));
        admit(&mut op, "a");
        admit(&mut op, "b");
        let b_cancel = function.cancel_signal_of("b");
        function
            .take("a")
            .complete_exceptionally(InvocationError::new("connection refused"));

        let err = op.poll().unwrap_err();
        assert_eq!(
            err.to_string(),
            "step lookup failed processing input \"a\": async invocation failed: connection refused"
        );
        assert!(b_cancel.is_cancelled());
        assert!(matches!(
            op.try_process_element(rec("c")),
            Err(AsyncWaitError::Closed { .. })
        ));
    }

    #[test]
    fn fallback_substitutes_and_notifies() {
        let clock = TestingClock::new(start());
        let function = Manual::default();
        let events = Rc::new(RefCell::new(Vec::new()));
        let listener_events = events.clone();
        let config = AsyncWaitConfig::new("lookup", OutputMode::Ordered)
            .with_timeout(Duration::from_secs(1));
        let mut op: TestOp = AsyncWaitBuilder::new(config)
            .with_clock(clock.clone())
            .with_fallback(|input: &String, _err| vec![format!("fallback-{input}")])
            .with_fallback_listener(move |event: &FallbackEvent<String>| {
                listener_events.borrow_mut().push((
                    event.step_id.clone(),
                    event.input.clone(),
                    event.error.is_timeout(),
                    event.attempts,
                ));
            })
            .build(function.clone(), CollectingOutput::new())
            .unwrap();

        admit(&mut op, "a");
        admit(&mut op, "b");
        function
            .take("b")
            .complete_exceptionally(InvocationError::new("nope"));
        clock.advance(chrono::Duration::seconds(1));
        op.poll().unwrap();

        // A late completion for the timed out attempt is ignored.
        function.complete("a");
        op.poll().unwrap();

        assert_eq!(values(&op), vec!["fallback-a", "fallback-b"]);
        assert_eq!(
            *events.borrow(),
            vec![
                (StepId::new("lookup"), "b".to_owned(), false, 1),
                (StepId::new("lookup"), "a".to_owned(), true, 1),
            ]
        );
        assert!(op.is_running());
    }

    #[test]
    fn finish_resolves_waiting_retries() {
        let (mut op, function, _clock) = retrying(3, 1_000, 60_000);
        admit(&mut op, "a");
        admit(&mut op, "b");
        function.take("a").complete(vec![]);
        function.complete("b");
        op.poll().unwrap();
        assert_eq!(op.len(), 2);

        op.finish().unwrap();
        assert_eq!(values(&op), vec!["B"]);
        assert_eq!(function.history(), vec!["a#1", "b#1"]);
        assert!(op.is_empty());
    }

    #[test]
    fn snapshot_round_trip_reinvokes_in_order() {
        let (mut op, function) = build(AsyncWaitConfig::new("test", OutputMode::Unordered));
        let wm = Watermark(start());
        admit(&mut op, "a");
        admit(&mut op, "b");
        op.process_watermark(wm).unwrap();
        admit(&mut op, "c");
        // Finished, but held back by the watermark.
        function.complete("c");
        op.poll().unwrap();

        let state = op.snapshot().unwrap();
        assert_eq!(
            op.snapshot_state(),
            PendingElements(vec![
                StreamElement::Record(rec("a")),
                StreamElement::Record(rec("b")),
                StreamElement::Watermark(wm),
                StreamElement::Record(rec("c")),
            ])
        );
        drop(op);

        let restored_fn = Manual::default();
        let mut restored: TestOp =
            AsyncWaitBuilder::new(AsyncWaitConfig::new("test", OutputMode::Unordered))
                .with_clock(TestingClock::new(start()))
                .restore(restored_fn.clone(), CollectingOutput::new(), &state)
                .unwrap();
        assert_eq!(restored_fn.history(), vec!["a#1", "b#1", "c#1"]);
        assert_eq!(restored.len(), 4);

        for input in ["c", "b", "a"] {
            restored_fn.complete(input);
        }
        restored.poll().unwrap();
        assert_eq!(values(&restored), vec!["B", "A", "C"]);
    }

    #[test]
    fn checkpoint_and_restore_from_store() {
        let mut store = InMemStore::new();
        let (mut op, function) = build(AsyncWaitConfig::new("lookup", OutputMode::Ordered));
        admit(&mut op, "a");
        admit(&mut op, "b");
        op.checkpoint(CheckpointId(1), &mut store).unwrap();
        function.complete("a");
        op.checkpoint(CheckpointId(2), &mut store).unwrap();
        assert_eq!(values(&op), vec!["A"]);
        assert_eq!(store.snapshot_count(&StepId::new("lookup")), 1);
        drop(op);

        let restored_fn = Manual::default();
        let restored: TestOp =
            AsyncWaitBuilder::new(AsyncWaitConfig::new("lookup", OutputMode::Ordered))
                .with_clock(TestingClock::new(start()))
                .restore_from(&mut store, restored_fn.clone(), CollectingOutput::new())
                .unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored_fn.history(), vec!["b#1"]);

        let fresh: TestOp =
            AsyncWaitBuilder::new(AsyncWaitConfig::new("other", OutputMode::Ordered))
                .restore_from(&mut store, Manual::default(), CollectingOutput::new())
                .unwrap();
        assert!(fresh.is_empty());
    }

    #[test]
    fn close_and_drop_cancel_attempts() {
        let (mut op, function) = build(AsyncWaitConfig::new("test", OutputMode::Ordered));
        admit(&mut op, "a");
        let cancel = function.cancel_signal_of("a");
        op.close();
        assert!(cancel.is_cancelled());
        assert!(op.is_empty());
        assert!(matches!(
            op.process_watermark(Watermark(start())),
            Err(AsyncWaitError::Closed { .. })
        ));

        let (mut op, function) = build(AsyncWaitConfig::new("test", OutputMode::Unordered));
        admit(&mut op, "b");
        let cancel = function.cancel_signal_of("b");
        drop(op);
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn retry_requires_timeout() {
        let found = AsyncWaitBuilder::new(AsyncWaitConfig::default())
            .with_retry_strategy(FixedDelay::new(
                None,
                Duration::from_millis(1),
                RetryPredicate::Error,
            ))
            .build(Manual::default(), CollectingOutput::new());
        assert!(matches!(
            found,
            Err(AsyncWaitError::ConfigurationInvalid(_))
        ));
    }
}
