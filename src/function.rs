//! The boundary with the user's asynchronous operation.
//!
//! Implement [`AsyncFunction`] to plug an external call into the
//! stage. Each attempt gets its own [`ResultFuture`], which must be
//! completed exactly once from any thread. If your operation is
//! already a Rust [`Future`], wrap it in [`FutureFunction`] instead.

use std::future::Future;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::Notify;

use crate::errors::InvocationError;
use crate::mailbox::Mail;
use crate::mailbox::MailSender;
use crate::queue::EntryId;

/// Result of a single attempt.
///
/// An empty `Vec` is an "empty result"; it is a success, but retry
/// predicates may treat it as worth retrying.
pub type Outcome<O> = Result<Vec<O>, InvocationError>;

/// A user-supplied asynchronous operation.
///
/// Preconditions the stage relies on but does not check:
///
/// - [`ResultFuture`] is completed exactly once per call. Completing
///   twice is impossible since completion consumes it; never
///   completing leaves the entry pending until the overall timeout, or
///   forever if there is none.
///
/// - The operation is safe to run more than once for the same input.
///   Retries and restores from a checkpoint both re-invoke it.
pub trait AsyncFunction<I, O> {
    /// Start one attempt for this input.
    ///
    /// This is called on the driver thread and must not block; hand
    /// the work and the [`ResultFuture`] to another thread or
    /// executor.
    fn async_invoke(&self, input: &I, result: ResultFuture<O>);
}

impl<I, O, F> AsyncFunction<I, O> for Box<F>
where
    F: AsyncFunction<I, O> + ?Sized,
{
    fn async_invoke(&self, input: &I, result: ResultFuture<O>) {
        (**self).async_invoke(input, result)
    }
}

/// Best-effort cancellation for a single attempt.
///
/// Triggered when the attempt times out or the stage is torn down.
#[derive(Debug, Default)]
pub struct CancelSignal {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelSignal {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Resolves once this attempt is cancelled.
    pub async fn cancelled(&self) {
        loop {
            // Register before checking the flag so a cancel between
            // the two isn't missed.
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Completion callback for one attempt of one entry.
///
/// Completing posts the outcome to the stage's mailbox; the stage
/// applies it on its own thread. Outcomes for attempts the stage no
/// longer cares about (timed out, superseded, torn down) are
/// ignored.
pub struct ResultFuture<O> {
    entry: EntryId,
    attempt: u32,
    mailbox: MailSender<O>,
    cancel: Arc<CancelSignal>,
}

impl<O> std::fmt::Debug for ResultFuture<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultFuture")
            .field("entry", &self.entry)
            .field("attempt", &self.attempt)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl<O> ResultFuture<O> {
    pub(crate) fn new(
        entry: EntryId,
        attempt: u32,
        mailbox: MailSender<O>,
        cancel: Arc<CancelSignal>,
    ) -> Self {
        Self {
            entry,
            attempt,
            mailbox,
            cancel,
        }
    }

    /// Which attempt this is, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Has the stage given up on this attempt?
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Shared handle to this attempt's cancel signal, for awaiting it
    /// alongside the work.
    pub fn cancel_signal(&self) -> Arc<CancelSignal> {
        self.cancel.clone()
    }

    /// Complete with zero or more output values.
    pub fn complete(self, results: Vec<O>) {
        self.complete_with(Ok(results))
    }

    /// Complete with a failure.
    pub fn complete_exceptionally(self, error: InvocationError) {
        self.complete_with(Err(error))
    }

    pub fn complete_with(self, outcome: Outcome<O>) {
        let Self {
            entry,
            attempt,
            mailbox,
            ..
        } = self;
        if mailbox
            .send(Mail::Completed {
                entry,
                attempt,
                outcome,
            })
            .is_err()
        {
            tracing::trace!("Stage gone; dropping completion of entry {entry} attempt {attempt}");
        }
    }
}

/// Adapt a function returning a [`Future`] into an [`AsyncFunction`].
///
/// Each attempt is spawned onto the given tokio runtime and raced
/// against the attempt's [`CancelSignal`]; a cancelled attempt is
/// dropped without completing.
pub struct FutureFunction<F> {
    handle: Handle,
    f: F,
}

impl<F> FutureFunction<F> {
    pub fn new(handle: Handle, f: F) -> Self {
        Self { handle, f }
    }
}

impl<I, O, F, Fut> AsyncFunction<I, O> for FutureFunction<F>
where
    I: Clone,
    O: Send + 'static,
    F: Fn(I) -> Fut,
    Fut: Future<Output = Outcome<O>> + Send + 'static,
{
    fn async_invoke(&self, input: &I, result: ResultFuture<O>) {
        let fut = (self.f)(input.clone());
        let cancel = result.cancel_signal();
        self.handle.spawn(async move {
            tokio::select! {
                outcome = fut => result.complete_with(outcome),
                _ = cancel.cancelled() => {
                    tracing::trace!("Attempt cancelled before completing");
                }
            }
        });
    }
}

#[test]
fn complete_posts_to_mailbox() {
    let mut mailbox = crate::mailbox::Mailbox::<u8>::new();
    let result = ResultFuture::new(4, 2, mailbox.sender(), Arc::new(CancelSignal::new()));
    result.complete(vec![1, 2]);

    match mailbox.try_recv() {
        Some(Mail::Completed {
            entry,
            attempt,
            outcome,
        }) => {
            assert_eq!((entry, attempt), (4, 2));
            assert_eq!(outcome, Ok(vec![1, 2]));
        }
        None => panic!("completion not posted"),
    }
}

#[test]
fn cancel_is_visible_to_result_future() {
    let mailbox = crate::mailbox::Mailbox::<u8>::new();
    let cancel = Arc::new(CancelSignal::new());
    let result = ResultFuture::new(0, 1, mailbox.sender(), cancel.clone());
    assert!(!result.is_cancelled());
    cancel.cancel();
    assert!(result.is_cancelled());
}

#[test]
fn future_function_stops_on_cancel() {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .unwrap();
    let mut mailbox = crate::mailbox::Mailbox::<u8>::new();
    let function = FutureFunction::new(rt.handle().clone(), |_x: u8| async {
        tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        Ok(vec![1])
    });

    let cancel = Arc::new(CancelSignal::new());
    function.async_invoke(&0, ResultFuture::new(0, 1, mailbox.sender(), cancel.clone()));
    cancel.cancel();

    assert!(mailbox
        .recv_timeout(std::time::Duration::from_millis(50))
        .unwrap()
        .is_none());
}

#[test]
fn future_function_completes() {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .unwrap();
    let mut mailbox = crate::mailbox::Mailbox::<u8>::new();
    let function = FutureFunction::new(rt.handle().clone(), |x: u8| async move {
        Ok(vec![x + 1])
    });

    function.async_invoke(
        &4,
        ResultFuture::new(9, 1, mailbox.sender(), Arc::new(CancelSignal::new())),
    );

    match mailbox.recv_timeout(std::time::Duration::from_secs(10)).unwrap() {
        Some(Mail::Completed { entry, outcome, .. }) => {
            assert_eq!(entry, 9);
            assert_eq!(outcome, Ok(vec![5]));
        }
        None => panic!("future never completed"),
    }
}
