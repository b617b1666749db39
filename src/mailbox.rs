//! The driver's single-consumer event queue.
//!
//! Completion callbacks run on whatever thread the user's async
//! operation finishes on. They never touch the queue; they post a
//! [`Mail`] here and the driver applies it on its own turn.

use std::time::Duration;

use tokio::runtime::Handle;
use tokio::runtime::Runtime;
use tokio::runtime::RuntimeFlavor;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::unbounded_channel;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::UnboundedSender;

use crate::errors::AsyncWaitError;
use crate::function::Outcome;
use crate::queue::EntryId;

/// A message for the driver.
#[derive(Debug)]
pub(crate) enum Mail<O> {
    /// One attempt of an entry finished.
    Completed {
        entry: EntryId,
        attempt: u32,
        outcome: Outcome<O>,
    },
}

/// Cloneable sending half handed out inside each
/// [`crate::ResultFuture`].
pub(crate) type MailSender<O> = UnboundedSender<Mail<O>>;

pub(crate) struct Mailbox<O> {
    /// Only built when the driver parks outside of any tokio runtime.
    /// Nothing is ever spawned onto it.
    rt: Option<Runtime>,
    tx: MailSender<O>,
    rx: UnboundedReceiver<Mail<O>>,
}

impl<O> Mailbox<O> {
    pub(crate) fn new() -> Self {
        let (tx, rx) = unbounded_channel();
        Self { rt: None, tx, rx }
    }

    pub(crate) fn sender(&self) -> MailSender<O> {
        self.tx.clone()
    }

    /// Next message if one is already waiting.
    pub(crate) fn try_recv(&mut self) -> Option<Mail<O>> {
        match self.rx.try_recv() {
            Ok(mail) => Some(mail),
            // We hold a sender, so this never disconnects.
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Block the driver thread until a message arrives or the timeout
    /// elapses.
    ///
    /// Inside a multi-thread tokio runtime the wait happens in
    /// [`tokio::task::block_in_place`]. A current-thread runtime can't
    /// be blocked without stalling whatever it is driving, so that is
    /// an error.
    pub(crate) fn recv_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<Mail<O>>, AsyncWaitError> {
        let rx = &mut self.rx;
        let wait = async move { tokio::time::timeout(timeout, rx.recv()).await.ok().flatten() };
        match Handle::try_current() {
            Ok(handle) => match handle.runtime_flavor() {
                RuntimeFlavor::MultiThread => {
                    Ok(tokio::task::block_in_place(|| handle.block_on(wait)))
                }
                _ => Err(AsyncWaitError::CurrentThreadRuntime),
            },
            Err(_) => {
                let rt = match self.rt.take() {
                    Some(rt) => rt,
                    None => tokio::runtime::Builder::new_current_thread()
                        .enable_time()
                        .build()?,
                };
                let found = rt.block_on(wait);
                self.rt = Some(rt);
                Ok(found)
            }
        }
    }
}

impl<O> Drop for Mailbox<O> {
    fn drop(&mut self) {
        // The stage may be dropped from inside some other runtime,
        // where a blocking shutdown panics.
        if let Some(rt) = self.rt.take() {
            rt.shutdown_background();
        }
    }
}

#[test]
fn recv_timeout_returns_none_when_idle() {
    let mut mailbox = Mailbox::<u8>::new();
    assert!(mailbox.try_recv().is_none());
    assert!(mailbox.recv_timeout(Duration::from_millis(1)).unwrap().is_none());
}

#[test]
fn recv_from_other_thread() {
    let mut mailbox = Mailbox::<u8>::new();
    let tx = mailbox.sender();
    std::thread::spawn(move || {
        tx.send(Mail::Completed {
            entry: 3,
            attempt: 1,
            outcome: Ok(vec![7]),
        })
        .unwrap();
    });

    match mailbox.recv_timeout(Duration::from_secs(10)).unwrap() {
        Some(Mail::Completed {
            entry,
            attempt,
            outcome,
        }) => {
            assert_eq!(entry, 3);
            assert_eq!(attempt, 1);
            assert_eq!(outcome, Ok(vec![7]));
        }
        None => panic!("no mail arrived"),
    }
}

#[test]
fn parks_inside_multi_thread_runtime() {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .unwrap();
    rt.block_on(async {
        let mut mailbox = Mailbox::<u8>::new();
        let tx = mailbox.sender();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let _ = tx.send(Mail::Completed {
                entry: 0,
                attempt: 1,
                outcome: Ok(vec![1]),
            });
        });
        let found = mailbox.recv_timeout(Duration::from_secs(10)).unwrap();
        assert!(found.is_some());
        drop(mailbox);
    });
}

#[test]
fn owned_runtime_drops_inside_other_runtime() {
    let mut mailbox = Mailbox::<u8>::new();
    assert!(mailbox.recv_timeout(Duration::from_millis(1)).unwrap().is_none());

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    rt.block_on(async move {
        drop(mailbox);
    });
}

#[test]
fn current_thread_runtime_refuses_to_park() {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    rt.block_on(async {
        let mut mailbox = Mailbox::<u8>::new();
        assert!(matches!(
            mailbox.recv_timeout(Duration::from_millis(1)),
            Err(AsyncWaitError::CurrentThreadRuntime)
        ));
    });
}
