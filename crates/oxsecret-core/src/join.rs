//! Fan-out/fan-in primitive.
//!
//! A [`JoinGroup`] tracks a number of outstanding sub-operations and fires its
//! completion action exactly once, when the last of them finishes. Each
//! sub-operation is represented by a [`JoinTicket`]; completing a ticket folds
//! its result into a shared accumulator.
//!
//! The group itself holds one implicit ticket while work is being launched, so
//! the completion action can never fire half-way through fan-out. Sealing the
//! group (or dropping it) releases that ticket:
//!
//! - With zero tickets issued, sealing fires the completion action
//!   synchronously, on the sealing thread.
//! - Otherwise the completion action runs on whichever thread completes the
//!   last ticket.
//!
//! A ticket that is dropped without being completed (for example because the
//! task holding it was cancelled) still counts as finished. It is reported in
//! [`JoinOutcome::abandoned`] so the accumulator's owner can treat it as a
//! failure instead of waiting forever.
//!
//! # Example
//!
//! ```
//! use oxsecret_core::join::JoinGroup;
//!
//! let (group, mut done) = JoinGroup::with_channel(Vec::new());
//! let tickets: Vec<_> = (0..3).map(|_| group.add()).collect();
//! group.seal();
//!
//! for (i, ticket) in tickets.into_iter().enumerate().rev() {
//!     ticket.complete(|acc| acc.push(i));
//! }
//!
//! let outcome = done.try_recv().unwrap();
//! assert_eq!(outcome.value, vec![2, 1, 0]);
//! assert_eq!(outcome.abandoned, 0);
//! ```

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::oneshot;

/// Result handed to the completion action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome<T> {
    /// The accumulator after every completed ticket was folded in.
    pub value: T,
    /// Number of tickets dropped without being completed.
    pub abandoned: usize,
}

type CompletionAction<T> = Box<dyn FnOnce(JoinOutcome<T>) + Send>;

struct JoinShared<T> {
    /// Outstanding tickets, including the group's own launch ticket.
    pending: AtomicUsize,
    abandoned: AtomicUsize,
    state: Mutex<JoinState<T>>,
}

struct JoinState<T> {
    value: Option<T>,
    on_complete: Option<CompletionAction<T>>,
}

impl<T> JoinShared<T> {
    fn finish_one(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }

        // Last ticket: take everything out under the lock, run the action outside it.
        let (value, on_complete) = {
            let mut state = self.state.lock();
            (state.value.take(), state.on_complete.take())
        };
        if let (Some(value), Some(on_complete)) = (value, on_complete) {
            on_complete(JoinOutcome {
                value,
                abandoned: self.abandoned.load(Ordering::Acquire),
            });
        }
    }
}

/// Fan-out/fan-in group over an accumulator of type `T`.
pub struct JoinGroup<T> {
    shared: Arc<JoinShared<T>>,
}

impl<T: Send + 'static> JoinGroup<T> {
    /// Create a group that calls `on_complete` once all tickets are finished.
    pub fn new(initial: T, on_complete: impl FnOnce(JoinOutcome<T>) + Send + 'static) -> Self {
        Self {
            shared: Arc::new(JoinShared {
                pending: AtomicUsize::new(1),
                abandoned: AtomicUsize::new(0),
                state: Mutex::new(JoinState {
                    value: Some(initial),
                    on_complete: Some(Box::new(on_complete)),
                }),
            }),
        }
    }

    /// Create a group whose completion is delivered over a oneshot channel.
    pub fn with_channel(initial: T) -> (Self, oneshot::Receiver<JoinOutcome<T>>) {
        let (tx, rx) = oneshot::channel();
        let group = Self::new(initial, move |outcome| {
            // The waiter may have given up; nothing left to notify then.
            let _ = tx.send(outcome);
        });
        (group, rx)
    }
}

impl<T> JoinGroup<T> {
    /// Register one more outstanding sub-operation.
    pub fn add(&self) -> JoinTicket<T> {
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        JoinTicket {
            shared: Some(Arc::clone(&self.shared)),
        }
    }

    /// Number of issued tickets not yet finished.
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire).saturating_sub(1)
    }

    /// Stop issuing tickets. Fires the completion action now if nothing is pending.
    pub fn seal(self) {
        drop(self);
    }
}

impl<T> Drop for JoinGroup<T> {
    fn drop(&mut self) {
        self.shared.finish_one();
    }
}

impl<T> fmt::Debug for JoinGroup<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinGroup")
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

/// One outstanding sub-operation of a [`JoinGroup`].
#[must_use = "dropping a ticket without completing it counts as abandoned"]
pub struct JoinTicket<T> {
    shared: Option<Arc<JoinShared<T>>>,
}

impl<T> JoinTicket<T> {
    /// Fold this sub-operation's result into the accumulator and finish it.
    pub fn complete(mut self, fold: impl FnOnce(&mut T)) {
        if let Some(shared) = self.shared.take() {
            {
                let mut state = shared.state.lock();
                if let Some(value) = state.value.as_mut() {
                    fold(value);
                }
            }
            shared.finish_one();
        }
    }
}

impl<T> Drop for JoinTicket<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.abandoned.fetch_add(1, Ordering::AcqRel);
            shared.finish_one();
        }
    }
}

impl<T> fmt::Debug for JoinTicket<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinTicket")
            .field("finished", &self.shared.is_none())
            .finish()
    }
}
