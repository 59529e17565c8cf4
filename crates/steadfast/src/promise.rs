#![forbid(unsafe_code)]

//! Watchdog-guarded, cancelable wrapper for a single async operation.
//!
//! # Design
//!
//! [`SafePromise<T>`] wraps one user-supplied future with a dead-man's
//! switch: if the operation has not settled within `die_timeout` of
//! accumulated **non-paused** run time, it is force-rejected with a fatal
//! [`PromiseError::Died`]. The watchdog budget is measured against
//! `tokio::time::Instant`, so paused stretches never count toward it.
//!
//! The promise is a cheap `Clone` handle over shared state; observers and
//! other local tasks may call [`pause`](SafePromise::pause),
//! [`resume`](SafePromise::resume), or [`cancel`](SafePromise::cancel)
//! while [`run`](SafePromise::run) is in flight. Control changes reach
//! the drive loop through a permit-storing `Notify`, so a signal raised
//! while the loop is mid-poll is never lost.
//!
//! # Invariants
//!
//! 1. Settle once: exactly one of resolved / rejected / canceled / died
//!    is reached; later settlement attempts are no-ops.
//! 2. Cancellation is a successful outcome ([`Settled::Canceled`]), never
//!    an error.
//! 3. Every exit path drops its pending watchdog timer (timers live only
//!    inside the drive loop's select arms).
//! 4. `finally` fires on every settlement path, after the outcome's own
//!    observables.

use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use futures_util::future::LocalBoxFuture;
use tokio::sync::Notify;
use tokio::time::{Instant, sleep};
use tracing::{debug, error};

use crate::error::{Fault, PromiseError};
use crate::observable::Observable;

type Operation<T> = LocalBoxFuture<'static, Result<T, Fault>>;

/// Successful terminal outcome of [`SafePromise::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settled<T> {
    /// The operation completed with a value.
    Resolved(T),
    /// The promise was canceled before settling; a non-exceptional
    /// outcome carrying no value.
    Canceled,
}

impl<T> Settled<T> {
    /// Whether this outcome is the cancellation sentinel.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    /// The resolved value, if any.
    pub fn into_value(self) -> Option<T> {
        match self {
            Self::Resolved(value) => Some(value),
            Self::Canceled => None,
        }
    }
}

/// Lifecycle observables owned by a [`SafePromise`].
pub struct PromiseObservers<T> {
    /// The watchdog fired; payload is the fatal death error.
    pub died: Observable<PromiseError>,
    /// The promise was canceled.
    pub canceled: Observable<()>,
    /// The operation reported failure.
    pub rejected: Observable<PromiseError>,
    /// The operation completed; payload is the value.
    pub resolved: Observable<T>,
    /// Any settlement path completed.
    pub finally: Observable<()>,
    /// Any failure path (rejection or death).
    pub error: Observable<PromiseError>,
}

impl<T: Clone + 'static> PromiseObservers<T> {
    fn new() -> Self {
        Self {
            died: Observable::new(),
            canceled: Observable::new(),
            rejected: Observable::new(),
            resolved: Observable::new(),
            finally: Observable::new(),
            error: Observable::new(),
        }
    }
}

struct State {
    paused: bool,
    canceled: bool,
    resolved: bool,
    rejected: bool,
    /// Non-paused run time accumulated from completed stretches.
    elapsed: Duration,
    /// Start of the current non-paused stretch, if one is open.
    stretch_started: Option<Instant>,
}

impl State {
    fn settled(&self) -> bool {
        self.resolved || self.rejected
    }

    /// Accumulated non-paused run time, including the open stretch.
    fn elapsed_now(&self) -> Duration {
        match self.stretch_started {
            Some(t0) if !self.paused => self.elapsed + t0.elapsed(),
            _ => self.elapsed,
        }
    }

    /// Close the open stretch, folding it into `elapsed`.
    fn fold_stretch(&mut self) {
        if let Some(t0) = self.stretch_started.take() {
            self.elapsed += t0.elapsed();
        }
    }
}

struct PromiseInner<T> {
    id: String,
    die_timeout: Option<Duration>,
    /// Taken exactly once by `run()`.
    op: RefCell<Option<Operation<T>>>,
    state: RefCell<State>,
    /// Control signal (pause/resume/cancel) into the drive loop.
    wake: Notify,
    observers: PromiseObservers<T>,
}

/// A single-shot asynchronous operation with watchdog timeout,
/// pause/resume, and explicit cancellation.
///
/// Cloning yields another handle to the **same** promise.
pub struct SafePromise<T> {
    inner: Rc<PromiseInner<T>>,
}

impl<T> Clone for SafePromise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for SafePromise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.inner.state.borrow();
        f.debug_struct("SafePromise")
            .field("id", &self.inner.id)
            .field("die_timeout", &self.inner.die_timeout)
            .field("paused", &st.paused)
            .field("canceled", &st.canceled)
            .field("resolved", &st.resolved)
            .field("rejected", &st.rejected)
            .finish_non_exhaustive()
    }
}

impl<T: Clone + 'static> SafePromise<T> {
    /// Wrap `op` under diagnostic id `id`. A `None` timeout disables the
    /// watchdog entirely.
    pub fn new<F>(id: impl Into<String>, op: F, die_timeout: Option<Duration>) -> Self
    where
        F: Future<Output = Result<T, Fault>> + 'static,
    {
        let this = Self::bare(id.into(), die_timeout);
        *this.inner.op.borrow_mut() = Some(Box::pin(op));
        this
    }

    /// Like [`new`](Self::new), but the closure receives a handle to the
    /// promise itself, so the operation can cancel or pause its own
    /// watchdog.
    ///
    /// The stored operation keeps that handle alive; a promise built this
    /// way that is never run holds itself until the operation is dropped.
    pub fn from_fn<F, Fut>(id: impl Into<String>, f: F, die_timeout: Option<Duration>) -> Self
    where
        F: FnOnce(SafePromise<T>) -> Fut,
        Fut: Future<Output = Result<T, Fault>> + 'static,
    {
        let this = Self::bare(id.into(), die_timeout);
        let op = f(this.clone());
        *this.inner.op.borrow_mut() = Some(Box::pin(op));
        this
    }

    fn bare(id: String, die_timeout: Option<Duration>) -> Self {
        Self {
            inner: Rc::new(PromiseInner {
                id,
                die_timeout,
                op: RefCell::new(None),
                state: RefCell::new(State {
                    paused: false,
                    canceled: false,
                    resolved: false,
                    rejected: false,
                    elapsed: Duration::ZERO,
                    stretch_started: None,
                }),
                wake: Notify::new(),
                observers: PromiseObservers::new(),
            }),
        }
    }

    /// Diagnostic id supplied at construction.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Lifecycle observables of this promise.
    #[must_use]
    pub fn observers(&self) -> &PromiseObservers<T> {
        &self.inner.observers
    }

    /// Accumulated non-paused run time.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.inner.state.borrow().elapsed_now()
    }

    /// Whether the promise reached a resolved state (including
    /// cancellation, which reports as resolved).
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.inner.state.borrow().resolved
    }

    /// Whether the promise reached a rejected state (including death).
    #[must_use]
    pub fn is_rejected(&self) -> bool {
        self.inner.state.borrow().rejected
    }

    /// Freeze the watchdog and stop accumulating run time. The wrapped
    /// operation keeps running and may settle while paused. Idempotent.
    pub fn pause(&self) {
        {
            let mut st = self.inner.state.borrow_mut();
            if st.paused {
                return;
            }
            st.paused = true;
            st.fold_stretch();
        }
        debug!(id = %self.inner.id, "promise paused");
        self.inner.wake.notify_one();
    }

    /// Re-arm the watchdog for the remaining budget. Idempotent.
    pub fn resume(&self) {
        {
            let mut st = self.inner.state.borrow_mut();
            if !st.paused {
                return;
            }
            st.paused = false;
            st.stretch_started = Some(Instant::now());
        }
        debug!(id = %self.inner.id, "promise resumed");
        self.inner.wake.notify_one();
    }

    /// Cancel the promise if it has not settled yet. Safe to call at any
    /// time, including before `run()`; later calls are no-ops.
    ///
    /// Cancellation settles the promise as a resolved, non-error outcome:
    /// `run()` returns [`Settled::Canceled`], the `canceled` observable
    /// fires, and neither `resolved` nor `rejected` fires.
    pub fn cancel(&self) {
        {
            let mut st = self.inner.state.borrow_mut();
            if st.settled() || st.canceled {
                return;
            }
            st.canceled = true;
            st.resolved = true;
            st.fold_stretch();
        }
        debug!(id = %self.inner.id, "promise canceled");
        self.inner.observers.canceled.notify(&());
        self.inner.wake.notify_one();
    }

    /// Start the clock and the watchdog, drive the wrapped operation to a
    /// terminal state, and fire the matching observables.
    ///
    /// Returns the resolved value or cancellation sentinel on success; a
    /// rejection or fatal death error otherwise. A second call fails with
    /// [`PromiseError::Spent`].
    pub async fn run(&self) -> Result<Settled<T>, PromiseError> {
        let op = self.inner.op.borrow_mut().take();
        let Some(mut op) = op else {
            return Err(PromiseError::Spent {
                id: self.inner.id.clone(),
            });
        };
        {
            let mut st = self.inner.state.borrow_mut();
            if !st.paused {
                st.stretch_started = Some(Instant::now());
            }
        }
        debug!(id = %self.inner.id, timeout = ?self.inner.die_timeout, "promise run started");
        let outcome = self.drive(&mut op).await;
        self.inner.observers.finally.notify(&());
        outcome
    }

    async fn drive(&self, op: &mut Operation<T>) -> Result<Settled<T>, PromiseError> {
        loop {
            let (canceled, watchdog) = {
                let st = self.inner.state.borrow();
                let budget = self
                    .inner
                    .die_timeout
                    .map(|t| t.saturating_sub(st.elapsed_now()));
                // Pausing withholds only the watchdog arm; the operation
                // itself keeps running and may settle mid-pause.
                (st.canceled, if st.paused { None } else { budget })
            };
            if canceled {
                return Ok(Settled::Canceled);
            }
            // The watchdog timer is re-created from fresh state on every
            // control change and dropped with its select arm.
            match watchdog {
                Some(remaining) => {
                    tokio::select! {
                        biased;
                        out = &mut *op => return self.settle(out),
                        _ = self.inner.wake.notified() => {}
                        () = sleep(remaining) => return self.die(),
                    }
                }
                None => {
                    tokio::select! {
                        biased;
                        out = &mut *op => return self.settle(out),
                        _ = self.inner.wake.notified() => {}
                    }
                }
            }
        }
    }

    fn settle(&self, out: Result<T, Fault>) -> Result<Settled<T>, PromiseError> {
        // A cancel raised during the same poll wins; it already settled
        // the promise and fired its observables.
        if self.inner.state.borrow().canceled {
            return Ok(Settled::Canceled);
        }
        match out {
            Ok(value) => {
                {
                    let mut st = self.inner.state.borrow_mut();
                    st.resolved = true;
                    st.fold_stretch();
                }
                debug!(id = %self.inner.id, "promise resolved");
                self.inner.observers.resolved.notify(&value);
                Ok(Settled::Resolved(value))
            }
            Err(fault) => {
                {
                    let mut st = self.inner.state.borrow_mut();
                    st.rejected = true;
                    st.fold_stretch();
                }
                let err = PromiseError::Rejected(fault);
                debug!(id = %self.inner.id, %err, "promise rejected");
                self.inner.observers.rejected.notify(&err);
                self.inner.observers.error.notify(&err);
                Err(err)
            }
        }
    }

    fn die(&self) -> Result<Settled<T>, PromiseError> {
        if self.inner.state.borrow().canceled {
            return Ok(Settled::Canceled);
        }
        {
            let mut st = self.inner.state.borrow_mut();
            st.rejected = true;
            st.fold_stretch();
        }
        let err = PromiseError::Died {
            id: self.inner.id.clone(),
        };
        error!(id = %self.inner.id, "watchdog fired; promise died");
        self.inner.observers.died.notify(&err);
        self.inner.observers.error.notify(&err);
        Err(err)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
