#![forbid(unsafe_code)]

//! Self-correcting repeating scheduler with settle-then-wait pacing.
//!
//! [`SafeInterval`] runs a user callback on a fixed delay measured from
//! the **completion** of the previous tick's work, not from a fixed
//! origin: a slow or async tick naturally throttles the cadence instead
//! of piling up overlapping runs. A single-flight latch guarantees two
//! ticks never execute concurrently, even across a `stop()`/`start()`
//! restart while a tick is still in flight.

use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::LocalBoxFuture;
use tokio::sync::Notify;
use tokio::time::sleep;
use tracing::{debug, error};

use crate::error::Fault;
use crate::observable::Observable;

type TickFn = Rc<dyn Fn() -> LocalBoxFuture<'static, Result<(), Fault>>>;

/// Lifecycle observables owned by a [`SafeInterval`].
pub struct IntervalObservers {
    /// Fired on every `start()` call, including redundant ones.
    pub start: Observable<()>,
    /// Fired on every `stop()` call, including redundant ones.
    pub stop: Observable<()>,
    /// Fired whenever a tick's callback fails.
    pub error: Observable<Fault>,
}

/// Outcome of one scheduling cycle.
enum Cycle {
    Completed,
    /// The single-flight latch was held; this cycle was a no-op.
    Skipped,
    Faulted {
        stopped: bool,
    },
}

struct IntervalState {
    active: bool,
    /// Single-flight latch: false while a tick's work is outstanding.
    can_run: bool,
    /// Bumped on every stop so a superseded drive loop retires even if
    /// `start()` follows immediately.
    epoch: u64,
    period: Duration,
    stop_on_error: bool,
    on_tick: Option<TickFn>,
}

struct IntervalInner {
    state: RefCell<IntervalState>,
    /// Interrupts the inter-tick sleep on stop.
    wake: Notify,
    observers: IntervalObservers,
}

/// A repeating scheduler that re-arms only after the previous tick's
/// async work has completed.
///
/// Cloning yields another handle to the **same** interval.
///
/// Reconfiguration mid-run is permitted between ticks: a new callback or
/// period applies from the next cycle, never the in-flight one.
pub struct SafeInterval {
    inner: Rc<IntervalInner>,
}

impl Clone for SafeInterval {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for SafeInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.inner.state.borrow();
        f.debug_struct("SafeInterval")
            .field("active", &st.active)
            .field("period", &st.period)
            .field("stop_on_error", &st.stop_on_error)
            .finish_non_exhaustive()
    }
}

impl Default for SafeInterval {
    fn default() -> Self {
        Self::new()
    }
}

impl SafeInterval {
    /// Create an inactive interval with a 1ms period, no callback, and
    /// `stop_on_error` enabled.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Rc::new(IntervalInner {
                state: RefCell::new(IntervalState {
                    active: false,
                    can_run: true,
                    epoch: 0,
                    period: Duration::from_millis(1),
                    stop_on_error: true,
                    on_tick: None,
                }),
                wake: Notify::new(),
                observers: IntervalObservers {
                    start: Observable::new(),
                    stop: Observable::new(),
                    error: Observable::new(),
                },
            }),
        }
    }

    /// Replace the tick callback. Takes effect from the next cycle.
    pub fn set_on_run<F, Fut>(&self, run: F) -> &Self
    where
        F: Fn() -> Fut + 'static,
        Fut: Future<Output = Result<(), Fault>> + 'static,
    {
        let wrapped: TickFn = Rc::new(move || Box::pin(run()));
        self.inner.state.borrow_mut().on_tick = Some(wrapped);
        self
    }

    /// Change the inter-tick delay. Takes effect from the next re-arm.
    pub fn set_interval(&self, period: Duration) -> &Self {
        self.inner.state.borrow_mut().period = period;
        self
    }

    /// Whether a failing tick stops the interval (default) or is
    /// swallowed after firing the `error` observable.
    pub fn set_stop_on_error(&self, stop_on_error: bool) -> &Self {
        self.inner.state.borrow_mut().stop_on_error = stop_on_error;
        self
    }

    /// Lifecycle observables of this interval.
    #[must_use]
    pub fn observers(&self) -> &IntervalObservers {
        &self.inner.observers
    }

    /// Whether the scheduling loop is currently active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.state.borrow().active
    }

    /// Begin (or keep) ticking. The `start` observable fires even when
    /// already active, so restart-observers can reset their state.
    ///
    /// # Panics
    ///
    /// Panics if called outside a `tokio::task::LocalSet` context (the
    /// drive loop is spawned with `spawn_local`).
    pub fn start(&self) {
        let spawn_epoch = {
            let mut st = self.inner.state.borrow_mut();
            if st.active {
                None
            } else {
                st.active = true;
                Some(st.epoch)
            }
        };
        if let Some(epoch) = spawn_epoch {
            debug!(period = ?self.inner.state.borrow().period, "interval started");
            let driver = self.clone();
            drop(tokio::task::spawn_local(driver.drive(epoch)));
        }
        self.inner.observers.start.notify(&());
    }

    /// Stop ticking and cancel the pending re-arm. An in-flight tick is
    /// never aborted mid-await; it completes, then the loop retires. The
    /// `stop` observable fires even when already stopped.
    pub fn stop(&self) {
        {
            let mut st = self.inner.state.borrow_mut();
            st.active = false;
            st.epoch += 1;
        }
        debug!("interval stopped");
        self.inner.wake.notify_one();
        self.inner.observers.stop.notify(&());
    }

    async fn drive(self, epoch: u64) {
        // Consume any stale stop permit left by a previous generation.
        let _ = self.inner.wake.notified().now_or_never();
        loop {
            if !self.live(epoch) {
                break;
            }
            if let Cycle::Faulted { stopped: true } = self.run_cycle().await {
                break;
            }
            if !self.live(epoch) {
                break;
            }
            let period = self.inner.state.borrow().period;
            tokio::select! {
                () = sleep(period) => {}
                _ = self.inner.wake.notified() => {}
            }
        }
    }

    fn live(&self, epoch: u64) -> bool {
        let st = self.inner.state.borrow();
        st.active && st.epoch == epoch
    }

    /// One tick: acquire the single-flight latch, run the callback, and
    /// route any failure per `stop_on_error`.
    async fn run_cycle(&self) -> Cycle {
        let tick = {
            let mut st = self.inner.state.borrow_mut();
            if !st.can_run {
                return Cycle::Skipped;
            }
            let Some(tick) = st.on_tick.clone() else {
                return Cycle::Completed;
            };
            st.can_run = false;
            tick
        };
        let out = tick().await;
        self.inner.state.borrow_mut().can_run = true;
        match out {
            Ok(()) => Cycle::Completed,
            Err(fault) => {
                let stopped = self.inner.state.borrow().stop_on_error;
                error!(%fault, stop_on_error = stopped, "interval tick failed");
                if stopped {
                    self.stop();
                }
                self.inner.observers.error.notify(&fault);
                Cycle::Faulted { stopped }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
