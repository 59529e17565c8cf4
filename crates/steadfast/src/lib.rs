#![forbid(unsafe_code)]

//! Resilient async primitives for single-threaded cooperative runtimes.
//!
//! # Role
//!
//! `steadfast` provides three building blocks for callback-driven control
//! flow on a local (non-`Send`) task set:
//!
//! - [`Observable`]: keyed and anonymous subscriber registry with
//!   synchronous and serialized-async notification, one-shot
//!   subscriptions, and in-flight pass short-circuiting.
//! - [`SafePromise`]: a single-shot async operation wrapper with a
//!   dead-man's-switch watchdog, pause/resume of that watchdog, and
//!   explicit cancellation as a non-error outcome.
//! - [`SafeInterval`]: a repeating scheduler that re-arms only after the
//!   previous tick's async work settles, guarded against overlapping
//!   executions.
//!
//! # Concurrency model
//!
//! Everything runs on one logical thread of control; suspension happens
//! only at explicit await points. Shared state is `Rc<RefCell<..>>`, and
//! correctness rests on re-entrancy guards and settle-once invariants
//! rather than locks. Components that spawn background work
//! ([`SafeInterval::start`], async subscribers under
//! [`Observable::notify`]) require a `tokio::task::LocalSet` context.
//!
//! Lifecycle transitions are logged through `tracing` at `debug` level,
//! failures at `error`; no subscriber is installed by this crate.

pub mod error;
pub mod interval;
pub mod observable;
pub mod promise;

pub use error::{Fault, PromiseError, fault};
pub use interval::{IntervalObservers, SafeInterval};
pub use observable::{Observable, SubscriberKey, Token};
pub use promise::{PromiseObservers, SafePromise, Settled};
