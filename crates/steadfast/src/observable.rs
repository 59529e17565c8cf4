#![forbid(unsafe_code)]

//! Keyed subscriber registry with re-entrant-safe notification.
//!
//! # Design
//!
//! [`Observable<T>`] is a cheap `Clone` handle over shared state
//! (`Rc<RefCell<..>>`) holding an ordered list of subscriber entries.
//! Notification walks the list in **reverse registration order**: the
//! most recently subscribed callback runs first, so late-added handlers
//! can observe (or [`break_pass`](Observable::break_pass)) a pass before
//! older ones run.
//!
//! A pass snapshots entry serials up front and re-looks each serial up
//! right before invoking it. Subscribers may therefore freely mutate the
//! registry from inside their callbacks:
//!
//! - an entry removed mid-pass before its turn is skipped;
//! - an entry added mid-pass is not visited until the next pass;
//! - no entry is invoked twice within one pass.
//!
//! # Delivery modes
//!
//! | Mode | Sync subscriber | Async subscriber |
//! |------|-----------------|------------------|
//! | [`notify`](Observable::notify) | invoked inline | spawned fire-and-forget (`spawn_local`) |
//! | [`notify_async`](Observable::notify_async) | invoked inline | awaited before the next entry |
//!
//! # Invariants
//!
//! 1. At most one live subscriber per explicit key; re-subscribing a key
//!    replaces the prior entry.
//! 2. A once-subscriber is removed immediately after its single
//!    invocation, regardless of how the pass ends.
//! 3. `break_pass()` stops only the pass it was called from; the next
//!    pass visits every remaining subscriber.
//!
//! # Failure Modes
//!
//! | Condition | Behavior |
//! |-----------|----------|
//! | Subscriber panics | Propagates to the `notify` caller; registry stays consistent |
//! | Async subscriber under `notify` outside a `LocalSet` | Panics (`spawn_local` requirement) |
//! | `break_pass()` outside a pass | Poisons the next pass's first step (matches upstream behavior; avoid) |

use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;

use futures_util::future::LocalBoxFuture;

type SyncFn<T> = Rc<dyn Fn(&T, &Observable<T>)>;
type AsyncFn<T> = Rc<dyn Fn(T, Observable<T>) -> LocalBoxFuture<'static, ()>>;

/// Opaque identity handed out for an anonymous subscription.
///
/// Only the registry mints these, so a token can never collide with (or
/// be forged to replace) another subscriber's key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(u64);

/// Identity under which a subscriber is registered.
///
/// Anonymous subscriptions get a fresh [`Token`](SubscriberKey::Token)
/// per call; explicit keys come from strings or integers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubscriberKey {
    /// Auto-allocated identity for anonymous subscriptions.
    Token(Token),
    /// Caller-chosen textual key.
    Name(String),
    /// Caller-chosen numeric key.
    Id(i64),
}

impl From<&str> for SubscriberKey {
    fn from(name: &str) -> Self {
        Self::Name(name.to_owned())
    }
}

impl From<String> for SubscriberKey {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

impl From<i64> for SubscriberKey {
    fn from(id: i64) -> Self {
        Self::Id(id)
    }
}

enum Callback<T> {
    Sync(SyncFn<T>),
    Async(AsyncFn<T>),
}

impl<T> Clone for Callback<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Sync(f) => Self::Sync(Rc::clone(f)),
            Self::Async(f) => Self::Async(Rc::clone(f)),
        }
    }
}

struct Entry<T> {
    /// Unique within this observable; pass snapshots iterate by serial.
    serial: u64,
    key: SubscriberKey,
    callback: Callback<T>,
    once: bool,
}

struct Inner<T> {
    entries: Vec<Entry<T>>,
    next_serial: u64,
    broken: bool,
}

/// Keyed and anonymous subscriber registry with synchronous and
/// asynchronous notification.
///
/// Cloning an `Observable` creates a new handle to the **same** registry.
pub struct Observable<T = ()> {
    inner: Rc<RefCell<Inner<T>>>,
}

// Manual Clone: shares the same Rc, no bound on T.
impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observable")
            .field("subscriber_count", &self.inner.borrow().entries.len())
            .finish()
    }
}

impl<T: Clone + 'static> Default for Observable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + 'static> Observable<T> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                entries: Vec::new(),
                next_serial: 0,
                broken: false,
            })),
        }
    }

    /// Register an anonymous subscriber; returns its auto-allocated key.
    ///
    /// Each call registers a distinct entry, even for behaviorally
    /// identical closures.
    pub fn subscribe<F>(&self, callback: F) -> SubscriberKey
    where
        F: Fn(&T, &Observable<T>) + 'static,
    {
        self.insert(None, Callback::Sync(Rc::new(callback)), false)
    }

    /// Register a subscriber under an explicit key.
    ///
    /// If the key already has a live subscriber it is removed first, then
    /// the new one is added at the end of the registration order.
    pub fn subscribe_keyed<F>(&self, key: impl Into<SubscriberKey>, callback: F)
    where
        F: Fn(&T, &Observable<T>) + 'static,
    {
        self.insert(Some(key.into()), Callback::Sync(Rc::new(callback)), false);
    }

    /// Register an anonymous asynchronous subscriber.
    ///
    /// The payload is cloned per delivery. Under [`notify`](Self::notify)
    /// the returned future is spawned fire-and-forget on the current
    /// `LocalSet`; under [`notify_async`](Self::notify_async) it is
    /// awaited in order.
    pub fn subscribe_async<F, Fut>(&self, callback: F) -> SubscriberKey
    where
        F: Fn(T, Observable<T>) -> Fut + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        let wrapped: AsyncFn<T> = Rc::new(move |data, obs| Box::pin(callback(data, obs)));
        self.insert(None, Callback::Async(wrapped), false)
    }

    /// Register a subscriber that is removed immediately after its first
    /// invocation.
    pub fn subscribe_once<F>(&self, callback: F) -> SubscriberKey
    where
        F: Fn(&T, &Observable<T>) + 'static,
    {
        self.insert(None, Callback::Sync(Rc::new(callback)), true)
    }

    /// Remove the subscriber registered under `key`.
    ///
    /// Returns whether one was found and removed.
    pub fn unsubscribe(&self, key: &SubscriberKey) -> bool {
        let mut inner = self.inner.borrow_mut();
        let before = inner.entries.len();
        inner.entries.retain(|e| e.key != *key);
        inner.entries.len() != before
    }

    /// Remove a once-subscriber before it has fired.
    ///
    /// Returns whether one was found and removed. Entries not flagged as
    /// once are left alone.
    pub fn unsubscribe_once(&self, key: &SubscriberKey) -> bool {
        let mut inner = self.inner.borrow_mut();
        match inner.entries.iter().position(|e| e.once && e.key == *key) {
            Some(pos) => {
                inner.entries.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Invoke every current subscriber with `(data, self)`, most recently
    /// subscribed first.
    ///
    /// Async subscribers are started fire-and-forget via
    /// `tokio::task::spawn_local`.
    ///
    /// # Panics
    ///
    /// Panics if an async subscriber is delivered outside a
    /// `tokio::task::LocalSet` context.
    pub fn notify(&self, data: &T) {
        for serial in self.pass_order() {
            let Some((callback, once)) = self.lookup(serial) else {
                continue; // removed mid-pass
            };
            match callback {
                Callback::Sync(f) => f(data, self),
                Callback::Async(f) => {
                    drop(tokio::task::spawn_local(f(data.clone(), self.clone())));
                }
            }
            if once {
                self.remove(serial);
            }
            if self.take_broken() {
                return;
            }
        }
    }

    /// Like [`notify`](Self::notify), but awaits each async subscriber
    /// before proceeding to the next entry (serialized delivery, same
    /// reverse order).
    pub async fn notify_async(&self, data: &T) {
        for serial in self.pass_order() {
            let Some((callback, once)) = self.lookup(serial) else {
                continue;
            };
            match callback {
                Callback::Sync(f) => f(data, self),
                Callback::Async(f) => f(data.clone(), self.clone()).await,
            }
            if once {
                self.remove(serial);
            }
            if self.take_broken() {
                return;
            }
        }
    }

    /// Stop the enclosing notification pass after the current callback
    /// returns. Remaining subscribers are skipped for this pass only.
    pub fn break_pass(&self) {
        self.inner.borrow_mut().broken = true;
    }

    /// Remove all subscribers and keys.
    pub fn clear(&self) {
        self.inner.borrow_mut().entries.clear();
    }

    /// Number of currently registered subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.borrow().entries.len()
    }

    fn insert(&self, key: Option<SubscriberKey>, callback: Callback<T>, once: bool) -> SubscriberKey {
        let mut inner = self.inner.borrow_mut();
        let serial = inner.next_serial;
        inner.next_serial += 1;
        let key = key.unwrap_or(SubscriberKey::Token(Token(serial)));
        // Replace semantics: at most one live subscriber per key.
        inner.entries.retain(|e| e.key != key);
        inner.entries.push(Entry {
            serial,
            key: key.clone(),
            callback,
            once,
        });
        key
    }

    /// Serials of the current entries in delivery (reverse) order.
    fn pass_order(&self) -> Vec<u64> {
        self.inner
            .borrow()
            .entries
            .iter()
            .rev()
            .map(|e| e.serial)
            .collect()
    }

    fn lookup(&self, serial: u64) -> Option<(Callback<T>, bool)> {
        self.inner
            .borrow()
            .entries
            .iter()
            .find(|e| e.serial == serial)
            .map(|e| (e.callback.clone(), e.once))
    }

    fn remove(&self, serial: u64) {
        self.inner
            .borrow_mut()
            .entries
            .retain(|e| e.serial != serial);
    }

    fn take_broken(&self) -> bool {
        std::mem::take(&mut self.inner.borrow_mut().broken)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn recording(log: &Rc<RefCell<Vec<&'static str>>>, tag: &'static str) -> impl Fn(&(), &Observable) + 'static {
        let log = Rc::clone(log);
        move |_, _| log.borrow_mut().push(tag)
    }

    #[test]
    fn notify_runs_in_reverse_registration_order() {
        let obs = Observable::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        obs.subscribe(recording(&log, "a"));
        obs.subscribe(recording(&log, "b"));
        obs.subscribe(recording(&log, "c"));

        obs.notify(&());
        assert_eq!(*log.borrow(), vec!["c", "b", "a"]);
    }

    #[test]
    fn identical_closures_register_separately() {
        let obs = Observable::new();
        let count = Rc::new(Cell::new(0u32));

        for _ in 0..2 {
            let c = Rc::clone(&count);
            obs.subscribe(move |_, _| c.set(c.get() + 1));
        }

        obs.notify(&());
        assert_eq!(count.get(), 2);
    }

    #[test]
    fn keyed_resubscribe_replaces() {
        let obs = Observable::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        obs.subscribe_keyed("slot", recording(&log, "old"));
        obs.subscribe_keyed("slot", recording(&log, "new"));

        obs.notify(&());
        assert_eq!(*log.borrow(), vec!["new"]);
        assert_eq!(obs.subscriber_count(), 1);
    }

    #[test]
    fn unsubscribe_round_trip_never_fires() {
        let obs = Observable::<i32>::new();
        let fired = Rc::new(Cell::new(false));
        let f = Rc::clone(&fired);

        obs.subscribe_keyed(7i64, move |_, _| f.set(true));
        assert!(obs.unsubscribe(&SubscriberKey::Id(7)));
        assert!(!obs.unsubscribe(&SubscriberKey::Id(7)));

        obs.notify(&1);
        assert!(!fired.get());
    }

    #[test]
    fn anonymous_token_unsubscribes() {
        let obs = Observable::new();
        let count = Rc::new(Cell::new(0u32));
        let c = Rc::clone(&count);

        let key = obs.subscribe(move |_, _| c.set(c.get() + 1));
        obs.notify(&());
        assert!(obs.unsubscribe(&key));
        obs.notify(&());
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn once_fires_exactly_once_and_leaves() {
        let obs = Observable::new();
        let count = Rc::new(Cell::new(0u32));
        let c = Rc::clone(&count);

        obs.subscribe_once(move |_, _| c.set(c.get() + 1));
        assert_eq!(obs.subscriber_count(), 1);

        obs.notify(&());
        obs.notify(&());
        assert_eq!(count.get(), 1);
        assert_eq!(obs.subscriber_count(), 0);
    }

    #[test]
    fn unsubscribe_once_before_fire() {
        let obs = Observable::new();
        let fired = Rc::new(Cell::new(false));
        let f = Rc::clone(&fired);

        let key = obs.subscribe_once(move |_, _| f.set(true));
        assert!(obs.unsubscribe_once(&key));
        assert!(!obs.unsubscribe_once(&key));

        obs.notify(&());
        assert!(!fired.get());
    }

    #[test]
    fn unsubscribe_once_ignores_normal_entries() {
        let obs = Observable::<()>::new();
        let key = obs.subscribe(|_, _| {});
        assert!(!obs.unsubscribe_once(&key));
        assert_eq!(obs.subscriber_count(), 1);
    }

    #[test]
    fn auto_tokens_never_collide_with_caller_keys() {
        let obs = Observable::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        // Numeric keys chosen to shadow the serials the registry hands
        // out first; the anonymous entry must not replace either.
        obs.subscribe_keyed(0i64, recording(&log, "id-0"));
        obs.subscribe_keyed(1i64, recording(&log, "id-1"));
        let token = obs.subscribe(recording(&log, "anon"));

        assert!(matches!(token, SubscriberKey::Token(_)));
        assert_eq!(obs.subscriber_count(), 3);

        obs.notify(&());
        assert_eq!(*log.borrow(), vec!["anon", "id-1", "id-0"]);
    }

    #[test]
    fn break_stops_only_current_pass() {
        let obs = Observable::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        obs.subscribe(recording(&log, "old"));
        {
            let log = Rc::clone(&log);
            obs.subscribe_once(move |_, obs| {
                log.borrow_mut().push("breaker");
                obs.break_pass();
            });
        }

        obs.notify(&());
        assert_eq!(*log.borrow(), vec!["breaker"]);

        // The once-flagged breaker is gone: the next pass reaches the
        // older entry in full.
        log.borrow_mut().clear();
        obs.notify(&());
        assert_eq!(*log.borrow(), vec!["old"]);
    }

    #[test]
    fn subscriber_may_remove_a_not_yet_visited_entry() {
        let obs = Observable::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        obs.subscribe_keyed("victim", recording(&log, "victim"));
        {
            let log = Rc::clone(&log);
            obs.subscribe(move |_, obs| {
                log.borrow_mut().push("killer");
                obs.unsubscribe(&SubscriberKey::from("victim"));
            });
        }

        // Killer runs first (reverse order) and removes the victim mid-pass.
        obs.notify(&());
        assert_eq!(*log.borrow(), vec!["killer"]);
    }

    #[test]
    fn subscriber_may_remove_itself() {
        let obs = Observable::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        obs.subscribe(recording(&log, "other"));
        {
            let log = Rc::clone(&log);
            obs.subscribe_keyed("self", move |_, obs| {
                log.borrow_mut().push("self");
                obs.unsubscribe(&SubscriberKey::from("self"));
            });
        }

        obs.notify(&());
        assert_eq!(*log.borrow(), vec!["self", "other"]);
        assert_eq!(obs.subscriber_count(), 1);

        obs.notify(&());
        assert_eq!(*log.borrow(), vec!["self", "other", "other"]);
    }

    #[test]
    fn subscriber_added_mid_pass_waits_for_next_pass() {
        let obs = Observable::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        {
            let log = Rc::clone(&log);
            obs.subscribe(move |_, obs: &Observable| {
                log.borrow_mut().push("adder");
                let log = Rc::clone(&log);
                obs.subscribe_keyed("late", move |_, _| log.borrow_mut().push("late"));
            });
        }

        obs.notify(&());
        assert_eq!(*log.borrow(), vec!["adder"]);

        obs.notify(&());
        // Late entry is newest, so it leads the second pass. The adder
        // replaces it via the same key; no duplicate invocation.
        assert_eq!(*log.borrow(), vec!["adder", "late", "adder"]);
    }

    #[test]
    fn clear_removes_everything() {
        let obs = Observable::new();
        let count = Rc::new(Cell::new(0u32));
        let c = Rc::clone(&count);

        obs.subscribe(move |_, _| c.set(c.get() + 1));
        obs.subscribe_keyed("k", |_, _| {});
        obs.clear();

        assert_eq!(obs.subscriber_count(), 0);
        obs.notify(&());
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn payload_reaches_subscribers() {
        let obs = Observable::<String>::new();
        let seen = Rc::new(RefCell::new(String::new()));
        let s = Rc::clone(&seen);

        obs.subscribe(move |data, _| s.borrow_mut().push_str(data));
        obs.notify(&"ping".to_owned());
        assert_eq!(*seen.borrow(), "ping");
    }

    #[tokio::test]
    async fn notify_async_serializes_async_subscribers() {
        let obs = Observable::<u32>::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        {
            let log = Rc::clone(&log);
            obs.subscribe_async(move |v, _| {
                let log = Rc::clone(&log);
                async move {
                    tokio::task::yield_now().await;
                    log.borrow_mut().push(("async-old", v));
                }
            });
        }
        {
            let log = Rc::clone(&log);
            obs.subscribe(move |v, _| log.borrow_mut().push(("sync-new", *v)));
        }

        obs.notify_async(&3).await;
        // Reverse order holds across the await boundary.
        assert_eq!(*log.borrow(), vec![("sync-new", 3), ("async-old", 3)]);
    }

    #[tokio::test]
    async fn notify_async_honors_break() {
        let obs = Observable::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        obs.subscribe(recording(&log, "skipped"));
        {
            let log = Rc::clone(&log);
            obs.subscribe_async(move |(), obs| {
                let log = Rc::clone(&log);
                async move {
                    log.borrow_mut().push("breaker");
                    obs.break_pass();
                }
            });
        }

        obs.notify_async(&()).await;
        assert_eq!(*log.borrow(), vec!["breaker"]);
    }

    #[tokio::test]
    async fn notify_spawns_async_subscribers_fire_and_forget() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let obs = Observable::<u32>::new();
                let seen = Rc::new(Cell::new(0u32));
                let s = Rc::clone(&seen);

                obs.subscribe_async(move |v, _| {
                    let s = Rc::clone(&s);
                    async move { s.set(v) }
                });

                obs.notify(&9);
                // Delivery is deferred until the local set is polled.
                assert_eq!(seen.get(), 0);
                tokio::task::yield_now().await;
                assert_eq!(seen.get(), 9);
            })
            .await;
    }
}
