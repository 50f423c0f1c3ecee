#![doc = include_str!(".crate-docs.md")]
#![forbid(unsafe_code)]
#![warn(
    clippy::cargo,
    missing_docs,
    // clippy::missing_docs_in_private_items,
    clippy::pedantic,
    future_incompatible,
    rust_2018_idioms,
)]
#![allow(clippy::option_if_let_else, clippy::module_name_repetitions)]

use std::{
    any::Any,
    fmt,
    ops::Deref,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Weak,
    },
    task::Poll,
    time::{Duration, Instant},
};

use event_listener::{Event, EventListener};
use futures_util::{FutureExt, Stream};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockUpgradableReadGuard};

/// An observable container for a value.
#[derive(Default, Debug)]
pub struct Observable<T> {
    data: Arc<Data<T>>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        self.data.owners.fetch_add(1, Ordering::AcqRel);
        Self {
            data: self.data.clone(),
        }
    }
}

impl<T> Drop for Observable<T> {
    fn drop(&mut self) {
        if self.data.owners.fetch_sub(1, Ordering::AcqRel) == 1 {
            // Last owner
            self.shutdown();
        }
    }
}

impl<T> Observable<T> {
    /// Returns a new instance with the initial value provided.
    pub fn new(initial_value: T) -> Self {
        Self {
            data: Arc::new(Data {
                value: RwLock::new(initial_value),
                changed: RwLock::new(Some(Event::new())),
                version: AtomicUsize::new(0),
                trackers: AtomicUsize::new(0),
                owners: AtomicUsize::new(1),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Registers `handler` to be invoked with each newly stored value, for as
    /// long as `observer` remains alive.
    ///
    /// `observer` is an *observer identity*: it is only ever weakly
    /// referenced, and only to decide whether the handler should still fire.
    /// Once the last `Arc` pointing at it is dropped, the registration
    /// becomes inert without any explicit teardown. Callers that have no
    /// natural identity object can pass an `Arc` they synthesize and own
    /// (such as `Arc::new(())`), or use [`Self::subscribe_scoped()`] instead.
    ///
    /// The returned [`Subscription`] can cancel the registration explicitly.
    /// Dropping the token does *not* cancel it; delivery continues until the
    /// observer goes away.
    pub fn subscribe<O, F>(&self, observer: &Arc<O>, handler: F) -> Subscription<T>
    where
        O: Any + Send + Sync,
        F: Fn(&T) + Send + Sync + 'static,
    {
        let observer: Weak<O> = Arc::downgrade(observer);
        let observer: Weak<dyn Any + Send + Sync> = observer;
        self.register(Some(observer), handler)
    }

    /// Registers `handler` without an observer identity. The registration
    /// lives exactly as long as the returned guard: dropping the
    /// [`ScopedSubscription`] cancels it.
    pub fn subscribe_scoped<F>(&self, handler: F) -> ScopedSubscription<T>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        ScopedSubscription {
            subscription: self.register(None, handler),
        }
    }

    fn register<F>(
        &self,
        observer: Option<Weak<dyn Any + Send + Sync>>,
        handler: F,
    ) -> Subscription<T>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let state = Arc::new(SubscriptionState {
            cancelled: AtomicBool::new(false),
            observer,
        });
        self.data.subscribers.lock().push(Entry {
            state: state.clone(),
            handler: Arc::new(handler),
        });
        Subscription {
            data: Arc::downgrade(&self.data),
            state,
        }
    }

    /// Cancels `subscription` if it was issued by this observable.
    ///
    /// This is idempotent, and a token minted by a different observable is
    /// ignored. Equivalent to [`Subscription::unsubscribe()`] otherwise.
    pub fn unsubscribe(&self, subscription: &Subscription<T>) {
        let owned = subscription
            .data
            .upgrade()
            .map_or(false, |data| Arc::ptr_eq(&data, &self.data));
        if owned {
            subscription.unsubscribe();
        }
    }

    /// Replaces the current value, then synchronously invokes every live
    /// subscriber handler with the new value, in registration order.
    ///
    /// Handlers run on the calling thread with no internal lock held, so a
    /// handler may call back into this observable, including `set` itself.
    /// Re-entrant stores are permitted and unbounded: the nested notification
    /// completes before the outer walk resumes, so handlers later in the
    /// outer walk observe the nested value first. A handler that panics is
    /// caught, reported through [`log`], and skipped; delivery continues with
    /// the remaining handlers.
    pub fn set(&self, new_value: T)
    where
        T: Clone,
    {
        self.replace(new_value);
    }

    /// Replaces the current value and notifies subscribers and trackers,
    /// returning the previously stored value.
    ///
    /// Delivery follows the same rules as [`Self::set()`].
    pub fn replace(&self, new_value: T) -> T
    where
        T: Clone,
    {
        let notified = new_value.clone();
        let old_value = {
            let mut stored = self.data.value.write();
            std::mem::replace(&mut *stored, new_value)
        };
        self.data.bump_version();
        self.data.notify_subscribers(&notified);
        old_value
    }

    /// Stores `new_value` only if it differs from the contained value.
    /// Returns `Ok(previous_value)` when a store (and notification) happened.
    ///
    /// # Errors
    ///
    /// Returns `Err(new_value)` if the currently stored value is equal to
    /// `new_value`. No notification is delivered in that case.
    pub fn update(&self, new_value: T) -> Result<T, T>
    where
        T: Clone + PartialEq,
    {
        let stored = self.data.value.upgradable_read();
        if *stored == new_value {
            Err(new_value)
        } else {
            let notified = new_value.clone();
            let old_value = {
                let mut stored = RwLockUpgradableReadGuard::upgrade(stored);
                std::mem::replace(&mut *stored, new_value)
            };
            self.data.bump_version();
            self.data.notify_subscribers(&notified);
            Ok(old_value)
        }
    }

    /// Mutates the contained value in place while holding the value lock,
    /// then delivers one notification carrying a clone of the result.
    ///
    /// The notification is unconditional: it is delivered even if `mutate`
    /// left the value untouched. Returns whatever `mutate` returns.
    pub fn modify<R>(&self, mutate: impl FnOnce(&mut T) -> R) -> R
    where
        T: Clone,
    {
        let (result, notified) = {
            let mut stored = self.data.value.write();
            let result = mutate(&mut stored);
            (result, stored.clone())
        };
        self.data.bump_version();
        self.data.notify_subscribers(&notified);
        result
    }

    /// Returns a guard which can be used to access the value held within the
    /// container. This guard does not block other threads from reading the
    /// value.
    pub fn read(&self) -> ObservableReadGuard<'_, T> {
        ObservableReadGuard(self.data.value.read())
    }

    /// Returns the currently contained value.
    #[must_use]
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.data.value.read().clone()
    }

    /// Returns the number of live subscriptions. Entries whose observer has
    /// been dropped or that have been cancelled are pruned by this call.
    #[must_use]
    pub fn subscribers(&self) -> usize {
        let mut subscribers = self.data.subscribers.lock();
        subscribers.retain(|entry| entry.state.is_live());
        subscribers.len()
    }

    /// Returns true if there are any live subscriptions.
    #[must_use]
    pub fn has_subscribers(&self) -> bool {
        self.subscribers() > 0
    }

    /// Returns a new [`Tracker`] that can wait for changes to the contained
    /// value.
    pub fn track(&self) -> Tracker<T> {
        self.data.trackers.fetch_add(1, Ordering::AcqRel);
        Tracker {
            version: self.data.current_version(),
            tracked: self.data.clone(),
        }
    }

    /// Returns the number of [`Tracker`]s for this value.
    #[must_use]
    pub fn trackers(&self) -> usize {
        self.data.trackers.load(Ordering::Acquire)
    }

    /// Returns true if there are any [`Tracker`]s for this value.
    #[must_use]
    pub fn has_trackers(&self) -> bool {
        self.trackers() > 0
    }

    /// Disconnects all [`Tracker`]s and cancels all subscriptions.
    ///
    /// Trackers can still read the last stored value before they signal that
    /// they are disconnected. Subscriptions receive no further invocations.
    /// This is invoked automatically when the last `Observable` clone drops.
    pub fn shutdown(&self) {
        let mut changed = self.data.changed.write();
        if let Some(changed) = changed.take() {
            changed.notify(usize::MAX);
        }
        drop(changed);

        let mut subscribers = self.data.subscribers.lock();
        for entry in subscribers.drain(..) {
            entry.state.cancel();
        }
    }
}

#[derive(Debug)]
struct Data<T> {
    value: RwLock<T>,
    changed: RwLock<Option<Event>>,
    version: AtomicUsize,
    trackers: AtomicUsize,
    owners: AtomicUsize,
    subscribers: Mutex<Vec<Entry<T>>>,
}

impl<T> Default for Data<T>
where
    T: Default,
{
    fn default() -> Self {
        Self {
            value: RwLock::default(),
            changed: RwLock::new(Some(Event::new())),
            version: AtomicUsize::new(0),
            trackers: AtomicUsize::new(0),
            owners: AtomicUsize::new(1),
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

impl<T> Data<T> {
    fn current_version(&self) -> usize {
        self.version.load(Ordering::Acquire)
    }

    fn bump_version(&self) {
        self.version.fetch_add(1, Ordering::AcqRel);
        let changed = self.changed.read();
        if let Some(changed) = changed.as_ref() {
            changed.notify(usize::MAX);
        }
    }

    /// Snapshot-then-release-then-invoke: the list lock is held only to prune
    /// dead entries and copy the snapshot, never while a handler runs.
    fn notify_subscribers(&self, new_value: &T) {
        let snapshot = {
            let mut subscribers = self.subscribers.lock();
            subscribers.retain(|entry| entry.state.is_live());
            subscribers.clone()
        };

        for entry in snapshot {
            // Cancellation and observer death race with this walk; re-check
            // immediately before dispatch.
            if !entry.state.is_live() {
                continue;
            }
            let handler = &*entry.handler;
            if panic::catch_unwind(AssertUnwindSafe(|| handler(new_value))).is_err() {
                log::error!("subscriber handler panicked; continuing with remaining handlers");
            }
        }
    }
}

struct Entry<T> {
    state: Arc<SubscriptionState>,
    handler: Arc<dyn Fn(&T) + Send + Sync>,
}

impl<T> Clone for Entry<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            handler: self.handler.clone(),
        }
    }
}

impl<T> fmt::Debug for Entry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct SubscriptionState {
    cancelled: AtomicBool,
    /// `None` for scoped registrations, whose lifetime is their guard.
    observer: Option<Weak<dyn Any + Send + Sync>>,
}

impl SubscriptionState {
    fn observer_alive(&self) -> bool {
        // The weak handle is never upgraded, so liveness probes cannot extend
        // the observer's lifetime.
        self.observer
            .as_ref()
            .map_or(true, |observer| observer.strong_count() > 0)
    }

    fn is_live(&self) -> bool {
        !self.cancelled.load(Ordering::Acquire) && self.observer_alive()
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

/// A cancellable registration of one handler against one [`Observable`].
///
/// The token holds no strong reference to the observable. Dropping it leaves
/// the registration in place; the handler keeps firing until the observer
/// identity is dropped, [`Self::unsubscribe()`] is called, or the observable
/// shuts down.
#[derive(Debug)]
pub struct Subscription<T> {
    data: Weak<Data<T>>,
    state: Arc<SubscriptionState>,
}

impl<T> Subscription<T> {
    /// Cancels this registration. The handler will not be invoked by any
    /// store that observes the cancellation, including a notification already
    /// in flight that has not yet dispatched to it.
    ///
    /// Calling this more than once is a no-op.
    pub fn unsubscribe(&self) {
        if self.state.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(data) = self.data.upgrade() {
            data.subscribers
                .lock()
                .retain(|entry| !Arc::ptr_eq(&entry.state, &self.state));
        }
    }

    /// Returns true while the registration can still receive notifications:
    /// the observable is alive, the subscription has not been cancelled, and
    /// the observer identity (if any) has not been dropped.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.data.upgrade().is_some() && self.state.is_live()
    }

    /// Converts this token into a guard that cancels the registration when
    /// dropped.
    pub fn scoped(self) -> ScopedSubscription<T> {
        ScopedSubscription { subscription: self }
    }
}

/// A [`Subscription`] that cancels itself when dropped.
#[must_use = "dropping a scoped subscription immediately cancels it"]
#[derive(Debug)]
pub struct ScopedSubscription<T> {
    subscription: Subscription<T>,
}

impl<T> Deref for ScopedSubscription<T> {
    type Target = Subscription<T>;

    fn deref(&self) -> &Self::Target {
        &self.subscription
    }
}

impl<T> Drop for ScopedSubscription<T> {
    fn drop(&mut self) {
        self.subscription.unsubscribe();
    }
}

/// A read guard that allows reading the currently stored value in an
/// [`Observable`]. No values can be stored while this guard exists.
///
/// The inner value is accessible through [`Deref`].
#[must_use]
pub struct ObservableReadGuard<'a, T>(RwLockReadGuard<'a, T>);

impl<'a, T> Deref for ObservableReadGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// A tracker of an [`Observable`] value: a pull-style consumer that waits
/// for a value newer than the last one it marked seen.
///
/// Trackers coalesce. Only the most recently stored value can be observed;
/// values stored while a tracker is not waiting are skipped.
///
/// ## Cloning behavior
///
/// Cloning a tracker also clones the current tracking state. If the tracker
/// hasn't read the value currently stored, the cloned instance will also
/// consider the current value unseen.
#[derive(Debug)]
#[must_use]
pub struct Tracker<T> {
    version: usize,
    tracked: Arc<Data<T>>,
}

impl<T> Clone for Tracker<T> {
    fn clone(&self) -> Self {
        self.tracked.trackers.fetch_add(1, Ordering::AcqRel);
        Self {
            version: self.version,
            tracked: self.tracked.clone(),
        }
    }
}

impl<T> Drop for Tracker<T> {
    fn drop(&mut self) {
        self.tracked.trackers.fetch_sub(1, Ordering::AcqRel);
    }
}

enum Listen {
    /// A value newer than the tracker's is already stored.
    Ready,
    /// Every owner has dropped and the final value has been seen.
    Closed,
    /// Nothing new yet; park on this listener.
    Wait(EventListener),
}

/// A wait failed because all [`Observable`] instances have been dropped.
#[derive(Debug, thiserror::Error, Eq, PartialEq)]
#[error("all observable instances have been dropped")]
pub struct Disconnected;

/// A wait with a timeout failed.
#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum TimeoutError {
    /// A wait failed because all [`Observable`] instances have been dropped.
    #[error("all observable instances have been dropped")]
    Disconnected,
    /// No new values were stored before the timeout elapsed.
    #[error("no new values were stored before the timeout elapsed")]
    Timeout,
}

impl<T> Tracker<T> {
    fn listen(&self) -> Listen {
        if !self.is_current() {
            return Listen::Ready;
        }
        let changed = self.tracked.changed.read();
        match changed.as_ref() {
            None => Listen::Closed,
            Some(changed) => {
                let listener = changed.listen();

                // A store may have landed between the currency check above
                // and registering the listener; check again before parking.
                if self.is_current() {
                    Listen::Wait(listener)
                } else {
                    Listen::Ready
                }
            }
        }
    }

    /// Returns true if the latest stored value has been seen by this
    /// instance.
    #[must_use]
    pub fn is_current(&self) -> bool {
        self.version == self.tracked.current_version()
    }

    /// Updates this instance's state to reflect that it has seen the
    /// currently stored value. The next wait will block until another value
    /// is stored.
    ///
    /// Returns true if the internal state was updated, and false if no
    /// changes were necessary.
    pub fn mark_seen(&mut self) -> bool {
        let current_version = self.tracked.current_version();
        if self.version == current_version {
            false
        } else {
            self.version = current_version;
            true
        }
    }

    /// Blocks the calling thread until a value newer than the last one seen
    /// has been stored. Returns immediately if one already is.
    ///
    /// # Errors
    ///
    /// Returns [`Disconnected`] if all instances of [`Observable`] have been
    /// dropped and the current value has been seen.
    pub fn changed(&self) -> Result<(), Disconnected> {
        loop {
            match self.listen() {
                Listen::Ready => return Ok(()),
                Listen::Closed => return Err(Disconnected),
                Listen::Wait(listener) => {
                    listener.wait();
                    if !self.is_current() {
                        return Ok(());
                    }
                    // Spurious wake-up; go around again.
                }
            }
        }
    }

    /// Blocks the calling thread until a value newer than the last one seen
    /// has been stored, or until `duration` has elapsed.
    ///
    /// # Errors
    ///
    /// - [`TimeoutError::Disconnected`]: All instances of [`Observable`] have
    ///   been dropped and the current value has been seen.
    /// - [`TimeoutError::Timeout`]: No new value was stored in time.
    pub fn changed_timeout(&self, duration: Duration) -> Result<(), TimeoutError> {
        self.changed_deadline(Instant::now() + duration)
    }

    /// Blocks the calling thread until a value newer than the last one seen
    /// has been stored, or until `deadline`.
    ///
    /// # Errors
    ///
    /// - [`TimeoutError::Disconnected`]: All instances of [`Observable`] have
    ///   been dropped and the current value has been seen.
    /// - [`TimeoutError::Timeout`]: No new value was stored in time.
    pub fn changed_deadline(&self, deadline: Instant) -> Result<(), TimeoutError> {
        loop {
            match self.listen() {
                Listen::Ready => return Ok(()),
                Listen::Closed => return Err(TimeoutError::Disconnected),
                Listen::Wait(listener) => {
                    if listener.wait_deadline(deadline) {
                        if !self.is_current() {
                            return Ok(());
                        }
                        // Spurious wake-up; go around again.
                    } else {
                        return Err(TimeoutError::Timeout);
                    }
                }
            }
        }
    }

    /// Waits until a value newer than the last one seen has been stored.
    /// Completes immediately if one already is.
    ///
    /// # Errors
    ///
    /// Returns [`Disconnected`] if all instances of [`Observable`] have been
    /// dropped and the current value has been seen.
    pub async fn changed_async(&self) -> Result<(), Disconnected> {
        loop {
            match self.listen() {
                Listen::Ready => return Ok(()),
                Listen::Closed => return Err(Disconnected),
                Listen::Wait(listener) => {
                    listener.await;
                    if !self.is_current() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Returns a read guard that allows reading the currently stored value
    /// without considering it seen. The next wait is unaffected.
    pub fn peek(&self) -> ObservableReadGuard<'_, T> {
        ObservableReadGuard(self.tracked.value.read())
    }

    /// Returns a read guard that allows reading the currently stored value,
    /// marking it seen. The next wait will block until another value is
    /// stored.
    pub fn read(&mut self) -> ObservableReadGuard<'_, T> {
        let guard = self.tracked.value.read();
        self.version = self.tracked.current_version();
        ObservableReadGuard(guard)
    }

    /// Returns the currently contained value, marking it seen.
    #[must_use]
    pub fn get(&mut self) -> T
    where
        T: Clone,
    {
        self.read().clone()
    }

    /// Blocks until a value newer than the last one seen has been stored,
    /// then returns a clone of it.
    ///
    /// # Errors
    ///
    /// Returns [`Disconnected`] if all instances of [`Observable`] have been
    /// dropped and the current value has been seen.
    pub fn next_value(&mut self) -> Result<T, Disconnected>
    where
        T: Clone,
    {
        self.changed()?;
        Ok(self.read().clone())
    }

    /// Waits until a value newer than the last one seen has been stored, then
    /// returns a clone of it.
    ///
    /// The async task is safe to be cancelled without losing track of the
    /// last seen value.
    ///
    /// # Errors
    ///
    /// Returns [`Disconnected`] if all instances of [`Observable`] have been
    /// dropped and the current value has been seen.
    pub async fn next_value_async(&mut self) -> Result<T, Disconnected>
    where
        T: Clone,
    {
        self.changed_async().await?;
        Ok(self.read().clone())
    }

    /// Returns this tracker in a type that implements [`Stream`].
    pub fn into_stream(self) -> TrackerStream<T> {
        TrackerStream {
            tracker: self,
            listener: None,
        }
    }
}

impl<T> Iterator for Tracker<T>
where
    T: Clone,
{
    type Item = T;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_value().ok()
    }
}

/// Asynchronous iterator for a [`Tracker`]. Implements [`Stream`].
#[derive(Debug)]
#[must_use]
pub struct TrackerStream<T> {
    tracker: Tracker<T>,
    listener: Option<EventListener>,
}

impl<T> TrackerStream<T> {
    /// Returns the wrapped [`Tracker`].
    pub fn into_inner(self) -> Tracker<T> {
        self.tracker
    }
}

impl<T> Stream for TrackerStream<T>
where
    T: Clone,
{
    type Item = T;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        loop {
            // A listener stored by an earlier pending poll takes priority
            // over registering a new one.
            let listen = match self.listener.take() {
                Some(listener) => Listen::Wait(listener),
                None => self.tracker.listen(),
            };
            match listen {
                Listen::Ready => return Poll::Ready(Some(self.tracker.read().clone())),
                Listen::Closed => return Poll::Ready(None),
                Listen::Wait(mut listener) => match listener.poll_unpin(cx) {
                    Poll::Ready(()) => {
                        if !self.tracker.is_current() {
                            return Poll::Ready(Some(self.tracker.read().clone()));
                        }
                        // Spurious wake-up; a fresh listener is registered on
                        // the next pass.
                    }
                    Poll::Pending => {
                        self.listener = Some(listener);
                        return Poll::Pending;
                    }
                },
            }
        }
    }
}

#[test]
fn basics() {
    let observable = Observable::new(0_i32);
    assert!(!observable.has_subscribers());

    let first = Arc::new(());
    let second = Arc::new(());
    let first_seen = Arc::new(Mutex::new(Vec::new()));
    let second_seen = Arc::new(Mutex::new(Vec::new()));
    let _first_token = observable.subscribe(&first, {
        let seen = first_seen.clone();
        move |value| seen.lock().push(*value)
    });
    let _second_token = observable.subscribe(&second, {
        let seen = second_seen.clone();
        move |value| seen.lock().push(*value)
    });
    assert_eq!(observable.subscribers(), 2);

    observable.set(42);
    observable.set(27);
    assert_eq!(*first_seen.lock(), vec![42, 27]);
    assert_eq!(*second_seen.lock(), vec![42, 27]);

    // Dropping the second observer's identity ends its deliveries without
    // any explicit teardown.
    drop(second);
    observable.set(5);
    assert_eq!(*first_seen.lock(), vec![42, 27, 5]);
    assert_eq!(*second_seen.lock(), vec![42, 27]);
    assert_eq!(observable.subscribers(), 1);
    assert_eq!(observable.get(), 5);
}

#[test]
fn delivery_order() {
    let observable = Observable::new(0_usize);
    let observer = Arc::new(());
    let order = Arc::new(Mutex::new(Vec::new()));
    let mut tokens = Vec::new();
    for index in 0..8 {
        let order = order.clone();
        tokens.push(observable.subscribe(&observer, move |value| order.lock().push((index, *value))));
    }

    observable.set(7);

    let order = order.lock();
    assert_eq!(order.len(), 8);
    for (position, (index, value)) in order.iter().enumerate() {
        assert_eq!(*index, position);
        assert_eq!(*value, 7);
    }
}

#[test]
fn unsubscribe_stops_delivery() {
    let observable = Observable::new(0_u32);
    let observer = Arc::new(());
    let cancelled_seen = Arc::new(Mutex::new(Vec::new()));
    let kept_seen = Arc::new(Mutex::new(Vec::new()));
    let cancelled = observable.subscribe(&observer, {
        let seen = cancelled_seen.clone();
        move |value| seen.lock().push(*value)
    });
    let _kept = observable.subscribe(&observer, {
        let seen = kept_seen.clone();
        move |value| seen.lock().push(*value)
    });

    cancelled.unsubscribe();
    assert!(!cancelled.is_active());
    // Cancelling twice is a no-op.
    cancelled.unsubscribe();
    observable.unsubscribe(&cancelled);

    observable.set(1);
    assert!(cancelled_seen.lock().is_empty());
    assert_eq!(*kept_seen.lock(), vec![1]);
}

#[test]
fn foreign_token_is_ignored() {
    let observable = Observable::new(0_u32);
    let other = Observable::new(0_u32);
    let observer = Arc::new(());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let token = observable.subscribe(&observer, {
        let seen = seen.clone();
        move |value| seen.lock().push(*value)
    });

    other.unsubscribe(&token);
    assert!(token.is_active());
    observable.set(3);
    assert_eq!(*seen.lock(), vec![3]);
}

#[test]
fn dropped_observer_is_skipped() {
    let observable = Observable::new(0_u32);
    let observer = Arc::new(String::from("observer"));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let token = observable.subscribe(&observer, {
        let seen = seen.clone();
        move |value| seen.lock().push(*value)
    });

    observable.set(1);
    drop(observer);
    observable.set(2);

    assert_eq!(*seen.lock(), vec![1]);
    assert!(!token.is_active());
    assert_eq!(observable.subscribers(), 0);
}

#[test]
fn handler_panic_is_isolated() {
    let observable = Observable::new(0_u32);
    let observer = Arc::new(());
    let _panicking = observable.subscribe(&observer, |_| panic!("handler failure"));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let _ok = observable.subscribe(&observer, {
        let seen = seen.clone();
        move |value| seen.lock().push(*value)
    });

    observable.set(9);
    observable.set(10);
    assert_eq!(*seen.lock(), vec![9, 10]);
}

#[test]
fn subscriptions_added_during_notification_wait() {
    let observable = Observable::new(0_u32);
    let observer = Arc::new(());
    let late_seen = Arc::new(Mutex::new(Vec::new()));
    let registered = Arc::new(AtomicBool::new(false));
    let _token = observable.subscribe(&observer, {
        let observable = observable.clone();
        let observer = observer.clone();
        let late_seen = late_seen.clone();
        let registered = registered.clone();
        move |_| {
            if !registered.swap(true, Ordering::SeqCst) {
                let late_seen = late_seen.clone();
                let late =
                    observable.subscribe(&observer, move |value| late_seen.lock().push(*value));
                drop(late);
            }
        }
    });

    // The store that triggered the registration must not reach the new
    // subscription; the next one must.
    observable.set(1);
    assert!(late_seen.lock().is_empty());
    observable.set(2);
    assert_eq!(*late_seen.lock(), vec![2]);
}

#[test]
fn reentrant_set_is_permitted() {
    let observable = Observable::new(0_u32);
    let observer = Arc::new(());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let _echo = observable.subscribe(&observer, {
        let observable = observable.clone();
        move |value| {
            if *value == 1 {
                observable.set(2);
            }
        }
    });
    let _recorder = observable.subscribe(&observer, {
        let seen = seen.clone();
        move |value| seen.lock().push(*value)
    });

    observable.set(1);

    // The nested notification completes before the outer walk resumes.
    assert_eq!(*seen.lock(), vec![2, 1]);
    assert_eq!(observable.get(), 2);
}

#[test]
fn scoped_subscription_ends_on_drop() {
    let observable = Observable::new(0_u32);
    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let _scoped = observable.subscribe_scoped({
            let seen = seen.clone();
            move |value| seen.lock().push(*value)
        });
        observable.set(1);
        observable.set(2);
    }
    observable.set(3);

    assert_eq!(*seen.lock(), vec![1, 2]);
    assert_eq!(observable.subscribers(), 0);
}

#[test]
fn update_skips_equal_values() {
    let observable = Observable::new(1_u32);
    let observer = Arc::new(());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let _token = observable.subscribe(&observer, {
        let seen = seen.clone();
        move |value| seen.lock().push(*value)
    });

    assert!(observable.update(1).is_err());
    assert_eq!(observable.update(2), Ok(1));
    assert_eq!(observable.replace(3), 2);
    assert_eq!(*seen.lock(), vec![2, 3]);
}

#[test]
fn modify_notifies_with_result() {
    let observable = Observable::new(vec![1_u32]);
    let observer = Arc::new(());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let _token = observable.subscribe(&observer, {
        let seen = seen.clone();
        move |value: &Vec<u32>| seen.lock().push(value.clone())
    });

    let len = observable.modify(|values| {
        values.push(2);
        values.len()
    });

    assert_eq!(len, 2);
    assert_eq!(*seen.lock(), vec![vec![1, 2]]);
}

#[test]
fn accessing_values() {
    let observable = Observable::new(String::from("hello"));
    assert_eq!(observable.get(), "hello");
    assert_eq!(&*observable.read(), "hello");

    let mut tracker = observable.track();
    assert_eq!(tracker.get(), "hello");
    assert_eq!(&*tracker.read(), "hello");
    assert_eq!(&*tracker.peek(), "hello");
}

#[test]
fn concurrent_sets_notify_every_time() {
    let observable = Observable::new(0_usize);
    let observer = Arc::new(());
    let deliveries = Arc::new(AtomicUsize::new(0));
    let _token = observable.subscribe(&observer, {
        let deliveries = deliveries.clone();
        move |_| {
            deliveries.fetch_add(1, Ordering::SeqCst);
        }
    });

    let mut workers = Vec::new();
    for _ in 0..4 {
        let observable = observable.clone();
        workers.push(std::thread::spawn(move || {
            for i in 1..=250 {
                observable.set(i);
            }
        }));
    }
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(deliveries.load(Ordering::SeqCst), 1000);
}

#[test]
fn tracker_basics() {
    let observable = Observable::new(1_u32);
    assert!(!observable.has_trackers());
    let mut tracker = observable.track();
    assert_eq!(observable.trackers(), 1);
    assert!(!tracker.mark_seen());

    observable.replace(2);
    // The wait should not block since the value has already been stored.
    tracker.changed().unwrap();
    // Peeking shouldn't mark the value seen.
    assert_eq!(*tracker.peek(), 2);
    tracker.changed().unwrap();
    assert_eq!(*tracker.read(), 2);
    assert!(!tracker.mark_seen());

    let mut cloned = tracker.clone();
    assert_eq!(observable.trackers(), 2);
    observable.replace(3);
    assert!(cloned.mark_seen());
    drop(cloned);
    drop(tracker);
    assert_eq!(observable.trackers(), 0);
}

#[test]
fn tracker_blocking() {
    let observable = Observable::new(1_u32);
    let mut tracker = observable.track();
    let worker = std::thread::spawn(move || {
        tracker.changed().unwrap();
        assert_eq!(*tracker.read(), 2);
        tracker.changed().unwrap();
        *tracker.read()
    });

    observable.replace(2);
    std::thread::sleep(Duration::from_millis(50));
    assert!(observable.update(42).is_ok());
    assert!(observable.update(42).is_err());

    assert_eq!(worker.join().unwrap(), 42);
}

#[test]
fn tracker_timeouts() {
    let observable = Observable::new(1_u32);
    let tracker = observable.track();
    let start = Instant::now();
    assert!(matches!(
        tracker.changed_timeout(Duration::from_millis(100)),
        Err(TimeoutError::Timeout)
    ));
    assert!(matches!(
        tracker.changed_deadline(Instant::now() + Duration::from_millis(100)),
        Err(TimeoutError::Timeout)
    ));
    // We don't control the delay logic, so to ensure this test is stable,
    // we're comparing against a duration slightly less than 200ms even though
    // in theory that shouldn't be possible.
    assert!(start.elapsed().as_millis() >= 180);

    // Both waits return promptly when a new value is available.
    observable.replace(2);
    tracker.changed_timeout(Duration::from_secs(1)).unwrap();
    observable.replace(3);
    tracker
        .changed_deadline(Instant::now() + Duration::from_secs(1))
        .unwrap();
}

#[test]
fn disconnect_on_last_owner_drop() {
    let observable = Observable::new(0_u32);
    let second_owner = observable.clone();
    let observer = Arc::new(());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let subscription = observable.subscribe(&observer, {
        let seen = seen.clone();
        move |value| seen.lock().push(*value)
    });
    let mut tracker = observable.track();

    observable.replace(1);
    drop(observable);
    // A remaining owner keeps the stream alive.
    second_owner.replace(2);
    assert_eq!(*seen.lock(), vec![1, 2]);
    drop(second_owner);

    // The final value is still readable once, then the tracker reports the
    // disconnect and the subscription token reports inactive.
    assert_eq!(tracker.next_value().unwrap(), 2);
    assert!(matches!(tracker.next_value().unwrap_err(), Disconnected));
    assert!(!subscription.is_active());
}

#[test]
fn tracker_iterator() {
    let observable = Observable::new(0_u32);
    let mut tracker = observable.track();
    let worker = std::thread::spawn(move || {
        let mut last_value = tracker.next_value().unwrap();
        for value in tracker {
            // Values coalesce but always move forward.
            assert!(value > last_value);
            last_value = value;
        }
        assert_eq!(last_value, 100);
    });

    for i in 1..=100 {
        observable.replace(i);
    }
    drop(observable);
    worker.join().unwrap();
}

#[test]
fn stress_test() {
    let observable = Observable::new(0_u32);
    let mut workers = Vec::new();
    for _ in 0..8 {
        let mut tracker = observable.track();
        workers.push(std::thread::spawn(move || {
            let mut last_value = *tracker.read();
            while tracker.changed().is_ok() {
                let current_value = *tracker.read();
                assert!(current_value > last_value);
                last_value = current_value;
            }
            assert_eq!(last_value, 2000);
        }));
    }

    for i in 1..=2000 {
        let _ = observable.update(i);
    }
    drop(observable);

    for worker in workers {
        worker.join().unwrap();
    }
}

#[cfg(test)]
#[tokio::test(flavor = "multi_thread")]
async fn stream_test() {
    use futures_util::StreamExt;

    let observable = Observable::<u32>::default();
    let mut tracker = observable.track();
    let worker = tokio::task::spawn(async move {
        let mut last_value = tracker.next_value_async().await.unwrap();
        let mut stream = tracker.into_stream();
        while let Some(value) = stream.next().await {
            assert!(value > last_value);
            last_value = value;
        }
        assert_eq!(last_value, 500);

        // Ensure it's safe to poll again with no blocking and no panics.
        assert!(stream.next().await.is_none());

        // Convert back to a normal tracker and check that the state still
        // matches.
        let mut tracker = stream.into_inner();
        assert!(!tracker.mark_seen());
    });

    for i in 1..=500 {
        observable.replace(i);
        if i % 100 == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    // Allow the stream to end.
    drop(observable);

    worker.await.unwrap();
}

#[test]
fn shutdown() {
    let observable = Observable::new(0_u32);
    let observer = Arc::new(());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let subscription = observable.subscribe(&observer, {
        let seen = seen.clone();
        move |value| seen.lock().push(*value)
    });
    let mut tracker = observable.track();

    // Store a new value, then shut down.
    observable.replace(1);
    observable.shutdown();

    // The value should still be accessible to the tracker.
    assert_eq!(tracker.next_value().expect("final value missing"), 1);
    tracker
        .next_value()
        .expect_err("tracker should be disconnected");

    // Subscriptions were cancelled; further stores deliver nothing new.
    assert!(!subscription.is_active());
    observable.replace(2);
    assert_eq!(*seen.lock(), vec![1]);
}
