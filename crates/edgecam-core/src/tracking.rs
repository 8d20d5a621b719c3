// ── Reactive tracking variables ──
//
// An observable value with an async subscriber list. Committing a new
// value invokes each subscriber with `(new, old)` in registration order,
// one at a time. Commits to the same variable are serialized, so
// subscribers never overlap and always see changes in commit order.
// A value equal to the current one is not a change and notifies nobody.
//
// Every commit is mirrored into a `watch` channel for pull-style readers
// (`changed().await` loops, `Stream`s).

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::BoxFuture;
use tokio::sync::watch;

use crate::stream::VariableStream;

type Subscriber<T> = Arc<dyn Fn(T, Option<T>) -> BoxFuture<'static, ()> + Send + Sync>;

struct Slot<T> {
    current: Option<T>,
    previous: Option<T>,
}

/// Observable value of type `T`.
pub struct TrackingVariable<T> {
    slot: Mutex<Slot<T>>,
    subscribers: Mutex<Vec<Subscriber<T>>>,
    commit: tokio::sync::Mutex<()>,
    watch: watch::Sender<Option<T>>,
}

impl<T> TrackingVariable<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// An empty variable.
    pub fn new() -> Self {
        Self::from_option(None)
    }

    /// A variable holding `value`. No subscriber has seen it.
    pub fn with_value(value: T) -> Self {
        Self::from_option(Some(value))
    }

    fn from_option(value: Option<T>) -> Self {
        let (watch, _) = watch::channel(value.clone());
        Self {
            slot: Mutex::new(Slot {
                current: value,
                previous: None,
            }),
            subscribers: Mutex::new(Vec::new()),
            commit: tokio::sync::Mutex::new(()),
            watch,
        }
    }

    pub fn value(&self) -> Option<T> {
        self.lock_slot().current.clone()
    }

    pub fn previous(&self) -> Option<T> {
        self.lock_slot().previous.clone()
    }

    /// Register an async subscriber, invoked on every committed change.
    pub fn subscribe_async<F, Fut>(&self, callback: F)
    where
        F: Fn(T, Option<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let subscriber: Subscriber<T> = Arc::new(move |new, old| Box::pin(callback(new, old)));
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(subscriber);
    }

    /// Commit `value` and notify subscribers. Returns `false` (and notifies
    /// nobody) when `value` equals the current value.
    pub async fn aset(&self, value: T) -> bool {
        let _commit = self.commit.lock().await;

        let old = {
            let mut slot = self.lock_slot();
            if slot.current.as_ref() == Some(&value) {
                return false;
            }
            let old = slot.current.replace(value.clone());
            slot.previous.clone_from(&old);
            old
        };

        self.watch.send_replace(Some(value.clone()));

        let subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for subscriber in subscribers {
            subscriber(value.clone(), old.clone()).await;
        }
        true
    }

    /// Receiver of every committed value.
    pub fn watch(&self) -> watch::Receiver<Option<T>> {
        self.watch.subscribe()
    }

    /// Subscription handle with snapshot access and `Stream` conversion.
    pub fn stream(&self) -> VariableStream<T> {
        VariableStream::new(self.watch.subscribe())
    }

    fn lock_slot(&self) -> std::sync::MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Default for TrackingVariable<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for TrackingVariable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("TrackingVariable")
            .field("current", &slot.current)
            .field("previous", &slot.previous)
            .finish_non_exhaustive()
    }
}
