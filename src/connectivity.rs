//! Online/offline signal.
//!
//! The platform (or the CLI's probe loop) feeds raw observations in through
//! [`Connectivity::set_online`]. Subscribers are told about transitions only,
//! never about repeated reports of the same state. Async consumers use the
//! `watch` channel from [`Connectivity::watch`]; plain callbacks go through
//! [`Connectivity::subscribe`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::watch;

type Listener = Arc<dyn Fn(bool) + Send + Sync>;

struct Inner {
    online: AtomicBool,
    tx: watch::Sender<bool>,
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_listener: AtomicU64,
}

/// Shared handle; clones observe and feed the same state.
#[derive(Clone)]
pub struct Connectivity {
    inner: Arc<Inner>,
}

impl Connectivity {
    pub fn new(initially_online: bool) -> Self {
        let (tx, _rx) = watch::channel(initially_online);
        Self {
            inner: Arc::new(Inner {
                online: AtomicBool::new(initially_online),
                tx,
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(1),
            }),
        }
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::Acquire)
    }

    /// Record an observation. Returns true if it changed the state, in which
    /// case watchers and callbacks have been notified.
    pub fn set_online(&self, online: bool) -> bool {
        let previous = self.inner.online.swap(online, Ordering::AcqRel);
        if previous == online {
            return false;
        }
        self.inner.tx.send_replace(online);
        let listeners: Vec<Listener> = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(online);
        }
        true
    }

    /// Register a transition callback. It stays registered until the returned
    /// [`Subscription`] is dropped or explicitly unsubscribed.
    #[must_use = "dropping the subscription unsubscribes immediately"]
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(callback)));
        Subscription {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Receiver that observes every settled state change.
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.inner.tx.subscribe()
    }
}

pub struct Subscription {
    id: u64,
    inner: Weak<Inner>,
}

impl Subscription {
    /// Drop the subscription; the callback is removed by `Drop`.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner
                .listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|(id, _)| *id != self.id);
        }
    }
}
