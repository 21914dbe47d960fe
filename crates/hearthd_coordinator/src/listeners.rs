//! Subscriber bookkeeping and fan-out.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::Weak;

use tokio::sync::mpsc;
use tracing::error;
use tracing::warn;

use crate::error::panic_message;

type Callback<E> = Arc<dyn Fn(&E) -> anyhow::Result<()> + Send + Sync>;

/// Identifies a registered listener for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerHandle(u64);

/// Registry of callbacks notified with events of type `E`.
pub struct ListenerRegistry<E> {
    entries: Arc<Mutex<Entries<E>>>,
}

struct Entries<E> {
    next_id: u64,
    listeners: HashMap<u64, Callback<E>>,
}

impl<E: 'static> ListenerRegistry<E> {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(Entries {
                next_id: 0,
                listeners: HashMap::new(),
            })),
        }
    }

    /// Register `callback`. Listeners are notified in registration order.
    pub fn add_listener<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(&E) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut entries = lock(&self.entries);
        let id = entries.next_id;
        entries.next_id += 1;
        entries.listeners.insert(id, Arc::new(callback));
        ListenerHandle(id)
    }

    /// Unregister a listener. Returns `false` if it was already gone.
    ///
    /// Safe to call from inside a callback; the removed listener is skipped
    /// for the rest of an ongoing pass.
    pub fn remove_listener(&self, handle: ListenerHandle) -> bool {
        lock(&self.entries).listeners.remove(&handle.0).is_some()
    }

    /// Deliver `event` to every listener registered when the pass starts.
    ///
    /// Listeners added during the pass are not called until the next one.
    /// A listener that returns an error or panics is logged and skipped;
    /// the others still run. Returns the number of listeners invoked.
    pub fn notify_all(&self, event: &E) -> usize {
        let mut snapshot: Vec<(u64, Callback<E>)> = lock(&self.entries)
            .listeners
            .iter()
            .map(|(id, callback)| (*id, Arc::clone(callback)))
            .collect();
        snapshot.sort_unstable_by_key(|(id, _)| *id);

        let mut invoked = 0;
        for (id, callback) in snapshot {
            let registered = lock(&self.entries).listeners.contains_key(&id);
            if !registered {
                continue;
            }
            invoked += 1;
            match std::panic::catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(listener = id, error = %e, "Listener failed"),
                Err(payload) => error!(
                    listener = id,
                    panic = %panic_message(&*payload),
                    "Listener panicked"
                ),
            }
        }
        invoked
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E: Clone + Send + 'static> ListenerRegistry<E> {
    /// Register a channel-backed listener.
    ///
    /// Every notified event is cloned into the returned [`Subscription`]; the
    /// listener is removed when the subscription is dropped.
    pub fn subscribe(&self) -> Subscription<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self.add_listener(move |event: &E| {
            tx.send(event.clone())
                .map_err(|_| anyhow::anyhow!("subscriber went away"))
        });
        Subscription {
            rx,
            handle,
            entries: Arc::downgrade(&self.entries),
        }
    }
}

impl<E: 'static> Default for ListenerRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for ListenerRegistry<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &lock(&self.entries).listeners.len())
            .finish()
    }
}

fn lock<E>(entries: &Mutex<Entries<E>>) -> MutexGuard<'_, Entries<E>> {
    entries.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Receiving end of [`ListenerRegistry::subscribe`].
pub struct Subscription<E> {
    rx: mpsc::UnboundedReceiver<E>,
    handle: ListenerHandle,
    entries: Weak<Mutex<Entries<E>>>,
}

impl<E> Subscription<E> {
    /// Wait for the next event. Returns `None` once the registry is gone.
    pub async fn recv(&mut self) -> Option<E> {
        self.rx.recv().await
    }

    /// Take an already delivered event without waiting.
    pub fn try_recv(&mut self) -> Option<E> {
        self.rx.try_recv().ok()
    }

    pub fn handle(&self) -> ListenerHandle {
        self.handle
    }
}

impl<E> Drop for Subscription<E> {
    fn drop(&mut self) {
        if let Some(entries) = self.entries.upgrade() {
            lock(&entries).listeners.remove(&self.handle.0);
        }
    }
}

#[cfg(test)]
mod tests;
