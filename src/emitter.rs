//! Named-event listener registry with concurrent dispatch.
//!
//! An [`Emitter`] holds an ordered list of listeners per event name. [`Emitter::emit`]
//! snapshots the list under a read lock, runs every listener on its own task and waits
//! for all of them. A panicking listener is logged and never takes its siblings or the
//! caller down with it.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use tokio::task::JoinSet;
use tracing::error;

/// An async callback invoked with the emitted payload.
pub type Listener<T> = Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure into a [`Listener`].
pub fn listener<T, F, Fut>(f: F) -> Listener<T>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |payload| Box::pin(f(payload)))
}

/// Handle returned at registration, used to remove exactly one listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerToken(u64);

impl fmt::Display for ListenerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener#{}", self.0)
    }
}

struct Entry<T> {
    token: ListenerToken,
    listener: Listener<T>,
    /// Set for `register_once` entries; flips to true on first dispatch.
    fired: Option<Arc<AtomicBool>>,
}

impl<T> Clone for Entry<T> {
    fn clone(&self) -> Self {
        Self {
            token: self.token,
            listener: Arc::clone(&self.listener),
            fired: self.fired.clone(),
        }
    }
}

pub struct Emitter<T> {
    listeners: RwLock<HashMap<String, Vec<Entry<T>>>>,
    next_token: AtomicU64,
}

impl<T> Default for Emitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Emitter<T> {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
            next_token: AtomicU64::new(0),
        }
    }

    /// Append a listener for `event`.
    ///
    /// # Panics
    ///
    /// Panics if `event` is empty. That is a wiring bug, not runtime input.
    pub fn register(&self, event: &str, listener: Listener<T>) -> ListenerToken {
        self.insert(event, listener, false)
    }

    /// Like [`register`](Self::register), but the listener is removed after it first runs.
    ///
    /// # Panics
    ///
    /// Panics if `event` is empty.
    pub fn register_once(&self, event: &str, listener: Listener<T>) -> ListenerToken {
        self.insert(event, listener, true)
    }

    fn insert(&self, event: &str, listener: Listener<T>, once: bool) -> ListenerToken {
        assert!(!event.is_empty(), "event name cannot be empty");

        let token = ListenerToken(self.next_token.fetch_add(1, Ordering::Relaxed) + 1);
        let entry = Entry {
            token,
            listener,
            fired: once.then(|| Arc::new(AtomicBool::new(false))),
        };

        self.listeners
            .write()
            .entry(event.to_owned())
            .or_default()
            .push(entry);
        token
    }

    /// Remove the listener registered under `token`. Returns whether one was removed.
    pub fn unregister(&self, event: &str, token: ListenerToken) -> bool {
        self.remove_first(event, |entry| entry.token == token)
    }

    /// Remove the first listener that is the same allocation as `listener`.
    ///
    /// Only reliable for listeners kept around and re-used (clones of the same `Arc`).
    /// Two closures with identical bodies are distinct listeners and never match.
    pub fn unregister_by_identity(&self, event: &str, listener: &Listener<T>) -> bool {
        self.remove_first(event, |entry| Arc::ptr_eq(&entry.listener, listener))
    }

    fn remove_first(&self, event: &str, matches: impl Fn(&Entry<T>) -> bool) -> bool {
        let mut listeners = self.listeners.write();
        let Some(list) = listeners.get_mut(event) else {
            return false;
        };

        match list.iter().position(matches) {
            Some(index) => {
                list.remove(index);
                true
            }
            None => false,
        }
    }

    /// Drop every listener registered for `event`.
    pub fn remove_all(&self, event: &str) {
        self.listeners.write().remove(event);
    }

    pub fn event_names(&self) -> Vec<String> {
        self.listeners.read().keys().cloned().collect()
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners.read().get(event).map_or(0, Vec::len)
    }
}

impl<T: Clone + Send + 'static> Emitter<T> {
    /// Dispatch `payload` to every listener of `event` concurrently and wait for all.
    ///
    /// Listeners added or removed while a dispatch is running only affect later emits.
    pub async fn emit(&self, event: &str, payload: T) {
        let snapshot: Vec<Entry<T>> = self
            .listeners
            .read()
            .get(event)
            .map(|list| list.to_vec())
            .unwrap_or_default();

        if snapshot.is_empty() {
            return;
        }

        let mut tasks = JoinSet::new();
        let mut fired = Vec::new();

        for entry in snapshot {
            if let Some(flag) = &entry.fired {
                // a concurrent emit already claimed this once-listener
                if flag.swap(true, Ordering::AcqRel) {
                    continue;
                }
                fired.push(entry.token);
            }

            let payload = payload.clone();
            let listener = entry.listener;
            tasks.spawn(async move { listener(payload).await });
        }

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                if e.is_panic() {
                    error!(
                        "Listener panicked on event {:?}: {}",
                        event,
                        panic_message(e.into_panic())
                    );
                } else {
                    error!("Listener task on event {:?} was cancelled", event);
                }
            }
        }

        if !fired.is_empty() {
            let mut listeners = self.listeners.write();
            if let Some(list) = listeners.get_mut(event) {
                list.retain(|entry| !fired.contains(&entry.token));
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
