//! Keyed handler lists with removal by handle.
//!
//! Every [`HandlerRegistry::add`] returns a fresh [`HandlerId`]; removal
//! takes that id, so two registrations of identical closures stay
//! independent. Dispatch runs on a snapshot of the list, so handlers may add
//! or remove handlers (including themselves) while being invoked.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque handle of one registration. Unique for the life of the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl HandlerId {
    fn next() -> Self {
        Self(NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

/// A registered callback.
pub type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Ordered callbacks per key.
pub struct HandlerRegistry<K, T> {
    handlers: Mutex<HashMap<K, Vec<(HandlerId, Handler<T>)>>>,
}

impl<K, T> Default for HandlerRegistry<K, T> {
    fn default() -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, T> fmt::Debug for HandlerRegistry<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers = self.handlers.lock();
        f.debug_struct("HandlerRegistry")
            .field("keys", &handlers.len())
            .field("handlers", &handlers.values().map(Vec::len).sum::<usize>())
            .finish()
    }
}

impl<K: Eq + Hash, T> HandlerRegistry<K, T> {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `handler` to the list for `key`.
    pub fn add(&self, key: K, handler: Handler<T>) -> HandlerId {
        let id = HandlerId::next();
        self.handlers.lock().entry(key).or_default().push((id, handler));
        id
    }

    /// Remove the registration `id` under `key`. Returns whether it existed.
    pub fn remove<Q>(&self, key: &Q, id: HandlerId) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        let mut handlers = self.handlers.lock();
        let Some(list) = handlers.get_mut(key) else {
            return false;
        };
        let before = list.len();
        list.retain(|(h, _)| *h != id);
        let removed = list.len() != before;
        if list.is_empty() {
            let _ = handlers.remove(key);
        }
        removed
    }

    /// Invoke every handler for `key` in registration order.
    ///
    /// Returns how many handlers were invoked.
    pub fn dispatch<Q>(&self, key: &Q, payload: &T) -> usize
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        let snapshot: Vec<Handler<T>> = match self.handlers.lock().get(key) {
            Some(list) => list.iter().map(|(_, h)| Arc::clone(h)).collect(),
            None => return 0,
        };
        for handler in &snapshot {
            handler(payload);
        }
        snapshot.len()
    }

    /// Number of handlers registered for `key`.
    pub fn count<Q>(&self, key: &Q) -> usize
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.handlers.lock().get(key).map_or(0, Vec::len)
    }

    /// Total number of registrations.
    pub fn len(&self) -> usize {
        self.handlers.lock().values().map(Vec::len).sum()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every registration.
    pub fn clear(&self) {
        self.handlers.lock().clear();
    }
}
