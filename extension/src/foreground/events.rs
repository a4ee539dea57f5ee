// Page-side event emitter for notifications pushed by the wallet

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
pub struct EventEmitter {
    listeners: Mutex<HashMap<String, Vec<(ListenerId, Listener)>>>,
    next_id: AtomicU64,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// `events.on(name, handler)`
    pub fn on<F>(&self, name: &str, listener: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .entry(name.to_string())
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    pub fn off(&self, name: &str, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let Some(list) = listeners.get_mut(name) else {
            return false;
        };
        let before = list.len();
        list.retain(|(listener, _)| *listener != id);
        before != list.len()
    }

    /// Call every listener of `name`; returns how many ran
    pub fn emit(&self, name: &str, value: &Value) -> usize {
        // listeners may register others, so call them unlocked
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .get(name)
            .map(|list| list.iter().map(|(_, listener)| listener.clone()).collect())
            .unwrap_or_default();
        for listener in &listeners {
            listener(value);
        }
        listeners.len()
    }

    pub fn listener_count(&self, name: &str) -> usize {
        self.listeners.lock().get(name).map_or(0, Vec::len)
    }
}
