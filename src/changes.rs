//! Change notification plumbing.
//!
//! Subscribers register a callback and get back a [`Subscription`] handle; dropping
//! or cancelling the handle unregisters the callback. Nothing here recomputes
//! anything: a subscriber reacts by refetching and re-running the pure report
//! functions on the fresh snapshot.

use crate::schema::RecordId;
use futures::channel::mpsc::{unbounded, UnboundedReceiver};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Callback registry shared by the change feed and the session watcher.
pub(crate) struct Registry<T> {
    next_id: AtomicU64,
    callbacks: Mutex<BTreeMap<u64, Callback<T>>>,
}

impl<T: 'static> Registry<T> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            callbacks: Mutex::new(BTreeMap::new()),
        })
    }

    pub(crate) fn register(self: &Arc<Self>, callback: Callback<T>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut callbacks) = self.callbacks.lock() {
            callbacks.insert(id, callback);
        }

        let registry = Arc::downgrade(self);
        Subscription {
            id,
            cancel: Some(Box::new(move || {
                if let Some(registry) = registry.upgrade() {
                    registry.remove(id);
                }
            })),
        }
    }

    fn remove(&self, id: u64) {
        if let Ok(mut callbacks) = self.callbacks.lock() {
            callbacks.remove(&id);
        }
    }

    /// Callbacks run outside the lock so they may subscribe or cancel freely.
    pub(crate) fn notify(&self, value: &T) {
        let callbacks: Vec<Callback<T>> = match self.callbacks.lock() {
            Ok(callbacks) => callbacks.values().cloned().collect(),
            Err(_) => return,
        };
        for callback in callbacks {
            callback(value);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.callbacks.lock().map(|c| c.len()).unwrap_or(0)
    }
}

/// Handle returned by every `subscribe` call. Unsubscribes on `cancel` or drop.
pub struct Subscription {
    id: u64,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cancel(mut self) {
        self.run_cancel();
    }

    fn run_cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.run_cancel();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeTable {
    Members,
    Meals,
    Bazar,
    Deposits,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: ChangeTable,
    pub kind: ChangeKind,
    pub row_id: Option<RecordId>,
}

/// Row-change notifications published by a data store.
#[derive(Clone)]
pub struct ChangeFeed {
    registry: Arc<Registry<ChangeEvent>>,
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeFeed {
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
        }
    }

    pub fn publish(&self, event: ChangeEvent) {
        debug!("Change on {:?}: {:?} {:?}", event.table, event.kind, event.row_id);
        self.registry.notify(&event);
    }

    /// Calls `callback` for events on any of `tables` (all tables when empty).
    pub fn subscribe<F>(&self, tables: &[ChangeTable], callback: F) -> Subscription
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let tables = tables.to_vec();
        self.registry.register(Arc::new(move |event: &ChangeEvent| {
            if tables.is_empty() || tables.contains(&event.table) {
                callback(event);
            }
        }))
    }

    /// Channel flavour of [`subscribe`](Self::subscribe) for async consumers.
    pub fn subscribe_channel(
        &self,
        tables: &[ChangeTable],
    ) -> (Subscription, UnboundedReceiver<ChangeEvent>) {
        let (sender, receiver) = unbounded();
        let subscription = self.subscribe(tables, move |event| {
            let _ = sender.unbounded_send(event.clone());
        });
        (subscription, receiver)
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.len()
    }
}
