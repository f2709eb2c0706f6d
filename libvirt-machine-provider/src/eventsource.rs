//! List-watch fan-out from a `Store` into handler registrations.
//!
//! Mirrors the teacher's single dispatch loop: one task drains the
//! store's broadcast channel and invokes every registered handler in
//! turn, so handlers observe events in the same order they were
//! published, with no weakening of ordering across handlers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::warn;

use crate::store::{Event, Store, StoreObject};

pub type HandlerId = u64;

type Handler<T> = Box<dyn Fn(Event<T>) + Send + Sync>;

struct Registered<T> {
    id: HandlerId,
    handler: Handler<T>,
}

/// Drives handler dispatch for one object kind. Construction performs an
/// initial `List` synchronously so callers can rely on synthetic `Added`
/// events having already fired once `run` starts.
pub struct EventSource<T: StoreObject> {
    store: Arc<dyn Store<T>>,
    handlers: Arc<Mutex<Vec<Registered<T>>>>,
    next_id: AtomicU64,
}

impl<T: StoreObject> EventSource<T> {
    pub fn new(store: Arc<dyn Store<T>>) -> Self {
        Self {
            store,
            handlers: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }

    pub async fn add_handler<F>(&self, f: F) -> HandlerId
    where
        F: Fn(Event<T>) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.handlers.lock().await.push(Registered {
            id,
            handler: Box::new(f),
        });
        id
    }

    pub async fn remove_handler(&self, id: HandlerId) {
        self.handlers.lock().await.retain(|r| r.id != id);
    }

    /// Replays the current store contents as synthetic `Added` events,
    /// then forwards every subsequent `Watch` event to all handlers,
    /// until the store's broadcast channel closes. Re-subscribes after a
    /// lagged receiver (a handler fell behind the broadcast buffer) by
    /// re-listing, matching the store's "re-list after backoff" contract
    /// for transient backend gaps.
    pub async fn run(&self) {
        self.dispatch_initial_list().await;

        let mut rx = self.store.subscribe();
        loop {
            match rx.recv().await {
                Ok(event) => self.dispatch(event).await,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "event source lagged, re-listing");
                    self.dispatch_initial_list().await;
                    rx = self.store.subscribe();
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    async fn dispatch_initial_list(&self) {
        match self.store.list().await {
            Ok(objects) => {
                for object in objects {
                    self.dispatch(Event::added(object)).await;
                }
            }
            Err(e) => warn!(error = %e, "initial list failed"),
        }
    }

    async fn dispatch(&self, event: Event<T>) {
        let handlers = self.handlers.lock().await;
        for registered in handlers.iter() {
            (registered.handler)(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Machine, MachineStatus};
    use crate::store::FileStore;
    use std::sync::atomic::AtomicUsize;

    fn machine(uid: &str) -> Machine {
        Machine {
            uid: uid.to_string(),
            generation: 0,
            memory_bytes: 0,
            cpu_millis: 0,
            image: None,
            ignition: None,
            volumes: vec![],
            network_interfaces: vec![],
            class: "default".to_string(),
            finalizers: Default::default(),
            deleted_at: None,
            status: MachineStatus::default(),
        }
    }

    #[tokio::test]
    async fn initial_list_replays_as_added() {
        let tmp = tempfile::tempdir().unwrap();
        let store: Arc<dyn Store<Machine>> =
            Arc::new(FileStore::load(tmp.path(), "machine").await.unwrap());
        store.create(machine("m1")).await.unwrap();

        let source = EventSource::new(store.clone());
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        source
            .add_handler(move |_e| {
                seen2.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        let run = tokio::spawn(async move { source.run().await });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        run.abort();

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
