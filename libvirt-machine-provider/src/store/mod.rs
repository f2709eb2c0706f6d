//! Durable on-disk object store keyed by UID.
//!
//! One JSON file per object under a directory; `update` is optimistic via
//! a generation counter, `watch` fans out through a `tokio::sync::broadcast`
//! channel — mirroring the teacher's `DataStore::subscribe() ->
//! broadcast::Receiver<Event>` shape, but backed by the filesystem instead
//! of a raft log since this daemon is single-host.

pub mod error;
pub mod event;

mod file_store;

pub use error::{Result, StoreError};
pub use event::{Event, EventType};
pub use file_store::FileStore;

use async_trait::async_trait;
use tokio::sync::broadcast;

/// An object a `Store` can persist: addressable by UID, versioned by a
/// generation counter bumped on every successful `update`.
pub trait StoreObject: Clone + Send + Sync + 'static {
    fn uid(&self) -> &str;
    fn set_uid(&mut self, uid: String);
    fn generation(&self) -> u64;
    fn set_generation(&mut self, generation: u64);
}

#[async_trait]
pub trait Store<T: StoreObject>: Send + Sync {
    async fn get(&self, uid: &str) -> Result<T>;
    async fn list(&self) -> Result<Vec<T>>;
    /// Assigns `object.uid()` if empty and persists it; fails with
    /// `AlreadyExists` if the UID is already taken.
    async fn create(&self, object: T) -> Result<T>;
    /// Optimistic update: `object.generation()` must match the stored
    /// generation or this fails with `Conflict`.
    async fn update(&self, object: T) -> Result<T>;
    async fn delete(&self, uid: &str) -> Result<()>;
    fn subscribe(&self) -> broadcast::Receiver<Event<T>>;
}

impl StoreObject for crate::model::Machine {
    fn uid(&self) -> &str {
        &self.uid
    }

    fn set_uid(&mut self, uid: String) {
        self.uid = uid;
    }

    fn generation(&self) -> u64 {
        self.generation
    }

    fn set_generation(&mut self, generation: u64) {
        self.generation = generation;
    }
}

impl StoreObject for crate::model::Volume {
    fn uid(&self) -> &str {
        &self.uid
    }

    fn set_uid(&mut self, uid: String) {
        self.uid = uid;
    }

    fn generation(&self) -> u64 {
        self.generation
    }

    fn set_generation(&mut self, generation: u64) {
        self.generation = generation;
    }
}
