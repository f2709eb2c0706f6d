use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::{Event, EventType, Result, Store, StoreError, StoreObject};

const BROADCAST_CAPACITY: usize = 256;

/// One JSON file per object under `dir`. An in-memory `HashMap` mirrors
/// the directory contents so `list`/`get` don't re-read the filesystem
/// on every call; every mutation writes through before updating it.
pub struct FileStore<T> {
    dir: PathBuf,
    kind: &'static str,
    objects: Mutex<HashMap<String, T>>,
    tx: broadcast::Sender<Event<T>>,
}

impl<T> FileStore<T>
where
    T: StoreObject + Serialize + DeserializeOwned,
{
    pub async fn load(dir: impl Into<PathBuf>, kind: &'static str) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_err(kind, "<dir>", e))?;

        let mut objects = HashMap::new();
        let mut entries = fs::read_dir(&dir).await.map_err(|e| io_err(kind, "<dir>", e))?;
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_err(kind, "<dir>", e))? {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let uid = entry.file_name().to_string_lossy().into_owned();
            let bytes = fs::read(&path).await.map_err(|e| io_err(kind, &uid, e))?;
            let object: T = serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
                kind,
                uid: uid.clone(),
                source: e,
            })?;
            objects.insert(uid, object);
        }

        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Ok(Self {
            dir,
            kind,
            objects: Mutex::new(objects),
            tx,
        })
    }

    fn path(&self, uid: &str) -> PathBuf {
        self.dir.join(uid)
    }

    async fn write_through(&self, uid: &str, object: &T) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(object).map_err(|e| StoreError::Corrupt {
            kind: self.kind,
            uid: uid.to_string(),
            source: e,
        })?;
        let path = self.path(uid);
        fs::write(&path, bytes).await.map_err(|e| io_err(self.kind, uid, e))?;
        crate::paths::set_file_mode(&path, crate::paths::FILE_MODE_RW)
            .await
            .map_err(|e| io_err(self.kind, uid, std::io::Error::other(e.to_string())))
    }
}

fn io_err(kind: &'static str, uid: &str, source: std::io::Error) -> StoreError {
    StoreError::Io {
        kind,
        uid: uid.to_string(),
        source,
    }
}

#[async_trait]
impl<T> Store<T> for FileStore<T>
where
    T: StoreObject + Serialize + DeserializeOwned,
{
    async fn get(&self, uid: &str) -> Result<T> {
        self.objects
            .lock()
            .unwrap()
            .get(uid)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: self.kind,
                uid: uid.to_string(),
            })
    }

    async fn list(&self) -> Result<Vec<T>> {
        Ok(self.objects.lock().unwrap().values().cloned().collect())
    }

    async fn create(&self, mut object: T) -> Result<T> {
        if object.uid().is_empty() {
            object.set_uid(Uuid::new_v4().to_string());
        }
        let uid = object.uid().to_string();

        {
            let mut objects = self.objects.lock().unwrap();
            if objects.contains_key(&uid) {
                return Err(StoreError::AlreadyExists {
                    kind: self.kind,
                    uid,
                });
            }
            object.set_generation(1);
            objects.insert(uid.clone(), object.clone());
        }
        self.write_through(&uid, &object).await?;
        let _ = self.tx.send(Event::added(object.clone()));
        Ok(object)
    }

    async fn update(&self, mut object: T) -> Result<T> {
        let uid = object.uid().to_string();
        {
            let mut objects = self.objects.lock().unwrap();
            let current = objects.get(&uid).ok_or_else(|| StoreError::NotFound {
                kind: self.kind,
                uid: uid.clone(),
            })?;
            if current.generation() != object.generation() {
                return Err(StoreError::Conflict {
                    kind: self.kind,
                    uid,
                    expected: current.generation(),
                    actual: object.generation(),
                });
            }
            object.set_generation(object.generation() + 1);
            objects.insert(uid.clone(), object.clone());
        }
        self.write_through(&uid, &object).await?;
        let _ = self.tx.send(Event::modified(object.clone()));
        Ok(object)
    }

    async fn delete(&self, uid: &str) -> Result<()> {
        let object = {
            let mut objects = self.objects.lock().unwrap();
            objects.remove(uid).ok_or_else(|| StoreError::NotFound {
                kind: self.kind,
                uid: uid.to_string(),
            })?
        };
        fs::remove_file(self.path(uid))
            .await
            .or_else(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Ok(())
                } else {
                    Err(e)
                }
            })
            .map_err(|e| io_err(self.kind, uid, e))?;
        let _ = self.tx.send(Event::deleted(object));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Event<T>> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Machine, MachineStatus};

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
    async fn create_get_update_delete_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let store: FileStore<Machine> = FileStore::load(tmp.path(), "machine").await.unwrap();

        let created = store.create(machine("m1")).await.unwrap();
        assert_eq!(created.generation, 1);

        let fetched = store.get("m1").await.unwrap();
        assert_eq!(fetched.uid, "m1");

        let mut to_update = fetched.clone();
        to_update.memory_bytes = 1024;
        let updated = store.update(to_update).await.unwrap();
        assert_eq!(updated.generation, 2);
        assert_eq!(updated.memory_bytes, 1024);

        store.delete("m1").await.unwrap();
        assert!(matches!(
            store.get("m1").await.unwrap_err(),
            StoreError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn create_duplicate_uid_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let store: FileStore<Machine> = FileStore::load(tmp.path(), "machine").await.unwrap();
        store.create(machine("m1")).await.unwrap();
        assert!(matches!(
            store.create(machine("m1")).await.unwrap_err(),
            StoreError::AlreadyExists { .. }
        ));
    }

    #[tokio::test]
    async fn update_with_stale_generation_conflicts() {
        let tmp = tempfile::tempdir().unwrap();
        let store: FileStore<Machine> = FileStore::load(tmp.path(), "machine").await.unwrap();
        let created = store.create(machine("m1")).await.unwrap();
        store.update(created.clone()).await.unwrap();
        assert!(matches!(
            store.update(created).await.unwrap_err(),
            StoreError::Conflict { .. }
        ));
    }

    #[tokio::test]
    async fn persists_across_reload() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let store: FileStore<Machine> = FileStore::load(tmp.path(), "machine").await.unwrap();
            store.create(machine("m1")).await.unwrap();
        }
        let reloaded: FileStore<Machine> = FileStore::load(tmp.path(), "machine").await.unwrap();
        assert_eq!(reloaded.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn watch_receives_events_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let store: FileStore<Machine> = FileStore::load(tmp.path(), "machine").await.unwrap();
        let mut rx = store.subscribe();

        store.create(machine("m1")).await.unwrap();
        let created = store.get("m1").await.unwrap();
        store.update(created).await.unwrap();
        store.delete("m1").await.unwrap();

        assert_eq!(rx.recv().await.unwrap().event_type, EventType::Added);
        assert_eq!(rx.recv().await.unwrap().event_type, EventType::Modified);
        assert_eq!(rx.recv().await.unwrap().event_type, EventType::Deleted);
    }
}
