use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Anything kept in a [`ListStore`] is addressed by its synthetic ID.
pub trait Identified {
    fn id(&self) -> &str;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    Persist(String),
}

/// A list of entities persisted as one YAML document.
///
/// Every mutation rewrites the whole file. Saves are debounced: callers that
/// land inside the same window share one write, and each caller still learns
/// whether the write that covered its change succeeded. A failed save rolls
/// the in-memory list back to what it was before the caller's mutation.
pub struct ListStore<T> {
    path: PathBuf,
    items: RwLock<Vec<T>>,
    debounce: Duration,
    generation: AtomicU64,
    saved_generation: tokio::sync::Mutex<u64>,
}

impl<T> ListStore<T>
where
    T: Identified + Clone + Serialize + DeserializeOwned + Send + Sync,
{
    pub fn new(path: PathBuf, debounce: Duration) -> Self {
        Self {
            path,
            items: RwLock::new(Vec::new()),
            debounce,
            generation: AtomicU64::new(0),
            saved_generation: tokio::sync::Mutex::new(0),
        }
    }

    /// Reads the list from disk. A missing file leaves the store empty.
    pub fn load(path: PathBuf, debounce: Duration) -> Result<Self, String> {
        let store = Self::new(path, debounce);
        let items = read_list::<T>(&store.path)?;
        *store.items.write().expect("store rwlock poisoned") = items;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.items.read().expect("store rwlock poisoned").clone()
    }

    pub fn get(&self, id: &str) -> Option<T> {
        self.items
            .read()
            .expect("store rwlock poisoned")
            .iter()
            .find(|item| item.id() == id)
            .cloned()
    }

    pub fn find<P>(&self, predicate: P) -> Option<T>
    where
        P: Fn(&T) -> bool,
    {
        self.items
            .read()
            .expect("store rwlock poisoned")
            .iter()
            .find(|item| predicate(item))
            .cloned()
    }

    pub async fn add(&self, item: T) -> Result<(), StoreError> {
        let id = item.id().to_string();
        self.items.write().expect("store rwlock poisoned").push(item);

        if let Err(err) = self.save().await {
            let mut items = self.items.write().expect("store rwlock poisoned");
            if let Some(idx) = items.iter().position(|v| v.id() == id) {
                items.remove(idx);
            }
            return Err(err);
        }
        Ok(())
    }

    /// Replaces the entity with `id` wholesale.
    pub async fn edit(&self, id: &str, item: T) -> Result<(), StoreError> {
        let backup = {
            let mut items = self.items.write().expect("store rwlock poisoned");
            let idx = items
                .iter()
                .position(|v| v.id() == id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            std::mem::replace(&mut items[idx], item)
        };

        if let Err(err) = self.save().await {
            let mut items = self.items.write().expect("store rwlock poisoned");
            if let Some(slot) = items.iter_mut().find(|v| v.id() == id) {
                *slot = backup;
            }
            return Err(err);
        }
        Ok(())
    }

    /// Changes the stored entity through `f` and persists it. Returns the
    /// entity as stored.
    pub async fn modify<F>(&self, id: &str, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut T),
    {
        let (backup, modified) = {
            let mut items = self.items.write().expect("store rwlock poisoned");
            let slot = items
                .iter_mut()
                .find(|v| v.id() == id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            let backup = slot.clone();
            f(slot);
            (backup, slot.clone())
        };

        if let Err(err) = self.save().await {
            let mut items = self.items.write().expect("store rwlock poisoned");
            if let Some(slot) = items.iter_mut().find(|v| v.id() == id) {
                *slot = backup;
            }
            return Err(err);
        }
        Ok(modified)
    }

    pub async fn delete(&self, id: &str) -> Result<T, StoreError> {
        let (idx, removed) = {
            let mut items = self.items.write().expect("store rwlock poisoned");
            let idx = items
                .iter()
                .position(|v| v.id() == id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            (idx, items.remove(idx))
        };

        if let Err(err) = self.save().await {
            let mut items = self.items.write().expect("store rwlock poisoned");
            let idx = idx.min(items.len());
            items.insert(idx, removed);
            return Err(err);
        }
        Ok(removed)
    }

    /// Applies `f` in place without persisting. Used by resolvers that batch
    /// several in-memory updates behind a single [`ListStore::save`].
    pub fn update_in_place<F, R>(&self, id: &str, f: F) -> Option<R>
    where
        F: FnOnce(&mut T) -> R,
    {
        let mut items = self.items.write().expect("store rwlock poisoned");
        items.iter_mut().find(|v| v.id() == id).map(f)
    }

    pub async fn save(&self) -> Result<(), StoreError> {
        let requested = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        if !self.debounce.is_zero() {
            tokio::time::sleep(self.debounce).await;
        }

        let mut saved = self.saved_generation.lock().await;
        if *saved >= requested {
            return Ok(());
        }

        let current = self.generation.load(Ordering::SeqCst);
        let snapshot = self.snapshot();
        write_list(&self.path, &snapshot).map_err(StoreError::Persist)?;
        *saved = current;
        Ok(())
    }
}

fn read_list<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, String> {
    use std::io::ErrorKind;

    match std::fs::read_to_string(path) {
        Ok(content) if content.trim().is_empty() => Ok(Vec::new()),
        Ok(content) => serde_yaml::from_str::<Vec<T>>(&content)
            .map_err(|err| format!("failed to parse {}: {err}", path.display())),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => Err(format!("failed to read {}: {err}", path.display())),
    }
}

fn write_list<T: Serialize>(path: &Path, items: &[T]) -> Result<(), String> {
    let content = serde_yaml::to_string(items)
        .map_err(|err| format!("failed to serialize {}: {err}", path.display()))?;
    write_atomic(path, content.as_bytes())
}

/// Writes through a sibling temp file and renames it over the target so that
/// readers never observe a half-written document.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<(), String> {
    use std::fs;
    use std::io::Write;

    let parent = path
        .parent()
        .ok_or_else(|| format!("invalid path: {}", path.display()))?;
    fs::create_dir_all(parent)
        .map_err(|err| format!("failed to create directory {}: {err}", parent.display()))?;

    let mut tmp_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    {
        let mut file = fs::File::create(&tmp_path)
            .map_err(|err| format!("failed to create {}: {err}", tmp_path.display()))?;
        file.write_all(content)
            .map_err(|err| format!("failed to write {}: {err}", tmp_path.display()))?;
        file.flush()
            .map_err(|err| format!("failed to flush {}: {err}", tmp_path.display()))?;
    }

    fs::rename(&tmp_path, path).map_err(|err| {
        format!(
            "failed to move {} to {}: {err}",
            tmp_path.display(),
            path.display()
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::Arc;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Item {
        id: String,
        value: u32,
    }

    impl Identified for Item {
        fn id(&self) -> &str {
            &self.id
        }
    }

    fn item(id: &str, value: u32) -> Item {
        Item {
            id: id.to_string(),
            value,
        }
    }

    #[tokio::test]
    async fn mutations_rewrite_the_whole_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("items.yaml");
        let store = ListStore::<Item>::new(path.clone(), Duration::ZERO);

        store.add(item("a", 1)).await.unwrap();
        store.add(item("b", 2)).await.unwrap();
        store.edit("a", item("a", 10)).await.unwrap();
        store.delete("b").await.unwrap();

        let reloaded = ListStore::<Item>::load(path, Duration::ZERO).unwrap();
        assert_eq!(reloaded.snapshot(), vec![item("a", 10)]);
    }

    #[tokio::test]
    async fn failed_save_restores_previous_entity() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should be makes every write fail.
        let path = dir.path().join("blocked");
        std::fs::create_dir_all(path.join("items.yaml.tmp")).unwrap();
        let store = ListStore::<Item>::new(path.join("items.yaml"), Duration::ZERO);
        store.items.write().unwrap().push(item("a", 1));

        assert!(store.edit("a", item("a", 2)).await.is_err());
        assert_eq!(store.get("a"), Some(item("a", 1)));

        assert!(store.add(item("b", 3)).await.is_err());
        assert!(store.get("b").is_none());

        assert!(store.delete("a").await.is_err());
        assert_eq!(store.snapshot(), vec![item("a", 1)]);

        assert!(store.modify("a", |v| v.value = 5).await.is_err());
        assert_eq!(store.get("a"), Some(item("a", 1)));
    }

    #[tokio::test]
    async fn modify_works_on_the_current_entity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("items.yaml");
        let store = ListStore::<Item>::new(path.clone(), Duration::ZERO);
        store.add(item("a", 1)).await.unwrap();
        store.update_in_place("a", |v| v.value = 2);

        let stored = store.modify("a", |v| v.value += 1).await.unwrap();
        assert_eq!(stored, item("a", 3));
        let reloaded = ListStore::<Item>::load(path, Duration::ZERO).unwrap();
        assert_eq!(reloaded.get("a"), Some(item("a", 3)));
        assert!(matches!(store.modify("nope", |_| {}).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn rapid_edits_share_one_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("items.yaml");
        let store = Arc::new(ListStore::<Item>::new(
            path.clone(),
            Duration::from_millis(30),
        ));

        let a = {
            let store = store.clone();
            tokio::spawn(async move { store.add(item("a", 1)).await })
        };
        let b = {
            let store = store.clone();
            tokio::spawn(async move { store.add(item("b", 2)).await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        let reloaded = ListStore::<Item>::load(path, Duration::ZERO).unwrap();
        assert_eq!(reloaded.snapshot().len(), 2);
    }

    #[tokio::test]
    async fn missing_entities_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = ListStore::<Item>::new(dir.path().join("items.yaml"), Duration::ZERO);
        assert!(matches!(
            store.edit("nope", item("nope", 0)).await,
            Err(StoreError::NotFound(_))
        ));
    }
}
