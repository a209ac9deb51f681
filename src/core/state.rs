/// Attribute store: JSON values cached in memory, optionally persisted.
///
/// Persisted values live under `"<storage_key>-<attribute>"` as JSON text in
/// a [`Storage`] backend. Without a backend the store is memory-only.

use serde_json::Value;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use thiserror::Error;
use tracing::{debug, error};

#[derive(Debug, Error)]
pub enum StateError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("corrupt persisted value for '{key}': {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// A flat string key/value persistence layer, shaped like browser local storage.
pub trait Storage {
    fn get_item(&self, key: &str) -> Option<String>;
    fn set_item(&mut self, key: &str, value: &str) -> Result<(), StateError>;
    fn remove_item(&mut self, key: &str) -> Result<(), StateError>;
    fn keys(&self) -> Vec<String>;
}

/// In-memory storage. Clones share the same map, so a host can keep a handle
/// and hand another to a session.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    items: Rc<RefCell<BTreeMap<String, String>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.borrow().is_empty()
    }
}

impl Storage for MemoryStorage {
    fn get_item(&self, key: &str) -> Option<String> {
        self.items.borrow().get(key).cloned()
    }

    fn set_item(&mut self, key: &str, value: &str) -> Result<(), StateError> {
        self.items
            .borrow_mut()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&mut self, key: &str) -> Result<(), StateError> {
        self.items.borrow_mut().remove(key);
        Ok(())
    }

    fn keys(&self) -> Vec<String> {
        self.items.borrow().keys().cloned().collect()
    }
}

/// Storage kept in a JSON object file, rewritten on every change.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    items: BTreeMap<String, String>,
}

impl FileStorage {
    /// Open `path`, starting empty if the file does not exist yet.
    pub fn open(path: &Path) -> Result<Self, StateError> {
        let items = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            if contents.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&contents)?
            }
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path: path.to_path_buf(),
            items,
        })
    }

    fn flush(&self) -> Result<(), StateError> {
        let json = serde_json::to_string_pretty(&self.items)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }
}

impl Storage for FileStorage {
    fn get_item(&self, key: &str) -> Option<String> {
        self.items.get(key).cloned()
    }

    fn set_item(&mut self, key: &str, value: &str) -> Result<(), StateError> {
        self.items.insert(key.to_string(), value.to_string());
        self.flush()
    }

    fn remove_item(&mut self, key: &str) -> Result<(), StateError> {
        if self.items.remove(key).is_some() {
            self.flush()?;
        }
        Ok(())
    }

    fn keys(&self) -> Vec<String> {
        self.items.keys().cloned().collect()
    }
}

/// Called with the attribute name and its new value after every observed set.
pub type SetObserver = Rc<dyn Fn(&str, &Value)>;

pub struct StateStore {
    cache: BTreeMap<String, Value>,
    backend: Option<Box<dyn Storage>>,
    storage_key: String,
    observer: Option<SetObserver>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("cache", &self.cache)
            .field("persistent", &self.backend.is_some())
            .field("storage_key", &self.storage_key)
            .finish()
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    /// A memory-only store.
    pub fn new() -> Self {
        Self {
            cache: BTreeMap::new(),
            backend: None,
            storage_key: String::new(),
            observer: None,
        }
    }

    /// A store persisted to `backend` under `storage_key`.
    pub fn persistent(backend: Box<dyn Storage>, storage_key: &str) -> Self {
        Self {
            cache: BTreeMap::new(),
            backend: Some(backend),
            storage_key: storage_key.to_string(),
            observer: None,
        }
    }

    pub fn set_observer(&mut self, observer: SetObserver) {
        self.observer = Some(observer);
    }

    pub fn is_persistent(&self) -> bool {
        self.backend.is_some()
    }

    pub fn storage_key(&self) -> &str {
        &self.storage_key
    }

    fn key_for(&self, attribute: &str) -> String {
        format!("{}-{}", self.storage_key, attribute)
    }

    fn prefix(&self) -> String {
        format!("{}-", self.storage_key)
    }

    /// Current value, or `Value::Null` when unset.
    pub fn get(&self, attribute: &str) -> Value {
        self.cache.get(attribute).cloned().unwrap_or(Value::Null)
    }

    pub fn contains(&self, attribute: &str) -> bool {
        self.cache.contains_key(attribute)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.cache.keys().map(String::as_str)
    }

    /// Store a value and notify the observer. Returns the previous value.
    pub fn set(&mut self, attribute: &str, value: Value) -> Value {
        let previous = self.write(attribute, value.clone());
        if let Some(observer) = &self.observer {
            observer(attribute, &value);
        }
        previous
    }

    /// Store a value without notifying anyone.
    pub fn set_silent(&mut self, attribute: &str, value: Value) -> Value {
        self.write(attribute, value)
    }

    /// Put back a value captured in an undo log. `Null` means the attribute
    /// did not exist, so it is removed.
    pub fn restore(&mut self, attribute: &str, value: Value) {
        if value.is_null() {
            self.cache.remove(attribute);
            let key = self.key_for(attribute);
            if let Some(backend) = self.backend.as_mut() {
                if let Err(err) = backend.remove_item(&key) {
                    error!(attribute, %err, "failed to remove persisted attribute");
                }
            }
        } else {
            self.write(attribute, value);
        }
    }

    fn write(&mut self, attribute: &str, value: Value) -> Value {
        if self.backend.is_some() {
            let key = self.key_for(attribute);
            match serde_json::to_string(&value) {
                Ok(json) => {
                    if let Some(backend) = self.backend.as_mut() {
                        if let Err(err) = backend.set_item(&key, &json) {
                            error!(attribute, %err, "failed to persist attribute");
                        }
                    }
                }
                Err(err) => error!(attribute, %err, "attribute is not serializable"),
            }
        }
        self.cache
            .insert(attribute.to_string(), value)
            .unwrap_or(Value::Null)
    }

    /// Read every persisted attribute into the cache. Returns how many were loaded.
    pub fn load(&mut self) -> Result<usize, StateError> {
        let Some(backend) = self.backend.as_ref() else {
            return Ok(0);
        };
        let prefix = self.prefix();
        let mut loaded = Vec::new();
        for key in backend.keys() {
            let Some(attribute) = key.strip_prefix(&prefix) else {
                continue;
            };
            let Some(raw) = backend.get_item(&key) else {
                continue;
            };
            let value: Value = serde_json::from_str(&raw).map_err(|source| StateError::Corrupt {
                key: key.clone(),
                source,
            })?;
            loaded.push((attribute.to_string(), value));
        }
        let count = loaded.len();
        self.cache.extend(loaded);
        debug!(count, storage_key = %self.storage_key, "loaded persisted attributes");
        Ok(count)
    }

    /// Forget every attribute, including persisted ones under this store's key.
    pub fn reset(&mut self) {
        self.cache.clear();
        let prefix = self.prefix();
        if let Some(backend) = self.backend.as_mut() {
            for key in backend.keys() {
                if key.starts_with(&prefix) {
                    if let Err(err) = backend.remove_item(&key) {
                        error!(%key, %err, "failed to remove persisted attribute");
                    }
                }
            }
        }
    }

    /// Whether `name` is recorded in `_seen_sections`.
    pub fn seen(&self, name: &str) -> bool {
        match self.cache.get("_seen_sections") {
            Some(Value::Array(items)) => items.iter().any(|v| v.as_str() == Some(name)),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::RefCell;

    #[test]
    fn get_missing_is_null() {
        let store = StateStore::new();
        assert_eq!(store.get("nothing"), Value::Null);
    }

    #[test]
    fn set_returns_previous_value() {
        let mut store = StateStore::new();
        assert_eq!(store.set("x", json!(1)), Value::Null);
        assert_eq!(store.set("x", json!(2)), json!(1));
        assert_eq!(store.get("x"), json!(2));
    }

    #[test]
    fn restore_null_removes() {
        let mut store = StateStore::new();
        store.set("x", json!("a"));
        store.restore("x", Value::Null);
        assert!(!store.contains("x"));
        store.restore("y", json!(4));
        assert_eq!(store.get("y"), json!(4));
    }

    #[test]
    fn observer_sees_sets_but_not_silent_writes() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let mut store = StateStore::new();
        store.set_observer(Rc::new(move |name: &str, value: &Value| {
            sink.borrow_mut().push((name.to_string(), value.clone()))
        }));
        store.set("a", json!(true));
        store.set_silent("b", json!(false));
        assert_eq!(*seen.borrow(), vec![("a".to_string(), json!(true))]);
    }

    #[test]
    fn persists_under_prefixed_keys() {
        let storage = MemoryStorage::new();
        let mut store = StateStore::persistent(Box::new(storage.clone()), "story");
        store.set("score", json!(10));
        assert_eq!(storage.get_item("story-score").as_deref(), Some("10"));

        let mut reloaded = StateStore::persistent(Box::new(storage.clone()), "story");
        assert_eq!(reloaded.load().unwrap(), 1);
        assert_eq!(reloaded.get("score"), json!(10));
    }

    #[test]
    fn reset_only_touches_own_prefix() {
        let mut storage = MemoryStorage::new();
        storage.set_item("other-score", "1").unwrap();
        let mut store = StateStore::persistent(Box::new(storage.clone()), "story");
        store.set("score", json!(1));
        store.reset();
        assert_eq!(store.get("score"), Value::Null);
        assert_eq!(storage.keys(), vec!["other-score".to_string()]);
    }

    #[test]
    fn corrupt_storage_is_reported() {
        let mut storage = MemoryStorage::new();
        storage.set_item("story-bad", "{not json").unwrap();
        let mut store = StateStore::persistent(Box::new(storage), "story");
        match store.load() {
            Err(StateError::Corrupt { key, .. }) => assert_eq!(key, "story-bad"),
            other => panic!("expected corrupt error, got {other:?}"),
        }
    }

    #[test]
    fn file_storage_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("save.json");
        {
            let storage = FileStorage::open(&path).unwrap();
            let mut store = StateStore::persistent(Box::new(storage), "s");
            store.set("name", json!("Ada"));
        }
        let storage = FileStorage::open(&path).unwrap();
        let mut store = StateStore::persistent(Box::new(storage), "s");
        store.load().unwrap();
        assert_eq!(store.get("name"), json!("Ada"));
    }

    #[test]
    fn seen_reads_seen_sections() {
        let mut store = StateStore::new();
        store.set("_seen_sections", json!(["intro", "hall"]));
        assert!(store.seen("hall"));
        assert!(!store.seen("attic"));
    }
}
