use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle};
use tracing::{debug, info};

use super::error::{PersistError, Result};

/// Durable string-keyed storage scoped to one client profile
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    fn remove(&self, key: &str) -> Result<()>;

    /// Every key starting with `prefix`, in no particular order
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Fjall-backed snapshot storage
#[derive(Clone)]
pub struct FjallKv {
    keyspace: Keyspace,
    snapshots: PartitionHandle,
}

impl FjallKv {
    /// Open or create a snapshot keyspace at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening snapshot store at: {}", path.display());

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let keyspace = Config::new(path).open()?;
        let snapshots = keyspace.open_partition("snapshots", PartitionCreateOptions::default())?;

        Ok(Self { keyspace, snapshots })
    }
}

impl KvStore for FjallKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.snapshots.get(key)?.map(|value| value.to_vec()))
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.snapshots.insert(key.as_bytes(), value)?;
        debug!(key, size = value.len(), "Snapshot written");
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.snapshots.remove(key.as_bytes())?;
        debug!(key, "Snapshot removed");
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for item in self.snapshots.prefix(prefix) {
            let (key, _) = item?;
            keys.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(keys)
    }

    fn flush(&self) -> Result<()> {
        self.keyspace.persist(fjall::PersistMode::SyncAll)?;
        Ok(())
    }
}

/// In-process storage for tests and ephemeral sessions
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>>> {
        self.entries
            .lock()
            .map_err(|_| PersistError::Backend("memory store lock poisoned".to_string()))
    }

    pub fn len(&self) -> usize {
        self.entries().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvStore for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries()?.get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entries()?.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries()?.remove(key);
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .entries()?
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// [`MemoryKv`] that fails chosen operations on chosen key prefixes
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct FlakyKv {
    inner: MemoryKv,
    failing: Mutex<Vec<(&'static str, String)>>,
}

#[cfg(test)]
impl FlakyKv {
    /// `op` is one of `get`, `put` or `remove`
    pub(crate) fn fail_on(&self, op: &'static str, prefix: &str) {
        self.failing.lock().unwrap().push((op, prefix.to_string()));
    }

    pub(crate) fn heal(&self) {
        self.failing.lock().unwrap().clear();
    }

    fn check(&self, op: &str, key: &str) -> Result<()> {
        let failing = self.failing.lock().unwrap();
        if failing
            .iter()
            .any(|(failing_op, prefix)| *failing_op == op && key.starts_with(prefix.as_str()))
        {
            return Err(PersistError::Backend(format!("injected {op} failure for {key}")));
        }
        Ok(())
    }
}

#[cfg(test)]
impl KvStore for FlakyKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check("get", key)?;
        self.inner.get(key)
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.check("put", key)?;
        self.inner.put(key, value)
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.check("remove", key)?;
        self.inner.remove(key)
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.keys_with_prefix(prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn exercise(store: &dyn KvStore) {
        store.put("credits_user_a", b"{\"balance\":1}").unwrap();
        store.put("credits_anonymous", b"{}").unwrap();
        store.put("jobs_user_a", b"[]").unwrap();

        assert_eq!(store.get("credits_user_a").unwrap().unwrap(), b"{\"balance\":1}");
        assert!(store.get("credits_user_b").unwrap().is_none());

        let mut keys = store.keys_with_prefix("credits_").unwrap();
        keys.sort();
        assert_eq!(keys, vec!["credits_anonymous", "credits_user_a"]);

        store.remove("credits_user_a").unwrap();
        assert!(store.get("credits_user_a").unwrap().is_none());
        store.flush().unwrap();
    }

    #[test]
    fn test_memory_kv() {
        let store = MemoryKv::new();
        exercise(&store);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_fjall_kv() {
        let temp_dir = TempDir::new().unwrap();
        let store = FjallKv::open(temp_dir.path().join("snapshots")).unwrap();
        exercise(&store);
    }

    #[test]
    fn test_fjall_kv_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("snapshots");

        {
            let store = FjallKv::open(&path).unwrap();
            store.put("jobs_user_z", b"[1,2,3]").unwrap();
            store.flush().unwrap();
        }

        let store = FjallKv::open(&path).unwrap();
        assert_eq!(store.get("jobs_user_z").unwrap().unwrap(), b"[1,2,3]");
    }
}
