use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

use super::error::Result;
use super::gateway::PersistenceGateway;
use super::keys::namespaced_key;

/// Bumped whenever a persisted projection changes shape incompatibly
pub const SNAPSHOT_VERSION: u32 = 1;

/// A store whose state can be projected into a durable snapshot
pub trait PersistedStore: Send + Sync + 'static {
    /// Namespace prefix of every key written for this store
    const STORE_NAME: &'static str;

    type Snapshot: Serialize + DeserializeOwned + Send;

    fn snapshot(&self) -> Self::Snapshot;

    fn restore(&mut self, snapshot: Self::Snapshot);

    /// Return to the freshly constructed state, keeping configuration
    fn reset(&mut self);

    /// Empty or default-valued snapshots are not worth restoring
    fn is_meaningful(_snapshot: &Self::Snapshot) -> bool {
        true
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    version: u32,
    saved_at: DateTime<Utc>,
    state: T,
}

/// How a reload resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Restored,
    Missing,
    Meaningless,
    Corrupt,
}

/// Registry entry the gateway uses to purge and reload a store
#[async_trait]
pub trait NamespacedStore: Send + Sync {
    fn store_name(&self) -> &'static str;

    /// Reset the in-memory state and load the snapshot for `identity`
    async fn reload(&self, identity: Option<&str>) -> Result<LoadOutcome>;
}

/// In-memory store with write-through persistence under the current identity
pub struct Persisted<S: PersistedStore> {
    inner: RwLock<S>,
    gateway: Arc<PersistenceGateway>,
}

impl<S: PersistedStore> Persisted<S> {
    /// Register `store` with the gateway and load the snapshot of the
    /// gateway's current identity into it.
    pub async fn attach(gateway: &Arc<PersistenceGateway>, store: S) -> Result<Arc<Self>> {
        let persisted = Arc::new(Self {
            inner: RwLock::new(store),
            gateway: Arc::clone(gateway),
        });

        let entry: Arc<dyn NamespacedStore> = persisted.clone();
        gateway.register(Arc::downgrade(&entry)).await;

        let identity = gateway.current_identity().await;
        let outcome = persisted.reload(identity.as_deref()).await?;
        debug!(store = S::STORE_NAME, outcome = ?outcome, "Store attached");

        Ok(persisted)
    }

    pub async fn read<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        let guard = self.inner.read().await;
        f(&guard)
    }

    /// Apply `f` and write the resulting projection through to storage.
    ///
    /// The mutation is applied synchronously under the store lock. A failed
    /// write is logged; the in-memory change stands.
    pub async fn mutate<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        let identity = self.gateway.lock_identity().await;
        let mut guard = self.inner.write().await;

        let result = f(&mut guard);

        let key = namespaced_key(S::STORE_NAME, identity.as_deref());
        if let Err(e) = write_snapshot(&self.gateway, &key, &*guard) {
            error!(store = S::STORE_NAME, key, error = %e, "Write-through failed");
        }

        result
    }

    /// Apply `f` to two stores as one unit under a single identity hold.
    ///
    /// Both snapshots are written through before the locks are released. If
    /// either write fails, both stores go back to their prior state (in
    /// memory and, best effort, on disk) and the error is returned.
    pub async fn transact<T, R>(
        first: &Self,
        second: &Persisted<T>,
        f: impl FnOnce(&mut S, &mut T) -> R,
    ) -> Result<R>
    where
        S: Clone,
        T: PersistedStore + Clone,
    {
        let identity = first.gateway.lock_identity().await;
        let mut first_guard = first.inner.write().await;
        let mut second_guard = second.inner.write().await;

        let first_before = first_guard.clone();
        let second_before = second_guard.clone();
        let result = f(&mut first_guard, &mut second_guard);

        let first_key = namespaced_key(S::STORE_NAME, identity.as_deref());
        let second_key = namespaced_key(T::STORE_NAME, identity.as_deref());
        let written = write_snapshot(&first.gateway, &first_key, &*first_guard)
            .and_then(|_| write_snapshot(&second.gateway, &second_key, &*second_guard));

        if let Err(e) = written {
            error!(
                first = S::STORE_NAME,
                second = T::STORE_NAME,
                error = %e,
                "Write-through failed, rolling back both stores"
            );
            *first_guard = first_before;
            *second_guard = second_before;
            for (key, outcome) in [
                (&first_key, write_snapshot(&first.gateway, &first_key, &*first_guard)),
                (&second_key, write_snapshot(&second.gateway, &second_key, &*second_guard)),
            ] {
                if let Err(e) = outcome {
                    warn!(key = %key, error = %e, "Rollback write failed");
                }
            }
            return Err(e);
        }

        Ok(result)
    }
}

fn write_snapshot<S: PersistedStore>(
    gateway: &PersistenceGateway,
    key: &str,
    store: &S,
) -> Result<()> {
    let envelope = Envelope {
        version: SNAPSHOT_VERSION,
        saved_at: Utc::now(),
        state: store.snapshot(),
    };
    let bytes = serde_json::to_vec(&envelope)?;
    gateway.kv().put(key, &bytes)
}

#[async_trait]
impl<S: PersistedStore> NamespacedStore for Persisted<S> {
    fn store_name(&self) -> &'static str {
        S::STORE_NAME
    }

    async fn reload(&self, identity: Option<&str>) -> Result<LoadOutcome> {
        let key = namespaced_key(S::STORE_NAME, identity);
        let mut guard = self.inner.write().await;
        guard.reset();

        let Some(bytes) = self.gateway.kv().get(&key)? else {
            debug!(store = S::STORE_NAME, key, "No snapshot, starting fresh");
            return Ok(LoadOutcome::Missing);
        };

        let envelope = match serde_json::from_slice::<Envelope<S::Snapshot>>(&bytes) {
            Ok(envelope) if envelope.version == SNAPSHOT_VERSION => envelope,
            Ok(envelope) => {
                warn!(
                    store = S::STORE_NAME,
                    key,
                    version = envelope.version,
                    "Unsupported snapshot version, starting fresh"
                );
                return Ok(LoadOutcome::Corrupt);
            }
            Err(e) => {
                warn!(store = S::STORE_NAME, key, error = %e, "Undecodable snapshot, starting fresh");
                return Ok(LoadOutcome::Corrupt);
            }
        };

        if !S::is_meaningful(&envelope.state) {
            debug!(store = S::STORE_NAME, key, "Snapshot is empty, starting fresh");
            return Ok(LoadOutcome::Meaningless);
        }

        guard.restore(envelope.state);
        debug!(store = S::STORE_NAME, key, saved_at = %envelope.saved_at, "Snapshot restored");
        Ok(LoadOutcome::Restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::backend::{KvStore, MemoryKv};

    #[derive(Debug, Default)]
    struct Counter {
        value: u32,
    }

    impl PersistedStore for Counter {
        const STORE_NAME: &'static str = "counter";
        type Snapshot = u32;

        fn snapshot(&self) -> u32 {
            self.value
        }

        fn restore(&mut self, snapshot: u32) {
            self.value = snapshot;
        }

        fn reset(&mut self) {
            self.value = 0;
        }

        fn is_meaningful(snapshot: &u32) -> bool {
            *snapshot > 0
        }
    }

    #[tokio::test]
    async fn test_mutation_writes_through() {
        let kv = Arc::new(MemoryKv::new());
        let gateway = PersistenceGateway::new(kv.clone(), Some("alice".to_string()));
        let counter = Persisted::attach(&gateway, Counter::default()).await.unwrap();

        counter.mutate(|c| c.value += 3).await;

        let raw = kv.get("counter_user_alice").unwrap().unwrap();
        let envelope: Envelope<u32> = serde_json::from_slice(&raw).unwrap();
        assert_eq!(envelope.state, 3);
        assert_eq!(envelope.version, SNAPSHOT_VERSION);
    }

    #[tokio::test]
    async fn test_attach_restores_existing_snapshot() {
        let kv = Arc::new(MemoryKv::new());
        {
            let gateway = PersistenceGateway::new(kv.clone(), None);
            let counter = Persisted::attach(&gateway, Counter::default()).await.unwrap();
            counter.mutate(|c| c.value = 9).await;
        }

        let gateway = PersistenceGateway::new(kv, None);
        let counter = Persisted::attach(&gateway, Counter::default()).await.unwrap();
        assert_eq!(counter.read(|c| c.value).await, 9);
    }

    #[tokio::test]
    async fn test_corrupt_and_meaningless_snapshots_start_fresh() {
        let kv = Arc::new(MemoryKv::new());
        let gateway = PersistenceGateway::new(kv.clone(), Some("bob".to_string()));
        let counter = Persisted::attach(&gateway, Counter { value: 5 }).await.unwrap();
        assert_eq!(counter.read(|c| c.value).await, 0);

        kv.put("counter_user_bob", b"not json").unwrap();
        assert_eq!(counter.reload(Some("bob")).await.unwrap(), LoadOutcome::Corrupt);

        kv.put(
            "counter_user_bob",
            br#"{"version":1,"saved_at":"2026-01-01T00:00:00Z","state":0}"#,
        )
        .unwrap();
        assert_eq!(counter.reload(Some("bob")).await.unwrap(), LoadOutcome::Meaningless);

        kv.put(
            "counter_user_bob",
            br#"{"version":99,"saved_at":"2026-01-01T00:00:00Z","state":4}"#,
        )
        .unwrap();
        assert_eq!(counter.reload(Some("bob")).await.unwrap(), LoadOutcome::Corrupt);
        assert_eq!(counter.read(|c| c.value).await, 0);
    }
}
