use std::sync::{Arc, Weak};

use tokio::sync::{Mutex, RwLock, RwLockReadGuard};
use tracing::{debug, error, info, warn};

use crate::config::IdentityConfig;
use crate::identity::{IdentityProvider, wait_for_identity};

use super::backend::KvStore;
use super::error::Result;
use super::keys::{decode_namespaced_key, namespaced_key, store_prefix};
use super::store::NamespacedStore;

/// What an identity change did to persisted state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityTransition {
    Unchanged,
    SignedIn { to: String },
    SignedOut { from: String },
    Switched { from: String, to: String },
}

/// Owns the current identity and every store's namespaced snapshot key.
///
/// Stores register at construction; purges iterate that registry rather than
/// scanning storage. Identity transitions take the identity lock exclusively,
/// so no write-through can land under a namespace that is being replaced.
pub struct PersistenceGateway {
    kv: Arc<dyn KvStore>,
    identity: RwLock<Option<String>>,
    stores: Mutex<Vec<Weak<dyn NamespacedStore>>>,
}

impl PersistenceGateway {
    pub fn new(kv: Arc<dyn KvStore>, identity: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            kv,
            identity: RwLock::new(identity),
            stores: Mutex::new(Vec::new()),
        })
    }

    /// Wait (bounded) for the provider to resolve, then bind to that identity
    pub async fn initialize(
        kv: Arc<dyn KvStore>,
        provider: &dyn IdentityProvider,
        config: &IdentityConfig,
    ) -> Arc<Self> {
        let identity = wait_for_identity(
            provider,
            config.resolve_timeout.as_duration(),
            config.poll_interval.as_duration(),
        )
        .await;

        info!(
            identity = identity.as_deref().unwrap_or("anonymous"),
            "Persistence gateway initialized"
        );
        Self::new(kv, identity)
    }

    pub fn kv(&self) -> &dyn KvStore {
        self.kv.as_ref()
    }

    pub async fn current_identity(&self) -> Option<String> {
        self.identity.read().await.clone()
    }

    /// Shared hold on the identity for the duration of a write-through
    pub(crate) async fn lock_identity(&self) -> RwLockReadGuard<'_, Option<String>> {
        self.identity.read().await
    }

    pub(crate) async fn register(&self, entry: Weak<dyn NamespacedStore>) {
        let mut stores = self.stores.lock().await;
        stores.retain(|store| store.strong_count() > 0);
        stores.push(entry);
    }

    async fn live_stores(&self) -> Vec<Arc<dyn NamespacedStore>> {
        let mut stores = self.stores.lock().await;
        stores.retain(|store| store.strong_count() > 0);
        stores.iter().filter_map(Weak::upgrade).collect()
    }

    pub async fn store_names(&self) -> Vec<&'static str> {
        self.live_stores()
            .await
            .iter()
            .map(|store| store.store_name())
            .collect()
    }

    /// Remove the snapshots of every registered store under `identity`
    pub async fn purge_identity(&self, identity: Option<&str>) -> Result<usize> {
        let stores = self.live_stores().await;
        let mut removed = 0;
        for store in &stores {
            let key = namespaced_key(store.store_name(), identity);
            if self.kv.get(&key)?.is_some() {
                self.kv.remove(&key)?;
                removed += 1;
            }
        }
        self.kv.flush()?;
        debug!(removed, "Purged namespaced snapshots");
        Ok(removed)
    }

    /// Every snapshot key of every registered store, whatever its identity.
    /// Falls back to `known` namespaces for a store whose listing fails.
    fn all_namespaces(
        &self,
        stores: &[Arc<dyn NamespacedStore>],
        known: &[Option<&str>],
    ) -> Vec<String> {
        let mut keys = Vec::new();
        for store in stores {
            let name = store.store_name();
            match self.kv.keys_with_prefix(&store_prefix(name)) {
                Ok(listed) => keys.extend(
                    listed
                        .into_iter()
                        .filter(|key| decode_namespaced_key(key, name).is_some()),
                ),
                Err(e) => {
                    warn!(store = name, error = %e, "Listing snapshots failed, purging known namespaces");
                    keys.extend(known.iter().map(|identity| namespaced_key(name, *identity)));
                }
            }
        }
        keys
    }

    /// Best effort: a key that cannot be removed is logged and skipped
    fn purge_keys(&self, keys: &[String]) -> usize {
        let mut removed = 0;
        for key in keys {
            match self.kv.remove(key) {
                Ok(()) => removed += 1,
                Err(e) => warn!(key = %key, error = %e, "Failed to purge snapshot"),
            }
        }
        if let Err(e) = self.kv.flush() {
            warn!(error = %e, "Flush after purge failed");
        }
        debug!(removed, attempted = keys.len(), "Purged namespaced snapshots");
        removed
    }

    /// Reset and reload every store; all are attempted, the first error wins
    async fn reload_all(
        &self,
        stores: &[Arc<dyn NamespacedStore>],
        identity: Option<&str>,
    ) -> Result<()> {
        let mut first_error = None;
        for store in stores {
            match store.reload(identity).await {
                Ok(outcome) => {
                    debug!(store = store.store_name(), outcome = ?outcome, "Store reloaded");
                }
                Err(e) => {
                    warn!(store = store.store_name(), error = %e, "Store reload failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Move to `next` and bring every registered store in line with it.
    ///
    /// - switch between two identities: purge every namespace of every
    ///   registered store, then reload from scratch
    /// - sign-out: purge the departing identity, reload as anonymous
    /// - sign-in: reload from the new identity's namespace
    ///
    /// The identity only changes once every store has reloaded. If a reload
    /// fails the stores are reloaded under the previous identity and the
    /// error is returned; purged snapshots stay purged.
    pub async fn apply_identity(&self, next: Option<String>) -> Result<IdentityTransition> {
        let mut identity = self.identity.write().await;
        if *identity == next {
            return Ok(IdentityTransition::Unchanged);
        }

        let stores = self.live_stores().await;
        let transition = match (identity.as_deref(), next.as_deref()) {
            (Some(from), Some(to)) => {
                let keys = self.all_namespaces(&stores, &[Some(from), Some(to), None]);
                let removed = self.purge_keys(&keys);
                info!(from, to, removed, "Identity switched, purged all namespaces");
                IdentityTransition::Switched {
                    from: from.to_string(),
                    to: to.to_string(),
                }
            }
            (Some(from), None) => {
                let keys: Vec<String> = stores
                    .iter()
                    .map(|store| namespaced_key(store.store_name(), Some(from)))
                    .collect();
                let removed = self.purge_keys(&keys);
                info!(from, removed, "Signed out, purged identity namespace");
                IdentityTransition::SignedOut {
                    from: from.to_string(),
                }
            }
            (None, Some(to)) => {
                info!(to, "Signed in");
                IdentityTransition::SignedIn { to: to.to_string() }
            }
            (None, None) => IdentityTransition::Unchanged,
        };

        if let Err(e) = self.reload_all(&stores, next.as_deref()).await {
            warn!(
                previous = identity.as_deref().unwrap_or("anonymous"),
                error = %e,
                "Identity change failed, keeping previous identity"
            );
            if let Err(restore) = self.reload_all(&stores, identity.as_deref()).await {
                error!(error = %restore, "Reload under previous identity failed");
            }
            return Err(e);
        }

        *identity = next;
        Ok(transition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::backend::{FlakyKv, MemoryKv};
    use crate::persist::store::{Persisted, PersistedStore};

    #[derive(Debug, Default)]
    struct Notes {
        lines: Vec<String>,
    }

    impl PersistedStore for Notes {
        const STORE_NAME: &'static str = "notes";
        type Snapshot = Vec<String>;

        fn snapshot(&self) -> Vec<String> {
            self.lines.clone()
        }

        fn restore(&mut self, snapshot: Vec<String>) {
            self.lines = snapshot;
        }

        fn reset(&mut self) {
            self.lines.clear();
        }

        fn is_meaningful(snapshot: &Vec<String>) -> bool {
            !snapshot.is_empty()
        }
    }

    /// Second store so registry iteration covers more than one entry
    #[derive(Debug, Default)]
    struct Jobs {
        lines: Vec<String>,
    }

    impl PersistedStore for Jobs {
        const STORE_NAME: &'static str = "jobs";
        type Snapshot = Vec<String>;

        fn snapshot(&self) -> Vec<String> {
            self.lines.clone()
        }

        fn restore(&mut self, snapshot: Vec<String>) {
            self.lines = snapshot;
        }

        fn reset(&mut self) {
            self.lines.clear();
        }
    }

    #[tokio::test]
    async fn test_switch_purges_and_isolates() {
        let kv = Arc::new(MemoryKv::new());
        let gateway = PersistenceGateway::new(kv.clone(), Some("a".to_string()));
        let notes = Persisted::attach(&gateway, Notes::default()).await.unwrap();

        notes.mutate(|n| n.lines.push("from a".to_string())).await;
        assert!(kv.get("notes_user_a").unwrap().is_some());

        let transition = gateway.apply_identity(Some("b".to_string())).await.unwrap();
        assert_eq!(
            transition,
            IdentityTransition::Switched {
                from: "a".to_string(),
                to: "b".to_string()
            }
        );
        assert!(kv.get("notes_user_a").unwrap().is_none());
        assert!(notes.read(|n| n.lines.is_empty()).await);

        notes.mutate(|n| n.lines.push("from b".to_string())).await;
        let raw = kv.get("notes_user_b").unwrap().unwrap();
        assert!(!String::from_utf8_lossy(&raw).contains("from a"));
    }

    #[tokio::test]
    async fn test_switch_purges_bystander_identities() {
        let kv = Arc::new(MemoryKv::new());
        kv.put("notes_user_carol", b"left behind").unwrap();
        kv.put("notes_anonymous", b"guest").unwrap();
        kv.put("other_user_carol", b"not ours").unwrap();

        let gateway = PersistenceGateway::new(kv.clone(), Some("alice".to_string()));
        let notes = Persisted::attach(&gateway, Notes::default()).await.unwrap();
        notes.mutate(|n| n.lines.push("alice's".to_string())).await;

        gateway.apply_identity(Some("bob".to_string())).await.unwrap();

        assert!(kv.get("notes_user_alice").unwrap().is_none());
        assert!(kv.get("notes_user_carol").unwrap().is_none());
        assert!(kv.get("notes_anonymous").unwrap().is_none());
        assert!(kv.get("other_user_carol").unwrap().is_some());

        gateway.apply_identity(Some("carol".to_string())).await.unwrap();
        assert!(notes.read(|n| n.lines.is_empty()).await);
    }

    #[tokio::test]
    async fn test_purge_failure_does_not_stop_switch() {
        let kv = Arc::new(FlakyKv::default());
        let gateway = PersistenceGateway::new(kv.clone(), Some("alice".to_string()));
        let notes = Persisted::attach(&gateway, Notes::default()).await.unwrap();
        let _jobs = Persisted::attach(&gateway, Jobs::default()).await.unwrap();
        notes.mutate(|n| n.lines.push("alice's".to_string())).await;
        kv.put("jobs_user_alice", b"[]").unwrap();

        kv.fail_on("remove", "notes_");
        let transition = gateway.apply_identity(Some("bob".to_string())).await.unwrap();

        assert!(matches!(transition, IdentityTransition::Switched { .. }));
        assert_eq!(gateway.current_identity().await.as_deref(), Some("bob"));
        assert!(kv.get("jobs_user_alice").unwrap().is_none());
        assert!(notes.read(|n| n.lines.is_empty()).await);
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_previous_identity() {
        let kv = Arc::new(FlakyKv::default());
        let gateway = PersistenceGateway::new(kv.clone(), Some("alice".to_string()));
        let notes = Persisted::attach(&gateway, Notes::default()).await.unwrap();
        let jobs = Persisted::attach(&gateway, Jobs::default()).await.unwrap();
        notes.mutate(|n| n.lines.push("alice's".to_string())).await;

        kv.fail_on("get", "jobs_user_bob");
        assert!(gateway.apply_identity(Some("bob".to_string())).await.is_err());

        assert_eq!(gateway.current_identity().await.as_deref(), Some("alice"));
        assert!(notes.read(|n| n.lines.is_empty()).await);
        assert!(jobs.read(|j| j.lines.is_empty()).await);

        kv.heal();
        gateway.apply_identity(Some("bob".to_string())).await.unwrap();
        assert_eq!(gateway.current_identity().await.as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn test_sign_out_purges_only_departing_identity() {
        let kv = Arc::new(MemoryKv::new());
        kv.put("notes_user_other", b"kept").unwrap();

        let gateway = PersistenceGateway::new(kv.clone(), Some("a".to_string()));
        let notes = Persisted::attach(&gateway, Notes::default()).await.unwrap();
        notes.mutate(|n| n.lines.push("secret".to_string())).await;

        let transition = gateway.apply_identity(None).await.unwrap();
        assert_eq!(transition, IdentityTransition::SignedOut { from: "a".to_string() });
        assert!(kv.get("notes_user_a").unwrap().is_none());
        assert!(kv.get("notes_user_other").unwrap().is_some());
        assert!(notes.read(|n| n.lines.is_empty()).await);
        assert_eq!(gateway.current_identity().await, None);
    }

    #[tokio::test]
    async fn test_sign_in_loads_identity_snapshot() {
        let kv = Arc::new(MemoryKv::new());
        {
            let gateway = PersistenceGateway::new(kv.clone(), Some("carol".to_string()));
            let notes = Persisted::attach(&gateway, Notes::default()).await.unwrap();
            notes.mutate(|n| n.lines.push("carol's".to_string())).await;
        }

        let gateway = PersistenceGateway::new(kv, None);
        let notes = Persisted::attach(&gateway, Notes::default()).await.unwrap();
        assert!(notes.read(|n| n.lines.is_empty()).await);

        let transition = gateway.apply_identity(Some("carol".to_string())).await.unwrap();
        assert_eq!(transition, IdentityTransition::SignedIn { to: "carol".to_string() });
        assert_eq!(notes.read(|n| n.lines.clone()).await, vec!["carol's".to_string()]);
    }

    #[tokio::test]
    async fn test_same_identity_is_unchanged() {
        let kv = Arc::new(MemoryKv::new());
        let gateway = PersistenceGateway::new(kv, Some("a".to_string()));
        let _notes = Persisted::attach(&gateway, Notes::default()).await.unwrap();

        assert_eq!(
            gateway.apply_identity(Some("a".to_string())).await.unwrap(),
            IdentityTransition::Unchanged
        );
        assert_eq!(gateway.store_names().await, vec!["notes"]);
    }

    #[tokio::test]
    async fn test_dropped_stores_leave_registry() {
        let kv = Arc::new(MemoryKv::new());
        let gateway = PersistenceGateway::new(kv, None);
        let notes = Persisted::attach(&gateway, Notes::default()).await.unwrap();
        drop(notes);

        assert!(gateway.store_names().await.is_empty());
    }
}
