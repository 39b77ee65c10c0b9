//! Identity-namespaced persistence
//!
//! Every store that needs to survive restarts is wrapped in [`Persisted`],
//! which writes its snapshot through to a [`KvStore`] after each mutation.
//! Keys take the form `{store}_user_{identity}` or `{store}_anonymous`.
//!
//! The [`PersistenceGateway`] holds the current identity and the registry of
//! attached stores. On an identity change it purges the affected namespaces
//! for every registered store and reloads them, so state written for one user
//! is never visible to another.

pub mod backend;
pub mod error;
pub mod gateway;
pub mod keys;
pub mod store;

pub use backend::{FjallKv, KvStore, MemoryKv};
pub use error::{PersistError, Result};
pub use gateway::{IdentityTransition, PersistenceGateway};
pub use keys::{ANONYMOUS_SUFFIX, decode_namespaced_key, identity_suffix, namespaced_key, store_prefix};
pub use store::{LoadOutcome, NamespacedStore, Persisted, PersistedStore, SNAPSHOT_VERSION};
