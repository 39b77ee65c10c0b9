use std::sync::Arc;

use crate::engine::SyncContext;
use crate::identity::WatchIdentity;

#[derive(Clone)]
pub struct AppState {
    pub context: Arc<SyncContext>,
    /// Set when the daemon owns the identity provider and accepts `/identity`
    pub identity: Option<Arc<WatchIdentity>>,
    pub max_payload_bytes: usize,
}

impl AppState {
    pub fn new(context: Arc<SyncContext>) -> Self {
        let max_payload_bytes = context.config().server.max_payload_bytes;
        Self {
            context,
            identity: None,
            max_payload_bytes,
        }
    }

    pub fn with_identity(mut self, identity: Arc<WatchIdentity>) -> Self {
        self.identity = Some(identity);
        self
    }
}
