//! Identity provider seam
//!
//! The provider answers two questions: has identity resolution completed, and
//! who is the current principal (`None` = anonymous).

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityState {
    Resolving,
    Resolved(Option<String>),
}

pub trait IdentityProvider: Send + Sync {
    fn is_resolved(&self) -> bool;

    fn current(&self) -> Option<String>;

    /// Change notifications; the receiver starts at the current state
    fn subscribe(&self) -> watch::Receiver<IdentityState>;
}

/// Identity provider backed by a `watch` channel
#[derive(Debug)]
pub struct WatchIdentity {
    tx: watch::Sender<IdentityState>,
}

impl Default for WatchIdentity {
    fn default() -> Self {
        Self::new()
    }
}

impl WatchIdentity {
    /// Provider that has not resolved an identity yet
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(IdentityState::Resolving);
        Self { tx }
    }

    /// Provider that already knows the identity
    pub fn resolved(identity: Option<String>) -> Self {
        let (tx, _rx) = watch::channel(IdentityState::Resolved(identity));
        Self { tx }
    }

    pub fn sign_in(&self, identity: impl Into<String>) {
        let identity = identity.into();
        debug!(identity = %identity, "Identity signed in");
        self.tx.send_replace(IdentityState::Resolved(Some(identity)));
    }

    pub fn sign_out(&self) {
        debug!("Identity signed out");
        self.tx.send_replace(IdentityState::Resolved(None));
    }

    pub fn set(&self, state: IdentityState) {
        self.tx.send_replace(state);
    }
}

impl IdentityProvider for WatchIdentity {
    fn is_resolved(&self) -> bool {
        matches!(*self.tx.borrow(), IdentityState::Resolved(_))
    }

    fn current(&self) -> Option<String> {
        match &*self.tx.borrow() {
            IdentityState::Resolved(identity) => identity.clone(),
            IdentityState::Resolving => None,
        }
    }

    fn subscribe(&self) -> watch::Receiver<IdentityState> {
        self.tx.subscribe()
    }
}

/// Wait for the provider to report a definitive identity.
///
/// Falls back to anonymous once `timeout` has elapsed.
pub async fn wait_for_identity(
    provider: &dyn IdentityProvider,
    timeout: Duration,
    poll_interval: Duration,
) -> Option<String> {
    let deadline = Instant::now() + timeout;

    loop {
        if provider.is_resolved() {
            return provider.current();
        }
        if Instant::now() >= deadline {
            warn!(
                timeout_ms = timeout.as_millis() as u64,
                "Identity resolution timed out, continuing as anonymous"
            );
            return None;
        }
        tokio::time::sleep(poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_resolved_provider_returns_immediately() {
        let provider = WatchIdentity::resolved(Some("alice".to_string()));
        let identity =
            wait_for_identity(&provider, Duration::from_secs(5), Duration::from_millis(10)).await;
        assert_eq!(identity.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_times_out_to_anonymous() {
        let provider = WatchIdentity::new();
        let identity =
            wait_for_identity(&provider, Duration::from_millis(30), Duration::from_millis(5)).await;
        assert_eq!(identity, None);
    }

    #[tokio::test]
    async fn test_waits_for_late_resolution() {
        let provider = Arc::new(WatchIdentity::new());
        let late = provider.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            late.sign_in("bob");
        });

        let identity =
            wait_for_identity(provider.as_ref(), Duration::from_secs(2), Duration::from_millis(5))
                .await;
        assert_eq!(identity.as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn test_subscribe_sees_changes() {
        let provider = WatchIdentity::resolved(None);
        let mut rx = provider.subscribe();

        provider.sign_in("carol");
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), IdentityState::Resolved(Some("carol".to_string())));

        provider.sign_out();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), IdentityState::Resolved(None));
        assert!(provider.is_resolved());
        assert_eq!(provider.current(), None);
    }
}
