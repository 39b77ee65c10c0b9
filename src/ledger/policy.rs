//! Decision procedure for folding a server balance read into local state

use std::time::Duration;

use crate::config::PolicyConfig;

/// Thresholds for [`ReconcilePolicy::decide`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilePolicy {
    pub stale_after: Duration,
    pub fresh_window: Duration,
    pub catch_up_tolerance: i64,
    pub drift_tolerance: i64,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        Self::from(&PolicyConfig::default())
    }
}

impl From<&PolicyConfig> for ReconcilePolicy {
    fn from(config: &PolicyConfig) -> Self {
        Self {
            stale_after: config.stale_after.as_duration(),
            fresh_window: config.fresh_window.as_duration(),
            catch_up_tolerance: config.catch_up_tolerance,
            drift_tolerance: config.drift_tolerance,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdoptReason {
    /// Local state has not been touched for longer than `stale_after`
    Stale,
    /// Credits only went up
    Increased,
    /// Server reached the locally observed value inside the fresh window
    Confirmed,
    /// Small drift after the fresh window has passed
    WithinDrift,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// Server has not applied a deduction that is already visible locally
    ServerLagging,
    /// No rule accepted the read
    Conflict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Adopt(AdoptReason),
    Discard(DiscardReason),
}

impl ReconcilePolicy {
    /// Rules are evaluated in order; the first match wins.
    ///
    /// 1. `since > stale_after`: adopt.
    /// 2. `since < fresh_window`, deductions pending, and the server exceeds
    ///    the local balance by exactly the pending amount (± catch-up
    ///    tolerance): discard.
    /// 3. `server > local`: adopt.
    /// 4. `since < fresh_window` and either `|local - server|` or
    ///    `|(local - server) - pending|` within `catch_up_tolerance`: adopt.
    /// 5. `fresh_window <= since <= stale_after` and
    ///    `|local - server| <= drift_tolerance`: adopt.
    /// 6. Otherwise discard.
    pub fn decide(&self, local: i64, server: i64, pending: i64, since: Duration) -> Decision {
        if since > self.stale_after {
            return Decision::Adopt(AdoptReason::Stale);
        }

        let fresh = since < self.fresh_window;
        // saturating: the server balance is untrusted input
        let ahead = server.saturating_sub(local);
        let behind = local.saturating_sub(server);

        if fresh
            && pending > 0
            && ahead.saturating_sub(pending).saturating_abs() <= self.catch_up_tolerance
        {
            return Decision::Discard(DiscardReason::ServerLagging);
        }

        if server > local {
            return Decision::Adopt(AdoptReason::Increased);
        }

        if fresh {
            if behind.saturating_abs() <= self.catch_up_tolerance
                || behind.saturating_sub(pending).saturating_abs() <= self.catch_up_tolerance
            {
                return Decision::Adopt(AdoptReason::Confirmed);
            }
            return Decision::Discard(DiscardReason::Conflict);
        }

        if behind.saturating_abs() <= self.drift_tolerance {
            return Decision::Adopt(AdoptReason::WithinDrift);
        }

        Decision::Discard(DiscardReason::Conflict)
    }
}
