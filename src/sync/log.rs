use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncLogKind {
    Network,
    Server,
    Auth,
    Compensation,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncLogEntry {
    pub id: u64,
    pub at: DateTime<Utc>,
    pub kind: SyncLogKind,
    pub message: String,
    pub occurrences: u32,
    pub dismissed: bool,
}

#[derive(Debug)]
struct Inner {
    entries: VecDeque<SyncLogEntry>,
    next_id: u64,
}

/// Bounded side channel for transient sync errors.
///
/// Failures recorded here are never raised to the caller that triggered the
/// poll. A repeat of the newest undismissed entry bumps its occurrence count
/// instead of adding a line; the oldest entry is dropped at the cap.
#[derive(Debug)]
pub struct SyncLog {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl SyncLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: VecDeque::new(),
                next_id: 1,
            }),
            capacity: capacity.max(1),
        }
    }

    fn with_inner<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut inner)
    }

    pub fn record(&self, kind: SyncLogKind, message: impl Into<String>) -> u64 {
        let capacity = self.capacity;
        let message = message.into();
        self.with_inner(|inner| {
            if let Some(last) = inner.entries.back_mut() {
                if !last.dismissed && last.kind == kind && last.message == message {
                    last.occurrences += 1;
                    last.at = Utc::now();
                    return last.id;
                }
            }

            let id = inner.next_id;
            inner.next_id += 1;
            inner.entries.push_back(SyncLogEntry {
                id,
                at: Utc::now(),
                kind,
                message,
                occurrences: 1,
                dismissed: false,
            });
            while inner.entries.len() > capacity {
                inner.entries.pop_front();
            }
            id
        })
    }

    /// Returns `false` if no such entry is retained
    pub fn dismiss(&self, id: u64) -> bool {
        self.with_inner(|inner| match inner.entries.iter_mut().find(|e| e.id == id) {
            Some(entry) => {
                entry.dismissed = true;
                true
            }
            None => false,
        })
    }

    pub fn clear(&self) {
        self.with_inner(|inner| inner.entries.clear());
    }

    /// Undismissed entries, oldest first
    pub fn visible(&self) -> Vec<SyncLogEntry> {
        self.with_inner(|inner| inner.entries.iter().filter(|e| !e.dismissed).cloned().collect())
    }

    pub fn entries(&self) -> Vec<SyncLogEntry> {
        self.with_inner(|inner| inner.entries.iter().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded_and_dismissible() {
        let log = SyncLog::new(2);
        let first = log.record(SyncLogKind::Network, "timeout");
        let second = log.record(SyncLogKind::Server, "HTTP 502");
        let third = log.record(SyncLogKind::Network, "reset");

        let ids: Vec<u64> = log.entries().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![second, third]);
        assert!(!log.dismiss(first));

        assert!(log.dismiss(second));
        let visible = log.visible();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].message, "reset");

        log.clear();
        assert!(log.entries().is_empty());
    }

    #[test]
    fn test_repeats_coalesce() {
        let log = SyncLog::new(10);
        let id = log.record(SyncLogKind::Network, "connection refused");
        assert_eq!(log.record(SyncLogKind::Network, "connection refused"), id);

        let entries = log.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].occurrences, 2);

        log.dismiss(id);
        assert_ne!(log.record(SyncLogKind::Network, "connection refused"), id);
    }
}
