use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RetentionConfig;
use crate::persist::PersistedStore;

use super::error::{LedgerError, Result};
use super::policy::{Decision, ReconcilePolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Debit,
    Credit,
    Purchase,
}

/// One applied balance change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub amount: i64,
    pub kind: TransactionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// Result of folding a server read into the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub decision: Decision,
    pub local: i64,
    pub server: i64,
    pub pending_before: i64,
}

impl ReconcileOutcome {
    pub fn adopted(&self) -> bool {
        matches!(self.decision, Decision::Adopt(_))
    }
}

/// Locally mutated credit balance with optimistic deductions.
///
/// `base_balance + sum(transactions) == balance` holds after every local
/// mutation. Transactions evicted by the retention cap are folded into
/// `base_balance`; an adopted server read rebases it.
#[derive(Debug, Clone)]
pub struct CreditLedger {
    balance: i64,
    pending_deductions: i64,
    base_balance: i64,
    transactions: VecDeque<Transaction>,
    last_local_update: Option<DateTime<Utc>>,
    last_server_sync: Option<DateTime<Utc>>,
    memory_cap: usize,
    persisted_cap: usize,
}

impl Default for CreditLedger {
    fn default() -> Self {
        Self::new(&RetentionConfig::default())
    }
}

impl CreditLedger {
    pub fn new(retention: &RetentionConfig) -> Self {
        Self {
            balance: 0,
            pending_deductions: 0,
            base_balance: 0,
            transactions: VecDeque::new(),
            last_local_update: None,
            last_server_sync: None,
            memory_cap: retention.transactions_in_memory.max(1),
            persisted_cap: retention.transactions_persisted.max(1),
        }
    }

    /// Ledger seeded with an opening balance (no transaction is recorded)
    pub fn with_balance(balance: i64) -> Self {
        let mut ledger = Self::default();
        ledger.balance = balance;
        ledger.base_balance = balance;
        ledger
    }

    pub fn balance(&self) -> i64 {
        self.balance
    }

    pub fn pending_deductions(&self) -> i64 {
        self.pending_deductions
    }

    /// Most recent last
    pub fn transactions(&self) -> impl Iterator<Item = &Transaction> {
        self.transactions.iter()
    }

    pub fn last_local_update(&self) -> Option<DateTime<Utc>> {
        self.last_local_update
    }

    pub fn last_server_sync(&self) -> Option<DateTime<Utc>> {
        self.last_server_sync
    }

    /// Elapsed time since the last local mutation; `Duration::MAX` if the
    /// ledger was never mutated locally.
    pub fn since_last_local_update(&self, now: DateTime<Utc>) -> Duration {
        match self.last_local_update {
            Some(at) => (now - at).to_std().unwrap_or(Duration::ZERO),
            None => Duration::MAX,
        }
    }

    pub fn is_consistent(&self) -> bool {
        let applied: i64 = self.transactions.iter().map(|t| t.amount).sum();
        self.base_balance + applied == self.balance
    }

    /// Optimistically spend `amount` credits.
    ///
    /// A negative amount is a refund and always succeeds.
    pub fn deduct(
        &mut self,
        amount: i64,
        job_id: Option<&str>,
        description: &str,
    ) -> Result<Transaction> {
        if amount > 0 && self.balance < amount {
            debug!(amount, balance = self.balance, "Deduction rejected");
            return Err(LedgerError::InsufficientBalance {
                requested: amount,
                available: self.balance,
            });
        }

        self.balance -= amount;
        if amount > 0 {
            self.pending_deductions += amount;
        }

        let kind = if amount >= 0 {
            TransactionKind::Debit
        } else {
            TransactionKind::Credit
        };
        let tx = self.record(-amount, kind, job_id, description);
        debug!(
            amount,
            balance = self.balance,
            pending = self.pending_deductions,
            job_id = ?job_id,
            "Credits deducted"
        );
        Ok(tx)
    }

    /// Credit the balance; used for grants and refund compensation
    pub fn add(&mut self, amount: i64, description: &str) -> Result<Transaction> {
        self.credit(amount, TransactionKind::Credit, None, description)
    }

    pub fn purchase(&mut self, amount: i64, description: &str) -> Result<Transaction> {
        self.credit(amount, TransactionKind::Purchase, None, description)
    }

    /// Compensate a deduction made for `job_id`.
    ///
    /// Never fails; a non-positive amount is a no-op. Releases up to `amount`
    /// of the pending deductions since the server never saw the spend.
    pub fn refund(&mut self, amount: i64, job_id: &str, description: &str) -> Option<Transaction> {
        if amount <= 0 {
            return None;
        }

        self.balance += amount;
        self.pending_deductions = (self.pending_deductions - amount).max(0);
        let tx = self.record(amount, TransactionKind::Credit, Some(job_id), description);
        info!(amount, job_id, balance = self.balance, "Credits refunded");
        Some(tx)
    }

    fn credit(
        &mut self,
        amount: i64,
        kind: TransactionKind,
        job_id: Option<&str>,
        description: &str,
    ) -> Result<Transaction> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }

        self.balance += amount;
        let tx = self.record(amount, kind, job_id, description);
        debug!(amount, balance = self.balance, kind = ?kind, "Credits added");
        Ok(tx)
    }

    fn record(
        &mut self,
        amount: i64,
        kind: TransactionKind,
        job_id: Option<&str>,
        description: &str,
    ) -> Transaction {
        let now = Utc::now();
        let tx = Transaction {
            id: Uuid::now_v7().to_string(),
            amount,
            kind,
            job_id: job_id.map(str::to_owned),
            description: description.to_string(),
            created_at: now,
        };

        self.transactions.push_back(tx.clone());
        while self.transactions.len() > self.memory_cap {
            if let Some(evicted) = self.transactions.pop_front() {
                self.base_balance += evicted.amount;
            }
        }
        self.last_local_update = Some(now);
        tx
    }

    /// Fold an authoritative balance read into local state.
    ///
    /// `since_local_update` is the time elapsed since the last local mutation.
    pub fn reconcile(
        &mut self,
        server_balance: i64,
        since_local_update: Duration,
        policy: &ReconcilePolicy,
    ) -> ReconcileOutcome {
        let outcome = ReconcileOutcome {
            decision: policy.decide(
                self.balance,
                server_balance,
                self.pending_deductions,
                since_local_update,
            ),
            local: self.balance,
            server: server_balance,
            pending_before: self.pending_deductions,
        };

        match outcome.decision {
            Decision::Adopt(reason) => {
                let applied: i64 = self.transactions.iter().map(|t| t.amount).sum();
                self.balance = server_balance;
                self.pending_deductions = 0;
                self.base_balance = server_balance.saturating_sub(applied);
                self.last_server_sync = Some(Utc::now());
                if outcome.local != server_balance {
                    info!(
                        local = outcome.local,
                        server = server_balance,
                        reason = ?reason,
                        "Adopted server balance"
                    );
                }
            }
            Decision::Discard(reason) => {
                warn!(
                    local = outcome.local,
                    server = server_balance,
                    pending = outcome.pending_before,
                    since_ms = since_local_update.as_millis() as u64,
                    reason = ?reason,
                    "Discarded server balance read"
                );
            }
        }

        outcome
    }
}

/// Persisted projection of [`CreditLedger`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditSnapshot {
    pub balance: i64,
    pub pending_deductions: i64,
    pub base_balance: i64,
    pub transactions: Vec<Transaction>,
    pub last_local_update: Option<DateTime<Utc>>,
    pub last_server_sync: Option<DateTime<Utc>>,
}

impl PersistedStore for CreditLedger {
    const STORE_NAME: &'static str = "credits";
    type Snapshot = CreditSnapshot;

    fn snapshot(&self) -> CreditSnapshot {
        let skip = self.transactions.len().saturating_sub(self.persisted_cap);
        let transactions: Vec<Transaction> = self.transactions.iter().skip(skip).cloned().collect();
        let dropped: i64 = self.transactions.iter().take(skip).map(|t| t.amount).sum();

        CreditSnapshot {
            balance: self.balance,
            pending_deductions: self.pending_deductions,
            base_balance: self.base_balance + dropped,
            transactions,
            last_local_update: self.last_local_update,
            last_server_sync: self.last_server_sync,
        }
    }

    fn restore(&mut self, snapshot: CreditSnapshot) {
        self.balance = snapshot.balance;
        self.pending_deductions = snapshot.pending_deductions.max(0);
        self.base_balance = snapshot.base_balance;
        self.transactions = snapshot.transactions.into();
        self.last_local_update = snapshot.last_local_update;
        self.last_server_sync = snapshot.last_server_sync;

        if !self.is_consistent() {
            warn!(balance = self.balance, "Restored ledger failed consistency check, rebasing");
            let applied: i64 = self.transactions.iter().map(|t| t.amount).sum();
            self.base_balance = self.balance - applied;
        }
    }

    fn reset(&mut self) {
        self.balance = 0;
        self.pending_deductions = 0;
        self.base_balance = 0;
        self.transactions.clear();
        self.last_local_update = None;
        self.last_server_sync = None;
    }

    fn is_meaningful(snapshot: &CreditSnapshot) -> bool {
        snapshot.balance != 0
            || snapshot.pending_deductions != 0
            || !snapshot.transactions.is_empty()
            || snapshot.last_server_sync.is_some()
    }
}
