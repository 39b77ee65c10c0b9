/// Optimistic credit ledger
///
/// The ledger holds the balance the user sees. Deductions apply immediately
/// and are counted as pending until a server read confirms them; reads from
/// the server are folded in through [`ReconcilePolicy`], which decides whether
/// a read is authoritative or merely lagging behind local work.
///
/// ## Compensation
///
/// Every deduction tied to an operation that later fails is paired with
/// [`CreditLedger::refund`]. If that compensation is lost, the stale rule of
/// the policy eventually restores the server's value.
///
/// ## Usage
///
/// ```rust
/// use creditsync::ledger::{CreditLedger, ReconcilePolicy};
/// use std::time::Duration;
///
/// let mut ledger = CreditLedger::with_balance(100);
/// ledger.deduct(20, Some("job_1"), "text to image").unwrap();
/// assert_eq!(ledger.balance(), 80);
///
/// // server has not applied the spend yet
/// let outcome = ledger.reconcile(100, Duration::from_secs(5), &ReconcilePolicy::default());
/// assert!(!outcome.adopted());
/// ```

pub mod error;
pub mod policy;
pub mod store;

pub use error::{LedgerError, Result};
pub use policy::{AdoptReason, Decision, DiscardReason, ReconcilePolicy};
pub use store::{CreditLedger, CreditSnapshot, ReconcileOutcome, Transaction, TransactionKind};
