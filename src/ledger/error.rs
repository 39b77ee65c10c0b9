use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("Insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance { requested: i64, available: i64 },

    #[error("Invalid amount: {0}")]
    InvalidAmount(i64),
}

pub type Result<T> = std::result::Result<T, LedgerError>;
