//! Error types for ledger storage operations.

use thiserror::Error;

use crate::Amount;
use crate::model::{OrderNumber, OrderStatus, UserId};

/// Error returned by every [`Store`](super::Store) operation.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("order {0} was already submitted by this user")]
    DuplicateOwnOrder(OrderNumber),

    #[error("order {0} was already submitted by another user")]
    DuplicateOtherOrder(OrderNumber),

    #[error("order {0} not found")]
    OrderNotFound(OrderNumber),

    #[error("order {number}: invalid transition {from} -> {to}")]
    InvalidTransition {
        number: OrderNumber,
        from: OrderStatus,
        to: OrderStatus,
    },

    #[error("user {0} not found")]
    UserNotFound(UserId),

    #[error("insufficient funds for user {user}: available {available}, requested {requested}")]
    InsufficientFunds {
        user: UserId,
        available: Amount,
        requested: Amount,
    },

    #[error("amount must not be negative, got {0}")]
    NegativeAmount(Amount),

    #[error("amount overflow for user {user}: cannot add {amount}")]
    AmountOverflow { user: UserId, amount: Amount },

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl LedgerError {
    /// The transition was rejected because the order had already settled.
    pub fn is_already_terminal(&self) -> bool {
        matches!(self, LedgerError::InvalidTransition { from, .. } if from.is_terminal())
    }
}
