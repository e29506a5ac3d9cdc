//! Error types for order reconciliation.

use thiserror::Error;

use crate::model::{OrderNumber, UserId};
use crate::store::LedgerError;

/// Error returned by [`ReconciliationEngine::reconcile`](super::ReconciliationEngine::reconcile)
/// and by the worker pool.
///
/// Transient oracle failures never show up here; they are retried.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("order {number}: {reason}")]
    Decode { number: OrderNumber, reason: String },

    #[error("order {0} not found")]
    OrderNotFound(OrderNumber),

    #[error("user {0} not found")]
    UserNotFound(UserId),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("reconciliation queue is closed")]
    QueueClosed,

    #[error("reconciliation worker was lost")]
    WorkerLost,
}

impl ReconcileError {
    /// Lift referential ledger failures into their own variants.
    pub(crate) fn from_ledger(err: LedgerError) -> Self {
        match err {
            LedgerError::OrderNotFound(number) => ReconcileError::OrderNotFound(number),
            LedgerError::UserNotFound(user) => ReconcileError::UserNotFound(user),
            other => ReconcileError::Ledger(other),
        }
    }
}
