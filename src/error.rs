use thiserror::Error;

use crate::engine::ReconcileError;
use crate::store::LedgerError;

/// Error returned by [`LoyaltyLedger`](crate::LoyaltyLedger) operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}

impl Error {
    /// Expected business outcome rather than a fault.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Error::Ledger(
                LedgerError::DuplicateOtherOrder(_)
                    | LedgerError::InsufficientFunds { .. }
                    | LedgerError::NegativeAmount(_)
            )
        )
    }
}
