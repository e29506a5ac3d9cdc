use crate::model::{Balance, UserId, Withdrawal};
use crate::{Amount, LedgerError};

/// A user's running totals together with their withdrawal history.
///
/// `accrued` only grows through [`credit`](Self::credit) and `withdrawn`
/// only grows through [`debit`](Self::debit), so
/// `current == accrued - withdrawn` can never go negative.
#[derive(Debug, Default)]
pub struct UserAccount {
    accrued: Amount,
    withdrawn: Amount,
    withdrawals: Vec<Withdrawal>,
}

impl UserAccount {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn balance(&self) -> Balance {
        Balance {
            current: self.accrued - self.withdrawn,
            withdrawn: self.withdrawn,
        }
    }

    pub fn credit(&mut self, user: UserId, amount: Amount) -> Result<(), LedgerError> {
        if amount.is_negative() {
            return Err(LedgerError::NegativeAmount(amount));
        }
        self.accrued = self
            .accrued
            .checked_add(amount)
            .ok_or(LedgerError::AmountOverflow { user, amount })?;
        Ok(())
    }

    pub fn debit(&mut self, user: UserId, amount: Amount) -> Result<(), LedgerError> {
        if amount.is_negative() {
            return Err(LedgerError::NegativeAmount(amount));
        }
        let available = self.balance().current;
        if available < amount {
            return Err(LedgerError::InsufficientFunds {
                user,
                available,
                requested: amount,
            });
        }
        self.withdrawn = self
            .withdrawn
            .checked_add(amount)
            .ok_or(LedgerError::AmountOverflow { user, amount })?;
        Ok(())
    }

    /// Append a withdrawal row. Only valid right after a successful `debit`
    /// of the same amount, under the same lock.
    pub fn record(&mut self, withdrawal: Withdrawal) {
        self.withdrawals.push(withdrawal);
    }

    pub fn withdrawals(&self) -> &[Withdrawal] {
        &self.withdrawals
    }
}
