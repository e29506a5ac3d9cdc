//! Inbound interface of the loyalty ledger.
//!
//! [`LoyaltyLedger`] is what a request layer (or the batch runner) calls. It
//! owns the reconciliation pool and routes every mutation through the store's
//! atomic units.

use std::sync::Arc;
use tokio_stream::{Stream, StreamExt};
use tracing::{info, warn};

use crate::engine::{ReconcileOutcome, ReconcilePool, ReconciliationEngine};
use crate::model::{Balance, Command, Order, OrderId, OrderNumber, UserId, Withdrawal};
use crate::store::{LedgerError, OrderRepository, Store, UserRepository, WithdrawalRepository};
use crate::{Amount, Error};

/// Result of submitting an order number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted(OrderId),
    /// The same user had already submitted this number.
    AlreadySubmitted,
}

/// Tally of one reconciliation sweep.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    pub settled: usize,
    pub already_settled: usize,
    pub pending: usize,
    pub failed: Vec<OrderNumber>,
}

impl ReconcileReport {
    pub fn merge(&mut self, other: ReconcileReport) {
        self.settled += other.settled;
        self.already_settled += other.already_settled;
        self.pending += other.pending;
        self.failed.extend(other.failed);
    }
}

pub struct LoyaltyLedger {
    store: Arc<dyn Store>,
    pool: ReconcilePool,
}

/// Public API
impl LoyaltyLedger {
    pub fn new(engine: Arc<ReconciliationEngine>, workers: usize, queue_size: usize) -> Self {
        Self {
            store: engine.store().clone(),
            pool: ReconcilePool::spawn(engine, workers, queue_size),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub async fn register_user(&self, user: UserId) -> Result<(), Error> {
        self.store.create_user(user).await?;
        Ok(())
    }

    /// A duplicate by the same user is not an error; one by another user is.
    pub async fn submit_order(
        &self,
        user: UserId,
        number: &OrderNumber,
    ) -> Result<SubmitOutcome, Error> {
        match self.store.create_order(number, user).await {
            Ok(id) => Ok(SubmitOutcome::Accepted(id)),
            Err(LedgerError::DuplicateOwnOrder(_)) => Ok(SubmitOutcome::AlreadySubmitted),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn orders(&self, user: UserId) -> Result<Vec<Order>, Error> {
        Ok(self.store.orders_by_user(user).await?)
    }

    pub async fn balance(&self, user: UserId) -> Result<Balance, Error> {
        Ok(self.store.balance(user).await?)
    }

    /// Oldest first.
    pub async fn withdrawals(&self, user: UserId) -> Result<Vec<Withdrawal>, Error> {
        Ok(self.store.withdrawals_by_user(user).await?)
    }

    /// Withdraw against the reconciled balance. Pending orders of `user` are
    /// reconciled first so fresh rewards count.
    pub async fn request_withdrawal(
        &self,
        user: UserId,
        order_ref: &OrderNumber,
        amount: Amount,
    ) -> Result<Withdrawal, Error> {
        if let Err(e) = self.reconcile_pending(user).await {
            warn!(user = %user, reason = %e, "reconciliation before withdrawal failed");
        }
        Ok(self.store.withdraw(user, order_ref, amount).await?)
    }

    /// Queue every non-terminal order of `user` and wait for all of them.
    /// One failing order never stops the others.
    pub async fn reconcile_pending(&self, user: UserId) -> Result<ReconcileReport, Error> {
        let orders = self.store.non_terminal_orders(user).await?;

        let mut tickets = Vec::with_capacity(orders.len());
        for order in orders {
            tickets.push(self.pool.submit(order).await?);
        }

        let mut report = ReconcileReport::default();
        for ticket in tickets {
            let number = ticket.number().clone();
            match ticket.wait().await {
                Ok(ReconcileOutcome::Settled(_)) => report.settled += 1,
                Ok(ReconcileOutcome::AlreadySettled(_)) => report.already_settled += 1,
                Ok(ReconcileOutcome::Pending(_)) => report.pending += 1,
                Err(_) => report.failed.push(number),
            }
        }
        Ok(report)
    }

    /// Known users, ascending.
    pub async fn users(&self) -> Result<Vec<UserId>, Error> {
        Ok(self.store.users().await?)
    }

    /// [`reconcile_pending`](Self::reconcile_pending) for every known user.
    pub async fn reconcile_all(&self) -> Result<ReconcileReport, Error> {
        let mut report = ReconcileReport::default();
        for user in self.users().await? {
            report.merge(self.reconcile_pending(user).await?);
        }
        info!(
            settled = report.settled,
            pending = report.pending,
            failed = report.failed.len(),
            "reconciliation sweep done"
        );
        Ok(report)
    }

    /// Apply a single command.
    pub async fn apply(&self, command: Command) -> Result<(), Error> {
        match &command {
            Command::Register { user } => {
                let result = self.register_user(*user).await;
                Self::log_result("register", *user, None, None, &result);
                result?;
            }
            Command::SubmitOrder { user, number } => {
                let result = self.submit_order(*user, number).await;
                Self::log_result("order", *user, Some(number), None, &result);
                result?;
            }
            Command::Withdraw {
                user,
                order_ref,
                amount,
            } => {
                let result = self.request_withdrawal(*user, order_ref, *amount).await;
                Self::log_result("withdraw", *user, Some(order_ref), Some(*amount), &result);
                result?;
            }
        }
        Ok(())
    }

    /// Apply every command of `stream`; rejected commands are logged and skipped.
    pub async fn run(&self, mut stream: impl Stream<Item = Command> + Unpin) {
        while let Some(command) = stream.next().await {
            let _ = self.apply(command).await;
        }
    }

    /// Drain the reconciliation queue and stop its workers.
    pub async fn shutdown(self) {
        self.pool.shutdown().await;
    }
}

/// Private API
impl LoyaltyLedger {
    fn log_result<T>(
        op: &str,
        user: UserId,
        order: Option<&OrderNumber>,
        amount: Option<Amount>,
        result: &Result<T, Error>,
    ) {
        match (result, order, amount) {
            (Ok(_), Some(order), Some(amount)) => {
                info!(user = %user, order = %order, amount = %amount, "{op} applied");
            }
            (Ok(_), Some(order), None) => {
                info!(user = %user, order = %order, "{op} applied");
            }
            (Ok(_), None, _) => {
                info!(user = %user, "{op} applied");
            }
            (Err(e), Some(order), Some(amount)) => {
                warn!(user = %user, order = %order, amount = %amount, reason = %e, "{op} skipped");
            }
            (Err(e), Some(order), None) => {
                warn!(user = %user, order = %order, reason = %e, "{op} skipped");
            }
            (Err(e), None, _) => {
                warn!(user = %user, reason = %e, "{op} skipped");
            }
        }
    }
}
