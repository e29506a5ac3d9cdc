//! Storage collaborator for the ledger.
//!
//! The engine only talks to storage through the [`Store`] trait, which groups
//! the three repositories (orders, users, withdrawals) with the two atomic
//! units of work that touch more than one of them:
//!
//! - [`Store::settle`]: terminal order transition + balance credit
//! - [`Store::withdraw`]: balance debit + withdrawal record
//!
//! Two variants exist, [`MemoryStore`] and [`PgStore`]; [`connect`] picks one
//! from configuration.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::Amount;
use crate::model::{Balance, Order, OrderId, OrderNumber, OrderStatus, UserId, Withdrawal};

mod account;
pub use account::UserAccount;

mod error;
pub use error::LedgerError;

pub mod memory;
pub use memory::MemoryStore;

pub mod postgres;
pub use postgres::PgStore;

/// Order lifecycle and lookup.
#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Create an order in `New` state.
    ///
    /// Fails with `DuplicateOwnOrder` if `user` already owns `number`, or
    /// `DuplicateOtherOrder` if someone else does.
    async fn create_order(&self, number: &OrderNumber, user: UserId)
    -> Result<OrderId, LedgerError>;

    async fn get_order(&self, number: &OrderNumber) -> Result<Option<Order>, LedgerError>;

    /// Move an order along one legal edge, updating the reward with the status.
    /// Terminal targets go through [`Store::settle`] so the reward is credited.
    async fn transition(
        &self,
        number: &OrderNumber,
        status: OrderStatus,
        reward: Amount,
    ) -> Result<Order, LedgerError>;

    /// Orders of `user` still in `New` or `Processing`.
    async fn non_terminal_orders(&self, user: UserId) -> Result<Vec<Order>, LedgerError>;

    /// All orders of `user`, oldest first.
    async fn orders_by_user(&self, user: UserId) -> Result<Vec<Order>, LedgerError>;
}

/// Per-user balances.
#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Idempotent.
    async fn create_user(&self, user: UserId) -> Result<(), LedgerError>;

    async fn balance(&self, user: UserId) -> Result<Balance, LedgerError>;

    async fn users(&self) -> Result<Vec<UserId>, LedgerError>;
}

/// Withdrawal history.
#[async_trait]
pub trait WithdrawalRepository: Send + Sync {
    /// All withdrawals of `user`, oldest first.
    async fn withdrawals_by_user(&self, user: UserId) -> Result<Vec<Withdrawal>, LedgerError>;

    async fn withdrawn_sum(&self, user: UserId) -> Result<Amount, LedgerError>;
}

/// The full storage contract used by the engine and the ledger facade.
#[async_trait]
pub trait Store: OrderRepository + UserRepository + WithdrawalRepository {
    /// Apply a terminal status to an order and, for `Processed` with a
    /// positive reward, credit the owner. Both halves commit or neither does.
    ///
    /// The credit is only reached when the transition itself succeeds, so a
    /// second settle of the same order fails with an already-terminal
    /// `InvalidTransition` and never credits twice.
    async fn settle(
        &self,
        number: &OrderNumber,
        status: OrderStatus,
        reward: Amount,
    ) -> Result<Order, LedgerError>;

    /// Debit `amount` from `user` and record the withdrawal. Rejected
    /// withdrawals leave no trace.
    async fn withdraw(
        &self,
        user: UserId,
        order_ref: &OrderNumber,
        amount: Amount,
    ) -> Result<Withdrawal, LedgerError>;
}

/// Which storage variant to run on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreKind {
    Memory,
    Postgres { uri: String },
}

impl StoreKind {
    /// A configured database URI selects PostgreSQL, otherwise memory.
    pub fn from_uri(uri: Option<&str>) -> Self {
        match uri.map(str::trim) {
            Some(uri) if !uri.is_empty() => StoreKind::Postgres {
                uri: uri.to_string(),
            },
            _ => StoreKind::Memory,
        }
    }
}

/// Build the configured store.
pub async fn connect(
    kind: &StoreKind,
    acquire_timeout: Duration,
) -> Result<Arc<dyn Store>, LedgerError> {
    match kind {
        StoreKind::Memory => {
            info!("using in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreKind::Postgres { uri } => {
            let store = PgStore::connect(uri, acquire_timeout).await?;
            store.migrate().await?;
            Ok(Arc::new(store))
        }
    }
}

fn ensure_non_negative(amount: Amount) -> Result<(), LedgerError> {
    if amount.is_negative() {
        return Err(LedgerError::NegativeAmount(amount));
    }
    Ok(())
}

/// Reward actually stored for a settled order.
fn settled_reward(status: OrderStatus, reward: Amount) -> Amount {
    match status {
        OrderStatus::Processed => reward,
        _ => Amount::ZERO,
    }
}
