pub mod accrual;
pub mod amount;
pub mod config;
pub mod csv;
pub mod engine;
mod error;
pub mod ledger;
pub mod model;
pub mod store;

pub use accrual::{AccrualSource, HttpAccrualClient};
pub use amount::Amount;
pub use config::Config;
pub use engine::{ReconcileConfig, ReconcileError, ReconcileOutcome, ReconciliationEngine};
pub use error::Error;
pub use ledger::{LoyaltyLedger, ReconcileReport, SubmitOutcome};
pub use model::{Balance, Command, Order, OrderNumber, OrderStatus, UserId, Withdrawal};
pub use store::{LedgerError, MemoryStore, Store};
