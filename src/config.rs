//! Command-line and environment configuration of the batch runner.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::engine::ReconcileConfig;
use crate::store::StoreKind;

/// Replay loyalty commands from a CSV file and print the resulting balances.
#[derive(Debug, Clone, Parser)]
#[command(name = "loyalty-ledger", version)]
pub struct Config {
    /// Input CSV with `type,user,order,amount` rows.
    pub input: PathBuf,

    /// Address of the accrual system (`host:port`, `:port` or URL).
    #[arg(
        short = 'r',
        long,
        env = "ACCRUAL_SYSTEM_ADDRESS",
        default_value = "http://localhost:8080"
    )]
    pub accrual_address: String,

    /// PostgreSQL connection URI; the in-memory store is used when absent.
    #[arg(short = 'd', long, env = "DATABASE_URI")]
    pub database_uri: Option<String>,

    /// Concurrent reconciliation workers.
    #[arg(long, env = "RECONCILE_WORKERS", default_value_t = 4)]
    pub workers: usize,

    /// Capacity of the reconciliation queue.
    #[arg(long, env = "RECONCILE_QUEUE_SIZE", default_value_t = 64)]
    pub queue_size: usize,

    /// Timeout of one accrual request, also used for database pool acquisition.
    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value_t = 5_000)]
    pub request_timeout_ms: u64,

    #[arg(long, env = "POLL_INTERVAL_MS", default_value_t = 1_000)]
    pub poll_interval_ms: u64,

    #[arg(long, env = "BACKOFF_INITIAL_MS", default_value_t = 500)]
    pub backoff_initial_ms: u64,

    #[arg(long, env = "BACKOFF_MAX_MS", default_value_t = 30_000)]
    pub backoff_max_ms: u64,

    /// Polls per order and pass before it is left pending.
    #[arg(long, env = "MAX_POLLS", default_value_t = 10)]
    pub max_polls: u32,
}

impl Config {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn store_kind(&self) -> StoreKind {
        StoreKind::from_uri(self.database_uri.as_deref())
    }

    pub fn reconcile(&self) -> ReconcileConfig {
        ReconcileConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            backoff_initial: Duration::from_millis(self.backoff_initial_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
            max_polls: self.max_polls.max(1),
        }
    }
}
