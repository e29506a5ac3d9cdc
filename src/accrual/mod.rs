//! Client side of the external accrual service.
//!
//! The service is an eventually-consistent oracle: it may not know an order
//! yet, may throttle us, or may be unreachable. [`AccrualSource::fetch`]
//! performs exactly one query and classifies the outcome; retry policy lives
//! in the engine.

use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::Amount;
use crate::model::{OrderNumber, OrderStatus};

mod http;
pub use http::HttpAccrualClient;

/// Status vocabulary of the accrual service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OracleStatus {
    Registered,
    Processing,
    Invalid,
    Processed,
}

impl OracleStatus {
    /// Internal status this oracle answer corresponds to.
    pub fn to_order_status(self) -> OrderStatus {
        match self {
            OracleStatus::Registered => OrderStatus::New,
            OracleStatus::Processing => OrderStatus::Processing,
            OracleStatus::Invalid => OrderStatus::Invalid,
            OracleStatus::Processed => OrderStatus::Processed,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.to_order_status().is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OracleStatus::Registered => "REGISTERED",
            OracleStatus::Processing => "PROCESSING",
            OracleStatus::Invalid => "INVALID",
            OracleStatus::Processed => "PROCESSED",
        }
    }
}

impl fmt::Display for OracleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OracleStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "REGISTERED" => Ok(OracleStatus::Registered),
            "PROCESSING" => Ok(OracleStatus::Processing),
            "INVALID" => Ok(OracleStatus::Invalid),
            "PROCESSED" => Ok(OracleStatus::Processed),
            other => Err(format!("unknown accrual status '{other}'")),
        }
    }
}

/// One decoded answer from the oracle.
#[derive(Debug, Clone, PartialEq)]
pub struct AccrualResult {
    pub number: OrderNumber,
    pub status: OracleStatus,
    /// Only meaningful for `Processed`; zero otherwise.
    pub accrual: Amount,
}

/// Why a single fetch did not produce an [`AccrualResult`].
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FetchError {
    #[error("order not registered in the accrual system")]
    NotRegistered,

    #[error("rate limited, retry after {}s", retry_after.as_secs())]
    RateLimited { retry_after: Duration },

    #[error("accrual system unavailable: {0}")]
    Transport(String),

    #[error("malformed accrual response: {0}")]
    Decode(String),
}

/// Something that can be asked about an order's accrual.
#[async_trait]
pub trait AccrualSource: Send + Sync {
    /// Issue one query. Never retries.
    async fn fetch(&self, number: &OrderNumber) -> Result<AccrualResult, FetchError>;
}

#[cfg(test)]
pub mod mock {
    //! Scripted oracle for engine and ledger tests.

    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Plays back a fixed sequence of answers per order number.
    ///
    /// When an order's script runs out, its last answer repeats. Unknown
    /// orders answer `NotRegistered`.
    #[derive(Default)]
    pub struct ScriptedOracle {
        scripts: Mutex<HashMap<OrderNumber, VecDeque<Result<AccrualResult, FetchError>>>>,
        last: Mutex<HashMap<OrderNumber, Result<AccrualResult, FetchError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedOracle {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn script(
            self,
            number: &str,
            answers: impl IntoIterator<Item = Result<AccrualResult, FetchError>>,
        ) -> Self {
            self.scripts
                .lock()
                .unwrap()
                .insert(OrderNumber::from(number), answers.into_iter().collect());
            self
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    pub fn answer(
        number: &str,
        status: OracleStatus,
        accrual: i64,
    ) -> Result<AccrualResult, FetchError> {
        Ok(AccrualResult {
            number: OrderNumber::from(number),
            status,
            accrual: Amount::from_points(accrual),
        })
    }

    #[async_trait]
    impl AccrualSource for ScriptedOracle {
        async fn fetch(&self, number: &OrderNumber) -> Result<AccrualResult, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);

            let next = self
                .scripts
                .lock()
                .unwrap()
                .get_mut(number)
                .and_then(VecDeque::pop_front);

            let mut last = self.last.lock().unwrap();
            match next {
                Some(answer) => {
                    last.insert(number.clone(), answer.clone());
                    answer
                }
                None => last
                    .get(number)
                    .cloned()
                    .unwrap_or(Err(FetchError::NotRegistered)),
            }
        }
    }
}
