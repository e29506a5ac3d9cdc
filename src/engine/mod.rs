//! Order-accrual reconciliation engine.
//!
//! The engine drives a non-terminal order to a terminal state by polling the
//! accrual oracle, and applies the financial effect of the final verdict
//! exactly once. "Exactly once" is a property of the store: the credit is
//! fused with the terminal transition in [`Store::settle`], and a second
//! terminal transition is always rejected.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::Amount;
use crate::accrual::{AccrualSource, FetchError};
use crate::model::{Order, OrderNumber, OrderStatus};
use crate::store::{LedgerError, OrderRepository, Store};

mod backoff;
pub use backoff::{Backoff, Throttle};

mod error;
pub use error::ReconcileError;

mod pool;
pub use pool::{ReconcilePool, ReconcileTicket};

/// Polling policy of one reconciliation pass.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Wait between polls while the oracle has not decided yet.
    pub poll_interval: Duration,
    /// First delay after the oracle was unavailable.
    pub backoff_initial: Duration,
    /// Upper bound for the escalating delay.
    pub backoff_max: Duration,
    /// Polls per pass before giving up with [`ReconcileOutcome::Pending`].
    pub max_polls: u32,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            backoff_initial: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            max_polls: 10,
        }
    }
}

/// How a reconciliation pass ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    /// This pass applied the terminal transition.
    Settled(Order),
    /// The order was already terminal; nothing was applied.
    AlreadySettled(OrderStatus),
    /// Still undecided after the poll budget; a later pass resumes from here.
    Pending(OrderStatus),
}

pub struct ReconciliationEngine {
    store: Arc<dyn Store>,
    oracle: Arc<dyn AccrualSource>,
    config: ReconcileConfig,
    throttle: Throttle,
}

/// Public API
impl ReconciliationEngine {
    pub fn new(
        store: Arc<dyn Store>,
        oracle: Arc<dyn AccrualSource>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            store,
            oracle,
            config,
            throttle: Throttle::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Poll the oracle for `order` until it settles or the poll budget runs
    /// out.
    ///
    /// `order` may be a stale snapshot; every step is re-checked against the
    /// store. Dropping the returned future is safe at any point.
    pub async fn reconcile(&self, order: &Order) -> Result<ReconcileOutcome, ReconcileError> {
        if order.status.is_terminal() {
            return Ok(ReconcileOutcome::AlreadySettled(order.status));
        }

        let number = &order.number;
        let mut status = order.status;
        let mut backoff = Backoff::new(self.config.backoff_initial, self.config.backoff_max);

        for poll in 1..=self.config.max_polls {
            self.throttle.wait().await;

            let delay = match self.oracle.fetch(number).await {
                Ok(result) => {
                    backoff.reset();
                    let verdict = result.status.to_order_status();
                    debug!(order = %number, poll, oracle = %result.status, "polled");

                    if verdict.is_terminal() {
                        return self.settle(number, status, verdict, result.accrual).await;
                    }

                    status = self.mark_processing(number, status).await?;
                    if status.is_terminal() {
                        return Ok(ReconcileOutcome::AlreadySettled(status));
                    }
                    self.config.poll_interval
                }
                Err(FetchError::NotRegistered) => {
                    backoff.reset();
                    debug!(order = %number, poll, "not registered yet");
                    self.config.poll_interval
                }
                Err(FetchError::RateLimited { retry_after }) => {
                    warn!(
                        order = %number,
                        retry_after_ms = retry_after.as_millis() as u64,
                        "accrual system rate limited"
                    );
                    self.throttle.defer(retry_after);
                    backoff.next_delay()
                }
                Err(FetchError::Transport(reason)) => {
                    let delay = backoff.next_delay();
                    warn!(
                        order = %number,
                        reason = %reason,
                        delay_ms = delay.as_millis() as u64,
                        "accrual system unavailable"
                    );
                    delay
                }
                Err(FetchError::Decode(reason)) => {
                    warn!(order = %number, reason = %reason, "malformed accrual response");
                    return Err(ReconcileError::Decode {
                        number: number.clone(),
                        reason,
                    });
                }
            };

            if poll < self.config.max_polls {
                tokio::time::sleep(delay).await;
            }
        }

        debug!(order = %number, status = %status, "poll budget exhausted");
        Ok(ReconcileOutcome::Pending(status))
    }

    /// Reconcile the stored order with the given number.
    pub async fn reconcile_number(
        &self,
        number: &OrderNumber,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let order = self
            .store
            .get_order(number)
            .await?
            .ok_or_else(|| ReconcileError::OrderNotFound(number.clone()))?;
        self.reconcile(&order).await
    }
}

/// Private API
impl ReconciliationEngine {
    /// Move a `New` order to `Processing`. Losing the race to a concurrent
    /// pass is fine; the status that pass left behind is returned instead.
    async fn mark_processing(
        &self,
        number: &OrderNumber,
        status: OrderStatus,
    ) -> Result<OrderStatus, ReconcileError> {
        if status != OrderStatus::New {
            return Ok(status);
        }

        match self
            .store
            .transition(number, OrderStatus::Processing, Amount::ZERO)
            .await
        {
            Ok(order) => {
                debug!(order = %number, "processing");
                Ok(order.status)
            }
            Err(LedgerError::InvalidTransition { from, .. }) => Ok(from),
            Err(e) => Err(ReconcileError::from_ledger(e)),
        }
    }

    async fn settle(
        &self,
        number: &OrderNumber,
        status: OrderStatus,
        verdict: OrderStatus,
        reward: Amount,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let status = self.mark_processing(number, status).await?;
        if status.is_terminal() {
            return Ok(ReconcileOutcome::AlreadySettled(status));
        }

        match self.store.settle(number, verdict, reward).await {
            Ok(order) => {
                info!(
                    order = %number,
                    user = %order.user,
                    status = %order.status,
                    reward = %order.reward,
                    "order settled"
                );
                Ok(ReconcileOutcome::Settled(order))
            }
            Err(LedgerError::InvalidTransition { from, .. }) if from.is_terminal() => {
                debug!(order = %number, status = %from, "settled by another pass");
                Ok(ReconcileOutcome::AlreadySettled(from))
            }
            Err(e) => Err(ReconcileError::from_ledger(e)),
        }
    }
}
