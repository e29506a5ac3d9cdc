use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::{ReconcileError, ReconcileOutcome, ReconciliationEngine};
use crate::model::{Order, OrderNumber};

type JobResult = Result<ReconcileOutcome, ReconcileError>;

struct Job {
    order: Order,
    reply: oneshot::Sender<JobResult>,
}

/// Handle to one queued reconciliation.
#[derive(Debug)]
pub struct ReconcileTicket {
    number: OrderNumber,
    receiver: oneshot::Receiver<JobResult>,
}

impl ReconcileTicket {
    pub fn number(&self) -> &OrderNumber {
        &self.number
    }

    /// Wait for the job to finish.
    pub async fn wait(self) -> JobResult {
        self.receiver.await.unwrap_or(Err(ReconcileError::WorkerLost))
    }
}

/// Bounded queue of reconciliation jobs drained by a fixed number of workers.
///
/// Every job runs in its own task, so a panic while reconciling one order
/// only fails that order's ticket.
pub struct ReconcilePool {
    sender: mpsc::Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl ReconcilePool {
    pub fn spawn(engine: Arc<ReconciliationEngine>, workers: usize, queue_size: usize) -> Self {
        let (sender, receiver) = mpsc::channel(queue_size.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..workers.max(1))
            .map(|id| tokio::spawn(work(id, engine.clone(), receiver.clone())))
            .collect();

        Self { sender, workers }
    }

    /// Queue `order`, waiting for room if the queue is full.
    pub async fn submit(&self, order: Order) -> Result<ReconcileTicket, ReconcileError> {
        let (reply, receiver) = oneshot::channel();
        let number = order.number.clone();
        self.sender
            .send(Job { order, reply })
            .await
            .map_err(|_| ReconcileError::QueueClosed)?;
        Ok(ReconcileTicket { number, receiver })
    }

    /// Stop accepting jobs, let queued ones finish and join the workers.
    pub async fn shutdown(self) {
        drop(self.sender);
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!(reason = %e, "reconciliation worker failed");
            }
        }
        info!("reconciliation pool stopped");
    }
}

async fn work(
    id: usize,
    engine: Arc<ReconciliationEngine>,
    receiver: Arc<Mutex<mpsc::Receiver<Job>>>,
) {
    loop {
        let job = receiver.lock().await.recv().await;
        let Some(Job { order, reply }) = job else {
            break;
        };

        let number = order.number.clone();
        let engine = engine.clone();
        let result = match tokio::spawn(async move { engine.reconcile(&order).await }).await {
            Ok(result) => result,
            Err(e) => {
                error!(worker = id, order = %number, reason = %e, "reconciliation task died");
                Err(ReconcileError::WorkerLost)
            }
        };

        if let Err(e) = &result {
            error!(worker = id, order = %number, reason = %e, "reconciliation failed");
        }

        // The submitter may have stopped waiting.
        let _ = reply.send(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Amount;
    use crate::accrual::mock::{ScriptedOracle, answer};
    use crate::accrual::{AccrualResult, AccrualSource, FetchError, OracleStatus};
    use crate::engine::ReconcileConfig;
    use crate::model::OrderStatus;
    use crate::store::{MemoryStore, OrderRepository, Store, UserRepository};
    use async_trait::async_trait;
    use std::time::Duration;

    fn config() -> ReconcileConfig {
        ReconcileConfig {
            poll_interval: Duration::from_millis(10),
            backoff_initial: Duration::from_millis(10),
            backoff_max: Duration::from_millis(40),
            max_polls: 5,
        }
    }

    async fn order(store: &MemoryStore, user: i64, number: &str) -> Order {
        let number = OrderNumber::from(number);
        store.create_user(user).await.unwrap();
        store.create_order(&number, user).await.unwrap();
        store.get_order(&number).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn tickets_resolve_to_outcomes() {
        let numbers = ["12345678903", "79927398713", "2377225624"];
        let mut oracle = ScriptedOracle::new();
        for (points, number) in numbers.iter().enumerate() {
            oracle = oracle.script(
                number,
                [answer(number, OracleStatus::Processed, points as i64 + 1)],
            );
        }

        let store = Arc::new(MemoryStore::new());
        let engine = Arc::new(ReconciliationEngine::new(
            store.clone(),
            Arc::new(oracle),
            config(),
        ));
        let pool = ReconcilePool::spawn(engine, 2, 1);

        let mut tickets = Vec::new();
        for number in numbers {
            let order = order(&store, 1, number).await;
            tickets.push(pool.submit(order).await.unwrap());
        }

        for ticket in tickets {
            let number = ticket.number().clone();
            let outcome = ticket.wait().await.unwrap();
            let ReconcileOutcome::Settled(order) = outcome else {
                panic!("expected settlement for {number}");
            };
            assert_eq!(order.status, OrderStatus::Processed);
        }

        pool.shutdown().await;
        assert_eq!(
            store.balance(1).await.unwrap().current,
            Amount::from_points(6)
        );
    }

    #[tokio::test]
    async fn failed_job_is_reported_not_dropped() {
        let number = "12345678903";
        let oracle =
            ScriptedOracle::new().script(number, [Err(FetchError::Decode("bad".into()))]);
        let store = Arc::new(MemoryStore::new());
        let engine = Arc::new(ReconciliationEngine::new(
            store.clone(),
            Arc::new(oracle),
            config(),
        ));
        let pool = ReconcilePool::spawn(engine, 1, 4);

        let ticket = pool.submit(order(&store, 1, number).await).await.unwrap();
        assert!(matches!(
            ticket.wait().await,
            Err(ReconcileError::Decode { .. })
        ));
        pool.shutdown().await;
    }

    struct PanickingOracle;

    #[async_trait]
    impl AccrualSource for PanickingOracle {
        async fn fetch(&self, number: &OrderNumber) -> Result<AccrualResult, FetchError> {
            if number.as_str() == "12345678903" {
                panic!("oracle exploded");
            }
            answer(number.as_str(), OracleStatus::Invalid, 0)
        }
    }

    #[tokio::test]
    async fn panic_is_contained_to_one_order() {
        let store = Arc::new(MemoryStore::new());
        let dyn_store: Arc<dyn Store> = store.clone();
        let engine = Arc::new(ReconciliationEngine::new(
            dyn_store,
            Arc::new(PanickingOracle),
            config(),
        ));
        let pool = ReconcilePool::spawn(engine, 1, 4);

        let bad = pool
            .submit(order(&store, 1, "12345678903").await)
            .await
            .unwrap();
        let good = pool
            .submit(order(&store, 1, "79927398713").await)
            .await
            .unwrap();

        assert!(matches!(bad.wait().await, Err(ReconcileError::WorkerLost)));
        assert!(matches!(
            good.wait().await,
            Ok(ReconcileOutcome::Settled(_))
        ));
        pool.shutdown().await;
    }
}
