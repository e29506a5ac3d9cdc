//! In-memory store.
//!
//! Orders live in an arena keyed by [`OrderId`] with two secondary indexes
//! (number -> id, user -> ids). All maps are `DashMap`s, so locking is per
//! shard and every guard is dropped before the enclosing `async fn` returns.
//!
//! Lock order is `numbers -> orders -> orders_by_user` and `orders -> users`.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::atomic::{AtomicI64, Ordering};

use super::{
    LedgerError, OrderRepository, Store, UserAccount, UserRepository, WithdrawalRepository,
    ensure_non_negative, settled_reward,
};
use crate::Amount;
use crate::model::{
    Balance, Order, OrderId, OrderNumber, OrderStatus, UserId, Withdrawal, WithdrawalId,
};

pub struct MemoryStore {
    orders: DashMap<OrderId, Order>,
    numbers: DashMap<OrderNumber, OrderId>,
    orders_by_user: DashMap<UserId, Vec<OrderId>>,
    users: DashMap<UserId, UserAccount>,
    next_order_id: AtomicI64,
    next_withdrawal_id: AtomicI64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            orders: DashMap::new(),
            numbers: DashMap::new(),
            orders_by_user: DashMap::new(),
            users: DashMap::new(),
            next_order_id: AtomicI64::new(1),
            next_withdrawal_id: AtomicI64::new(1),
        }
    }

    fn order_id(&self, number: &OrderNumber) -> Result<OrderId, LedgerError> {
        self.numbers
            .get(number)
            .map(|id| *id)
            .ok_or_else(|| LedgerError::OrderNotFound(number.clone()))
    }

    fn collect_orders(&self, user: UserId, filter: impl Fn(&Order) -> bool) -> Vec<Order> {
        let ids = self
            .orders_by_user
            .get(&user)
            .map(|ids| ids.value().clone())
            .unwrap_or_default();

        let mut orders: Vec<Order> = ids
            .iter()
            .filter_map(|id| self.orders.get(id).map(|order| order.value().clone()))
            .filter(|order| filter(order))
            .collect();
        orders.sort_by_key(|order| (order.created_at, order.id));
        orders
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OrderRepository for MemoryStore {
    async fn create_order(
        &self,
        number: &OrderNumber,
        user: UserId,
    ) -> Result<OrderId, LedgerError> {
        match self.numbers.entry(number.clone()) {
            Entry::Occupied(entry) => {
                let owner = self.orders.get(entry.get()).map(|order| order.user);
                if owner == Some(user) {
                    Err(LedgerError::DuplicateOwnOrder(number.clone()))
                } else {
                    Err(LedgerError::DuplicateOtherOrder(number.clone()))
                }
            }
            Entry::Vacant(entry) => {
                let id = self.next_order_id.fetch_add(1, Ordering::Relaxed);
                self.orders.insert(
                    id,
                    Order {
                        id,
                        number: number.clone(),
                        user,
                        status: OrderStatus::New,
                        reward: Amount::ZERO,
                        created_at: Utc::now(),
                    },
                );
                self.orders_by_user.entry(user).or_default().push(id);
                entry.insert(id);
                Ok(id)
            }
        }
    }

    async fn get_order(&self, number: &OrderNumber) -> Result<Option<Order>, LedgerError> {
        let Some(id) = self.numbers.get(number).map(|id| *id) else {
            return Ok(None);
        };
        Ok(self.orders.get(&id).map(|order| order.value().clone()))
    }

    async fn transition(
        &self,
        number: &OrderNumber,
        status: OrderStatus,
        reward: Amount,
    ) -> Result<Order, LedgerError> {
        if status.is_terminal() {
            return self.settle(number, status, reward).await;
        }
        ensure_non_negative(reward)?;
        let id = self.order_id(number)?;
        let mut order = self
            .orders
            .get_mut(&id)
            .ok_or_else(|| LedgerError::OrderNotFound(number.clone()))?;

        if !order.status.can_transition_to(status) {
            return Err(LedgerError::InvalidTransition {
                number: number.clone(),
                from: order.status,
                to: status,
            });
        }

        order.status = status;
        order.reward = settled_reward(status, reward);
        Ok(order.value().clone())
    }

    async fn non_terminal_orders(&self, user: UserId) -> Result<Vec<Order>, LedgerError> {
        Ok(self.collect_orders(user, |order| !order.status.is_terminal()))
    }

    async fn orders_by_user(&self, user: UserId) -> Result<Vec<Order>, LedgerError> {
        Ok(self.collect_orders(user, |_| true))
    }
}

#[async_trait]
impl UserRepository for MemoryStore {
    async fn create_user(&self, user: UserId) -> Result<(), LedgerError> {
        self.users.entry(user).or_default();
        Ok(())
    }

    async fn balance(&self, user: UserId) -> Result<Balance, LedgerError> {
        self.users
            .get(&user)
            .map(|account| account.balance())
            .ok_or(LedgerError::UserNotFound(user))
    }

    async fn users(&self) -> Result<Vec<UserId>, LedgerError> {
        let mut users: Vec<UserId> = self.users.iter().map(|entry| *entry.key()).collect();
        users.sort_unstable();
        Ok(users)
    }
}

#[async_trait]
impl WithdrawalRepository for MemoryStore {
    async fn withdrawals_by_user(&self, user: UserId) -> Result<Vec<Withdrawal>, LedgerError> {
        Ok(self
            .users
            .get(&user)
            .map(|account| account.withdrawals().to_vec())
            .unwrap_or_default())
    }

    async fn withdrawn_sum(&self, user: UserId) -> Result<Amount, LedgerError> {
        Ok(self
            .users
            .get(&user)
            .map(|account| account.withdrawals().iter().map(|w| w.amount).sum())
            .unwrap_or_default())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn settle(
        &self,
        number: &OrderNumber,
        status: OrderStatus,
        reward: Amount,
    ) -> Result<Order, LedgerError> {
        ensure_non_negative(reward)?;
        let id = self.order_id(number)?;
        let mut order = self
            .orders
            .get_mut(&id)
            .ok_or_else(|| LedgerError::OrderNotFound(number.clone()))?;

        if !status.is_terminal() || !order.status.can_transition_to(status) {
            return Err(LedgerError::InvalidTransition {
                number: number.clone(),
                from: order.status,
                to: status,
            });
        }

        let reward = settled_reward(status, reward);
        if reward.is_positive() {
            // Order guard is still held: nobody can settle this order
            // concurrently, and nothing is written until the credit succeeds.
            let mut account = self
                .users
                .get_mut(&order.user)
                .ok_or(LedgerError::UserNotFound(order.user))?;
            account.credit(order.user, reward)?;
        }

        order.status = status;
        order.reward = reward;
        Ok(order.value().clone())
    }

    async fn withdraw(
        &self,
        user: UserId,
        order_ref: &OrderNumber,
        amount: Amount,
    ) -> Result<Withdrawal, LedgerError> {
        let mut account = self
            .users
            .get_mut(&user)
            .ok_or(LedgerError::UserNotFound(user))?;

        account.debit(user, amount)?;

        let id: WithdrawalId = self.next_withdrawal_id.fetch_add(1, Ordering::Relaxed);
        let withdrawal = Withdrawal {
            id,
            user,
            order_ref: order_ref.clone(),
            amount,
            created_at: Utc::now(),
        };
        account.record(withdrawal.clone());
        Ok(withdrawal)
    }
}
