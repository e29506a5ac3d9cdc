//! PostgreSQL store.
//!
//! Every status change is a compare-and-swap on the single legal predecessor
//! (`UPDATE ... WHERE status = $expected`). The two multi-table units run in
//! one transaction each; dropping the future mid-way rolls them back.

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::time::Duration;
use tracing::info;

use super::{
    LedgerError, OrderRepository, Store, UserRepository, WithdrawalRepository,
    ensure_non_negative, settled_reward,
};
use crate::Amount;
use crate::model::{Balance, Order, OrderId, OrderNumber, OrderStatus, UserId, Withdrawal};

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS users (
        id          BIGINT PRIMARY KEY,
        accrued     NUMERIC(20, 4) NOT NULL DEFAULT 0,
        withdrawn   NUMERIC(20, 4) NOT NULL DEFAULT 0,
        CHECK (accrued >= withdrawn)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS orders (
        id          BIGSERIAL PRIMARY KEY,
        user_id     BIGINT NOT NULL,
        number      TEXT NOT NULL UNIQUE,
        status      TEXT NOT NULL DEFAULT 'NEW',
        reward      NUMERIC(20, 4) NOT NULL DEFAULT 0,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )"#,
    r#"CREATE INDEX IF NOT EXISTS orders_user_created_idx ON orders (user_id, created_at)"#,
    r#"CREATE TABLE IF NOT EXISTS withdrawals (
        id          BIGSERIAL PRIMARY KEY,
        user_id     BIGINT NOT NULL REFERENCES users (id),
        order_ref   TEXT NOT NULL,
        amount      NUMERIC(20, 4) NOT NULL CHECK (amount >= 0),
        created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )"#,
    r#"CREATE INDEX IF NOT EXISTS withdrawals_user_idx ON withdrawals (user_id, created_at)"#,
];

const ORDER_COLUMNS: &str = "id, number, user_id, status, reward, created_at";

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(uri: &str, acquire_timeout: Duration) -> Result<Self, LedgerError> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .acquire_timeout(acquire_timeout)
            .connect(uri)
            .await?;

        info!("PostgreSQL connection pool established");
        Ok(Self::new(pool))
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create tables and indexes if they do not exist yet.
    pub async fn migrate(&self) -> Result<(), LedgerError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("schema ready");
        Ok(())
    }
}

fn amount_from(value: Decimal) -> Result<Amount, LedgerError> {
    Amount::from_decimal(value)
        .ok_or_else(|| LedgerError::Corrupt(format!("amount {value} out of range")))
}

fn order_from_row(row: &PgRow) -> Result<Order, LedgerError> {
    let status: String = row.try_get("status")?;
    Ok(Order {
        id: row.try_get("id")?,
        number: OrderNumber::new(row.try_get::<String, _>("number")?),
        user: row.try_get("user_id")?,
        status: status.parse().map_err(LedgerError::Corrupt)?,
        reward: amount_from(row.try_get("reward")?)?,
        created_at: row.try_get("created_at")?,
    })
}

fn balance_from_row(row: &PgRow) -> Result<Balance, LedgerError> {
    let accrued = amount_from(row.try_get("accrued")?)?;
    let withdrawn = amount_from(row.try_get("withdrawn")?)?;
    Ok(Balance {
        current: accrued - withdrawn,
        withdrawn,
    })
}

fn withdrawal_from_row(row: &PgRow) -> Result<Withdrawal, LedgerError> {
    Ok(Withdrawal {
        id: row.try_get("id")?,
        user: row.try_get("user_id")?,
        order_ref: OrderNumber::new(row.try_get::<String, _>("order_ref")?),
        amount: amount_from(row.try_get("amount")?)?,
        created_at: row.try_get("created_at")?,
    })
}

async fn current_status(
    conn: &mut PgConnection,
    number: &OrderNumber,
) -> Result<Option<OrderStatus>, LedgerError> {
    let status: Option<String> = sqlx::query_scalar("SELECT status FROM orders WHERE number = $1")
        .bind(number.as_str())
        .fetch_optional(conn)
        .await?;

    status
        .map(|s| s.parse().map_err(LedgerError::Corrupt))
        .transpose()
}

/// Explain why a compare-and-swap on `number` matched no row.
async fn rejected_transition(
    conn: &mut PgConnection,
    number: &OrderNumber,
    to: OrderStatus,
) -> LedgerError {
    match current_status(conn, number).await {
        Ok(Some(from)) => LedgerError::InvalidTransition {
            number: number.clone(),
            from,
            to,
        },
        Ok(None) => LedgerError::OrderNotFound(number.clone()),
        Err(e) => e,
    }
}

/// Move `number` from `from` to `to`; `None` when the row was not in `from`.
async fn compare_and_swap(
    conn: &mut PgConnection,
    number: &OrderNumber,
    from: OrderStatus,
    to: OrderStatus,
    reward: Amount,
) -> Result<Option<Order>, LedgerError> {
    let row = sqlx::query(&format!(
        "UPDATE orders SET status = $1, reward = $2 \
         WHERE number = $3 AND status = $4 \
         RETURNING {ORDER_COLUMNS}"
    ))
    .bind(to.as_str())
    .bind(reward.to_decimal())
    .bind(number.as_str())
    .bind(from.as_str())
    .fetch_optional(conn)
    .await?;

    row.as_ref().map(order_from_row).transpose()
}

async fn credit(conn: &mut PgConnection, user: UserId, amount: Amount) -> Result<(), LedgerError> {
    ensure_non_negative(amount)?;
    let result = sqlx::query("UPDATE users SET accrued = accrued + $1 WHERE id = $2")
        .bind(amount.to_decimal())
        .bind(user)
        .execute(conn)
        .await?;

    if result.rows_affected() == 0 {
        return Err(LedgerError::UserNotFound(user));
    }
    Ok(())
}

/// Must run in the same transaction as [`record`], after the user row is locked.
async fn debit(
    conn: &mut PgConnection,
    user: UserId,
    balance: Balance,
    amount: Amount,
) -> Result<(), LedgerError> {
    ensure_non_negative(amount)?;
    if balance.current < amount {
        return Err(LedgerError::InsufficientFunds {
            user,
            available: balance.current,
            requested: amount,
        });
    }

    sqlx::query("UPDATE users SET withdrawn = withdrawn + $1 WHERE id = $2")
        .bind(amount.to_decimal())
        .bind(user)
        .execute(conn)
        .await?;
    Ok(())
}

async fn record(
    conn: &mut PgConnection,
    user: UserId,
    order_ref: &OrderNumber,
    amount: Amount,
) -> Result<Withdrawal, LedgerError> {
    let row = sqlx::query(
        r#"INSERT INTO withdrawals (user_id, order_ref, amount)
           VALUES ($1, $2, $3)
           RETURNING id, user_id, order_ref, amount, created_at"#,
    )
    .bind(user)
    .bind(order_ref.as_str())
    .bind(amount.to_decimal())
    .fetch_one(conn)
    .await?;

    withdrawal_from_row(&row)
}

#[async_trait]
impl OrderRepository for PgStore {
    async fn create_order(
        &self,
        number: &OrderNumber,
        user: UserId,
    ) -> Result<OrderId, LedgerError> {
        let id: Option<OrderId> = sqlx::query_scalar(
            r#"INSERT INTO orders (user_id, number, status, reward)
               VALUES ($1, $2, 'NEW', 0)
               ON CONFLICT (number) DO NOTHING
               RETURNING id"#,
        )
        .bind(user)
        .bind(number.as_str())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(id) = id {
            return Ok(id);
        }

        let owner: Option<UserId> =
            sqlx::query_scalar("SELECT user_id FROM orders WHERE number = $1")
                .bind(number.as_str())
                .fetch_optional(&self.pool)
                .await?;

        if owner == Some(user) {
            Err(LedgerError::DuplicateOwnOrder(number.clone()))
        } else {
            Err(LedgerError::DuplicateOtherOrder(number.clone()))
        }
    }

    async fn get_order(&self, number: &OrderNumber) -> Result<Option<Order>, LedgerError> {
        let row = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE number = $1"
        ))
        .bind(number.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(order_from_row).transpose()
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
        let mut conn = self.pool.acquire().await?;

        let Some(from) = status.predecessor() else {
            return Err(rejected_transition(&mut conn, number, status).await);
        };

        match compare_and_swap(&mut conn, number, from, status, settled_reward(status, reward))
            .await?
        {
            Some(order) => Ok(order),
            None => Err(rejected_transition(&mut conn, number, status).await),
        }
    }

    async fn non_terminal_orders(&self, user: UserId) -> Result<Vec<Order>, LedgerError> {
        let rows = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders \
             WHERE user_id = $1 AND status IN ('NEW', 'PROCESSING') \
             ORDER BY created_at, id"
        ))
        .bind(user)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(order_from_row).collect()
    }

    async fn orders_by_user(&self, user: UserId) -> Result<Vec<Order>, LedgerError> {
        let rows = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE user_id = $1 ORDER BY created_at, id"
        ))
        .bind(user)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(order_from_row).collect()
    }
}

#[async_trait]
impl UserRepository for PgStore {
    async fn create_user(&self, user: UserId) -> Result<(), LedgerError> {
        sqlx::query("INSERT INTO users (id) VALUES ($1) ON CONFLICT (id) DO NOTHING")
            .bind(user)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn balance(&self, user: UserId) -> Result<Balance, LedgerError> {
        let row = sqlx::query("SELECT accrued, withdrawn FROM users WHERE id = $1")
            .bind(user)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(LedgerError::UserNotFound(user))?;

        balance_from_row(&row)
    }

    async fn users(&self) -> Result<Vec<UserId>, LedgerError> {
        let users = sqlx::query_scalar("SELECT id FROM users ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(users)
    }
}

#[async_trait]
impl WithdrawalRepository for PgStore {
    async fn withdrawals_by_user(&self, user: UserId) -> Result<Vec<Withdrawal>, LedgerError> {
        let rows = sqlx::query(
            r#"SELECT id, user_id, order_ref, amount, created_at
               FROM withdrawals WHERE user_id = $1
               ORDER BY created_at, id"#,
        )
        .bind(user)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(withdrawal_from_row).collect()
    }

    async fn withdrawn_sum(&self, user: UserId) -> Result<Amount, LedgerError> {
        let total: Decimal = sqlx::query_scalar(
            "SELECT COALESCE(SUM(amount), 0)::NUMERIC(20, 4) FROM withdrawals WHERE user_id = $1",
        )
        .bind(user)
        .fetch_one(&self.pool)
        .await?;

        amount_from(total)
    }
}

#[async_trait]
impl Store for PgStore {
    async fn settle(
        &self,
        number: &OrderNumber,
        status: OrderStatus,
        reward: Amount,
    ) -> Result<Order, LedgerError> {
        ensure_non_negative(reward)?;
        let mut tx = self.pool.begin().await?;

        if !status.is_terminal() {
            return Err(rejected_transition(&mut tx, number, status).await);
        }

        // The row lock taken by this UPDATE serialises concurrent settles of
        // the same order; the loser re-checks `status` and matches nothing.
        let order = match compare_and_swap(
            &mut tx,
            number,
            OrderStatus::Processing,
            status,
            settled_reward(status, reward),
        )
        .await?
        {
            Some(order) => order,
            None => return Err(rejected_transition(&mut tx, number, status).await),
        };

        if order.reward.is_positive() {
            credit(&mut tx, order.user, order.reward).await?;
        }

        tx.commit().await?;
        Ok(order)
    }

    async fn withdraw(
        &self,
        user: UserId,
        order_ref: &OrderNumber,
        amount: Amount,
    ) -> Result<Withdrawal, LedgerError> {
        ensure_non_negative(amount)?;
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT accrued, withdrawn FROM users WHERE id = $1 FOR UPDATE")
            .bind(user)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(LedgerError::UserNotFound(user))?;
        let balance = balance_from_row(&row)?;

        debit(&mut tx, user, balance, amount).await?;
        let withdrawal = record(&mut tx, user, order_ref, amount).await?;

        tx.commit().await?;
        Ok(withdrawal)
    }
}
