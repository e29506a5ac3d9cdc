//! Core domain types for the loyalty ledger.

use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

use crate::Amount;

/// User identifier.
pub type UserId = i64;

/// Order identifier assigned by the store.
pub type OrderId = i64;

/// Withdrawal identifier assigned by the store.
pub type WithdrawalId = i64;

/// Externally supplied purchase-order number.
///
/// The ledger treats it as an opaque key; checksum validation happens at the
/// input boundary (see [`luhn_valid`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OrderNumber(String);

impl OrderNumber {
    pub fn new(number: impl Into<String>) -> Self {
        OrderNumber(number.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrderNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OrderNumber {
    fn from(value: &str) -> Self {
        OrderNumber::new(value)
    }
}

/// Lifecycle of an order: `New -> Processing -> {Processed, Invalid}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OrderStatus {
    /// Submitted, oracle not consulted yet.
    #[default]
    New,
    /// The oracle knows the order but has not decided on it.
    Processing,
    /// Terminal: reward granted.
    Processed,
    /// Terminal: no reward.
    Invalid,
}

impl OrderStatus {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Processed | OrderStatus::Invalid)
    }

    /// The only state a transition into `self` may start from.
    pub fn predecessor(&self) -> Option<OrderStatus> {
        match self {
            OrderStatus::New => None,
            OrderStatus::Processing => Some(OrderStatus::New),
            OrderStatus::Processed | OrderStatus::Invalid => Some(OrderStatus::Processing),
        }
    }

    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        next.predecessor() == Some(*self)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::Processing => "PROCESSING",
            OrderStatus::Processed => "PROCESSED",
            OrderStatus::Invalid => "INVALID",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(OrderStatus::New),
            "PROCESSING" => Ok(OrderStatus::Processing),
            "PROCESSED" => Ok(OrderStatus::Processed),
            "INVALID" => Ok(OrderStatus::Invalid),
            other => Err(format!("unknown order status '{other}'")),
        }
    }
}

/// An order tracked by the ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub id: OrderId,
    pub number: OrderNumber,
    pub user: UserId,
    pub status: OrderStatus,
    /// Zero until the order settles as `Processed`.
    pub reward: Amount,
    pub created_at: DateTime<Utc>,
}

/// An immutable withdrawal row.
#[derive(Debug, Clone, PartialEq)]
pub struct Withdrawal {
    pub id: WithdrawalId,
    pub user: UserId,
    /// Free-form reference, not necessarily a known order.
    pub order_ref: OrderNumber,
    pub amount: Amount,
    pub created_at: DateTime<Utc>,
}

/// A user's balance as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Balance {
    /// Available to withdraw: accrued rewards minus withdrawals.
    pub current: Amount,
    /// Running sum of withdrawals.
    pub withdrawn: Amount,
}

/// A command representing the possible inputs of the ledger.
#[derive(Debug, Clone)]
pub enum Command {
    /// Make a user known to the ledger.
    Register { user: UserId },
    /// Submit an order number for accrual.
    SubmitOrder { user: UserId, number: OrderNumber },
    /// Spend points against an order reference.
    Withdraw {
        user: UserId,
        order_ref: OrderNumber,
        amount: Amount,
    },
}

/// Luhn checksum over a string of ASCII digits.
pub fn luhn_valid(number: &str) -> bool {
    if number.is_empty() || !number.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }

    let sum: u32 = number
        .bytes()
        .rev()
        .map(|b| u32::from(b - b'0'))
        .enumerate()
        .map(|(idx, digit)| {
            if idx % 2 == 1 {
                let doubled = digit * 2;
                if doubled > 9 { doubled - 9 } else { doubled }
            } else {
                digit
            }
        })
        .sum();

    sum % 10 == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(OrderStatus::Processed.is_terminal());
        assert!(OrderStatus::Invalid.is_terminal());
        assert!(!OrderStatus::New.is_terminal());
        assert!(!OrderStatus::Processing.is_terminal());
    }

    #[test]
    fn legal_edges() {
        use OrderStatus::*;
        assert!(New.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Processed));
        assert!(Processing.can_transition_to(Invalid));
    }

    #[test]
    fn illegal_edges() {
        use OrderStatus::*;
        assert!(!New.can_transition_to(Processed));
        assert!(!New.can_transition_to(New));
        assert!(!Processing.can_transition_to(Processing));
        assert!(!Processing.can_transition_to(New));
        assert!(!Processed.can_transition_to(New));
        assert!(!Processed.can_transition_to(Invalid));
        assert!(!Invalid.can_transition_to(Processed));
    }

    #[test]
    fn status_names_parse_back() {
        for status in [
            OrderStatus::New,
            OrderStatus::Processing,
            OrderStatus::Processed,
            OrderStatus::Invalid,
        ] {
            assert_eq!(status.as_str().parse::<OrderStatus>(), Ok(status));
        }
        assert!("REGISTERED".parse::<OrderStatus>().is_err());
    }

    #[test]
    fn luhn_accepts_valid_numbers() {
        assert!(luhn_valid("12345678903"));
        assert!(luhn_valid("79927398713"));
        assert!(luhn_valid("2377225624"));
        assert!(luhn_valid("4561261212345467"));
    }

    #[test]
    fn luhn_rejects_invalid_numbers() {
        assert!(!luhn_valid("12345678900"));
        assert!(!luhn_valid("79927398710"));
        assert!(!luhn_valid(""));
        assert!(!luhn_valid("12a45"));
        assert!(!luhn_valid("-123"));
    }
}
