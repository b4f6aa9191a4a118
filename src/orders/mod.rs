//! Order records and their lifecycle.
//!
//! The order is the durable source of truth for a report task. Only the
//! coordinator moves an order out of `paid`, and every write it makes is
//! guarded by the status it expects to find, which is what keeps duplicate
//! invocations from repeating terminal side effects.

pub mod lifecycle;
pub mod store;

pub use lifecycle::{OrderEvent, OrderStateMachine};
pub use store::{FileSystemOrderStore, InMemoryOrderStore, OrderStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    #[default]
    Pending,
    Paid,
    Generating,
    Completed,
    Error,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Completed | OrderStatus::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Paid => "paid",
            OrderStatus::Generating => "generating",
            OrderStatus::Completed => "completed",
            OrderStatus::Error => "error",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub user_id: String,
    pub status: OrderStatus,
    pub report_ref: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn new(order_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            order_id: order_id.into(),
            user_id: user_id.into(),
            status: OrderStatus::Pending,
            report_ref: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_status(mut self, status: OrderStatus) -> Self {
        self.status = status;
        self
    }
}

/// Partial update applied by [`OrderStore::update`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderUpdate {
    /// Reject the update unless the stored status equals this.
    pub expected_status: Option<OrderStatus>,
    pub status: Option<OrderStatus>,
    pub report_ref: Option<String>,
    pub error_message: Option<String>,
}

impl OrderUpdate {
    pub fn transition(from: OrderStatus, to: OrderStatus) -> Self {
        Self {
            expected_status: Some(from),
            status: Some(to),
            ..Self::default()
        }
    }

    pub fn with_report_ref(mut self, report_ref: impl Into<String>) -> Self {
        self.report_ref = Some(report_ref.into());
        self
    }

    pub fn with_error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub(crate) fn apply_to(&self, order: &mut Order, now: DateTime<Utc>) -> Result<(), OrderError> {
        if let Some(expected) = self.expected_status {
            if order.status != expected {
                return Err(OrderError::StatusConflict {
                    order_id: order.order_id.clone(),
                    expected,
                    actual: order.status,
                });
            }
        }
        if let Some(status) = self.status {
            order.status = status;
        }
        if let Some(report_ref) = &self.report_ref {
            order.report_ref = Some(report_ref.clone());
        }
        if let Some(message) = &self.error_message {
            order.error_message = Some(message.clone());
        }
        order.updated_at = now;
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum OrderError {
    #[error("Order {0} not found")]
    NotFound(String),

    #[error("Order {order_id} is {actual}, expected {expected}")]
    StatusConflict {
        order_id: String,
        expected: OrderStatus,
        actual: OrderStatus,
    },

    #[error("Event {event:?} is not allowed while order is {status}")]
    InvalidTransition { event: OrderEvent, status: OrderStatus },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid order id: {0}")]
    InvalidOrderId(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guarded_update_rejects_stale_status() {
        let mut order = Order::new("order-1", "user-1").with_status(OrderStatus::Completed);
        let update = OrderUpdate::transition(OrderStatus::Generating, OrderStatus::Completed)
            .with_report_ref("blob-1");

        let result = update.apply_to(&mut order, Utc::now());
        assert!(matches!(
            result,
            Err(OrderError::StatusConflict {
                expected: OrderStatus::Generating,
                actual: OrderStatus::Completed,
                ..
            })
        ));
        assert_eq!(order.report_ref, None);
    }

    #[test]
    fn test_unguarded_update_applies_fields() {
        let mut order = Order::new("order-2", "user-2");
        let update = OrderUpdate {
            status: Some(OrderStatus::Paid),
            ..OrderUpdate::default()
        };
        update.apply_to(&mut order, Utc::now()).unwrap();
        assert_eq!(order.status, OrderStatus::Paid);
    }

    #[test]
    fn test_status_wire_format() {
        assert_eq!(
            serde_json::to_string(&OrderStatus::Generating).unwrap(),
            "\"generating\""
        );
        assert!(OrderStatus::Error.is_terminal());
        assert!(!OrderStatus::Paid.is_terminal());
    }
}
