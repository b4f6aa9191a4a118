use serde::{Deserialize, Serialize};
use statig::prelude::*;

use super::{OrderError, OrderStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderEvent {
    /// Payment confirmed by the external payment flow.
    PaymentConfirmed,
    /// First coordinator invocation picked the order up.
    StartGeneration,
    Complete,
    /// Abandon the order. Allowed from any non-terminal state.
    Fail,
}

/// Order lifecycle: pending → paid → generating → {completed, error}.
///
/// Terminal states ignore every event; the coordinator relies on that to
/// make repeated invocations no-ops.
#[derive(Debug, Default)]
pub struct OrderStateMachine {
    pub order_id: String,
    status: OrderStatus,
    rejected: Option<OrderEvent>,
}

impl OrderStateMachine {
    pub fn new(order_id: String) -> Self {
        Self {
            order_id,
            ..Default::default()
        }
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    /// Validate `event` against a stored status and return the resulting status.
    pub fn next_status(
        order_id: &str,
        current: OrderStatus,
        event: OrderEvent,
    ) -> Result<OrderStatus, OrderError> {
        let mut sm = OrderStateMachine::new(order_id.to_string()).state_machine();
        for replay in Self::path_to(current) {
            sm.handle(replay);
        }

        sm.handle(&event);

        match sm.inner().rejected {
            Some(event) => Err(OrderError::InvalidTransition {
                event,
                status: current,
            }),
            None => Ok(sm.inner().status()),
        }
    }

    /// Events that lead from the initial state to `status`.
    fn path_to(status: OrderStatus) -> &'static [OrderEvent] {
        match status {
            OrderStatus::Pending => &[],
            OrderStatus::Paid => &[OrderEvent::PaymentConfirmed],
            OrderStatus::Generating => &[OrderEvent::PaymentConfirmed, OrderEvent::StartGeneration],
            OrderStatus::Completed => &[
                OrderEvent::PaymentConfirmed,
                OrderEvent::StartGeneration,
                OrderEvent::Complete,
            ],
            OrderStatus::Error => &[OrderEvent::Fail],
        }
    }

    fn reject(&mut self, event: &OrderEvent) -> Outcome<State> {
        tracing::debug!(
            order_id = %self.order_id,
            status = %self.status,
            event = ?event,
            "Order event rejected"
        );
        self.rejected = Some(*event);
        Handled
    }
}

#[state_machine(initial = "State::pending()")]
impl OrderStateMachine {
    #[state]
    fn pending(&mut self, event: &OrderEvent) -> Outcome<State> {
        match event {
            OrderEvent::PaymentConfirmed => {
                self.status = OrderStatus::Paid;
                Transition(State::paid())
            }
            OrderEvent::Fail => {
                self.status = OrderStatus::Error;
                Transition(State::error())
            }
            _ => self.reject(event),
        }
    }

    #[state]
    fn paid(&mut self, event: &OrderEvent) -> Outcome<State> {
        match event {
            OrderEvent::StartGeneration => {
                self.status = OrderStatus::Generating;
                Transition(State::generating())
            }
            OrderEvent::Fail => {
                self.status = OrderStatus::Error;
                Transition(State::error())
            }
            _ => self.reject(event),
        }
    }

    #[state]
    fn generating(&mut self, event: &OrderEvent) -> Outcome<State> {
        match event {
            OrderEvent::Complete => {
                self.status = OrderStatus::Completed;
                Transition(State::completed())
            }
            OrderEvent::Fail => {
                self.status = OrderStatus::Error;
                Transition(State::error())
            }
            _ => self.reject(event),
        }
    }

    #[state]
    fn completed(&mut self, event: &OrderEvent) -> Outcome<State> {
        self.reject(event)
    }

    #[state]
    fn error(&mut self, event: &OrderEvent) -> Outcome<State> {
        self.reject(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut sm = OrderStateMachine::new("order-1".to_string()).state_machine();
        assert_eq!(sm.inner().status(), OrderStatus::Pending);

        sm.handle(&OrderEvent::PaymentConfirmed);
        assert_eq!(sm.inner().status(), OrderStatus::Paid);

        sm.handle(&OrderEvent::StartGeneration);
        assert_eq!(sm.inner().status(), OrderStatus::Generating);

        sm.handle(&OrderEvent::Complete);
        assert_eq!(sm.inner().status(), OrderStatus::Completed);
    }

    #[test]
    fn test_next_status_from_stored_state() {
        assert_eq!(
            OrderStateMachine::next_status("o", OrderStatus::Paid, OrderEvent::StartGeneration)
                .unwrap(),
            OrderStatus::Generating
        );
        assert_eq!(
            OrderStateMachine::next_status("o", OrderStatus::Generating, OrderEvent::Fail).unwrap(),
            OrderStatus::Error
        );
    }

    #[test]
    fn test_terminal_states_reject_everything() {
        for event in [
            OrderEvent::PaymentConfirmed,
            OrderEvent::StartGeneration,
            OrderEvent::Complete,
            OrderEvent::Fail,
        ] {
            assert!(matches!(
                OrderStateMachine::next_status("o", OrderStatus::Completed, event),
                Err(OrderError::InvalidTransition { .. })
            ));
            assert!(matches!(
                OrderStateMachine::next_status("o", OrderStatus::Error, event),
                Err(OrderError::InvalidTransition { .. })
            ));
        }
    }

    #[test]
    fn test_generation_requires_payment() {
        let result =
            OrderStateMachine::next_status("o", OrderStatus::Pending, OrderEvent::StartGeneration);
        assert!(matches!(
            result,
            Err(OrderError::InvalidTransition {
                event: OrderEvent::StartGeneration,
                status: OrderStatus::Pending,
            })
        ));
    }
}
