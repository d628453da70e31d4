use crate::orders::error::{OrderError, OrderResult};
use crate::orders::OrderStatus;

/// Service for managing ride order status transitions
pub struct StatusMachine;

impl StatusMachine {
    /// Check if a status transition is valid
    ///
    /// # Valid Transitions
    /// - Requested → Accepted, Cancelled, Expired
    /// - Accepted → InProgress, Cancelled
    /// - InProgress → TripEnded
    /// - TripEnded → Completed
    /// - Completed, Cancelled, Expired → (terminal)
    /// - Any status → Same status (idempotent)
    pub fn is_valid_transition(from: OrderStatus, to: OrderStatus) -> bool {
        // Same status is always valid (idempotent)
        if from == to {
            return true;
        }

        matches!(
            (from, to),
            (OrderStatus::Requested, OrderStatus::Accepted)
                | (OrderStatus::Requested, OrderStatus::Cancelled)
                | (OrderStatus::Requested, OrderStatus::Expired)
                | (OrderStatus::Accepted, OrderStatus::InProgress)
                | (OrderStatus::Accepted, OrderStatus::Cancelled)
                | (OrderStatus::InProgress, OrderStatus::TripEnded)
                | (OrderStatus::TripEnded, OrderStatus::Completed)
        )
    }

    /// Attempt to transition from one status to another
    ///
    /// Returns `Ok(to)` if the transition is valid, `InvalidTransition` otherwise
    pub fn transition(from: OrderStatus, to: OrderStatus) -> OrderResult<OrderStatus> {
        if Self::is_valid_transition(from, to) {
            Ok(to)
        } else {
            Err(OrderError::InvalidTransition(format!("{} -> {}", from, to)))
        }
    }
}
