// =============================================================================
// Shared outcome types
// =============================================================================
//
// Broker interactions are never allowed to unwind the session loop. Expected
// failure modes are modelled as values the caller matches on, not as
// propagated errors.

use std::fmt;

/// Result of submitting an order to the broker.
#[derive(Debug, Clone)]
pub enum OrderOutcome {
    /// Order filled immediately. Carries fill price and broker trade id.
    Filled { fill_price: f64, trade_id: String },
    /// Limit order accepted but not yet filled.
    Pending { order_id: String },
    /// Broker rejected the order with a reason string.
    Rejected(String),
    /// The request itself failed (network, timeout, non-2xx with no body).
    TransportError(String),
}

impl fmt::Display for OrderOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderOutcome::Filled { fill_price, trade_id } => {
                write!(f, "Filled(price={fill_price}, trade_id={trade_id})")
            }
            OrderOutcome::Pending { order_id } => write!(f, "Pending(order_id={order_id})"),
            OrderOutcome::Rejected(reason) => write!(f, "Rejected({reason})"),
            OrderOutcome::TransportError(reason) => write!(f, "TransportError({reason})"),
        }
    }
}

/// Result of a stop-loss update or market-close call against the broker.
#[derive(Debug, Clone)]
pub enum ExitOutcome {
    Applied,
    Failed(String),
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitOutcome::Applied => write!(f, "Applied"),
            ExitOutcome::Failed(reason) => write!(f, "Failed({reason})"),
        }
    }
}
