//! Connector capability and error taxonomy (§4.3).

use serde::{Deserialize, Serialize};

/// Capabilities a connector may advertise. A connector need not implement both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    Search,
    Order,
}

/// Error taxonomy a connector call surfaces to its caller.
///
/// `Timeout` and `Overloaded` are not part of the connector's own vocabulary
/// (a connector never returns them); they are recorded by the Search
/// Fan-out (§4.6) and the back-pressure gate respectively when a connector
/// does not answer within its budget, or the system-wide in-flight limit is
/// exceeded before the call could even start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConnectorErrorKind {
    Unavailable,
    AuthRequired,
    OutOfStock,
    PriceChanged { new_price: f64 },
    RateLimited,
    Transient,
    Permanent,
    Timeout,
    Overloaded,
}

impl ConnectorErrorKind {
    /// Whether a failed attempt using this error is worth retrying (§4.8 phase 4).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient | Self::Unavailable)
    }
}

impl std::fmt::Display for ConnectorErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable => write!(f, "unavailable"),
            Self::AuthRequired => write!(f, "auth_required"),
            Self::OutOfStock => write!(f, "out_of_stock"),
            Self::PriceChanged { new_price } => write!(f, "price_changed(new_price={new_price})"),
            Self::RateLimited => write!(f, "rate_limited"),
            Self::Transient => write!(f, "transient"),
            Self::Permanent => write!(f, "permanent"),
            Self::Timeout => write!(f, "timeout"),
            Self::Overloaded => write!(f, "overloaded"),
        }
    }
}
