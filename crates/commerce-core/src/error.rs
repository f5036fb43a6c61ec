//! Core error taxonomy (§7).
//!
//! Every variant here corresponds to one of the error kinds the spec
//! enumerates. `kind()` gives the stable string the Transport Adapter and
//! Audit Log use; the `Display` message is for logs, not for end users —
//! user-facing text always goes out as a Notification event, never this.

use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum CoreError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("system overloaded: {0}")]
    Overloaded(String),

    #[error("stage '{stage}' timed out after {elapsed_ms}ms")]
    StageTimeout { stage: String, elapsed_ms: u64 },

    #[error("stage '{stage}' failed internally: {reason}")]
    StageInternal { stage: String, reason: String },

    #[error("connector '{0}' unavailable")]
    ConnectorUnavailable(String),

    #[error("no connectors available for this request")]
    NoConnectorsAvailable,

    #[error("no candidate satisfied policy")]
    NoSuitableOption,

    #[error("run was cancelled")]
    UserCancelled,

    #[error("confirmation was not received within the deadline")]
    ConfirmationTimeout,

    #[error("risk assessment blocked the purchase (score={score})")]
    RiskBlocked { score: u8 },

    #[error("duplicate request suppressed, returning prior result")]
    DuplicateSuppressed,

    #[error("journal write failed: {0}")]
    JournalFailure(String),
}

impl CoreError {
    /// Stable identifier matching §7's error-kind vocabulary, used in events,
    /// audit details, and HTTP error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::Overloaded(_) => "overloaded",
            Self::StageTimeout { .. } => "stage_timeout",
            Self::StageInternal { .. } => "stage_internal",
            Self::ConnectorUnavailable(_) => "connector_unavailable",
            Self::NoConnectorsAvailable => "no_connectors_available",
            Self::NoSuitableOption => "no_suitable_option",
            Self::UserCancelled => "user_cancelled",
            Self::ConfirmationTimeout => "confirmation_timeout",
            Self::RiskBlocked { .. } => "risk_blocked",
            Self::DuplicateSuppressed => "duplicate_suppressed",
            Self::JournalFailure(_) => "journal_failure",
        }
    }

    /// `journal_failure` is the one kind the spec calls fatal to the run and
    /// to the process health check; every other kind is contained to the run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::JournalFailure(_))
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
