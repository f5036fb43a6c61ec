//! Stage-boundary contract errors.
//!
//! §9 requires that a conformant implementation reject malformed stage
//! outputs at the boundary rather than let them propagate as free-form
//! dictionaries. This is the error type that rejection surfaces as.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContractError {
    #[error("stage '{stage}' produced an output that does not match its contract: {reason}")]
    MalformedOutput { stage: String, reason: String },

    #[error("unknown stage identifier: {0}")]
    UnknownStage(String),

    #[error("field '{0}' is required but was missing")]
    MissingField(&'static str),
}
