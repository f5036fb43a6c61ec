//! Shared data model and stage-contract types for the commerce orchestrator.
//!
//! This crate is intentionally free of I/O and async runtime dependencies: it
//! defines the typed shapes that flow between the Session Store, Pipeline
//! Engine, Event Bus, and Transport Adapter, so that every crate in the
//! workspace agrees on one schema instead of passing free-form JSON around.

pub mod audit;
pub mod connector;
pub mod error;
pub mod event;
pub mod product;
pub mod session;
pub mod stage;

pub use audit::AuditRecord;
pub use connector::{Capability, ConnectorErrorKind};
pub use error::ContractError;
pub use event::{Event, EventPayload};
pub use product::{Product, SearchHits};
pub use session::{
    RunSnapshot, SessionPath, SessionSnapshot, StageOutputs, StageState, StageStatus,
};
pub use stage::{
    Decision, Intent, IntentKind, Plan, PurchaseResult, PurchaseStatus, Ranking, RankingEntry,
    RiskLevel, ScoreComponents, StageId, Urgency,
};
