//! Engine crate: Session Store, Event Bus, Connector Registry, Pipeline
//! Engine, Search Fan-out, Ranking & Decision, Purchase Executor, Audit Log,
//! and the `Orchestrator` that ties them together behind one request/response
//! and cancellation API. Pure data shapes live in `commerce-types`; this
//! crate is where they get I/O, concurrency, and state.

pub mod audit;
pub mod config;
pub mod confirmation;
pub mod connector;
pub mod error;
pub mod event_bus;
pub mod journal;
pub mod otp;
pub mod pipeline;
pub mod purchase;
pub mod ranking;
pub mod retry;
pub mod search;
pub mod session_store;
pub mod stages;

pub use audit::{AuditError, AuditLog, AuditSink, FileAuditSink, InMemoryAuditSink};
pub use config::{Config, ConfigError};
pub use confirmation::{ConfirmationInput, ConfirmationRegistry};
pub use connector::{
    Connector, OrderReceipt, OtpChannel, OtpChannelHandle, Registry, SearchHints, UserContext,
};
pub use error::{CoreError, CoreResult};
pub use event_bus::{EventBus, Subscription};
pub use journal::{CheckpointJournal, FileCheckpointJournal, InMemoryCheckpointJournal, JournalError};
pub use otp::OtpRegistry;
pub use pipeline::{Orchestrator, ProcessOutcome, StageEventSummary};
pub use purchase::{AutoApprove, ConfirmationGate, NoOtp, OtpProvider, PurchaseContext, PurchaseExecutor};
pub use ranking::{DecisionContext, DecisionPolicy, RankingWeights};
pub use retry::{retry_with_backoff, Attempt, BackoffConfig};
pub use search::SearchGate;
pub use session_store::{RunHandle, SessionStore};
pub use stages::{
    info_pipeline, purchase_pipeline, FixedPlanner, IntentClassifier, KeywordClassifier,
    KnowledgeLookup, StubKnowledgeLookup, TaskPlanner,
};
