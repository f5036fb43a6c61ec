//! Session and run snapshots (§4.1).

use crate::product::SearchHits;
use crate::stage::{Decision, Intent, Plan, PurchaseResult, Ranking};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Which fixed pipeline a session's current run is following, decided once
/// `intent_extraction` reports an `IntentKind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionPath {
    Unknown,
    Purchase,
    Info,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageStatus {
    Idle,
    Processing,
    Complete,
    Error,
    Skipped,
}

/// Per-stage execution record within a run, as broadcast on the Event Bus and
/// folded into a `RunSnapshot`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageState {
    pub status: StageStatus,
    pub message: Option<String>,
    pub data: Option<serde_json::Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl StageState {
    pub fn idle() -> Self {
        Self {
            status: StageStatus::Idle,
            message: None,
            data: None,
            started_at: None,
            ended_at: None,
        }
    }
}

/// The typed outputs accumulated by a run as its stages complete (§3).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageOutputs {
    pub intent: Option<Intent>,
    pub plan: Option<Plan>,
    pub search_hits: Option<SearchHits>,
    pub ranking: Option<Ranking>,
    pub decision: Option<Decision>,
    pub purchase_result: Option<PurchaseResult>,
    pub query_info: Option<String>,
    pub notification: Option<String>,
}

/// A point-in-time snapshot of one pipeline run, keyed by stage name so it
/// serializes stably regardless of `StageId` enum ordering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: String,
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub stage_states: BTreeMap<String, StageState>,
    pub cancel_requested: bool,
    pub awaiting_confirmation: bool,
}

/// A point-in-time snapshot of a session: its identity, current pipeline
/// path, accumulated stage outputs, and its most recent run, if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub current_stage: Option<String>,
    pub path: SessionPath,
    pub request_text: String,
    pub outputs: StageOutputs,
    pub last_run: Option<RunSnapshot>,
}
