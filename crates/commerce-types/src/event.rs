//! Event Bus wire types (§4.2).

use crate::session::StageStatus;
use crate::stage::StageId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The payload half of an `Event`. Kept as an internally-tagged enum so a
/// WebSocket subscriber can match on `"type"` without a second round-trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    StageUpdate {
        stage_id: StageId,
        status: StageStatus,
        message: Option<String>,
        data: Option<serde_json::Value>,
    },
    RunCancelled,
    ConfirmationRequired {
        detail: serde_json::Value,
    },
    OtpRequired {
        token: String,
    },
    /// Emitted in place of the events a subscriber's buffer dropped under
    /// back-pressure (§4.2), so the client can tell it missed something.
    Dropped {
        count: u64,
    },
}

/// One message on the per-session Event Bus topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub session_id: String,
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}
