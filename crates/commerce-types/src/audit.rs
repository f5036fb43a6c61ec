//! Audit Log record shape (§4.9).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One append-only audit entry. `id` is assigned by the Audit Log in strictly
/// increasing order within a process and is never reused there, so it can
/// serve as an idempotent pointer from a `PurchaseResult::audit_ids` list back
/// into the log. `id` alone restarts at 1 across a process restart, so
/// `process_instance` (stamped once per `AuditLog`/sink construction) must be
/// combined with it to get a globally monotonic, disambiguated ordering key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: u64,
    pub process_instance: String,
    pub ts: DateTime<Utc>,
    pub run_id: String,
    pub session_id: String,
    pub actor: String,
    pub action: String,
    pub detail: serde_json::Value,
}
