//! Session Store (§4.1).
//!
//! Holds per-session mutable state and the active Run, single-writer per
//! session via a `parking_lot::Mutex` guarding each entry, with copy-on-read
//! snapshots for everything that looks at a session from outside the
//! Pipeline Engine.

use crate::error::{CoreError, CoreResult};
use crate::journal::CheckpointJournal;
use chrono::Utc;
use commerce_types::{
    Decision, Intent, Plan, PurchaseResult, Ranking, RunSnapshot, SearchHits, SessionPath,
    SessionSnapshot, StageId, StageOutputs, StageState, StageStatus,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

struct ActiveRun {
    run_id: String,
    started_at: chrono::DateTime<Utc>,
    stage_states: BTreeMap<String, StageState>,
    cancel: Arc<AtomicBool>,
    awaiting_confirmation: bool,
    finished: Arc<Notify>,
}

struct SessionEntry {
    created_at: chrono::DateTime<Utc>,
    last_updated: chrono::DateTime<Utc>,
    current_stage: Option<String>,
    path: SessionPath,
    request_text: String,
    outputs: StageOutputs,
    active_run: Option<ActiveRun>,
}

impl SessionEntry {
    fn new(now: chrono::DateTime<Utc>) -> Self {
        Self {
            created_at: now,
            last_updated: now,
            current_stage: None,
            path: SessionPath::Unknown,
            request_text: String::new(),
            outputs: StageOutputs::default(),
            active_run: None,
        }
    }

    fn to_snapshot(&self, session_id: &str) -> SessionSnapshot {
        SessionSnapshot {
            id: session_id.to_string(),
            created_at: self.created_at,
            last_updated: self.last_updated,
            current_stage: self.current_stage.clone(),
            path: self.path,
            request_text: self.request_text.clone(),
            outputs: self.outputs.clone(),
            last_run: self.active_run.as_ref().map(|run| sanitized_run(session_id, run)),
        }
    }
}

/// An in-flight run's cancel flag, handed to the Pipeline Engine so it can
/// check it at every stage boundary and propagate it into blocked I/O.
#[derive(Clone)]
pub struct RunHandle {
    pub run_id: String,
    pub cancel: Arc<AtomicBool>,
}

impl RunHandle {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

/// Only completed stages survive into a checkpoint/snapshot; an in-flight
/// one is reported `idle` with its timestamps and message cleared, matching
/// §4.1's restore contract.
fn sanitized_run(session_id: &str, run: &ActiveRun) -> RunSnapshot {
    let stage_states = run
        .stage_states
        .iter()
        .map(|(k, v)| {
            let sanitized = if matches!(v.status, StageStatus::Processing) {
                StageState::idle()
            } else {
                v.clone()
            };
            (k.clone(), sanitized)
        })
        .collect();

    RunSnapshot {
        run_id: run.run_id.clone(),
        session_id: session_id.to_string(),
        started_at: run.started_at,
        stage_states,
        cancel_requested: run.cancel.load(Ordering::SeqCst),
        awaiting_confirmation: run.awaiting_confirmation,
    }
}

pub struct SessionStore {
    sessions: dashmap::DashMap<String, Arc<Mutex<SessionEntry>>>,
    journal: Arc<dyn CheckpointJournal>,
}

impl SessionStore {
    pub fn new(journal: Arc<dyn CheckpointJournal>) -> Self {
        Self {
            sessions: dashmap::DashMap::new(),
            journal,
        }
    }

    fn entry(&self, session_id: &str) -> Arc<Mutex<SessionEntry>> {
        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SessionEntry::new(Utc::now()))))
            .clone()
    }

    /// Atomically fetches or creates a session, returning its snapshot.
    pub fn get_or_create(&self, session_id: &str) -> SessionSnapshot {
        let entry = self.entry(session_id);
        let guard = entry.lock();
        guard.to_snapshot(session_id)
    }

    pub fn snapshot(&self, session_id: &str) -> Option<SessionSnapshot> {
        self.sessions
            .get(session_id)
            .map(|e| e.lock().to_snapshot(session_id))
    }

    /// Writes the session's current (sanitized) state to the journal.
    pub async fn checkpoint(&self, session_id: &str) -> CoreResult<()> {
        let snapshot = self
            .snapshot(session_id)
            .ok_or_else(|| CoreError::StageInternal {
                stage: "checkpoint".to_string(),
                reason: format!("unknown session '{session_id}'"),
            })?;
        self.journal
            .put(snapshot)
            .await
            .map_err(|e| CoreError::JournalFailure(e.to_string()))
    }

    /// Rebuilds a session from a journaled blob, overwriting any in-memory
    /// entry for that session id.
    pub fn restore(&self, blob: SessionSnapshot) -> SessionSnapshot {
        let entry = SessionEntry {
            created_at: blob.created_at,
            last_updated: blob.last_updated,
            current_stage: blob.current_stage.clone(),
            path: blob.path,
            request_text: blob.request_text.clone(),
            outputs: blob.outputs.clone(),
            active_run: None,
        };
        self.sessions
            .insert(blob.id.clone(), Arc::new(Mutex::new(entry)));
        blob
    }

    /// Starts a new run, cancelling any active one first and waiting up to
    /// `grace` for it to acknowledge (via `finish_run`) before proceeding
    /// regardless.
    pub async fn start_run(
        &self,
        session_id: &str,
        request_text: &str,
        grace: Duration,
    ) -> RunHandle {
        let entry = self.entry(session_id);

        let prior_finished = {
            let mut guard = entry.lock();
            guard.request_text = request_text.to_string();
            guard.last_updated = Utc::now();

            if let Some(active) = guard.active_run.as_ref() {
                active.cancel.store(true, Ordering::SeqCst);
                Some(active.finished.clone())
            } else {
                None
            }
        };

        if let Some(finished) = prior_finished {
            debug!(session_id, "waiting for prior run to cancel");
            let waited = tokio::time::timeout(grace, finished.notified()).await;
            if waited.is_err() {
                warn!(session_id, "prior run did not cancel within grace window, proceeding anyway");
            }
        }

        let run_id = uuid::Uuid::new_v4().to_string();
        let cancel = Arc::new(AtomicBool::new(false));
        let mut guard = entry.lock();
        guard.active_run = Some(ActiveRun {
            run_id: run_id.clone(),
            started_at: Utc::now(),
            stage_states: BTreeMap::new(),
            cancel: cancel.clone(),
            awaiting_confirmation: false,
            finished: Arc::new(Notify::new()),
        });
        guard.outputs = StageOutputs::default();

        RunHandle { run_id, cancel }
    }

    /// No-op if `run_id` is no longer the session's active run (it was
    /// superseded or cancelled), per §4.1.
    pub fn update_stage(
        &self,
        session_id: &str,
        run_id: &str,
        stage_id: StageId,
        state: StageState,
    ) {
        let entry = self.entry(session_id);
        let mut guard = entry.lock();
        let stale = !matches!(&guard.active_run, Some(r) if r.run_id == run_id);
        if stale {
            debug!(session_id, run_id, "update_stage on stale run, ignoring");
            return;
        }
        guard.current_stage = Some(stage_id.to_string());
        guard.last_updated = Utc::now();
        if let Some(run) = guard.active_run.as_mut() {
            run.stage_states.insert(stage_id.to_string(), state);
        }
    }

    pub fn set_awaiting_confirmation(&self, session_id: &str, run_id: &str, awaiting: bool) {
        let entry = self.entry(session_id);
        let mut guard = entry.lock();
        if let Some(run) = guard.active_run.as_mut() {
            if run.run_id == run_id {
                run.awaiting_confirmation = awaiting;
            }
        }
    }

    pub fn set_path(&self, session_id: &str, path: SessionPath) {
        let entry = self.entry(session_id);
        entry.lock().path = path;
    }

    pub fn set_intent(&self, session_id: &str, intent: Intent) {
        self.entry(session_id).lock().outputs.intent = Some(intent);
    }

    pub fn set_plan(&self, session_id: &str, plan: Plan) {
        self.entry(session_id).lock().outputs.plan = Some(plan);
    }

    pub fn set_search_hits(&self, session_id: &str, hits: SearchHits) {
        self.entry(session_id).lock().outputs.search_hits = Some(hits);
    }

    pub fn set_ranking(&self, session_id: &str, ranking: Ranking) {
        self.entry(session_id).lock().outputs.ranking = Some(ranking);
    }

    pub fn set_decision(&self, session_id: &str, decision: Decision) {
        self.entry(session_id).lock().outputs.decision = Some(decision);
    }

    pub fn set_purchase_result(&self, session_id: &str, result: PurchaseResult) {
        self.entry(session_id).lock().outputs.purchase_result = Some(result);
    }

    pub fn set_query_info(&self, session_id: &str, info: String) {
        self.entry(session_id).lock().outputs.query_info = Some(info);
    }

    pub fn set_notification(&self, session_id: &str, notification: String) {
        self.entry(session_id).lock().outputs.notification = Some(notification);
    }

    /// Marks the active run finished, waking anything waiting on it in
    /// `start_run`. The run itself remains in the snapshot until the next
    /// run replaces it.
    pub fn finish_run(&self, session_id: &str, run_id: &str) {
        let entry = self.entry(session_id);
        let guard = entry.lock();
        if let Some(run) = guard.active_run.as_ref() {
            if run.run_id == run_id {
                run.finished.notify_waiters();
            }
        }
    }

    /// Requests cancellation of the session's active run, if any. Returns
    /// whether a run was actually active.
    pub fn cancel_active_run(&self, session_id: &str) -> bool {
        match self.sessions.get(session_id) {
            Some(entry) => {
                let guard = entry.lock();
                match guard.active_run.as_ref() {
                    Some(run) => {
                        run.cancel.store(true, Ordering::SeqCst);
                        true
                    }
                    None => false,
                }
            }
            None => false,
        }
    }

    /// Removes sessions whose last update is older than `ttl`. Intended to
    /// run on a periodic interval (see the server binary's reaper task).
    pub fn reap_idle(&self, ttl: Duration) -> usize {
        let now = Utc::now();
        let mut removed = 0;
        self.sessions.retain(|_, entry| {
            let guard = entry.lock();
            let age = now.signed_duration_since(guard.last_updated);
            let keep = age.to_std().map(|a| a < ttl).unwrap_or(true);
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::InMemoryCheckpointJournal;

    fn store() -> SessionStore {
        SessionStore::new(Arc::new(InMemoryCheckpointJournal::new()))
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let store = store();
        let a = store.get_or_create("s1");
        let b = store.get_or_create("s1");
        assert_eq!(a.id, b.id);
        assert_eq!(a.created_at, b.created_at);
    }

    #[tokio::test]
    async fn start_run_cancels_prior_active_run() {
        let store = store();
        let first = store.start_run("s1", "milk", Duration::from_millis(50)).await;
        assert!(!first.is_cancelled());

        let second = store.start_run("s1", "rice", Duration::from_millis(50)).await;
        assert!(first.is_cancelled());
        assert_ne!(first.run_id, second.run_id);
    }

    #[tokio::test]
    async fn update_stage_is_noop_for_stale_run() {
        let store = store();
        let first = store.start_run("s1", "milk", Duration::from_millis(10)).await;
        let _second = store.start_run("s1", "rice", Duration::from_millis(10)).await;

        store.update_stage(
            "s1",
            &first.run_id,
            StageId::IntentExtraction,
            StageState {
                status: StageStatus::Complete,
                message: None,
                data: None,
                started_at: None,
                ended_at: None,
            },
        );

        let snap = store.snapshot("s1").unwrap();
        let run = snap.last_run.unwrap();
        assert!(!run.stage_states.contains_key("intent_extraction"));
    }

    #[tokio::test]
    async fn checkpoint_and_restore_round_trip() {
        let store = store();
        store.get_or_create("s1");
        store.set_intent(
            "s1",
            Intent {
                kind: commerce_types::IntentKind::Info,
                item: None,
                quantity: None,
                urgency: commerce_types::Urgency::Normal,
                confidence: 0.9,
                language_tag: "en".to_string(),
            },
        );
        store.checkpoint("s1").await.unwrap();

        let blob = store.snapshot("s1").unwrap();
        let restored = store.restore(blob.clone());
        assert_eq!(restored.outputs.intent.unwrap().confidence, 0.9);
    }

    #[tokio::test]
    async fn reap_idle_removes_stale_sessions() {
        let store = store();
        store.get_or_create("s1");
        let removed = store.reap_idle(Duration::from_secs(0));
        assert_eq!(removed, 1);
        assert!(store.snapshot("s1").is_none());
    }
}
