//! Pipeline Engine (§4.5) and the top-level `Orchestrator` that wires every
//! other module behind the public API the Transport Adapter calls through.
//!
//! §4.5 describes two fixed pipelines (purchase, info) but also requires a
//! single ordered event sequence where the untaken path's stages each emit
//! exactly one `skipped` status (§8's scenario S4, the prefix invariant in
//! §8 invariant #1). Rather than construct two separate node graphs, this
//! engine walks ONE fixed node list in canonical order (§4.4) and gates each
//! node with a predicate over the accumulated stage outputs — "branching is
//! selection over a fixed node list", not dynamic graph construction.

use crate::audit::AuditLog;
use crate::confirmation::{ConfirmationInput, ConfirmationRegistry};
use crate::config::Config;
use crate::connector::{Registry, UserContext};
use crate::error::{CoreError, CoreResult};
use crate::event_bus::{EventBus, Subscription};
use crate::journal::CheckpointJournal;
use crate::otp::OtpRegistry;
use crate::purchase::{ConfirmationGate, OtpProvider, PurchaseContext, PurchaseExecutor};
use crate::ranking::{self, DecisionContext, DecisionPolicy, RankingWeights};
use crate::search::{self, SearchGate};
use crate::session_store::SessionStore;
use crate::stages::{info_pipeline, purchase_pipeline, IntentClassifier, KnowledgeLookup, TaskPlanner};
use async_trait::async_trait;
use chrono::Utc;
use commerce_types::{
    ConnectorErrorKind, Decision, Event, EventPayload, Intent, IntentKind, Plan, PurchaseResult,
    PurchaseStatus, Ranking, RiskLevel, SessionPath, SessionSnapshot, StageId, StageState,
    StageStatus,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::warn;

/// The fixed node order every run walks, per §4.4's canonical identifiers.
/// A node's predicate, not its position in a separate graph, decides whether
/// it runs or is reported `skipped`.
const CANONICAL_ORDER: [StageId; 9] = [
    StageId::IntentExtraction,
    StageId::TaskPlanning,
    StageId::Search,
    StageId::Comparison,
    StageId::Decision,
    StageId::AwaitConfirmation,
    StageId::Purchase,
    StageId::QueryInfo,
    StageId::Notification,
];

/// One stage's recorded outcome by the time a `ProcessOutcome` is built,
/// independent of the full `StageState` kept in the Session Store.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StageEventSummary {
    pub stage_id: StageId,
    pub status: StageStatus,
    pub message: Option<String>,
}

/// What `Orchestrator::process` hands back to the Transport Adapter (§6's
/// `/api/chat/process` response shape).
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProcessOutcome {
    pub run_id: String,
    pub success: bool,
    pub intent: Option<Intent>,
    pub plan_summary: Vec<StageId>,
    pub ranked_products: Option<Ranking>,
    pub decision: Option<Decision>,
    pub awaiting_confirmation: bool,
    pub purchase_result: Option<PurchaseResult>,
    pub query_info: Option<String>,
    pub notification: Option<String>,
    pub terminal_stage_events: Vec<StageEventSummary>,
}

impl ProcessOutcome {
    fn bad_request(run_id: String, reason: &str) -> Self {
        Self {
            run_id,
            success: false,
            intent: None,
            plan_summary: Vec::new(),
            ranked_products: None,
            decision: None,
            awaiting_confirmation: false,
            purchase_result: None,
            query_info: None,
            notification: Some(reason.to_string()),
            terminal_stage_events: Vec::new(),
        }
    }
}

/// Races a stage future against its deadline and a cooperative cancellation
/// poll. Timing out or being cancelled both stop the run — only the
/// *meaning* reported back differs (`StageTimeout` vs `UserCancelled`).
async fn run_with_deadline<T, F>(
    stage: StageId,
    timeout: Duration,
    cancel: &Arc<AtomicBool>,
    fut: F,
) -> CoreResult<T>
where
    F: std::future::Future<Output = CoreResult<T>>,
{
    tokio::pin!(fut);
    let sleep = tokio::time::sleep(timeout);
    tokio::pin!(sleep);
    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            res = &mut fut => return res,
            _ = &mut sleep => {
                return Err(CoreError::StageTimeout {
                    stage: stage.to_string(),
                    elapsed_ms: timeout.as_millis() as u64,
                });
            }
            _ = ticker.tick() => {
                if cancel.load(Ordering::SeqCst) {
                    return Err(CoreError::UserCancelled);
                }
            }
        }
    }
}

/// What the `await_confirmation` stage resolved to, used only to gate the
/// `purchase` node's predicate — not part of the persisted stage outputs.
enum ConfirmationOutcome {
    Accepted { selected_index: usize },
    Rejected,
}

/// Relays the Purchase Executor's high-risk re-confirmation request (§4.8
/// phase 2) back through the same session-keyed rendezvous `await_confirmation`
/// uses, so a re-confirming client sees the same shape it already handles.
struct EngineConfirmationGate {
    confirmations: ConfirmationRegistry,
    event_bus: EventBus,
    session_id: String,
    timeout: Duration,
}

#[async_trait]
impl ConfirmationGate for EngineConfirmationGate {
    async fn reconfirm(&self, run_id: &str, detail: serde_json::Value) -> bool {
        let rx = self.confirmations.register(&self.session_id, run_id);
        self.event_bus.publish(
            &self.session_id,
            Event {
                session_id: self.session_id.clone(),
                run_id: run_id.to_string(),
                timestamp: Utc::now(),
                payload: EventPayload::ConfirmationRequired { detail },
            },
        );
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(input)) => input.accepted,
            _ => {
                self.confirmations.clear(&self.session_id);
                false
            }
        }
    }
}

/// Relays a connector's mid-`order` OTP request to the client as an
/// `otp_required` event and waits for the code to come back through the OTP
/// Registry (§4.3, §4.8 phase 4). No endpoint for posting the code is named
/// in §6's external interface; `commerce-server` adds one (`/api/order/otp`)
/// as a necessary supplement, analogous to `/api/order/confirm`.
struct EngineOtpProvider {
    otp: OtpRegistry,
    event_bus: EventBus,
    session_id: String,
}

#[async_trait]
impl OtpProvider for EngineOtpProvider {
    async fn obtain(&self, run_id: &str, deadline: Instant) -> Result<String, ConnectorErrorKind> {
        let rx = self.otp.register(&self.session_id);
        let token = uuid::Uuid::new_v4().to_string();
        self.event_bus.publish(
            &self.session_id,
            Event {
                session_id: self.session_id.clone(),
                run_id: run_id.to_string(),
                timestamp: Utc::now(),
                payload: EventPayload::OtpRequired { token },
            },
        );
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, rx).await {
            Ok(Ok(code)) => Ok(code),
            _ => {
                self.otp.clear(&self.session_id);
                Err(ConnectorErrorKind::Transient)
            }
        }
    }
}

/// Per-run working state threaded through `execute_run`'s node loop — the
/// parts of a run that matter for deciding later predicates and building the
/// final `ProcessOutcome`, but aren't all persisted stage output fields.
struct RunState {
    intent: Option<Intent>,
    plan: Option<Plan>,
    ranking: Option<Ranking>,
    decision: Option<Decision>,
    confirmation: Option<ConfirmationOutcome>,
    purchase_result: Option<PurchaseResult>,
    query_info: Option<String>,
    notification: Option<String>,
    events: Vec<StageEventSummary>,
}

impl RunState {
    fn new() -> Self {
        Self {
            intent: None,
            plan: None,
            ranking: None,
            decision: None,
            confirmation: None,
            purchase_result: None,
            query_info: None,
            notification: None,
            events: Vec::new(),
        }
    }
}

/// Ties the Session Store, Event Bus, Connector Registry, Search Fan-out,
/// Ranking & Decision, Purchase Executor, and Audit Log together behind the
/// request/response and cancellation API the Transport Adapter calls.
#[derive(Clone)]
pub struct Orchestrator {
    config: Config,
    session_store: Arc<SessionStore>,
    event_bus: EventBus,
    registry: Registry,
    search_gate: SearchGate,
    purchase_executor: PurchaseExecutor,
    audit: AuditLog,
    confirmations: ConfirmationRegistry,
    otp: OtpRegistry,
    final_waiters: Arc<dashmap::DashMap<String, oneshot::Sender<ProcessOutcome>>>,
    classifier: Arc<dyn IntentClassifier>,
    planner: Arc<dyn TaskPlanner>,
    knowledge: Arc<dyn KnowledgeLookup>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        journal: Arc<dyn CheckpointJournal>,
        registry: Registry,
        audit: AuditLog,
        classifier: Arc<dyn IntentClassifier>,
        planner: Arc<dyn TaskPlanner>,
        knowledge: Arc<dyn KnowledgeLookup>,
    ) -> Self {
        let purchase_executor = PurchaseExecutor::new(
            registry.clone(),
            audit.clone(),
            config.dry_run,
            config.purchase_max_retries,
            config.risk_critical_threshold,
            config.idempotency_window,
        );
        Self {
            search_gate: SearchGate::new(config.max_inflight_searches),
            event_bus: EventBus::new(config.event_buffer_capacity),
            session_store: Arc::new(SessionStore::new(journal)),
            confirmations: ConfirmationRegistry::new(),
            otp: OtpRegistry::new(),
            final_waiters: Arc::new(dashmap::DashMap::new()),
            registry,
            purchase_executor,
            audit,
            classifier,
            planner,
            knowledge,
            config,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn session_snapshot(&self, session_id: &str) -> Option<SessionSnapshot> {
        self.session_store.snapshot(session_id)
    }

    pub fn subscribe(&self, session_id: &str) -> Subscription {
        self.event_bus.subscribe(session_id)
    }

    /// Requests cancellation of a session's active run. Returns whether one
    /// was active.
    pub fn cancel(&self, session_id: &str) -> bool {
        self.confirmations.clear(session_id);
        self.otp.clear(session_id);
        self.session_store.cancel_active_run(session_id)
    }

    pub fn reap_idle(&self, ttl: Duration) -> usize {
        self.session_store.reap_idle(ttl)
    }

    fn publish_stage(
        &self,
        session_id: &str,
        run_id: &str,
        stage_id: StageId,
        status: StageStatus,
        message: Option<String>,
        data: Option<serde_json::Value>,
    ) {
        self.event_bus.publish(
            session_id,
            Event {
                session_id: session_id.to_string(),
                run_id: run_id.to_string(),
                timestamp: Utc::now(),
                payload: EventPayload::StageUpdate {
                    stage_id,
                    status,
                    message,
                    data,
                },
            },
        );
    }

    /// Drives a request through the pipeline. Spawns the run as a background
    /// task and returns as soon as there is something worth showing the
    /// client: the moment `await_confirmation` begins blocking, or the
    /// run's terminal outcome if it never reaches that stage (info path,
    /// no-suitable-option, or an engine-stopping error).
    pub async fn process(&self, session_id: &str, message: &str) -> ProcessOutcome {
        self.session_store.get_or_create(session_id);
        let run_handle = self
            .session_store
            .start_run(session_id, message, Duration::from_secs(5))
            .await;
        let run_id = run_handle.run_id.clone();

        let (tx, rx) = oneshot::channel();
        let engine = self.clone();
        let session_id_owned = session_id.to_string();
        let message_owned = message.to_string();

        tokio::spawn(async move {
            engine
                .execute_run(&session_id_owned, &message_owned, run_handle, Some(tx))
                .await;
        });

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => ProcessOutcome::bad_request(run_id, "the run ended before producing a response"),
        }
    }

    /// Delivers the user's response to a pending `await_confirmation` and
    /// waits for the run to reach its true terminal outcome (after
    /// `purchase` and `notification` run), returning the `PurchaseResult`.
    pub async fn confirm(
        &self,
        session_id: &str,
        accepted: bool,
        selected_index: Option<usize>,
    ) -> CoreResult<PurchaseResult> {
        let (tx, rx) = oneshot::channel();
        self.final_waiters.insert(session_id.to_string(), tx);

        let delivered = self.confirmations.deliver(
            session_id,
            ConfirmationInput {
                accepted,
                selected_index,
            },
        );
        if !delivered {
            self.final_waiters.remove(session_id);
            return Err(CoreError::BadRequest(
                "no confirmation is pending for this session".to_string(),
            ));
        }

        let grace = self.config.purchase_timeout + Duration::from_secs(5);
        match tokio::time::timeout(grace, rx).await {
            // A missing purchase result means the run reached
            // `await_confirmation` and the user declined, so `purchase` was
            // skipped outright rather than attempted and failed.
            Ok(Ok(outcome)) => Ok(outcome.purchase_result.unwrap_or(PurchaseResult {
                status: PurchaseStatus::Failed,
                platform_used: None,
                order_id: None,
                risk_score: 0,
                risk_level: RiskLevel::Low,
                attempts: 0,
                used_fallback: false,
                audit_ids: Vec::new(),
            })),
            _ => {
                self.final_waiters.remove(session_id);
                Err(CoreError::StageTimeout {
                    stage: StageId::Purchase.to_string(),
                    elapsed_ms: grace.as_millis() as u64,
                })
            }
        }
    }

    /// Submits an out-of-band OTP code for whatever connector call is
    /// currently waiting on one for this session.
    pub fn supply_otp(&self, session_id: &str, code: String) -> bool {
        self.otp.deliver(session_id, code)
    }

    /// Runs every node in `CANONICAL_ORDER` against this run, in order, with
    /// each node gated by a predicate over `RunState`. An `Err` from a node
    /// stops the run immediately — no further stage events are emitted,
    /// satisfying the prefix property in §8 invariant #1. `Purchase` never
    /// returns `Err` for a business failure; it always resolves to a
    /// complete `PurchaseResult`.
    async fn execute_run(
        &self,
        session_id: &str,
        request_text: &str,
        run_handle: crate::session_store::RunHandle,
        mut first_response: Option<oneshot::Sender<ProcessOutcome>>,
    ) {
        let run_id = run_handle.run_id.clone();
        let cancel = run_handle.cancel.clone();
        let mut state = RunState::new();
        let mut stopped_with_error = false;

        for stage_id in CANONICAL_ORDER {
            if cancel.load(Ordering::SeqCst) {
                self.session_store.update_stage(
                    session_id,
                    &run_id,
                    stage_id,
                    StageState {
                        status: StageStatus::Error,
                        message: Some("run cancelled".to_string()),
                        data: None,
                        started_at: None,
                        ended_at: Some(Utc::now()),
                    },
                );
                self.publish_stage(
                    session_id,
                    &run_id,
                    stage_id,
                    StageStatus::Error,
                    Some("run cancelled".to_string()),
                    None,
                );
                self.event_bus.publish(
                    session_id,
                    Event {
                        session_id: session_id.to_string(),
                        run_id: run_id.clone(),
                        timestamp: Utc::now(),
                        payload: EventPayload::RunCancelled,
                    },
                );
                stopped_with_error = true;
                break;
            }

            if !self.predicate(stage_id, &state) {
                self.session_store.update_stage(
                    session_id,
                    &run_id,
                    stage_id,
                    StageState {
                        status: StageStatus::Skipped,
                        message: None,
                        data: None,
                        started_at: None,
                        ended_at: None,
                    },
                );
                self.publish_stage(session_id, &run_id, stage_id, StageStatus::Skipped, None, None);
                state.events.push(StageEventSummary {
                    stage_id,
                    status: StageStatus::Skipped,
                    message: None,
                });
                continue;
            }

            let started_at = Utc::now();
            self.session_store.update_stage(
                session_id,
                &run_id,
                stage_id,
                StageState {
                    status: StageStatus::Processing,
                    message: None,
                    data: None,
                    started_at: Some(started_at),
                    ended_at: None,
                },
            );
            self.publish_stage(session_id, &run_id, stage_id, StageStatus::Processing, None, None);

            if matches!(stage_id, StageId::AwaitConfirmation) {
                // The client needs to see ranked_products/decision before
                // this blocks, so fire the "here's what we have" response
                // right before waiting.
                if let Some(tx) = first_response.take() {
                    let partial = self.build_outcome(&run_id, &state, true, false);
                    let _ = tx.send(partial);
                }
            }

            let result = self
                .run_stage(stage_id, session_id, &run_id, request_text, &cancel, &mut state)
                .await;

            match result {
                Ok(message) => {
                    self.session_store.update_stage(
                        session_id,
                        &run_id,
                        stage_id,
                        StageState {
                            status: StageStatus::Complete,
                            message: message.clone(),
                            data: None,
                            started_at: Some(started_at),
                            ended_at: Some(Utc::now()),
                        },
                    );
                    self.publish_stage(
                        session_id,
                        &run_id,
                        stage_id,
                        StageStatus::Complete,
                        message.clone(),
                        None,
                    );
                    state.events.push(StageEventSummary {
                        stage_id,
                        status: StageStatus::Complete,
                        message,
                    });
                }
                Err(e) => {
                    self.session_store.update_stage(
                        session_id,
                        &run_id,
                        stage_id,
                        StageState {
                            status: StageStatus::Error,
                            message: Some(e.to_string()),
                            data: None,
                            started_at: Some(started_at),
                            ended_at: Some(Utc::now()),
                        },
                    );
                    self.publish_stage(
                        session_id,
                        &run_id,
                        stage_id,
                        StageStatus::Error,
                        Some(e.to_string()),
                        None,
                    );
                    state.events.push(StageEventSummary {
                        stage_id,
                        status: StageStatus::Error,
                        message: Some(e.to_string()),
                    });
                    warn!(session_id, run_id, stage = %stage_id, error = %e, "stage stopped the run");
                    stopped_with_error = true;
                    break;
                }
            }

            let _ = self.session_store.checkpoint(session_id).await;
        }

        self.session_store.set_awaiting_confirmation(session_id, &run_id, false);
        self.session_store.finish_run(session_id, &run_id);

        let final_outcome = self.build_outcome(&run_id, &state, false, !stopped_with_error);

        if let Some((_, tx)) = self.final_waiters.remove(session_id) {
            let _ = tx.send(final_outcome.clone());
        }
        if let Some(tx) = first_response.take() {
            let _ = tx.send(final_outcome);
        }
    }

    fn predicate(&self, stage_id: StageId, state: &RunState) -> bool {
        let is_purchase_intent = matches!(
            state.intent.as_ref().map(|i| i.kind),
            Some(IntentKind::Purchase)
        );
        let is_info_intent = matches!(
            state.intent.as_ref().map(|i| i.kind),
            Some(IntentKind::Info) | Some(IntentKind::Clarify)
        );
        match stage_id {
            StageId::IntentExtraction | StageId::TaskPlanning | StageId::Notification => true,
            StageId::Search | StageId::Comparison => is_purchase_intent,
            StageId::Decision => is_purchase_intent && state.ranking.is_some(),
            StageId::AwaitConfirmation => {
                is_purchase_intent && state.decision.as_ref().is_some_and(|d| d.selected.is_some())
            }
            StageId::Purchase => {
                is_purchase_intent
                    && state.decision.as_ref().is_some_and(|d| d.selected.is_some())
                    && matches!(state.confirmation, Some(ConfirmationOutcome::Accepted { .. }))
            }
            StageId::QueryInfo => is_info_intent,
        }
    }

    async fn run_stage(
        &self,
        stage_id: StageId,
        session_id: &str,
        run_id: &str,
        request_text: &str,
        cancel: &Arc<AtomicBool>,
        state: &mut RunState,
    ) -> CoreResult<Option<String>> {
        match stage_id {
            StageId::IntentExtraction => {
                let deadline = self.config.intent_timeout;
                let classifier = self.classifier.clone();
                let request_text = request_text.to_string();
                let intent = run_with_deadline(stage_id, deadline, cancel, async move {
                    classifier
                        .classify(&request_text)
                        .await
                        .map_err(|e| CoreError::StageInternal {
                            stage: StageId::IntentExtraction.to_string(),
                            reason: e.to_string(),
                        })
                })
                .await?;

                let path = match intent.kind {
                    IntentKind::Purchase => SessionPath::Purchase,
                    IntentKind::Info | IntentKind::Clarify => SessionPath::Info,
                };
                self.session_store.set_path(session_id, path);
                self.session_store.set_intent(session_id, intent.clone());
                let message = format!("classified as {:?}", intent.kind);
                state.intent = Some(intent);
                Ok(Some(message))
            }

            StageId::TaskPlanning => {
                let deadline = self.config.plan_timeout;
                let planner = self.planner.clone();
                let intent = state.intent.clone().ok_or_else(|| CoreError::StageInternal {
                    stage: StageId::TaskPlanning.to_string(),
                    reason: "no intent available".to_string(),
                })?;
                let plan = run_with_deadline(stage_id, deadline, cancel, async move {
                    planner
                        .plan(&intent)
                        .await
                        .map_err(|e| CoreError::StageInternal {
                            stage: StageId::TaskPlanning.to_string(),
                            reason: e.to_string(),
                        })
                })
                .await?;

                let expected = match state.intent.as_ref().map(|i| i.kind) {
                    Some(IntentKind::Purchase) => purchase_pipeline(),
                    _ => info_pipeline(),
                };
                if plan != expected {
                    return Err(CoreError::StageInternal {
                        stage: StageId::TaskPlanning.to_string(),
                        reason: "planner output does not match either fixed pipeline".to_string(),
                    });
                }

                self.session_store.set_plan(session_id, plan.clone());
                let message = format!("{} stages planned", plan.len());
                state.plan = Some(plan);
                Ok(Some(message))
            }

            StageId::Search => {
                let deadline_instant = Instant::now() + self.config.search_timeout;
                let intent = state.intent.clone().ok_or_else(|| CoreError::StageInternal {
                    stage: StageId::Search.to_string(),
                    reason: "no intent available".to_string(),
                })?;
                let query = intent.item.clone().unwrap_or_default();
                let qty = intent.quantity.unwrap_or(1);
                let registry = self.registry.clone();
                let gate = self.search_gate.clone();
                let hits = run_with_deadline(stage_id, self.config.search_timeout, cancel, async move {
                    search::fan_out(
                        &registry,
                        &gate,
                        &query,
                        qty,
                        &serde_json::Value::Null,
                        deadline_instant,
                    )
                    .await
                })
                .await?;
                let count: usize = hits.values().filter_map(|r| r.as_ref().ok()).map(Vec::len).sum();
                let connector_count = hits.len();
                self.session_store.set_search_hits(session_id, hits);
                let message = format!("{count} products found across {connector_count} connectors");
                Ok(Some(message))
            }

            StageId::Comparison => {
                let hits = self
                    .session_store
                    .snapshot(session_id)
                    .and_then(|s| s.outputs.search_hits)
                    .ok_or_else(|| CoreError::StageInternal {
                        stage: StageId::Comparison.to_string(),
                        reason: "no search hits available".to_string(),
                    })?;
                let ranking = ranking::rank(&hits, RankingWeights::default());
                self.session_store.set_ranking(session_id, ranking.clone());
                let message = format!("{} candidates ranked", ranking.len());
                state.ranking = Some(ranking);
                Ok(Some(message))
            }

            StageId::Decision => {
                let ranking = state.ranking.clone().ok_or_else(|| CoreError::StageInternal {
                    stage: StageId::Decision.to_string(),
                    reason: "no ranking available".to_string(),
                })?;
                let intent = state.intent.clone().unwrap_or(Intent {
                    kind: IntentKind::Purchase,
                    item: None,
                    quantity: None,
                    urgency: commerce_types::Urgency::Normal,
                    confidence: 0.0,
                    language_tag: "en".to_string(),
                });
                let ctx = DecisionContext {
                    urgency: intent.urgency,
                    budget: None,
                    unhealthy_connectors: self.purchase_executor.unhealthy_connectors(0.5),
                };
                let decision = ranking::decide(&ranking, &ctx, DecisionPolicy::default());
                self.session_store.set_decision(session_id, decision.clone());
                let message = if decision.selected.is_some() {
                    "candidate selected".to_string()
                } else {
                    "no candidate satisfied policy".to_string()
                };
                state.decision = Some(decision);
                Ok(Some(message))
            }

            StageId::AwaitConfirmation => {
                let rx = self.confirmations.register(session_id, run_id);
                self.session_store.set_awaiting_confirmation(session_id, run_id, true);

                let timeout = self.config.confirmation_timeout;
                let outcome = run_with_deadline(stage_id, timeout, cancel, async move {
                    match rx.await {
                        Ok(input) => Ok(input),
                        Err(_) => Err(CoreError::ConfirmationTimeout),
                    }
                })
                .await;

                self.session_store.set_awaiting_confirmation(session_id, run_id, false);

                let input = match outcome {
                    Ok(input) => input,
                    Err(CoreError::StageTimeout { .. }) => {
                        self.confirmations.clear(session_id);
                        return Err(CoreError::ConfirmationTimeout);
                    }
                    Err(e) => {
                        self.confirmations.clear(session_id);
                        return Err(e);
                    }
                };

                if input.accepted {
                    let selected_index = input.selected_index.unwrap_or(0);
                    state.confirmation = Some(ConfirmationOutcome::Accepted { selected_index });
                    Ok(Some("confirmed".to_string()))
                } else {
                    state.confirmation = Some(ConfirmationOutcome::Rejected);
                    Ok(Some("declined".to_string()))
                }
            }

            StageId::Purchase => {
                let decision = state.decision.clone().ok_or_else(|| CoreError::StageInternal {
                    stage: StageId::Purchase.to_string(),
                    reason: "no decision available".to_string(),
                })?;
                let decision = reorder_for_selection(decision, &state.confirmation);

                let intent = state.intent.clone();
                let quantity = intent.as_ref().and_then(|i| i.quantity).unwrap_or(1);
                let user_context = UserContext {
                    user_id: session_id.to_string(),
                    delivery_address: String::new(),
                    budget: None,
                    raw: serde_json::Value::Null,
                };
                let stage_deadline = Instant::now() + self.config.purchase_timeout;

                let ctx = PurchaseContext {
                    run_id: run_id.to_string(),
                    session_id: session_id.to_string(),
                    decision: &decision,
                    user_context: &user_context,
                    quantity,
                    stage_deadline,
                    cancel: cancel.clone(),
                };

                let confirmation_gate = EngineConfirmationGate {
                    confirmations: self.confirmations.clone(),
                    event_bus: self.event_bus.clone(),
                    session_id: session_id.to_string(),
                    timeout: self.config.confirmation_timeout,
                };
                let otp_provider = EngineOtpProvider {
                    otp: self.otp.clone(),
                    event_bus: self.event_bus.clone(),
                    session_id: session_id.to_string(),
                };

                let result = self
                    .purchase_executor
                    .execute(&ctx, &confirmation_gate, &otp_provider)
                    .await;
                self.session_store.set_purchase_result(session_id, result.clone());
                let message = format!("{:?}", result.status);
                state.purchase_result = Some(result);
                Ok(Some(message))
            }

            StageId::QueryInfo => {
                let deadline = self.config.plan_timeout;
                let knowledge = self.knowledge.clone();
                let request_text = request_text.to_string();
                let intent = state.intent.clone().ok_or_else(|| CoreError::StageInternal {
                    stage: StageId::QueryInfo.to_string(),
                    reason: "no intent available".to_string(),
                })?;
                let answer = run_with_deadline(stage_id, deadline, cancel, async move {
                    knowledge
                        .lookup(&request_text, &intent)
                        .await
                        .map_err(|e| CoreError::StageInternal {
                            stage: StageId::QueryInfo.to_string(),
                            reason: e.to_string(),
                        })
                })
                .await?;
                self.session_store.set_query_info(session_id, answer.clone());
                state.query_info = Some(answer.clone());
                Ok(Some(answer))
            }

            StageId::Notification => {
                let message = self.notification_message(state);
                self.session_store.set_notification(session_id, message.clone());
                state.notification = Some(message.clone());
                Ok(Some(message))
            }
        }
    }

    fn notification_message(&self, state: &RunState) -> String {
        if let Some(info) = &state.query_info {
            return info.clone();
        }
        if let Some(result) = &state.purchase_result {
            return match result.status {
                commerce_types::PurchaseStatus::Success => format!(
                    "Order placed via {} (order {}).",
                    result.platform_used.as_deref().unwrap_or("unknown"),
                    result.order_id.as_deref().unwrap_or("unknown")
                ),
                commerce_types::PurchaseStatus::Blocked => {
                    "The purchase was blocked by risk review and needs manual review.".to_string()
                }
                commerce_types::PurchaseStatus::Failed => {
                    "The purchase could not be completed with any available option.".to_string()
                }
            };
        }
        if matches!(state.confirmation, Some(ConfirmationOutcome::Rejected)) {
            return "Purchase cancelled at your request.".to_string();
        }
        if let Some(decision) = &state.decision {
            if decision.selected.is_none() {
                return "No option satisfied the current requirements.".to_string();
            }
        }
        "Done.".to_string()
    }

    fn build_outcome(
        &self,
        run_id: &str,
        state: &RunState,
        awaiting_confirmation: bool,
        success: bool,
    ) -> ProcessOutcome {
        ProcessOutcome {
            run_id: run_id.to_string(),
            success,
            intent: state.intent.clone(),
            plan_summary: state.plan.clone().unwrap_or_default(),
            ranked_products: state.ranking.clone(),
            decision: state.decision.clone(),
            awaiting_confirmation,
            purchase_result: state.purchase_result.clone(),
            query_info: state.query_info.clone(),
            notification: state.notification.clone(),
            terminal_stage_events: state.events.clone(),
        }
    }
}

/// Reorders the Purchase Executor's candidate list so the user's chosen
/// index (among `[selected, ...fallbacks]`) is attempted first, keeping the
/// others as fallbacks — staying within the set Decision already cleared
/// through policy rather than re-ranking from scratch.
fn reorder_for_selection(decision: Decision, confirmation: &Option<ConfirmationOutcome>) -> Decision {
    let index = match confirmation {
        Some(ConfirmationOutcome::Accepted { selected_index }) => *selected_index,
        _ => 0,
    };
    if index == 0 {
        return decision;
    }
    let Some(selected) = decision.selected else {
        return decision;
    };
    let mut candidates = vec![selected];
    candidates.extend(decision.fallbacks);
    if index >= candidates.len() {
        return Decision {
            selected: Some(candidates.remove(0)),
            fallbacks: candidates,
            reasoning: decision.reasoning,
            policy_flags: decision.policy_flags,
        };
    }
    let chosen = candidates.remove(index);
    let mut fallbacks = vec![];
    fallbacks.push(candidates.remove(0));
    fallbacks.extend(candidates);
    Decision {
        selected: Some(chosen),
        fallbacks,
        reasoning: decision.reasoning,
        policy_flags: decision.policy_flags,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{Connector, OrderReceipt, OtpChannel, SearchHints};
    use crate::journal::InMemoryCheckpointJournal;
    use crate::stages::{FixedPlanner, KeywordClassifier, StubKnowledgeLookup};
    use async_trait::async_trait;
    use commerce_types::{Capability, ConnectorErrorKind, Product};

    struct MockConnector {
        id: String,
    }

    #[async_trait]
    impl Connector for MockConnector {
        fn id(&self) -> &str {
            &self.id
        }
        fn capabilities(&self) -> &[Capability] {
            &[Capability::Search, Capability::Order]
        }
        async fn search(
            &self,
            _query: &str,
            _qty: u32,
            _hints: &SearchHints,
            _deadline: Instant,
        ) -> Result<Vec<Product>, ConnectorErrorKind> {
            Ok(vec![Product {
                connector_id: self.id.clone(),
                external_id: "p1".to_string(),
                title: "milk".to_string(),
                unit_price: 60.0,
                currency: "INR".to_string(),
                delivery_eta_minutes: 15,
                rating: Some(0.9),
                stock: Some(true),
                url: "https://example.invalid".to_string(),
                raw: serde_json::Value::Null,
            }])
        }
        async fn order(
            &self,
            _product: &Product,
            _quantity: u32,
            _user_context: &UserContext,
            _otp: Option<OtpChannel>,
            _deadline: Instant,
        ) -> Result<OrderReceipt, ConnectorErrorKind> {
            Ok(OrderReceipt {
                order_id: "order-1".to_string(),
            })
        }
    }

    fn test_orchestrator() -> Orchestrator {
        let registry = Registry::new();
        registry.add(Arc::new(MockConnector { id: "fast".to_string() }));
        Orchestrator::new(
            Config::default().with_connectors(vec!["fast".to_string()]),
            InMemoryCheckpointJournal::shared(),
            registry,
            AuditLog::new(),
            Arc::new(KeywordClassifier),
            Arc::new(FixedPlanner),
            Arc::new(StubKnowledgeLookup),
        )
    }

    #[tokio::test]
    async fn info_path_skips_purchase_stages_and_completes() {
        let orchestrator = test_orchestrator();
        let outcome = orchestrator.process("s1", "what is haldi?").await;
        assert!(outcome.success);
        assert!(!outcome.awaiting_confirmation);
        assert!(outcome.query_info.is_some());

        let skipped: Vec<_> = outcome
            .terminal_stage_events
            .iter()
            .filter(|e| matches!(e.status, StageStatus::Skipped))
            .map(|e| e.stage_id)
            .collect();
        assert!(skipped.contains(&StageId::Search));
        assert!(skipped.contains(&StageId::Comparison));
        assert!(skipped.contains(&StageId::Decision));
        assert!(skipped.contains(&StageId::AwaitConfirmation));
        assert!(skipped.contains(&StageId::Purchase));
    }

    #[tokio::test]
    async fn purchase_path_pauses_for_confirmation_then_completes() {
        let orchestrator = test_orchestrator();
        let outcome = orchestrator.process("s2", "milk").await;
        assert!(outcome.awaiting_confirmation);
        assert!(outcome.decision.is_some());

        let result = orchestrator
            .confirm("s2", true, Some(0))
            .await
            .expect("confirmation succeeds");
        assert_eq!(result.status, commerce_types::PurchaseStatus::Success);
    }

    #[tokio::test]
    async fn rejecting_confirmation_skips_purchase() {
        let orchestrator = test_orchestrator();
        let outcome = orchestrator.process("s3", "milk").await;
        assert!(outcome.awaiting_confirmation);

        let result = orchestrator.confirm("s3", false, None).await.unwrap();
        assert_eq!(result.status, commerce_types::PurchaseStatus::Failed);

        let snapshot = orchestrator.session_snapshot("s3").unwrap();
        let run = snapshot.last_run.unwrap();
        let purchase_state = &run.stage_states["purchase"];
        assert_eq!(purchase_state.status, StageStatus::Skipped);
    }

    #[tokio::test]
    async fn cancel_stops_a_pending_confirmation() {
        let orchestrator = test_orchestrator();
        let _outcome = orchestrator.process("s4", "milk").await;
        assert!(orchestrator.cancel("s4"));

        let confirm_result = orchestrator.confirm("s4", true, Some(0)).await;
        assert!(confirm_result.is_err());
    }
}
