//! Purchase Executor (§4.8).

use crate::audit::AuditLog;
use crate::connector::{Connector, OtpChannel, Registry, UserContext};
use crate::retry::{retry_with_backoff, Attempt, BackoffConfig};
use async_trait::async_trait;
use chrono::{Datelike, Utc};
use commerce_types::{ConnectorErrorKind, Decision, Product, PurchaseResult, PurchaseStatus, RiskLevel};
use dashmap::DashMap;
use serde_json::json;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Threshold above which a cart total is treated as "large" for risk
/// scoring (§4.8 phase 2's `total >= budget_large` factor). The spec does
/// not give a figure; this is a chosen constant, not user-configurable.
const DEFAULT_BUDGET_LARGE: f64 = 2_000.0;

const PRE_VALIDATION_DEADLINE: Duration = Duration::from_secs(3);

/// Re-enters `await_confirmation` for a `high`-risk purchase (§4.8 phase 2).
/// Implemented by the Pipeline Engine; stubbed here so Purchase Executor
/// tests don't need a running pipeline.
#[async_trait]
pub trait ConfirmationGate: Send + Sync {
    async fn reconfirm(&self, run_id: &str, detail: serde_json::Value) -> bool;
}

/// Relays a connector's `otp_required` event to the user and returns
/// whatever code comes back before the deadline.
#[async_trait]
pub trait OtpProvider: Send + Sync {
    async fn obtain(&self, run_id: &str, deadline: Instant) -> Result<String, ConnectorErrorKind>;
}

/// Always approves — used where the pipeline has already confirmed once and
/// dry-run/test contexts that don't exercise the re-confirmation path.
pub struct AutoApprove;

#[async_trait]
impl ConfirmationGate for AutoApprove {
    async fn reconfirm(&self, _run_id: &str, _detail: serde_json::Value) -> bool {
        true
    }
}

/// Never supplies a code — connectors that never request OTP never call it.
pub struct NoOtp;

#[async_trait]
impl OtpProvider for NoOtp {
    async fn obtain(&self, _run_id: &str, _deadline: Instant) -> Result<String, ConnectorErrorKind> {
        Err(ConnectorErrorKind::Transient)
    }
}

#[derive(Clone)]
struct IdempotencyRecord {
    at: chrono::DateTime<Utc>,
    result: PurchaseResult,
}

#[derive(Clone, Copy, Default)]
struct ConnectorHealth {
    successes: u32,
    failures: u32,
}

impl ConnectorHealth {
    fn score(&self) -> f64 {
        let total = self.successes + self.failures;
        if total == 0 {
            1.0
        } else {
            self.successes as f64 / total as f64
        }
    }
}

pub struct PurchaseContext<'a> {
    pub run_id: String,
    pub session_id: String,
    pub decision: &'a Decision,
    pub user_context: &'a UserContext,
    pub quantity: u32,
    pub stage_deadline: Instant,
    /// Set by the Pipeline Engine when the run is cancelled; checked
    /// between retry attempts so a cancelled run doesn't sleep through a
    /// whole backoff window before giving up.
    pub cancel: Arc<std::sync::atomic::AtomicBool>,
}

#[derive(Clone)]
pub struct PurchaseExecutor {
    registry: Registry,
    audit: AuditLog,
    health: Arc<DashMap<String, ConnectorHealth>>,
    idempotency: Arc<DashMap<String, IdempotencyRecord>>,
    dry_run: bool,
    max_retries: u32,
    risk_critical_threshold: u8,
    idempotency_window: chrono::Duration,
    backoff: BackoffConfig,
}

impl PurchaseExecutor {
    pub fn new(
        registry: Registry,
        audit: AuditLog,
        dry_run: bool,
        max_retries: u32,
        risk_critical_threshold: u8,
        idempotency_window: Duration,
    ) -> Self {
        Self {
            registry,
            audit,
            health: Arc::new(DashMap::new()),
            idempotency: Arc::new(DashMap::new()),
            dry_run,
            max_retries,
            risk_critical_threshold,
            idempotency_window: chrono::Duration::from_std(idempotency_window)
                .unwrap_or(chrono::Duration::seconds(300)),
            backoff: BackoffConfig::default(),
        }
    }

    fn record_health(&self, connector_id: &str, success: bool) {
        let mut entry = self.health.entry(connector_id.to_string()).or_default();
        if success {
            entry.successes += 1;
        } else {
            entry.failures += 1;
        }
    }

    fn health_of(&self, connector_id: &str) -> f64 {
        self.health
            .get(connector_id)
            .map(|e| e.score())
            .unwrap_or(1.0)
    }

    /// Connectors whose recorded health score has fallen below `threshold`,
    /// for the Decision gate's `connector_health` policy (§4.7).
    pub fn unhealthy_connectors(&self, threshold: f64) -> Vec<String> {
        self.health
            .iter()
            .filter(|e| e.score() < threshold)
            .map(|e| e.key().clone())
            .collect()
    }

    fn idempotency_key(connector_id: &str, external_id: &str, user_id: &str) -> String {
        let day_bucket = Utc::now();
        let day_bucket = format!(
            "{:04}-{:02}-{:02}",
            day_bucket.year(),
            day_bucket.month(),
            day_bucket.day()
        );
        let mut hasher = DefaultHasher::new();
        (connector_id, external_id, user_id, &day_bucket).hash(&mut hasher);
        format!("{:x}", hasher.finish())
    }

    /// Runs all six phases against the Decision's selected product, falling
    /// back through its listed alternates on exhaustion.
    pub async fn execute(
        &self,
        ctx: &PurchaseContext<'_>,
        confirmation: &dyn ConfirmationGate,
        otp: &dyn OtpProvider,
    ) -> PurchaseResult {
        let mut audit_ids = Vec::new();
        let Some(primary) = ctx.decision.selected.clone() else {
            return PurchaseResult {
                status: PurchaseStatus::Failed,
                platform_used: None,
                order_id: None,
                risk_score: 0,
                risk_level: RiskLevel::Low,
                attempts: 0,
                used_fallback: false,
                audit_ids,
            };
        };

        let mut candidates = vec![primary];
        candidates.extend(ctx.decision.fallbacks.clone());

        let mut total_attempts = 0u32;
        for (idx, candidate) in candidates.iter().enumerate() {
            let used_fallback = idx > 0;
            if used_fallback {
                audit_ids.push(self.audit.append(
                    &ctx.run_id,
                    &ctx.session_id,
                    "purchase_executor",
                    "fallback_chosen",
                    json!({ "connector_id": candidate.connector_id, "attempt_index": idx }),
                ));
            }

            let Some(connector) = self.registry.get(&candidate.connector_id) else {
                continue;
            };

            let outcome = self
                .attempt_candidate(
                    ctx,
                    &connector,
                    candidate,
                    used_fallback,
                    confirmation,
                    otp,
                    &mut audit_ids,
                )
                .await;

            total_attempts += outcome.attempts;

            match outcome.status {
                CandidateOutcome::Success { order_id, risk_score, risk_level } => {
                    let result = PurchaseResult {
                        status: PurchaseStatus::Success,
                        platform_used: Some(candidate.connector_id.clone()),
                        order_id: Some(order_id),
                        risk_score,
                        risk_level,
                        attempts: total_attempts,
                        used_fallback,
                        audit_ids: audit_ids.clone(),
                    };
                    audit_ids.push(self.audit.append(
                        &ctx.run_id,
                        &ctx.session_id,
                        "purchase_executor",
                        "terminal_result",
                        json!({ "status": "success", "platform": candidate.connector_id }),
                    ));
                    return result;
                }
                CandidateOutcome::Blocked { risk_score, risk_level } => {
                    audit_ids.push(self.audit.append(
                        &ctx.run_id,
                        &ctx.session_id,
                        "purchase_executor",
                        "risk_blocked",
                        json!({ "risk_score": risk_score, "connector_id": candidate.connector_id }),
                    ));
                    let result = PurchaseResult {
                        status: PurchaseStatus::Blocked,
                        platform_used: None,
                        order_id: None,
                        risk_score,
                        risk_level,
                        attempts: total_attempts,
                        used_fallback,
                        audit_ids: audit_ids.clone(),
                    };
                    audit_ids.push(self.audit.append(
                        &ctx.run_id,
                        &ctx.session_id,
                        "purchase_executor",
                        "terminal_result",
                        json!({ "status": "blocked" }),
                    ));
                    return result;
                }
                CandidateOutcome::Duplicate(result) => return result,
                CandidateOutcome::Exhausted => continue,
            }
        }

        let result = PurchaseResult {
            status: PurchaseStatus::Failed,
            platform_used: None,
            order_id: None,
            risk_score: 0,
            risk_level: RiskLevel::Low,
            attempts: total_attempts,
            used_fallback: candidates.len() > 1,
            audit_ids: audit_ids.clone(),
        };
        audit_ids.push(self.audit.append(
            &ctx.run_id,
            &ctx.session_id,
            "purchase_executor",
            "terminal_result",
            json!({ "status": "failed", "reason": "all candidates exhausted" }),
        ));
        PurchaseResult { audit_ids, ..result }
    }

    async fn attempt_candidate(
        &self,
        ctx: &PurchaseContext<'_>,
        connector: &Arc<dyn Connector>,
        candidate: &Product,
        is_fallback: bool,
        confirmation: &dyn ConfirmationGate,
        otp: &dyn OtpProvider,
        audit_ids: &mut Vec<u64>,
    ) -> CandidateAttempt {
        // Phase 1: pre-validation.
        audit_ids.push(self.audit.append(
            &ctx.run_id,
            &ctx.session_id,
            "purchase_executor",
            "validation_start",
            json!({ "connector_id": candidate.connector_id }),
        ));

        let validation_deadline = Instant::now() + PRE_VALIDATION_DEADLINE;
        let revalidated = connector
            .search(&candidate.external_id, ctx.quantity, &serde_json::Value::Null, validation_deadline)
            .await;

        let (current_price, in_stock) = match revalidated {
            Ok(products) => {
                let matched = products
                    .iter()
                    .find(|p| p.external_id == candidate.external_id);
                match matched {
                    Some(p) => (p.unit_price, p.stock.unwrap_or(true)),
                    None => (candidate.unit_price, false),
                }
            }
            Err(_) => (candidate.unit_price, false),
        };

        let price_delta = if candidate.unit_price > 0.0 {
            (current_price - candidate.unit_price) / candidate.unit_price
        } else {
            0.0
        };

        // Phase 2: risk assessment.
        let idempotency_key = Self::idempotency_key(
            &candidate.connector_id,
            &candidate.external_id,
            &ctx.user_context.user_id,
        );
        let duplicate = self
            .idempotency
            .get(&idempotency_key)
            .map(|e| Utc::now().signed_duration_since(e.at) < self.idempotency_window)
            .unwrap_or(false);

        let mut risk_score: i32 = 0;
        if price_delta >= 0.5 {
            risk_score += 40;
        }
        if !in_stock {
            risk_score += 20;
        }
        let platform_health = self.health_of(&candidate.connector_id);
        if platform_health < 0.5 {
            risk_score += 20;
        }
        let total = current_price * ctx.quantity as f64;
        if total >= DEFAULT_BUDGET_LARGE {
            risk_score += 20;
        }
        if duplicate {
            risk_score += 30;
        }
        let risk_score = risk_score.clamp(0, 100) as u8;
        let risk_level = RiskLevel::from_score(risk_score, self.risk_critical_threshold);

        audit_ids.push(self.audit.append(
            &ctx.run_id,
            &ctx.session_id,
            "purchase_executor",
            "risk_computed",
            json!({
                "connector_id": candidate.connector_id,
                "risk_score": risk_score,
                "price_delta": price_delta,
                "in_stock": in_stock,
            }),
        ));

        if matches!(risk_level, RiskLevel::Critical) {
            return CandidateAttempt {
                attempts: 0,
                status: CandidateOutcome::Blocked { risk_score, risk_level },
            };
        }

        if matches!(risk_level, RiskLevel::High) {
            let approved = confirmation
                .reconfirm(
                    &ctx.run_id,
                    json!({
                        "connector_id": candidate.connector_id,
                        "risk_score": risk_score,
                        "current_price": current_price,
                    }),
                )
                .await;
            if !approved {
                return CandidateAttempt {
                    attempts: 0,
                    status: CandidateOutcome::Blocked { risk_score, risk_level },
                };
            }
        }

        // Phase 3: idempotency short-circuit.
        if let Some(entry) = self.idempotency.get(&idempotency_key) {
            if Utc::now().signed_duration_since(entry.at) < self.idempotency_window
                && matches!(entry.result.status, PurchaseStatus::Success)
            {
                info!(connector_id = %candidate.connector_id, "idempotent replay, suppressing duplicate order");
                return CandidateAttempt {
                    attempts: 0,
                    status: CandidateOutcome::Duplicate(entry.result.clone()),
                };
            }
        }

        // Phase 4: execute, with retry on the primary candidate only.
        let max_retries = if is_fallback { 0 } else { self.max_retries };
        let dry_run = self.dry_run;
        let user_context = ctx.user_context.clone();
        let quantity = ctx.quantity;
        let connector = connector.clone();
        let candidate_clone = candidate.clone();
        let run_id = ctx.run_id.clone();
        let audit = self.audit.clone();
        let session_id = ctx.session_id.clone();
        let stage_deadline = ctx.stage_deadline;
        let cancel = ctx.cancel.clone();
        let attempts_made = Arc::new(std::sync::atomic::AtomicU32::new(0));

        let attempt_result = retry_with_backoff(
            self.backoff,
            max_retries,
            "purchase.order",
            move || cancel.load(std::sync::atomic::Ordering::SeqCst),
            {
                let attempts_made = attempts_made.clone();
                move |attempt| {
                    let connector = connector.clone();
                    let candidate = candidate_clone.clone();
                    let user_context = user_context.clone();
                    let run_id = run_id.clone();
                    let audit = audit.clone();
                    let session_id = session_id.clone();
                    let attempts_made = attempts_made.clone();
                    async move {
                        attempts_made.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        audit.append(
                            &run_id,
                            &session_id,
                            "purchase_executor",
                            "attempt_start",
                            json!({ "connector_id": candidate.connector_id, "attempt": attempt }),
                        );

                        let remaining = stage_deadline.saturating_duration_since(Instant::now());
                        let deadline = Instant::now() + remaining;

                        // The connector may need an out-of-band OTP mid-call
                        // (§4.3). It gets the connector-side half of the
                        // rendezvous; we hold the caller-side half here and
                        // relay to `otp` only if the connector actually asks.
                        let order_result = if dry_run {
                            Ok(crate::connector::OrderReceipt {
                                order_id: format!("dry-run-{}", uuid::Uuid::new_v4()),
                            })
                        } else {
                            let (mut otp_handle, otp_channel) = crate::connector::OtpChannel::new();
                            let order_fut = connector
                                .order(&candidate, quantity, &user_context, Some(otp_channel), deadline);
                            let relay_fut = async {
                                if otp_handle.wait_for_request().await {
                                    if let Ok(code) = otp.obtain(&run_id, deadline).await {
                                        otp_handle.supply(code);
                                    }
                                }
                            };
                            let (result, _) = tokio::join!(order_fut, relay_fut);
                            result
                        };

                        match &order_result {
                            Ok(receipt) => {
                                audit.append(
                                    &run_id,
                                    &session_id,
                                    "purchase_executor",
                                    "attempt_outcome",
                                    json!({ "connector_id": candidate.connector_id, "outcome": "success", "order_id": receipt.order_id }),
                                );
                            }
                            Err(e) => {
                                audit.append(
                                    &run_id,
                                    &session_id,
                                    "purchase_executor",
                                    "attempt_outcome",
                                    json!({ "connector_id": candidate.connector_id, "outcome": e.to_string() }),
                                );
                            }
                        }

                        match order_result {
                            Ok(receipt) => Attempt::Done(receipt),
                            Err(e) if e.is_retryable() => Attempt::Retryable(e),
                            Err(e) => Attempt::Fatal(e),
                        }
                    }
                }
            },
        )
        .await;

        let attempts = attempts_made.load(std::sync::atomic::Ordering::SeqCst);

        match attempt_result {
            Ok(receipt) => {
                self.record_health(&candidate.connector_id, true);
                let result = PurchaseResult {
                    status: PurchaseStatus::Success,
                    platform_used: Some(candidate.connector_id.clone()),
                    order_id: Some(receipt.order_id.clone()),
                    risk_score,
                    risk_level,
                    attempts,
                    used_fallback: is_fallback,
                    audit_ids: audit_ids.clone(),
                };
                self.idempotency.insert(
                    idempotency_key,
                    IdempotencyRecord {
                        at: Utc::now(),
                        result: result.clone(),
                    },
                );
                CandidateAttempt {
                    attempts,
                    status: CandidateOutcome::Success {
                        order_id: receipt.order_id,
                        risk_score,
                        risk_level,
                    },
                }
            }
            Err(e) => {
                self.record_health(&candidate.connector_id, false);
                warn!(connector_id = %candidate.connector_id, error = %e, "candidate exhausted");
                CandidateAttempt {
                    attempts,
                    status: CandidateOutcome::Exhausted,
                }
            }
        }
    }
}

struct CandidateAttempt {
    attempts: u32,
    status: CandidateOutcome,
}

enum CandidateOutcome {
    Success {
        order_id: String,
        risk_score: u8,
        risk_level: RiskLevel,
    },
    Blocked {
        risk_score: u8,
        risk_level: RiskLevel,
    },
    Duplicate(PurchaseResult),
    Exhausted,
}

#[cfg(test)]
mod tests {
    use super::*;
    use commerce_types::Capability;

    struct FlakyConnector {
        id: String,
        fails_before_success: std::sync::atomic::AtomicU32,
        search_stock: bool,
        search_price: f64,
    }

    #[async_trait]
    impl Connector for FlakyConnector {
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
            _hints: &serde_json::Value,
            _deadline: Instant,
        ) -> Result<Vec<Product>, ConnectorErrorKind> {
            Ok(vec![Product {
                connector_id: self.id.clone(),
                external_id: "p1".to_string(),
                title: "milk".to_string(),
                unit_price: self.search_price,
                currency: "INR".to_string(),
                delivery_eta_minutes: 15,
                rating: Some(0.9),
                stock: Some(self.search_stock),
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
        ) -> Result<crate::connector::OrderReceipt, ConnectorErrorKind> {
            let remaining = self
                .fails_before_success
                .fetch_update(std::sync::atomic::Ordering::SeqCst, std::sync::atomic::Ordering::SeqCst, |v| {
                    if v == 0 {
                        None
                    } else {
                        Some(v - 1)
                    }
                });
            match remaining {
                Ok(_) => Err(ConnectorErrorKind::Transient),
                Err(_) => Ok(crate::connector::OrderReceipt {
                    order_id: format!("{}-order", self.id),
                }),
            }
        }
    }

    fn product(connector_id: &str, price: f64) -> Product {
        Product {
            connector_id: connector_id.to_string(),
            external_id: "p1".to_string(),
            title: "milk".to_string(),
            unit_price: price,
            currency: "INR".to_string(),
            delivery_eta_minutes: 15,
            rating: Some(0.9),
            stock: Some(true),
            url: "https://example.invalid".to_string(),
            raw: serde_json::Value::Null,
        }
    }

    fn decision(selected: Product, fallbacks: Vec<Product>) -> Decision {
        Decision {
            selected: Some(selected),
            fallbacks,
            reasoning: "test".to_string(),
            policy_flags: Vec::new(),
        }
    }

    #[tokio::test]
    async fn s1_happy_path_succeeds_first_attempt() {
        let registry = Registry::new();
        registry.add(Arc::new(FlakyConnector {
            id: "fast".to_string(),
            fails_before_success: std::sync::atomic::AtomicU32::new(0),
            search_stock: true,
            search_price: 60.0,
        }));

        let executor = PurchaseExecutor::new(
            registry,
            AuditLog::new(),
            false,
            3,
            80,
            Duration::from_secs(300),
        );

        let decision = decision(product("fast", 60.0), vec![]);
        let user_context = UserContext::default();
        let ctx = PurchaseContext {
            run_id: "r1".to_string(),
            session_id: "s1".to_string(),
            decision: &decision,
            user_context: &user_context,
            quantity: 1,
            stage_deadline: Instant::now() + Duration::from_secs(60),
            cancel: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        };

        let result = executor.execute(&ctx, &AutoApprove, &NoOtp).await;
        assert_eq!(result.status, PurchaseStatus::Success);
        assert_eq!(result.platform_used.as_deref(), Some("fast"));
        assert!(!result.used_fallback);
    }

    #[tokio::test]
    async fn s2_primary_exhausts_then_fallback_succeeds() {
        let registry = Registry::new();
        registry.add(Arc::new(FlakyConnector {
            id: "fast".to_string(),
            fails_before_success: std::sync::atomic::AtomicU32::new(100),
            search_stock: true,
            search_price: 60.0,
        }));
        registry.add(Arc::new(FlakyConnector {
            id: "slow".to_string(),
            fails_before_success: std::sync::atomic::AtomicU32::new(0),
            search_stock: true,
            search_price: 55.0,
        }));

        let executor = PurchaseExecutor::new(
            registry,
            AuditLog::new(),
            false,
            3,
            80,
            Duration::from_secs(300),
        );

        let decision = decision(product("fast", 60.0), vec![product("slow", 55.0)]);
        let user_context = UserContext::default();
        let ctx = PurchaseContext {
            run_id: "r2".to_string(),
            session_id: "s1".to_string(),
            decision: &decision,
            user_context: &user_context,
            quantity: 1,
            stage_deadline: Instant::now() + Duration::from_secs(60),
            cancel: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        };

        let result = executor.execute(&ctx, &AutoApprove, &NoOtp).await;
        assert_eq!(result.status, PurchaseStatus::Success);
        assert_eq!(result.platform_used.as_deref(), Some("slow"));
        assert!(result.used_fallback);
    }

    #[tokio::test]
    async fn s3_critical_risk_blocks_without_ordering() {
        let registry = Registry::new();
        registry.add(Arc::new(FlakyConnector {
            id: "fast".to_string(),
            fails_before_success: std::sync::atomic::AtomicU32::new(0),
            search_stock: true,
            search_price: 132.0, // +120% over the decision's recorded 60.0
        }));

        let executor = PurchaseExecutor::new(
            registry,
            AuditLog::new(),
            false,
            3,
            80,
            Duration::from_secs(300),
        );

        // Pre-seed a duplicate idempotency record so risk scoring includes
        // the duplicate_request factor, matching S3's composition
        // (40 + 20 budget_large + 30 duplicate = 90 -> critical).
        let key = PurchaseExecutor::idempotency_key("fast", "p1", "");
        executor.idempotency.insert(
            key,
            IdempotencyRecord {
                at: Utc::now(),
                result: PurchaseResult {
                    status: PurchaseStatus::Failed,
                    platform_used: None,
                    order_id: None,
                    risk_score: 0,
                    risk_level: RiskLevel::Low,
                    attempts: 1,
                    used_fallback: false,
                    audit_ids: vec![],
                },
            },
        );

        let decision = decision(product("fast", 60.0), vec![]);
        let user_context = UserContext {
            budget: None,
            ..UserContext::default()
        };
        let ctx = PurchaseContext {
            run_id: "r3".to_string(),
            session_id: "s1".to_string(),
            decision: &decision,
            user_context: &user_context,
            quantity: 20,
            stage_deadline: Instant::now() + Duration::from_secs(60),
            cancel: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        };

        let result = executor.execute(&ctx, &AutoApprove, &NoOtp).await;
        assert_eq!(result.status, PurchaseStatus::Blocked);
        assert_eq!(result.risk_level, RiskLevel::Critical);
    }
}
