//! Stage Contracts (§4.4) for the stages the spec treats as external
//! collaborators: the classifier, planner, and knowledge lookup are "pure
//! functions with stated input/output contracts", not something this crate
//! implements. These traits are the seam the Pipeline Engine calls through;
//! production wiring supplies real NLU/LLM-backed implementations, and the
//! keyword-based ones below exist so the engine is testable without one.

use async_trait::async_trait;
use commerce_types::{ContractError, Intent, IntentKind, Plan, StageId, Urgency};

/// `intent_extraction`: classifies a request into an `Intent`. Stateless —
/// a pure function of the request text (and, for a real implementation,
/// whatever language model backs it).
#[async_trait]
pub trait IntentClassifier: Send + Sync {
    async fn classify(&self, request_text: &str) -> Result<Intent, ContractError>;
}

/// `task_planning`: orders the remaining stage identifiers for a given
/// intent. The two fixed pipelines in §4.5 are the only plans this crate's
/// engine honors; a planner that returns anything else is rejected at the
/// stage boundary.
#[async_trait]
pub trait TaskPlanner: Send + Sync {
    async fn plan(&self, intent: &Intent) -> Result<Plan, ContractError>;
}

/// `query_info`: answers an info-path request directly, bypassing search
/// and purchase. Out of scope per §1 ("knowledge-base lookup" is an
/// external collaborator); this trait is the seam a real implementation
/// plugs into.
#[async_trait]
pub trait KnowledgeLookup: Send + Sync {
    async fn lookup(&self, request_text: &str, intent: &Intent) -> Result<String, ContractError>;
}

/// The two fixed pipelines §4.5 names. A plan must match one of these
/// exactly (by stage identity, independent of the predicate-skipped
/// entries) or it is rejected as `stage_internal` at the `task_planning`
/// boundary, per §9's "schemaed stage output types" requirement.
pub fn purchase_pipeline() -> Plan {
    vec![
        StageId::IntentExtraction,
        StageId::TaskPlanning,
        StageId::Search,
        StageId::Comparison,
        StageId::Decision,
        StageId::AwaitConfirmation,
        StageId::Purchase,
        StageId::Notification,
    ]
}

pub fn info_pipeline() -> Plan {
    vec![
        StageId::IntentExtraction,
        StageId::TaskPlanning,
        StageId::QueryInfo,
        StageId::Notification,
    ]
}

/// Keyword-driven stand-in classifier: not a model, just a deterministic
/// heuristic so the engine and its tests don't require a live NLU service.
/// Production wiring replaces this with a real classifier behind the same
/// trait.
pub struct KeywordClassifier;

#[async_trait]
impl IntentClassifier for KeywordClassifier {
    async fn classify(&self, request_text: &str) -> Result<Intent, ContractError> {
        let lower = request_text.to_lowercase();
        let urgency = if lower.contains("urgent") || lower.contains("asap") || lower.contains("now") {
            Urgency::High
        } else {
            Urgency::Normal
        };

        let kind = if lower.starts_with("what") || lower.starts_with("how") || lower.contains('?') {
            IntentKind::Info
        } else if lower.trim().is_empty() {
            IntentKind::Clarify
        } else {
            IntentKind::Purchase
        };

        let item = if matches!(kind, IntentKind::Purchase) {
            Some(request_text.trim().to_string())
        } else {
            None
        };

        Ok(Intent {
            kind,
            item,
            quantity: Some(1),
            urgency,
            confidence: 0.6,
            language_tag: "en".to_string(),
        })
    }
}

/// Deterministic planner selecting one of the two fixed pipelines by intent
/// kind, per §4.5. `clarify` has no dedicated pipeline in scope; it is
/// routed through the info path so the run still terminates in a
/// Notification rather than stalling.
pub struct FixedPlanner;

#[async_trait]
impl TaskPlanner for FixedPlanner {
    async fn plan(&self, intent: &Intent) -> Result<Plan, ContractError> {
        Ok(match intent.kind {
            IntentKind::Purchase => purchase_pipeline(),
            IntentKind::Info | IntentKind::Clarify => info_pipeline(),
        })
    }
}

/// Stub knowledge lookup: echoes a canned answer. §1 scopes the real
/// knowledge base out of this crate entirely.
pub struct StubKnowledgeLookup;

#[async_trait]
impl KnowledgeLookup for StubKnowledgeLookup {
    async fn lookup(&self, request_text: &str, _intent: &Intent) -> Result<String, ContractError> {
        Ok(format!(
            "I don't have a knowledge base connected yet, but you asked: \"{request_text}\""
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn keyword_classifier_flags_questions_as_info() {
        let intent = KeywordClassifier.classify("what is haldi?").await.unwrap();
        assert_eq!(intent.kind, IntentKind::Info);
    }

    #[tokio::test]
    async fn keyword_classifier_flags_bare_item_as_purchase() {
        let intent = KeywordClassifier.classify("milk 1 litre").await.unwrap();
        assert_eq!(intent.kind, IntentKind::Purchase);
        assert_eq!(intent.item.as_deref(), Some("milk 1 litre"));
    }

    #[tokio::test]
    async fn fixed_planner_selects_purchase_pipeline() {
        let intent = Intent {
            kind: IntentKind::Purchase,
            item: Some("rice".to_string()),
            quantity: Some(1),
            urgency: Urgency::Normal,
            confidence: 0.9,
            language_tag: "en".to_string(),
        };
        let plan = FixedPlanner.plan(&intent).await.unwrap();
        assert_eq!(plan, purchase_pipeline());
    }
}
