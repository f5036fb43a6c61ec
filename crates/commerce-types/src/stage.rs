//! Stage output contracts and canonical stage identifiers (§3, §4.4).

use crate::product::Product;
use serde::{Deserialize, Serialize};

/// Fixed stage identifiers the Pipeline Engine schedules. Order here has no
/// meaning; a pipeline's node list is what fixes execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StageId {
    IntentExtraction,
    TaskPlanning,
    Search,
    Comparison,
    Decision,
    AwaitConfirmation,
    Purchase,
    QueryInfo,
    Notification,
}

impl StageId {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IntentExtraction => "intent_extraction",
            Self::TaskPlanning => "task_planning",
            Self::Search => "search",
            Self::Comparison => "comparison",
            Self::Decision => "decision",
            Self::AwaitConfirmation => "await_confirmation",
            Self::Purchase => "purchase",
            Self::QueryInfo => "query_info",
            Self::Notification => "notification",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "intent_extraction" => Self::IntentExtraction,
            "task_planning" => Self::TaskPlanning,
            "search" => Self::Search,
            "comparison" => Self::Comparison,
            "decision" => Self::Decision,
            "await_confirmation" => Self::AwaitConfirmation,
            "purchase" => Self::Purchase,
            "query_info" => Self::QueryInfo,
            "notification" => Self::Notification,
            _ => return None,
        })
    }
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntentKind {
    Purchase,
    Info,
    Clarify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Urgency {
    Low,
    #[default]
    Normal,
    High,
}

/// Output of `intent_extraction`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub kind: IntentKind,
    pub item: Option<String>,
    pub quantity: Option<u32>,
    pub urgency: Urgency,
    /// Confidence in [0, 1].
    pub confidence: f64,
    pub language_tag: String,
}

/// Output of `task_planning`: an ordered sequence of stage identifiers.
pub type Plan = Vec<StageId>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ScoreComponents {
    pub delivery: f64,
    pub price: f64,
    pub reliability: f64,
}

/// One entry of a `Ranking`, in descending `score` order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingEntry {
    pub product: Product,
    pub score: f64,
    pub score_components: ScoreComponents,
}

/// Output of `comparison`.
pub type Ranking = Vec<RankingEntry>;

/// Output of `decision`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub selected: Option<Product>,
    pub fallbacks: Vec<Product>,
    pub reasoning: String,
    pub policy_flags: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PurchaseStatus {
    Success,
    Blocked,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn from_score(score: u8, critical_threshold: u8) -> Self {
        if score > critical_threshold {
            Self::Critical
        } else if score > 60 {
            Self::High
        } else if score > 30 {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

/// Output of `purchase`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseResult {
    pub status: PurchaseStatus,
    pub platform_used: Option<String>,
    pub order_id: Option<String>,
    /// Risk score in [0, 100].
    pub risk_score: u8,
    pub risk_level: RiskLevel,
    pub attempts: u32,
    pub used_fallback: bool,
    pub audit_ids: Vec<u64>,
}
