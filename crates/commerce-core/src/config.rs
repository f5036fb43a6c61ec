//! Process configuration, loaded from environment (§6).

use std::time::Duration;

/// All tunables the orchestrator reads from its environment at startup.
/// Construction never fails on a missing var; it falls back to the spec's
/// stated defaults. Malformed values (e.g. a non-numeric timeout override)
/// are reported so `main` can exit with the configuration-error code.
#[derive(Debug, Clone)]
pub struct Config {
    pub connectors: Vec<String>,
    pub dry_run: bool,

    pub intent_timeout: Duration,
    pub plan_timeout: Duration,
    pub search_timeout: Duration,
    pub comparison_timeout: Duration,
    pub decision_timeout: Duration,
    pub purchase_timeout: Duration,

    pub purchase_max_retries: u32,
    pub risk_critical_threshold: u8,
    pub confirmation_timeout: Duration,
    pub idempotency_window: Duration,

    pub max_inflight_searches: usize,
    pub event_buffer_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connectors: Vec::new(),
            dry_run: false,
            intent_timeout: Duration::from_secs(5),
            plan_timeout: Duration::from_secs(5),
            search_timeout: Duration::from_secs(10),
            comparison_timeout: Duration::from_secs(5),
            decision_timeout: Duration::from_secs(5),
            purchase_timeout: Duration::from_secs(60),
            purchase_max_retries: 3,
            risk_critical_threshold: 80,
            confirmation_timeout: Duration::from_secs(300),
            idempotency_window: Duration::from_secs(300),
            max_inflight_searches: 16,
            event_buffer_capacity: 64,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("environment variable {0} is not a valid integer")]
    InvalidInteger(&'static str),
    #[error("no connectors configured (CONNECTORS is empty or unset)")]
    NoConnectorsConfigured,
}

impl Config {
    /// Loads from `CONNECTORS`, `DRY_RUN`, `PER_STAGE_TIMEOUT_*`,
    /// `PURCHASE_MAX_RETRIES`, `RISK_CRITICAL_THRESHOLD`,
    /// `CONFIRMATION_TIMEOUT_SEC`, and `IDEMPOTENCY_WINDOW_SEC`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        if let Ok(raw) = std::env::var("CONNECTORS") {
            cfg.connectors = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }

        cfg.dry_run = std::env::var("DRY_RUN")
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(cfg.dry_run);

        cfg.intent_timeout = read_secs_override("PER_STAGE_TIMEOUT_INTENT", cfg.intent_timeout)?;
        cfg.plan_timeout = read_secs_override("PER_STAGE_TIMEOUT_PLAN", cfg.plan_timeout)?;
        cfg.search_timeout = read_secs_override("PER_STAGE_TIMEOUT_SEARCH", cfg.search_timeout)?;
        cfg.comparison_timeout =
            read_secs_override("PER_STAGE_TIMEOUT_COMPARISON", cfg.comparison_timeout)?;
        cfg.decision_timeout =
            read_secs_override("PER_STAGE_TIMEOUT_DECISION", cfg.decision_timeout)?;
        cfg.purchase_timeout =
            read_secs_override("PER_STAGE_TIMEOUT_PURCHASE", cfg.purchase_timeout)?;

        if let Some(v) = read_u64_override("PURCHASE_MAX_RETRIES")? {
            cfg.purchase_max_retries = v as u32;
        }
        if let Some(v) = read_u64_override("RISK_CRITICAL_THRESHOLD")? {
            cfg.risk_critical_threshold = v as u8;
        }
        if let Some(v) = read_u64_override("CONFIRMATION_TIMEOUT_SEC")? {
            cfg.confirmation_timeout = Duration::from_secs(v);
        }
        if let Some(v) = read_u64_override("IDEMPOTENCY_WINDOW_SEC")? {
            cfg.idempotency_window = Duration::from_secs(v);
        }

        Ok(cfg)
    }

    /// Checked separately from parsing, since an empty connector set (exit
    /// code 4) is distinct from a malformed value (exit code 2).
    pub fn require_connectors(&self) -> Result<(), ConfigError> {
        if self.connectors.is_empty() {
            Err(ConfigError::NoConnectorsConfigured)
        } else {
            Ok(())
        }
    }

    pub fn with_connectors(mut self, connectors: Vec<String>) -> Self {
        self.connectors = connectors;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_purchase_max_retries(mut self, n: u32) -> Self {
        self.purchase_max_retries = n;
        self
    }

    pub fn with_risk_critical_threshold(mut self, n: u8) -> Self {
        self.risk_critical_threshold = n;
        self
    }
}

fn read_u64_override(var: &'static str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => raw
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidInteger(var)),
        Err(_) => Ok(None),
    }
}

fn read_secs_override(var: &'static str, current: Duration) -> Result<Duration, ConfigError> {
    Ok(read_u64_override(var)?.map(Duration::from_secs).unwrap_or(current))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = Config::default();
        assert_eq!(cfg.purchase_max_retries, 3);
        assert_eq!(cfg.risk_critical_threshold, 80);
        assert_eq!(cfg.confirmation_timeout, Duration::from_secs(300));
        assert_eq!(cfg.idempotency_window, Duration::from_secs(300));
        assert_eq!(cfg.search_timeout, Duration::from_secs(10));
        assert_eq!(cfg.purchase_timeout, Duration::from_secs(60));
    }

    #[test]
    fn require_connectors_rejects_empty() {
        let cfg = Config::default();
        assert!(cfg.require_connectors().is_err());
        let cfg = cfg.with_connectors(vec!["fast".to_string()]);
        assert!(cfg.require_connectors().is_ok());
    }
}
