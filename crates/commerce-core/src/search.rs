//! Search Fan-out (§4.6).

use crate::connector::{Registry, SearchHints};
use crate::error::CoreError;
use commerce_types::{Capability, ConnectorErrorKind, Product, SearchHits};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::warn;

/// Ceiling on any single connector's slice of the stage budget, independent
/// of how much of the stage deadline remains. A connector never gets more
/// than this even if the stage has minutes left.
const DEFAULT_PER_CONNECTOR_BUDGET: Duration = Duration::from_secs(8);

/// System-wide in-flight search gate (§4.6's back-pressure rule), shared
/// across every run's fan-out calls.
#[derive(Clone)]
pub struct SearchGate {
    semaphore: Arc<Semaphore>,
    queued: Arc<AtomicUsize>,
    max_queued: usize,
}

impl SearchGate {
    pub fn new(max_inflight: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_inflight)),
            queued: Arc::new(AtomicUsize::new(0)),
            // The queue bound itself is not a configured knob; four times
            // the in-flight cap gives bursts room to queue briefly without
            // letting the wait list grow unbounded.
            max_queued: max_inflight * 4,
        }
    }
}

type SearchOutcome = (String, Result<Vec<Product>, ConnectorErrorKind>);

/// Issues `search` to every registered connector advertising
/// `Capability::Search`, merges the results, and never fails the stage
/// because one connector failed — only when every connector failed.
pub async fn fan_out(
    registry: &Registry,
    gate: &SearchGate,
    query: &str,
    qty: u32,
    hints: &SearchHints,
    stage_deadline: Instant,
) -> Result<SearchHits, CoreError> {
    let connectors = registry.snapshot_with_capability(Capability::Search);
    if connectors.is_empty() {
        return Err(CoreError::NoConnectorsAvailable);
    }

    let mut handles: Vec<JoinHandle<SearchOutcome>> = Vec::with_capacity(connectors.len());

    for connector in connectors {
        let queued_before = gate.queued.fetch_add(1, Ordering::SeqCst);
        if queued_before >= gate.max_queued {
            gate.queued.fetch_sub(1, Ordering::SeqCst);
            for handle in handles {
                handle.abort();
            }
            warn!(connector_id = connector.id(), "search queue overflow, aborting fan-out");
            return Err(CoreError::Overloaded(
                "search back-pressure queue is full".to_string(),
            ));
        }

        let semaphore = gate.semaphore.clone();
        let queued = gate.queued.clone();
        let id = connector.id().to_string();
        let query = query.to_string();
        let hints = hints.clone();
        let remaining = stage_deadline.saturating_duration_since(Instant::now());
        let connector_timeout = remaining.min(DEFAULT_PER_CONNECTOR_BUDGET);
        let connector_deadline = Instant::now() + connector_timeout;

        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            queued.fetch_sub(1, Ordering::SeqCst);
            let outcome = tokio::time::timeout_at(
                connector_deadline,
                connector.search(&query, qty, &hints, connector_deadline),
            )
            .await
            .unwrap_or(Err(ConnectorErrorKind::Timeout));
            (id, outcome)
        }));
    }

    let mut hits: SearchHits = SearchHits::new();
    let mut any_ok = false;
    for handle in handles {
        if let Ok((id, outcome)) = handle.await {
            if outcome.is_ok() {
                any_ok = true;
            }
            hits.insert(id, outcome);
        }
    }

    if !any_ok {
        return Err(CoreError::NoConnectorsAvailable);
    }

    Ok(hits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{OrderReceipt, OtpChannel, UserContext};
    use async_trait::async_trait;

    struct SlowConnector {
        id: String,
        delay: Duration,
        result: Result<Vec<Product>, ConnectorErrorKind>,
    }

    #[async_trait]
    impl crate::connector::Connector for SlowConnector {
        fn id(&self) -> &str {
            &self.id
        }
        fn capabilities(&self) -> &[Capability] {
            &[Capability::Search]
        }
        async fn search(
            &self,
            _query: &str,
            _qty: u32,
            _hints: &SearchHints,
            _deadline: Instant,
        ) -> Result<Vec<Product>, ConnectorErrorKind> {
            tokio::time::sleep(self.delay).await;
            self.result.clone()
        }
        async fn order(
            &self,
            _product: &Product,
            _quantity: u32,
            _user_context: &UserContext,
            _otp: Option<OtpChannel>,
            _deadline: Instant,
        ) -> Result<OrderReceipt, ConnectorErrorKind> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn empty_registry_errors_no_connectors_available() {
        let registry = Registry::new();
        let gate = SearchGate::new(16);
        let result = fan_out(
            &registry,
            &gate,
            "milk",
            1,
            &serde_json::Value::Null,
            Instant::now() + Duration::from_secs(5),
        )
        .await;
        assert!(matches!(result, Err(CoreError::NoConnectorsAvailable)));
    }

    #[tokio::test]
    async fn slow_connector_is_recorded_as_timeout() {
        let registry = Registry::new();
        registry.add(Arc::new(SlowConnector {
            id: "slow".to_string(),
            delay: Duration::from_millis(200),
            result: Ok(Vec::new()),
        }));
        let gate = SearchGate::new(16);
        let hits = fan_out(
            &registry,
            &gate,
            "milk",
            1,
            &serde_json::Value::Null,
            Instant::now() + Duration::from_millis(20),
        )
        .await
        .unwrap_err();
        assert!(matches!(hits, CoreError::NoConnectorsAvailable));
    }

    #[tokio::test]
    async fn partial_connector_failure_does_not_fail_stage() {
        let registry = Registry::new();
        registry.add(Arc::new(SlowConnector {
            id: "ok".to_string(),
            delay: Duration::from_millis(1),
            result: Ok(vec![]),
        }));
        registry.add(Arc::new(SlowConnector {
            id: "broken".to_string(),
            delay: Duration::from_millis(1),
            result: Err(ConnectorErrorKind::Unavailable),
        }));
        let gate = SearchGate::new(16);
        let hits = fan_out(
            &registry,
            &gate,
            "milk",
            1,
            &serde_json::Value::Null,
            Instant::now() + Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.get("ok").unwrap().is_ok());
        assert!(hits.get("broken").unwrap().is_err());
    }
}
