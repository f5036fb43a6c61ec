//! Connector Interface & Registry (§4.3).

use async_trait::async_trait;
use commerce_types::{Capability, ConnectorErrorKind, Product};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Context passed into `order`: the address and any other user-scoped data
/// the merchant platform needs. Per §9's open-question resolution, address
/// selection is a static field here rather than its own flow.
#[derive(Debug, Clone, Default)]
pub struct UserContext {
    pub user_id: String,
    pub delivery_address: String,
    pub budget: Option<f64>,
    pub raw: Value,
}

/// One-shot rendezvous a connector uses to request an out-of-band OTP code
/// from the caller during `order` (§4.3's OTP handling).
pub struct OtpChannel {
    request_tx: Option<oneshot::Sender<()>>,
    reply_rx: oneshot::Receiver<String>,
}

impl OtpChannel {
    pub fn new() -> (OtpChannelHandle, Self) {
        let (req_tx, req_rx) = oneshot::channel();
        let (reply_tx, reply_rx) = oneshot::channel();
        (
            OtpChannelHandle {
                request_rx: Some(req_rx),
                reply_tx: Some(reply_tx),
            },
            Self {
                request_tx: Some(req_tx),
                reply_rx,
            },
        )
    }

    /// Called by the connector: signals the caller that an OTP is needed,
    /// then awaits the value with the given deadline. A `transient` result
    /// means the caller never supplied one in time.
    pub async fn request_and_wait(
        mut self,
        deadline: std::time::Duration,
    ) -> Result<String, ConnectorErrorKind> {
        if let Some(tx) = self.request_tx.take() {
            let _ = tx.send(());
        }
        match tokio::time::timeout(deadline, &mut self.reply_rx).await {
            Ok(Ok(code)) => Ok(code),
            _ => Err(ConnectorErrorKind::Transient),
        }
    }
}

/// Caller-side handle: await the connector's OTP request, then supply a code.
pub struct OtpChannelHandle {
    request_rx: Option<oneshot::Receiver<()>>,
    reply_tx: Option<oneshot::Sender<String>>,
}

impl OtpChannelHandle {
    pub async fn wait_for_request(&mut self) -> bool {
        match self.request_rx.take() {
            Some(rx) => rx.await.is_ok(),
            None => false,
        }
    }

    pub fn supply(mut self, code: String) {
        if let Some(tx) = self.reply_tx.take() {
            let _ = tx.send(code);
        }
    }
}

/// Search hints: free-form refinements (brand, package size, ...) a
/// connector may use or ignore.
pub type SearchHints = Value;

/// Uniform contract implemented by each merchant adapter. A connector need
/// not implement both capabilities; the Registry tracks which it declares.
#[async_trait]
pub trait Connector: Send + Sync {
    fn id(&self) -> &str;
    fn capabilities(&self) -> &[Capability];

    async fn search(
        &self,
        query: &str,
        qty: u32,
        hints: &SearchHints,
        deadline: Instant,
    ) -> Result<Vec<Product>, ConnectorErrorKind>;

    async fn order(
        &self,
        product: &Product,
        quantity: u32,
        user_context: &UserContext,
        otp: Option<OtpChannel>,
        deadline: Instant,
    ) -> Result<OrderReceipt, ConnectorErrorKind>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderReceipt {
    pub order_id: String,
}

/// Runtime registry of configured connector handles. Read-mostly: updates
/// take a write lock (the `DashMap` shard lock); the fan-out always works
/// off a cloned snapshot so an add/remove mid-fan-out cannot be observed
/// half-applied.
#[derive(Clone, Default)]
pub struct Registry {
    connectors: Arc<DashMap<String, Arc<dyn Connector>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, connector: Arc<dyn Connector>) {
        self.connectors.insert(connector.id().to_string(), connector);
    }

    pub fn remove(&self, id: &str) -> bool {
        self.connectors.remove(id).is_some()
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Connector>> {
        self.connectors.get(id).map(|e| e.value().clone())
    }

    /// Atomic point-in-time snapshot of every registered connector.
    pub fn snapshot(&self) -> Vec<Arc<dyn Connector>> {
        self.connectors.iter().map(|e| e.value().clone()).collect()
    }

    /// Snapshot filtered to connectors advertising `capability`.
    pub fn snapshot_with_capability(&self, capability: Capability) -> Vec<Arc<dyn Connector>> {
        self.snapshot()
            .into_iter()
            .filter(|c| c.capabilities().contains(&capability))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubConnector {
        id: String,
        caps: Vec<Capability>,
    }

    #[async_trait]
    impl Connector for StubConnector {
        fn id(&self) -> &str {
            &self.id
        }

        fn capabilities(&self) -> &[Capability] {
            &self.caps
        }

        async fn search(
            &self,
            _query: &str,
            _qty: u32,
            _hints: &SearchHints,
            _deadline: Instant,
        ) -> Result<Vec<Product>, ConnectorErrorKind> {
            Ok(Vec::new())
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
                order_id: "o1".to_string(),
            })
        }
    }

    #[test]
    fn registry_snapshot_filters_by_capability() {
        let registry = Registry::new();
        registry.add(Arc::new(StubConnector {
            id: "fast".to_string(),
            caps: vec![Capability::Search, Capability::Order],
        }));
        registry.add(Arc::new(StubConnector {
            id: "lookup-only".to_string(),
            caps: vec![Capability::Search],
        }));

        let searchers = registry.snapshot_with_capability(Capability::Search);
        assert_eq!(searchers.len(), 2);

        let orderers = registry.snapshot_with_capability(Capability::Order);
        assert_eq!(orderers.len(), 1);
        assert_eq!(orderers[0].id(), "fast");
    }

    #[test]
    fn remove_reports_whether_present() {
        let registry = Registry::new();
        registry.add(Arc::new(StubConnector {
            id: "fast".to_string(),
            caps: vec![Capability::Search],
        }));
        assert!(registry.remove("fast"));
        assert!(!registry.remove("fast"));
    }

    #[tokio::test]
    async fn otp_channel_round_trips() {
        let (mut handle, channel) = OtpChannel::new();
        let waiter = tokio::spawn(async move {
            channel
                .request_and_wait(std::time::Duration::from_secs(1))
                .await
        });
        assert!(handle.wait_for_request().await);
        handle.supply("123456".to_string());
        let code = waiter.await.unwrap().unwrap();
        assert_eq!(code, "123456");
    }
}
