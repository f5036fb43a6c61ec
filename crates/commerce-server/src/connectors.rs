//! Simulated merchant connectors used to populate the Connector Registry at
//! startup. The connector interface itself (`commerce_core::Connector`) is
//! the seam a real merchant integration plugs into; `commerce-types`'s own
//! scope cut treats "the specific merchant-automation transports" as an
//! external collaborator. This deterministic stand-in lets the server run
//! end-to-end (and `CONNECTORS=fast,slow` demo profiles work out of the box)
//! the same way `stages::KeywordClassifier`/`FixedPlanner` stand in for a
//! real NLU/LLM pipeline.

use async_trait::async_trait;
use commerce_core::connector::{Connector, OtpChannel, SearchHints, UserContext};
use commerce_types::{Capability, ConnectorErrorKind, Product};
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::time::Instant;

/// One simulated merchant profile: a fixed delivery ETA and price multiplier
/// so different `CONNECTORS` entries rank differently and deterministically.
pub struct SimulatedConnector {
    id: String,
    eta_minutes: u32,
    unit_price: f64,
    rating: f64,
    orders_placed: AtomicU32,
}

impl SimulatedConnector {
    pub fn new(id: impl Into<String>, eta_minutes: u32, unit_price: f64, rating: f64) -> Self {
        Self {
            id: id.into(),
            eta_minutes,
            unit_price,
            rating,
            orders_placed: AtomicU32::new(0),
        }
    }

    /// Picks a profile by connector id, falling back to a generic mid-tier
    /// listing for any id the built-in profiles don't recognize so
    /// `CONNECTORS` can name arbitrary ids without the server refusing to
    /// start.
    pub fn for_id(id: &str) -> Self {
        match id {
            "fast" => Self::new(id, 15, 60.0, 4.6),
            "slow" => Self::new(id, 90, 55.0, 4.2),
            "premium" => Self::new(id, 30, 85.0, 4.9),
            other => Self::new(other, 45, 65.0, 4.0),
        }
    }
}

#[async_trait]
impl Connector for SimulatedConnector {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> &[Capability] {
        &[Capability::Search, Capability::Order]
    }

    async fn search(
        &self,
        query: &str,
        quantity: u32,
        _hints: &SearchHints,
        _deadline: Instant,
    ) -> Result<Vec<Product>, ConnectorErrorKind> {
        Ok(vec![Product {
            connector_id: self.id.clone(),
            external_id: format!("{}-{}", self.id, quantity),
            title: query.to_string(),
            unit_price: self.unit_price,
            currency: "INR".to_string(),
            delivery_eta_minutes: self.eta_minutes,
            rating: Some(self.rating),
            stock: Some(true),
            url: format!("https://{}.example/item/{}", self.id, query.replace(' ', "-")),
            raw: serde_json::Value::Null,
        }])
    }

    async fn order(
        &self,
        product: &Product,
        _quantity: u32,
        _user_context: &UserContext,
        _otp: Option<OtpChannel>,
        _deadline: Instant,
    ) -> Result<commerce_core::connector::OrderReceipt, ConnectorErrorKind> {
        let seq = self.orders_placed.fetch_add(1, Ordering::SeqCst);
        Ok(commerce_core::connector::OrderReceipt {
            order_id: format!("{}-order-{}-{}", self.id, product.external_id, seq),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[tokio::test]
    async fn search_returns_one_product_priced_by_profile() {
        let connector = SimulatedConnector::for_id("fast");
        let hits = connector
            .search("milk 1 litre", 1, &Value::Null, Instant::now())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].delivery_eta_minutes, 15);
        assert_eq!(hits[0].connector_id, "fast");
    }

    #[tokio::test]
    async fn unknown_id_gets_generic_profile() {
        let connector = SimulatedConnector::for_id("corner-shop");
        assert_eq!(connector.id(), "corner-shop");
        let hits = connector
            .search("rice", 1, &Value::Null, Instant::now())
            .await
            .unwrap();
        assert_eq!(hits[0].delivery_eta_minutes, 45);
    }

    #[tokio::test]
    async fn order_ids_are_unique_per_call() {
        let connector = SimulatedConnector::for_id("fast");
        let product = &connector
            .search("milk", 1, &Value::Null, Instant::now())
            .await
            .unwrap()[0];
        let ctx = UserContext::default();
        let r1 = connector
            .order(product, 1, &ctx, None, Instant::now())
            .await
            .unwrap();
        let r2 = connector
            .order(product, 1, &ctx, None, Instant::now())
            .await
            .unwrap();
        assert_ne!(r1.order_id, r2.order_id);
    }
}
