//! Product and SearchHits (§3).

use crate::connector::ConnectorErrorKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub connector_id: String,
    pub external_id: String,
    pub title: String,
    pub unit_price: f64,
    pub currency: String,
    /// Estimated minutes until delivery. Smaller is better.
    pub delivery_eta_minutes: u32,
    pub rating: Option<f64>,
    pub stock: Option<bool>,
    pub url: String,
    /// Connector-specific payload, passed through unexamined by the core.
    #[serde(default)]
    pub raw: serde_json::Value,
}

/// connector_id → either its products or the reason it failed, for one search.
///
/// A `BTreeMap` keeps iteration order deterministic for snapshot round-trips
/// and for tests, even though the contract only requires key uniqueness.
pub type SearchHits = BTreeMap<String, Result<Vec<Product>, ConnectorErrorKind>>;
