//! Ranking & Decision (§4.7). Pure functions: no I/O, no session access.

use commerce_types::{
    Decision, Product, Ranking, RankingEntry, ScoreComponents, SearchHits, Urgency,
};

/// Weights applied to the three normalized score components. Exact weights
/// are flagged an open question upstream (§9); these favor delivery
/// slightly over price and weight reliability lowest, which is what S1's
/// expected ranking (`fast` over `slow` despite `slow` being cheaper)
/// requires.
#[derive(Debug, Clone, Copy)]
pub struct RankingWeights {
    pub delivery: f64,
    pub price: f64,
    pub reliability: f64,
}

impl Default for RankingWeights {
    fn default() -> Self {
        Self {
            delivery: 0.5,
            price: 0.35,
            reliability: 0.15,
        }
    }
}

/// Policy thresholds used by the Decision gate.
#[derive(Debug, Clone, Copy)]
pub struct DecisionPolicy {
    pub price_sanity_low: f64,
    pub price_sanity_high: f64,
    pub urgent_delivery_threshold_minutes: u32,
}

impl Default for DecisionPolicy {
    fn default() -> Self {
        Self {
            price_sanity_low: 0.5,
            price_sanity_high: 1.5,
            urgent_delivery_threshold_minutes: 60,
        }
    }
}

/// User-supplied constraints the Decision gate checks against.
#[derive(Debug, Clone, Default)]
pub struct DecisionContext {
    pub urgency: Urgency,
    pub budget: Option<f64>,
    pub unhealthy_connectors: Vec<String>,
}

fn normalize_smaller_better(value: f64, min: f64, max: f64) -> f64 {
    if (max - min).abs() < f64::EPSILON {
        1.0
    } else {
        1.0 - (value - min) / (max - min)
    }
}

/// Computes a score in `[0, 1]` per product, in the connector-then-product
/// order the fan-out produced them in, preserving that order as the
/// insertion-order tiebreaker.
pub fn rank(hits: &SearchHits, weights: RankingWeights) -> Ranking {
    let mut candidates: Vec<&Product> = Vec::new();
    for outcome in hits.values() {
        if let Ok(products) = outcome {
            candidates.extend(products.iter());
        }
    }

    if candidates.is_empty() {
        return Vec::new();
    }

    let (min_eta, max_eta) = min_max(candidates.iter().map(|p| p.delivery_eta_minutes as f64));
    let (min_price, max_price) = min_max(candidates.iter().map(|p| p.unit_price));

    let mut ranking: Vec<RankingEntry> = candidates
        .iter()
        .enumerate()
        .map(|(insertion_index, product)| {
            let delivery_score = normalize_smaller_better(
                product.delivery_eta_minutes as f64,
                min_eta,
                max_eta,
            );
            let price_score = normalize_smaller_better(product.unit_price, min_price, max_price);
            let reliability_score = product.rating.unwrap_or(0.5).clamp(0.0, 1.0);

            let score = weights.delivery * delivery_score
                + weights.price * price_score
                + weights.reliability * reliability_score;

            (
                insertion_index,
                RankingEntry {
                    product: (*product).clone(),
                    score,
                    score_components: ScoreComponents {
                        delivery: delivery_score,
                        price: price_score,
                        reliability: reliability_score,
                    },
                },
            )
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|(_, entry)| entry)
        .collect();

    // Stable sort descending by score; ties fall back to lower eta, then
    // lower price, then the original fan-out insertion order (guaranteed by
    // `sort_by`'s stability since we never reorder before this point).
    ranking.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                a.product
                    .delivery_eta_minutes
                    .cmp(&b.product.delivery_eta_minutes)
            })
            .then_with(|| {
                a.product
                    .unit_price
                    .partial_cmp(&b.product.unit_price)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    });

    ranking
}

fn min_max(values: impl Iterator<Item = f64>) -> (f64, f64) {
    values.fold((f64::MAX, f64::MIN), |(min, max), v| {
        (min.min(v), max.max(v))
    })
}

fn median(mut values: Vec<f64>) -> f64 {
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = values.len();
    if n == 0 {
        return 0.0;
    }
    if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    }
}

/// Walks the ranked list looking for the first product passing every
/// policy, in the order §4.7 specifies, returning it plus up to two more
/// passing products as fallbacks.
pub fn decide(ranking: &Ranking, ctx: &DecisionContext, policy: DecisionPolicy) -> Decision {
    if ranking.is_empty() {
        return Decision {
            selected: None,
            fallbacks: Vec::new(),
            reasoning: "no candidates to evaluate".to_string(),
            policy_flags: Vec::new(),
        };
    }

    let median_price = median(ranking.iter().map(|r| r.product.unit_price).collect());

    let passes = |entry: &RankingEntry, flags: &mut Vec<String>| -> bool {
        let p = &entry.product;

        if let Some(in_stock) = p.stock {
            if !in_stock {
                flags.push("in_stock".to_string());
                return false;
            }
        }

        let low = policy.price_sanity_low * median_price;
        let high = policy.price_sanity_high * median_price;
        if median_price > 0.0 && (p.unit_price < low || p.unit_price > high) {
            flags.push("price_sanity".to_string());
            return false;
        }

        if matches!(ctx.urgency, Urgency::High)
            && p.delivery_eta_minutes > policy.urgent_delivery_threshold_minutes
        {
            flags.push("delivery_meets_urgency".to_string());
            return false;
        }

        if let Some(budget) = ctx.budget {
            if p.unit_price > budget {
                flags.push("budget".to_string());
                return false;
            }
        }

        if ctx.unhealthy_connectors.contains(&p.connector_id) {
            flags.push("connector_health".to_string());
            return false;
        }

        true
    };

    let mut flags = Vec::new();
    let mut passing: Vec<&RankingEntry> = ranking
        .iter()
        .filter(|entry| passes(entry, &mut flags))
        .collect();

    // `delivery_meets_urgency` falls back to the lowest-eta candidate when
    // no product meets the urgent threshold outright.
    if passing.is_empty() && matches!(ctx.urgency, Urgency::High) {
        let mut relaxed_flags = Vec::new();
        let relaxed_policy = DecisionPolicy {
            urgent_delivery_threshold_minutes: u32::MAX,
            ..policy
        };
        passing = ranking
            .iter()
            .filter(|entry| {
                let p = &entry.product;
                if let Some(in_stock) = p.stock {
                    if !in_stock {
                        return false;
                    }
                }
                let low = relaxed_policy.price_sanity_low * median_price;
                let high = relaxed_policy.price_sanity_high * median_price;
                if median_price > 0.0 && (p.unit_price < low || p.unit_price > high) {
                    return false;
                }
                if let Some(budget) = ctx.budget {
                    if p.unit_price > budget {
                        return false;
                    }
                }
                if ctx.unhealthy_connectors.contains(&p.connector_id) {
                    return false;
                }
                true
            })
            .collect();
        let _ = &mut relaxed_flags;

        // Policy 3's fallback is lowest eta, not highest score: once the
        // urgency threshold itself is relaxed away, ranking-score order no
        // longer reflects delivery speed, so re-sort on eta directly.
        passing.sort_by_key(|entry| entry.product.delivery_eta_minutes);
    }

    if passing.is_empty() {
        return Decision {
            selected: None,
            fallbacks: Vec::new(),
            reasoning: "no candidate satisfied policy".to_string(),
            policy_flags: flags,
        };
    }

    let selected = passing[0].product.clone();

    // diversity: prefer fallbacks from a different connector than selected,
    // when one exists among the remaining passing candidates.
    let mut same_connector = Vec::new();
    let mut other_connector = Vec::new();
    for entry in passing.iter().skip(1) {
        if entry.product.connector_id == selected.connector_id {
            same_connector.push(entry.product.clone());
        } else {
            other_connector.push(entry.product.clone());
        }
    }
    let mut fallbacks: Vec<Product> = other_connector;
    fallbacks.extend(same_connector);
    fallbacks.truncate(2);

    Decision {
        selected: Some(selected),
        fallbacks,
        reasoning: "selected top-scoring candidate passing all policies".to_string(),
        policy_flags: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commerce_types::SearchHits;

    fn product(connector: &str, price: f64, eta: u32, rating: f64) -> Product {
        Product {
            connector_id: connector.to_string(),
            external_id: format!("{connector}-1"),
            title: "milk 1L".to_string(),
            unit_price: price,
            currency: "INR".to_string(),
            delivery_eta_minutes: eta,
            rating: Some(rating),
            stock: Some(true),
            url: "https://example.invalid".to_string(),
            raw: serde_json::Value::Null,
        }
    }

    #[test]
    fn s1_fast_outranks_cheaper_slower_connector() {
        let mut hits = SearchHits::new();
        hits.insert("fast".to_string(), Ok(vec![product("fast", 60.0, 15, 0.9)]));
        hits.insert("slow".to_string(), Ok(vec![product("slow", 55.0, 90, 0.9)]));

        let ranking = rank(&hits, RankingWeights::default());
        assert_eq!(ranking[0].product.connector_id, "fast");

        let decision = decide(&ranking, &DecisionContext::default(), DecisionPolicy::default());
        assert_eq!(decision.selected.unwrap().connector_id, "fast");
    }

    #[test]
    fn out_of_stock_is_disqualified() {
        let mut hits = SearchHits::new();
        let mut oos = product("a", 50.0, 20, 0.8);
        oos.stock = Some(false);
        hits.insert("a".to_string(), Ok(vec![oos]));
        hits.insert("b".to_string(), Ok(vec![product("b", 52.0, 25, 0.8)]));

        let ranking = rank(&hits, RankingWeights::default());
        let decision = decide(&ranking, &DecisionContext::default(), DecisionPolicy::default());
        assert_eq!(decision.selected.unwrap().connector_id, "b");
    }

    #[test]
    fn all_candidates_failing_policy_yields_no_selection() {
        let mut hits = SearchHits::new();
        hits.insert(
            "a".to_string(),
            Ok(vec![product("a", 1000.0, 20, 0.8)]),
        );
        let ranking = rank(&hits, RankingWeights::default());
        let decision = decide(
            &ranking,
            &DecisionContext {
                budget: Some(1.0),
                ..Default::default()
            },
            DecisionPolicy::default(),
        );
        assert!(decision.selected.is_none());
    }

    #[test]
    fn diversity_prefers_other_connector_for_fallback() {
        let mut hits = SearchHits::new();
        hits.insert(
            "a".to_string(),
            Ok(vec![
                product("a", 50.0, 10, 0.9),
                product("a", 51.0, 11, 0.9),
            ]),
        );
        hits.insert("b".to_string(), Ok(vec![product("b", 52.0, 12, 0.9)]));

        let ranking = rank(&hits, RankingWeights::default());
        let decision = decide(&ranking, &DecisionContext::default(), DecisionPolicy::default());
        let selected = decision.selected.unwrap();
        assert_eq!(selected.connector_id, "a");
        assert_eq!(decision.fallbacks[0].connector_id, "b");
    }
}
