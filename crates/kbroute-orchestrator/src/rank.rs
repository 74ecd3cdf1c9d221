//! Cross-source merge: weighting, deduplication and deterministic ordering.

use std::cmp::Ordering;
use std::collections::HashSet;

use kbroute_core::types::{Hit, RankedResult, TierLabel};

/// Composite score of a hit: raw similarity times collection weight.
pub fn composite(hit: &Hit) -> f32 {
    hit.score * hit.collection.weight
}

/// Total order of ranked results: composite desc, raw desc, collection name
/// asc, full collection id asc, chunk identity asc, chunk id asc. Arrival
/// order never matters.
pub fn result_order(a: &RankedResult, b: &RankedResult) -> Ordering {
    b.composite
        .total_cmp(&a.composite)
        .then_with(|| b.hit.score.total_cmp(&a.hit.score))
        .then_with(|| a.hit.collection.name().cmp(b.hit.collection.name()))
        .then_with(|| a.hit.collection.id.cmp(&b.hit.collection.id))
        .then_with(|| a.hit.chunk.identity_key().cmp(&b.hit.chunk.identity_key()))
        .then_with(|| a.hit.chunk.id.cmp(&b.hit.chunk.id))
}

/// Merge the hits of one tier into at most `top_n` ranked results.
///
/// Hits with a non-finite score or weight are dropped. Of several hits with
/// the same chunk identity only the first under `result_order` is kept.
pub fn rank(hits: Vec<Hit>, top_n: usize, tier: TierLabel) -> Vec<RankedResult> {
    let mut ranked: Vec<RankedResult> = hits
        .into_iter()
        .filter_map(|hit| {
            let composite = composite(&hit);
            if !composite.is_finite() || !hit.score.is_finite() {
                tracing::debug!(chunk = %hit.chunk.id, "dropping hit with non-finite score");
                return None;
            }
            Some(RankedResult { hit, composite, tier })
        })
        .collect();
    ranked.sort_by(result_order);

    let mut seen = HashSet::new();
    ranked.retain(|r| seen.insert(r.hit.chunk.identity_key()));
    ranked.truncate(top_n);
    ranked
}
