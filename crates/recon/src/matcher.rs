//! Candidate matcher / scorer.
//!
//! Pairs live owners whose ref matches no canonical key with canonical
//! owners, scored by fingerprint similarity. Only a clear winner above the
//! confidence threshold is accepted; everything else goes to review.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info};

use crate::config::{Exclusions, MatchingConfig, ScoreWeights};
use crate::model::{AmbiguityReason, AmbiguousMatch, Fingerprint, MatchCandidate, MatchOutcome, ScoreBreakdown};

pub struct MatchInput<'a> {
    pub canonical: &'a BTreeMap<String, Fingerprint>,
    pub live: &'a BTreeMap<String, Fingerprint>,
    pub exclusions: &'a Exclusions,
}

/// Live owners that need reconciliation: they hold records under a ref no
/// canonical owner has, and are not excluded.
pub fn needs_reconciliation<'a>(input: &MatchInput<'a>) -> Vec<&'a Fingerprint> {
    input
        .live
        .values()
        .filter(|fp| fp.total() > 0)
        .filter(|fp| !input.canonical.contains_key(&fp.owner))
        .filter(|fp| input.exclusions.permits_live(&fp.owner))
        .collect()
}

/// Canonical counts not yet covered by live records under the same key.
pub fn outstanding_counts(canonical: &Fingerprint, live_same_key: Option<&Fingerprint>) -> BTreeMap<String, usize> {
    canonical
        .counts
        .iter()
        .map(|(table, &expected)| {
            let present = live_same_key.map_or(0, |fp| fp.count(table));
            (table.clone(), expected.saturating_sub(present))
        })
        .collect()
}

pub fn match_owners(input: &MatchInput<'_>, config: &MatchingConfig) -> MatchOutcome {
    let targets: Vec<(&Fingerprint, BTreeMap<String, usize>)> = input
        .canonical
        .values()
        .filter(|fp| input.exclusions.permits_canonical(&fp.owner))
        .map(|fp| (fp, outstanding_counts(fp, input.live.get(&fp.owner))))
        .collect();

    let mut tentative: Vec<(MatchCandidate, Vec<MatchCandidate>, usize)> = Vec::new();
    let mut review_queue = Vec::new();

    for live in needs_reconciliation(input) {
        let mut candidates: Vec<MatchCandidate> = targets
            .iter()
            .map(|(canonical, outstanding)| score_candidate(live, canonical, outstanding, &config.weights))
            .collect();
        sort_candidates(&mut candidates);

        let reason = match candidates.as_slice() {
            [] => Some(AmbiguityReason::NoCandidate),
            [best, ..] if best.score < config.threshold => Some(AmbiguityReason::LowConfidence),
            [best, second, ..] if best.score - second.score <= config.tie_epsilon => Some(AmbiguityReason::Tie),
            _ => None,
        };

        candidates.truncate(config.review_candidates.max(1));
        match reason {
            Some(reason) => {
                debug!(live_owner = live.owner.as_str(), %reason, "routed to review");
                review_queue.push(AmbiguousMatch {
                    live_owner_ref: live.owner.clone(),
                    reason,
                    record_count: live.total(),
                    candidates,
                });
            }
            None => {
                let best = candidates[0].clone();
                tentative.push((best, candidates, live.total()));
            }
        }
    }

    // Two live owners claiming one canonical owner are never merged silently.
    let mut claims: BTreeMap<&str, usize> = BTreeMap::new();
    for (best, _, _) in &tentative {
        *claims.entry(best.canonical_owner_key.as_str()).or_insert(0) += 1;
    }
    let contested: BTreeSet<String> = claims
        .into_iter()
        .filter(|(_, n)| *n > 1)
        .map(|(key, _)| key.to_string())
        .collect();

    let mut accepted = Vec::new();
    for (best, candidates, record_count) in tentative {
        if contested.contains(&best.canonical_owner_key) {
            debug!(
                live_owner = best.live_owner_ref.as_str(),
                canonical = best.canonical_owner_key.as_str(),
                "contested match routed to review"
            );
            review_queue.push(AmbiguousMatch {
                live_owner_ref: best.live_owner_ref.clone(),
                reason: AmbiguityReason::Contested,
                record_count,
                candidates,
            });
        } else {
            info!(
                live_owner = best.live_owner_ref.as_str(),
                canonical = best.canonical_owner_key.as_str(),
                score = best.score,
                "match accepted"
            );
            accepted.push(best);
        }
    }

    review_queue.sort_by(|a, b| a.live_owner_ref.cmp(&b.live_owner_ref));
    MatchOutcome { accepted, review_queue }
}

/// Score descending, then canonical key ascending for reproducible order.
fn sort_candidates(candidates: &mut [MatchCandidate]) {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.canonical_owner_key.cmp(&b.canonical_owner_key))
    });
}

pub fn score_candidate(
    live: &Fingerprint,
    canonical: &Fingerprint,
    outstanding: &BTreeMap<String, usize>,
    weights: &ScoreWeights,
) -> MatchCandidate {
    let tables: BTreeSet<&String> = live
        .counts
        .keys()
        .chain(outstanding.iter().filter(|(_, &n)| n > 0).map(|(t, _)| t))
        .collect();
    let exact_tables = tables
        .iter()
        .filter(|t| live.count(t) == outstanding.get(t.as_str()).copied().unwrap_or(0))
        .count();
    let counts = if tables.is_empty() {
        0.0
    } else {
        exact_tables as f64 / tables.len() as f64
    };

    let attributes = jaccard(&live.attributes, &canonical.attributes);

    let identity = if live.identity_tokens.is_empty() || canonical.identity_tokens.is_empty() {
        None
    } else if live.identity_tokens.is_disjoint(&canonical.identity_tokens) {
        Some(0.0)
    } else {
        Some(1.0)
    };

    let raw = match identity {
        Some(id) => weights.counts * counts + weights.attributes * attributes + weights.identity * id,
        None => {
            let denom = weights.counts + weights.attributes;
            if denom > 0.0 {
                (weights.counts * counts + weights.attributes * attributes) / denom
            } else {
                0.0
            }
        }
    };
    let score = raw.clamp(0.0, 1.0);

    let outstanding_total: usize = outstanding.values().sum();
    let mut rationale = format!(
        "{}→{}: counts {:.2} ({}/{} tables exact, {} live vs {} outstanding), attributes {:.2}, identity {}; score {:.3}",
        live.owner,
        canonical.owner,
        counts,
        exact_tables,
        tables.len(),
        live.total(),
        outstanding_total,
        attributes,
        identity.map_or_else(|| "n/a".to_string(), |v| format!("{v:.0}")),
        score,
    );
    if ranges_disjoint(live, canonical) {
        rationale.push_str("; time ranges disjoint");
    }

    MatchCandidate {
        live_owner_ref: live.owner.clone(),
        canonical_owner_key: canonical.owner.clone(),
        score,
        breakdown: ScoreBreakdown {
            counts,
            attributes,
            identity,
        },
        rationale,
    }
}

pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

fn ranges_disjoint(a: &Fingerprint, b: &Fingerprint) -> bool {
    match (a.first_seen, a.last_seen, b.first_seen, b.last_seen) {
        (Some(a_lo), Some(a_hi), Some(b_lo), Some(b_hi)) => a_hi < b_lo || b_hi < a_lo,
        _ => false,
    }
}
