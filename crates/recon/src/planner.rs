use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use crate::error::{PlanError, ReconError};
use crate::model::{AmbiguousMatch, LiveSnapshot, MatchCandidate, PlanItem, ReassignmentPlan, RecordKey};

#[derive(Debug, Clone, Copy)]
pub struct PlanOptions {
    pub threshold: f64,
    /// Separately authorized: schedule creation of target owners missing live.
    pub create_missing_owners: bool,
}

/// Turn accepted matches into one rewrite per record held by each live owner.
///
/// The plan is validated before it is returned; a plan with any problem is
/// rejected wholesale.
pub fn build_plan(
    accepted: &[MatchCandidate],
    review_queue: Vec<AmbiguousMatch>,
    snapshot: &LiveSnapshot,
    options: &PlanOptions,
) -> Result<ReassignmentPlan, PlanError> {
    let mut items = Vec::new();
    for m in accepted {
        for record in snapshot.records_owned_by(&m.live_owner_ref) {
            items.push(PlanItem {
                record_id: record.record_id.clone(),
                table_name: record.table_name.clone(),
                from_owner_ref: m.live_owner_ref.clone(),
                to_owner_ref: m.canonical_owner_key.clone(),
                score: m.score,
                rationale: m.rationale.clone(),
            });
        }
    }
    items.sort_by(|a, b| {
        (&a.from_owner_ref, &a.table_name, &a.record_id).cmp(&(&b.from_owner_ref, &b.table_name, &b.record_id))
    });

    let owners_to_create: Vec<String> = if options.create_missing_owners {
        accepted
            .iter()
            .map(|m| m.canonical_owner_key.clone())
            .filter(|key| !snapshot.has_owner(key))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    } else {
        Vec::new()
    };

    let plan = ReassignmentPlan {
        plan_id: uuid::Uuid::new_v4().to_string(),
        generated_at: chrono::Utc::now(),
        threshold: options.threshold,
        owners_to_create,
        items,
        review_queue,
    };

    plan.validate(snapshot, options.create_missing_owners)?;
    debug!(
        plan_id = plan.plan_id.as_str(),
        items = plan.items.len(),
        review = plan.review_queue.len(),
        "plan built"
    );
    Ok(plan)
}

impl ReassignmentPlan {
    /// Check every precondition against the live snapshot. Collects all
    /// problems instead of stopping at the first.
    pub fn validate(&self, snapshot: &LiveSnapshot, allow_create: bool) -> Result<(), PlanError> {
        let mut diagnostics = Vec::new();

        if !(self.threshold > 0.0 && self.threshold <= 1.0) {
            diagnostics.push(format!("threshold {} outside (0, 1]", self.threshold));
        }

        if !self.owners_to_create.is_empty() && !allow_create {
            diagnostics.push(format!(
                "plan creates owner(s) {} but owner creation is not authorized",
                self.owners_to_create.join(", ")
            ));
        }

        let mut targets: BTreeMap<RecordKey, &str> = BTreeMap::new();
        let mut sources: BTreeSet<&str> = BTreeSet::new();
        let mut destinations: BTreeSet<&str> = BTreeSet::new();

        for item in &self.items {
            let key = item.key();
            if item.from_owner_ref == item.to_owner_ref {
                diagnostics.push(format!("{key}: source and target are both '{}'", item.to_owner_ref));
            }
            if item.score < self.threshold {
                diagnostics.push(format!(
                    "{key}: score {:.3} below threshold {:.3}",
                    item.score, self.threshold
                ));
            }
            if item.rationale.trim().is_empty() {
                diagnostics.push(format!("{key}: missing rationale"));
            }
            if let Some(prev) = targets.insert(key.clone(), item.to_owner_ref.as_str()) {
                if prev != item.to_owner_ref {
                    diagnostics.push(format!(
                        "{key}: assigned to both '{prev}' and '{}'",
                        item.to_owner_ref
                    ));
                }
            }
            sources.insert(item.from_owner_ref.as_str());
            destinations.insert(item.to_owner_ref.as_str());
        }

        for owner in sources.intersection(&destinations) {
            diagnostics.push(format!("owner '{owner}' is both a source and a target"));
        }

        for target in &destinations {
            let scheduled = allow_create && self.owners_to_create.iter().any(|o| o.as_str() == *target);
            if !snapshot.has_owner(target) && !scheduled {
                diagnostics.push(format!("target owner '{target}' does not exist in the live store"));
            }
        }

        if diagnostics.is_empty() {
            Ok(())
        } else {
            for d in &diagnostics {
                warn!(plan_id = self.plan_id.as_str(), "{d}");
            }
            Err(PlanError::Rejected { diagnostics })
        }
    }

    pub fn to_json_pretty(&self) -> Result<String, ReconError> {
        serde_json::to_string_pretty(self).map_err(|e| ReconError::Io(format!("plan serialization: {e}")))
    }

    pub fn from_json(input: &str) -> Result<Self, ReconError> {
        serde_json::from_str(input).map_err(|e| ReconError::ConfigParse(format!("plan: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Attributes, LiveRecord, OwnerEntry, ScoreBreakdown};

    fn snapshot(owners: &[&str], records: &[(&str, &str, &str)]) -> LiveSnapshot {
        LiveSnapshot {
            taken_at: chrono::Utc::now(),
            owners: owners.iter().map(|o| (o.to_string(), OwnerEntry::new(*o))).collect(),
            records: records
                .iter()
                .map(|(table, id, owner)| {
                    let r = LiveRecord {
                        record_id: id.to_string(),
                        table_name: table.to_string(),
                        owner_ref: owner.to_string(),
                        attributes: Attributes::new(),
                        timestamp: None,
                    };
                    (r.key(), r)
                })
                .collect::<BTreeMap<_, _>>(),
            quarantined: vec![],
        }
    }

    fn candidate(live: &str, canonical: &str, score: f64) -> MatchCandidate {
        MatchCandidate {
            live_owner_ref: live.into(),
            canonical_owner_key: canonical.into(),
            score,
            breakdown: ScoreBreakdown {
                counts: 1.0,
                attributes: 1.0,
                identity: None,
            },
            rationale: format!("{live}→{canonical}"),
        }
    }

    const OPTS: PlanOptions = PlanOptions {
        threshold: 0.85,
        create_missing_owners: false,
    };

    #[test]
    fn one_item_per_record_in_order() {
        let snap = snapshot(
            &["A"],
            &[("events", "e2", "Y"), ("events", "e1", "Y"), ("routines", "r1", "Y"), ("events", "e3", "Z")],
        );
        let plan = build_plan(&[candidate("Y", "A", 0.97)], vec![], &snap, &OPTS).unwrap();
        let ids: Vec<&str> = plan.items.iter().map(|i| i.record_id.as_str()).collect();
        assert_eq!(ids, vec!["e1", "e2", "r1"]);
        assert!(plan.items.iter().all(|i| i.to_owner_ref == "A" && i.from_owner_ref == "Y"));
        assert!(plan.owners_to_create.is_empty());
    }

    #[test]
    fn missing_target_rejected_unless_authorized() {
        let snap = snapshot(&[], &[("events", "e1", "Y")]);
        let err = build_plan(&[candidate("Y", "A", 0.97)], vec![], &snap, &OPTS).unwrap_err();
        assert!(err.diagnostics()[0].contains("does not exist"));

        let opts = PlanOptions {
            create_missing_owners: true,
            ..OPTS
        };
        let plan = build_plan(&[candidate("Y", "A", 0.97)], vec![], &snap, &opts).unwrap();
        assert_eq!(plan.owners_to_create, vec!["A".to_string()]);
        // A persisted plan that creates owners fails validation without authorization.
        assert!(plan.validate(&snap, false).is_err());
    }

    #[test]
    fn conflicting_targets_rejected_wholesale() {
        let snap = snapshot(&["A", "B"], &[("events", "e1", "Y")]);
        let err = build_plan(
            &[candidate("Y", "A", 0.97), candidate("Y", "B", 0.96)],
            vec![],
            &snap,
            &OPTS,
        )
        .unwrap_err();
        assert!(err.diagnostics().iter().any(|d| d.contains("assigned to both")));
    }

    #[test]
    fn below_threshold_item_rejected() {
        let snap = snapshot(&["A"], &[("events", "e1", "Y")]);
        let err = build_plan(&[candidate("Y", "A", 0.5)], vec![], &snap, &OPTS).unwrap_err();
        assert!(err.diagnostics()[0].contains("below threshold"));
    }

    #[test]
    fn chains_rejected() {
        let snap = snapshot(&["A", "Y"], &[("events", "e1", "Y"), ("events", "e2", "A")]);
        let err = build_plan(
            &[candidate("Y", "A", 0.97), candidate("A", "Y", 0.97)],
            vec![],
            &snap,
            &OPTS,
        )
        .unwrap_err();
        assert!(err.diagnostics().iter().any(|d| d.contains("both a source and a target")));
    }

    #[test]
    fn json_roundtrip_preserves_plan() {
        let snap = snapshot(&["A"], &[("events", "e1", "Y")]);
        let plan = build_plan(&[candidate("Y", "A", 0.97)], vec![], &snap, &OPTS).unwrap();
        let back = ReassignmentPlan::from_json(&plan.to_json_pretty().unwrap()).unwrap();
        assert_eq!(back, plan);
    }
}
