use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use proptest::prelude::*;

use relink_recon::apply::{apply_plan, ApplyOptions, RetryPolicy};
use relink_recon::config::RelinkConfig;
use relink_recon::engine::{self, RunOptions};
use relink_recon::fingerprint::extract;
use relink_recon::model::{
    ApplyOutcome, Attributes, CanonicalDataset, CanonicalRecord, LiveRecord, OwnerEntry, OwnerStatus, PlanItem,
    ReassignmentPlan, Source,
};
use relink_recon::store::{LiveStore, MemoryStore};
use relink_recon::verify::verify;
use relink_recon::ReconError;

fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
}

const CONFIG: &str = r#"
name = "scenario"

[extract]
file = "unused.csv"

[extract.columns]
record_id  = "id"
owner_key  = "user_id"
table_name = "table"

[fingerprint]
attributes = ["name"]

[apply]
initial_backoff_ms = 1
"#;

fn config() -> RelinkConfig {
    RelinkConfig::from_toml(CONFIG).unwrap()
}

fn attrs(name: &str) -> Attributes {
    let mut a = Attributes::new();
    a.insert("name".into(), name.into());
    a
}

/// `n` canonical records for `owner` in `table`, ids `{prefix}{i}`.
fn add_canonical(ds: &mut CanonicalDataset, owner: &str, table: &str, prefix: &str, n: usize) {
    ds.owners.entry(owner.to_string()).or_insert_with(|| OwnerEntry::new(owner));
    for i in 0..n {
        let r = CanonicalRecord {
            record_id: format!("{prefix}{i:03}"),
            table_name: table.into(),
            owner_key: owner.into(),
            attributes: attrs(&format!("{prefix} item {i}")),
            timestamp: None,
        };
        ds.records.insert(r.key(), r);
    }
}

/// Live copies of canonical records `range` of `prefix`, held by `owner_ref`.
fn add_live(store: &MemoryStore, owner_ref: &str, table: &str, prefix: &str, range: std::ops::Range<usize>) {
    for i in range {
        store.insert_record(LiveRecord {
            record_id: format!("{prefix}{i:03}"),
            table_name: table.into(),
            owner_ref: owner_ref.into(),
            attributes: attrs(&format!("{prefix} item {i}")),
            timestamp: None,
        });
    }
}

fn fast_apply(dry_run: bool) -> ApplyOptions {
    ApplyOptions {
        batch_size: 16,
        dry_run,
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
        },
        cancel: None,
    }
}

fn live_state(store: &MemoryStore) -> BTreeMap<(String, String), String> {
    let mut state = BTreeMap::new();
    for table in store.tables().unwrap() {
        for r in store.list_table(&table).unwrap() {
            state.insert((r.table_name, r.record_id), r.owner_ref);
        }
    }
    state
}

// -------------------------------------------------------------------------
// Fixture load
// -------------------------------------------------------------------------

#[test]
fn fixture_extract_loads_with_quarantine() {
    let dir = fixtures_dir();
    let toml = std::fs::read_to_string(dir.join("relink.toml")).unwrap();
    let config = RelinkConfig::from_toml(&toml).unwrap();
    let canonical = engine::load_canonical(&config, &dir).unwrap();

    assert_eq!(canonical.records.len(), 4);
    assert_eq!(canonical.quarantined.len(), 3);
    assert_eq!(canonical.owners.len(), 2);
    assert_eq!(
        canonical.owners["ana-01"].label.as_deref(),
        Some("ana.silva@example.com")
    );
    assert_eq!(canonical.table_totals()["events"], 3);
    let reasons: Vec<&str> = canonical.quarantined.iter().map(|q| q.reason.as_str()).collect();
    assert!(reasons.iter().any(|r| r.contains("duplicate")));
    assert!(canonical
        .records
        .values()
        .find(|r| r.record_id == "e4")
        .is_some_and(|r| r.timestamp.is_none()));
}

#[test]
fn missing_extract_is_fatal() {
    let config = config();
    let err = engine::load_canonical(&config, &fixtures_dir()).unwrap_err();
    assert!(matches!(err, ReconError::Io(_)));
}

// -------------------------------------------------------------------------
// Scenario A: one live owner holds every record of a canonical owner
// -------------------------------------------------------------------------

fn scenario_a() -> (RelinkConfig, CanonicalDataset, MemoryStore) {
    let mut canonical = CanonicalDataset::default();
    add_canonical(&mut canonical, "A", "T", "t", 70);
    let store = MemoryStore::new();
    add_live(&store, "Y", "T", "t", 0..70);
    (config(), canonical, store)
}

#[test]
fn scenario_a_relinks_all_records() {
    let (config, canonical, store) = scenario_a();
    let options = RunOptions {
        create_missing_owners: true,
        ..RunOptions::default()
    };
    let report = engine::run(&config, &canonical, &store, &options).unwrap();

    assert_eq!(report.plan.items.len(), 70);
    assert!(report.plan.items.iter().all(|i| i.score >= 0.95));
    assert!(report.plan.items.iter().all(|i| i.from_owner_ref == "Y" && i.to_owner_ref == "A"));
    assert_eq!(report.plan.owners_to_create, vec!["A".to_string()]);
    assert_eq!(report.apply.summary.applied, 70);
    assert_eq!(report.verification.status_of("A"), Some(OwnerStatus::Match));
    assert!(report.verification.stray_owners.is_empty());
    assert!(report.succeeded());
}

#[test]
fn scenario_a_without_owner_creation_is_rejected() {
    let (config, canonical, store) = scenario_a();
    let err = engine::run(&config, &canonical, &store, &RunOptions::default()).unwrap_err();
    match err {
        ReconError::InvalidPlan(e) => assert!(e.diagnostics()[0].contains("does not exist")),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(store.update_calls(), 0);
}

#[test]
fn scenario_a_score_does_not_depend_on_id_format() {
    let pairs = [
        ("Y", "A"),
        ("legacy_7731", "usr_a81f"),
        ("3f6c1e0a-9b7d-4c52-8e11-0d2b6f4a9c33", "a0e4b9d2-51f7-4e3a-b6c8-7d19e2f05b41"),
        ("user_999", "user_123"),
    ];
    for (live_ref, canonical_key) in pairs {
        let mut canonical = CanonicalDataset::default();
        add_canonical(&mut canonical, canonical_key, "T", "t", 70);
        add_canonical(&mut canonical, "user_456", "T", "u", 12);
        let store = MemoryStore::new();
        store.insert_owner(OwnerEntry::new(canonical_key));
        store.insert_owner(OwnerEntry::new("user_456"));
        add_live(&store, live_ref, "T", "t", 0..70);
        add_live(&store, "user_456", "T", "u", 0..12);

        let config = config();
        let snapshot = engine::snapshot(&config, &store).unwrap();
        let plan = engine::plan(&config, &canonical, &snapshot, false).unwrap();
        assert_eq!(plan.items.len(), 70, "{live_ref}->{canonical_key}");
        for item in &plan.items {
            assert_eq!(item.to_owner_ref, canonical_key);
            assert!(item.score >= 0.95, "{live_ref}->{canonical_key} scored {}", item.score);
        }
    }
}

#[test]
fn shared_id_prefix_does_not_lift_borderline_match() {
    // 40 of 70 records and half the attributes: below the gate whatever the ids look like.
    let mut canonical = CanonicalDataset::default();
    add_canonical(&mut canonical, "user_123", "T", "t", 70);
    let store = MemoryStore::new();
    store.insert_owner(OwnerEntry::new("user_123"));
    add_live(&store, "user_999", "T", "t", 0..40);

    let config = config();
    let snapshot = engine::snapshot(&config, &store).unwrap();
    let plan = engine::plan(&config, &canonical, &snapshot, false).unwrap();
    assert!(plan.items.is_empty());
    assert_eq!(plan.review_queue.len(), 1);
    assert_eq!(plan.review_queue[0].candidates[0].breakdown.identity, None);
}

// -------------------------------------------------------------------------
// Scenario B: two partial live owners never merged silently
// -------------------------------------------------------------------------

#[test]
fn scenario_b_split_owner_goes_to_review() {
    let mut canonical = CanonicalDataset::default();
    add_canonical(&mut canonical, "A", "T", "t", 70);
    let store = MemoryStore::new();
    store.insert_owner(OwnerEntry::new("A"));
    add_live(&store, "Y1", "T", "t", 0..40);
    add_live(&store, "Y2", "T", "t", 40..70);

    let config = config();
    let report = engine::run(&config, &canonical, &store, &RunOptions::default()).unwrap();
    assert!(report.plan.items.is_empty());
    let reviewed: Vec<&str> = report
        .plan
        .review_queue
        .iter()
        .map(|m| m.live_owner_ref.as_str())
        .collect();
    assert_eq!(reviewed, vec!["Y1", "Y2"]);
    assert_eq!(report.verification.status_of("A"), Some(OwnerStatus::Orphaned));
    assert!(!report.succeeded());

    // A partial manual reassignment must not verify as a match.
    let partial = ReassignmentPlan {
        plan_id: "manual".into(),
        generated_at: chrono::Utc::now(),
        threshold: 0.85,
        owners_to_create: vec![],
        items: store
            .list_by_owner("T", "Y1")
            .unwrap()
            .into_iter()
            .map(|r| PlanItem {
                record_id: r.record_id,
                table_name: r.table_name,
                from_owner_ref: "Y1".into(),
                to_owner_ref: "A".into(),
                score: 1.0,
                rationale: "operator decision".into(),
            })
            .collect(),
        review_queue: vec![],
    };
    let applied = apply_plan(&partial, &store, &fast_apply(false));
    assert_eq!(applied.summary.applied, 40);

    let after = engine::snapshot(&config, &store).unwrap();
    let verification = verify(&canonical, &after, &config.exclusions);
    let a = verification.owners.iter().find(|o| o.owner_key == "A").unwrap();
    assert_eq!(a.status, OwnerStatus::Mismatch);
    assert_eq!(a.actual_counts["T"], 40);
    assert_eq!(a.expected_counts["T"], 70);
    assert_eq!(verification.stray_owners.len(), 1);
}

// -------------------------------------------------------------------------
// Scenario C: re-applying a successful plan is a no-op
// -------------------------------------------------------------------------

#[test]
fn scenario_c_second_apply_skips_everything() {
    let (config, canonical, store) = scenario_a();
    let options = RunOptions {
        create_missing_owners: true,
        ..RunOptions::default()
    };
    let first = engine::run(&config, &canonical, &store, &options).unwrap();
    let state = live_state(&store);

    let second = apply_plan(&first.plan, &store, &fast_apply(false));
    assert_eq!(second.summary.skipped_conflict, 70);
    assert_eq!(second.summary.applied, 0);
    assert!(second.owners_created.is_empty());
    assert_eq!(live_state(&store), state);

    let after = engine::snapshot(&config, &store).unwrap();
    let verification = verify(&canonical, &after, &config.exclusions);
    assert_eq!(verification.status_of("A"), Some(OwnerStatus::Match));
}

// -------------------------------------------------------------------------
// Scenario D: quarantined live records never reach a plan
// -------------------------------------------------------------------------

#[test]
fn scenario_d_malformed_owner_ref_never_planned() {
    let mut canonical = CanonicalDataset::default();
    add_canonical(&mut canonical, "A", "T", "t", 5);
    let store = MemoryStore::new();
    store.insert_owner(OwnerEntry::new("A"));
    add_live(&store, "Y", "T", "t", 0..5);
    add_live(&store, "undefined", "T", "x", 0..2);
    add_live(&store, " Y", "T", "z", 0..1);

    let report = engine::run(&config(), &canonical, &store, &RunOptions::default()).unwrap();
    assert_eq!(report.plan.items.len(), 5);
    assert!(report.plan.items.iter().all(|i| i.record_id.starts_with('t')));
    let quarantined: Vec<&str> = report
        .quarantined
        .iter()
        .filter_map(|q| q.record_id.as_deref())
        .collect();
    assert_eq!(quarantined, vec!["x000", "x001", "z000"]);
    // Untouched, still under the malformed ref.
    assert_eq!(store.owner_of("T", "x000").as_deref(), Some("undefined"));
}

// -------------------------------------------------------------------------
// Properties
// -------------------------------------------------------------------------

#[test]
fn each_applied_item_moves_exactly_one_record() {
    let mut canonical = CanonicalDataset::default();
    add_canonical(&mut canonical, "A", "events", "e", 4);
    add_canonical(&mut canonical, "A", "routines", "r", 2);
    let store = MemoryStore::new();
    store.insert_owner(OwnerEntry::new("A"));
    add_live(&store, "Y", "events", "e", 0..4);
    add_live(&store, "Y", "routines", "r", 0..2);

    let config = config();
    let snap = engine::snapshot(&config, &store).unwrap();
    let plan = engine::plan(&config, &canonical, &snap, false).unwrap();
    assert_eq!(plan.items.len(), 6);

    for item in &plan.items {
        let before = extract(engine::snapshot(&config, &store).unwrap().records.values(), Source::Live, &[]);
        let single = ReassignmentPlan {
            items: vec![item.clone()],
            ..plan.clone()
        };
        let report = apply_plan(&single, &store, &fast_apply(false));
        assert_eq!(report.items[0].outcome, ApplyOutcome::Applied);
        let after = extract(engine::snapshot(&config, &store).unwrap().records.values(), Source::Live, &[]);

        let count = |prints: &BTreeMap<String, relink_recon::model::Fingerprint>, owner: &str| {
            prints.get(owner).map_or(0, |fp| fp.count(&item.table_name))
        };
        assert_eq!(count(&after, "A"), count(&before, "A") + 1);
        assert_eq!(count(&after, "Y") + 1, count(&before, "Y"));
    }
}

#[test]
fn tampered_plan_below_threshold_never_applied() {
    let mut canonical = CanonicalDataset::default();
    add_canonical(&mut canonical, "A", "T", "t", 3);
    let store = MemoryStore::new();
    store.insert_owner(OwnerEntry::new("A"));
    add_live(&store, "Y", "T", "t", 0..3);

    let config = config();
    let snap = engine::snapshot(&config, &store).unwrap();
    let mut plan = engine::plan(&config, &canonical, &snap, false).unwrap();
    assert!(plan.items.iter().all(|i| i.score >= plan.threshold));

    plan.items[1].score = 0.4;
    let json = plan.to_json_pretty().unwrap();
    let reloaded = ReassignmentPlan::from_json(&json).unwrap();
    let err = engine::apply_validated(&config, &reloaded, &store, &RunOptions::default()).unwrap_err();
    assert!(matches!(err, ReconError::InvalidPlan(_)));
    assert_eq!(store.update_calls(), 0);
}

#[test]
fn denied_owner_is_left_alone() {
    let mut canonical = CanonicalDataset::default();
    add_canonical(&mut canonical, "A", "T", "t", 3);
    let store = MemoryStore::new();
    store.insert_owner(OwnerEntry::new("A"));
    add_live(&store, "qa-bot", "T", "t", 0..3);

    let toml = format!("{CONFIG}\n[exclusions]\ndeny = [\"qa-bot\"]\n");
    let config = RelinkConfig::from_toml(&toml).unwrap();
    let report = engine::run(&config, &canonical, &store, &RunOptions::default()).unwrap();
    assert!(report.plan.items.is_empty());
    assert!(report.plan.review_queue.is_empty());
    assert_eq!(store.owner_of("T", "t000").as_deref(), Some("qa-bot"));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn totals_conserved_and_reapply_idempotent(
        owners in prop::collection::vec((1usize..12, 0usize..6), 1..6),
    ) {
        let mut canonical = CanonicalDataset::default();
        let store = MemoryStore::new();
        for (n, &(events, routines)) in owners.iter().enumerate() {
            let key = format!("c{n}");
            let live = format!("l{n}");
            store.insert_owner(OwnerEntry::new(key.as_str()));
            add_canonical(&mut canonical, &key, "events", &format!("e{n}-"), events);
            add_canonical(&mut canonical, &key, "routines", &format!("r{n}-"), routines);
            add_live(&store, &live, "events", &format!("e{n}-"), 0..events);
            add_live(&store, &live, "routines", &format!("r{n}-"), 0..routines);
        }
        store.add_table("events");
        store.add_table("routines");

        let config = config();
        let report = engine::run(&config, &canonical, &store, &RunOptions::default()).unwrap();
        prop_assert!(report.conservation.conserved);
        prop_assert!(report.verification.passed());
        prop_assert_eq!(report.apply.summary.failed, 0);

        let state = live_state(&store);
        let again = apply_plan(&report.plan, &store, &fast_apply(false));
        prop_assert_eq!(again.summary.applied, 0);
        prop_assert_eq!(live_state(&store), state);
    }
}
