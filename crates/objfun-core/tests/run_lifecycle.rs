use std::path::Path;
use std::sync::Barrier;

use objfun_core::{LookupOutcome, LookupState, ObjFunError, RunValue, Scenario, Store};
use serde_json::json;
use tempfile::TempDir;

fn setup(db: &Path) -> (Store, Scenario) {
    let mut store = Store::open(db).expect("open");
    store.init_schema().expect("schema");
    let app = store.create_app("test", "testpw").expect("app");
    let study = store
        .create_study(
            &app,
            "test study",
            &json!({
                "a": {"type": "float", "minv": -10.0, "maxv": 10.0, "resolution": 0.1},
                "b": {"type": "int", "minv": 10, "maxv": 100}
            }),
        )
        .expect("study");
    let scenario = store
        .create_scenario(&study, "scenario misfit", "MISFIT")
        .expect("scenario");
    (store, scenario)
}

#[test]
fn end_to_end_misfit_run() {
    let dir = TempDir::new().expect("tmp");
    let (mut store, scenario) = setup(&dir.path().join("objfun.db"));
    let v = json!({"a": 0, "b": 50});

    assert!(matches!(
        store.lookup_run(&scenario, &v).expect("first sighting"),
        LookupOutcome::Provisional(_)
    ));
    let confirmed = match store.lookup_run(&scenario, &v).expect("second sighting") {
        LookupOutcome::Found(run) => run,
        other => panic!("expected found, got {:?}", other),
    };
    assert_eq!(confirmed.state, LookupState::New);

    let claimed = store
        .get_run_with_state(&scenario, LookupState::New, Some(LookupState::Active))
        .expect("claim");
    assert_eq!(claimed.id, confirmed.id);
    assert_eq!(claimed.values.to_json(), json!({"a": 0.0, "b": 50}));

    store
        .set_value(&scenario, claimed.id, &json!({"value": 10.0}), false)
        .expect("set value");
    let value = store.get_value(&scenario, claimed.id).expect("get value");
    assert_eq!(value, RunValue::Misfit(10.0));
    assert_eq!(json!({"value": value.to_json()}), json!({"value": 10.0}));

    let done = store.run(&scenario, claimed.id).expect("reload");
    assert_eq!(done.state, LookupState::Completed);
    match store.lookup_run(&scenario, &v).expect("lookup completed") {
        LookupOutcome::Found(run) => {
            assert_eq!(run.to_json(), json!({"id": run.id, "state": "COMPLETED", "value": 10.0}))
        }
        other => panic!("expected found, got {:?}", other),
    }
}

#[test]
fn concurrent_claims_advance_a_single_run_once() {
    let dir = TempDir::new().expect("tmp");
    let db = dir.path().join("objfun.db");
    let (mut store, scenario) = setup(&db);
    let v = json!({"a": 1.5, "b": 20});
    store.lookup_run(&scenario, &v).expect("provisional");
    store.lookup_run(&scenario, &v).expect("confirm");

    let barrier = Barrier::new(2);
    let results: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..2)
            .map(|_| {
                s.spawn(|| {
                    let mut worker = Store::open(&db).expect("worker open");
                    barrier.wait();
                    worker.get_run_with_state(
                        &scenario,
                        LookupState::New,
                        Some(LookupState::Active),
                    )
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("worker thread"))
            .collect()
    });

    let won = results.iter().filter(|r| r.is_ok()).count();
    let lost = results
        .iter()
        .filter(|r| matches!(r, Err(ObjFunError::NotFound(_))))
        .count();
    assert_eq!((won, lost), (1, 1), "unexpected claim results: {:?}", results);
    let runs = store.runs(&scenario).expect("runs");
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].state, LookupState::Active);
}

#[test]
fn concurrent_lookups_keep_at_most_one_provisional_run() {
    let dir = TempDir::new().expect("tmp");
    let db = dir.path().join("objfun.db");
    let (_store, scenario) = setup(&db);
    let threads = 4;
    let barrier = Barrier::new(threads);

    std::thread::scope(|s| {
        for t in 0..threads {
            let (db, scenario, barrier) = (&db, &scenario, &barrier);
            s.spawn(move || {
                let mut client = Store::open(db).expect("client open");
                barrier.wait();
                for i in 0..10 {
                    let v = json!({"a": t as f64, "b": 10 + (i % 3)});
                    client.lookup_run(scenario, &v).expect("lookup");
                    let provisional = client
                        .runs(scenario)
                        .expect("runs")
                        .iter()
                        .filter(|r| r.state == LookupState::Provisional)
                        .count();
                    assert!(provisional <= 1, "saw {} provisional runs", provisional);
                }
            });
        }
    });

    let store = Store::open(&db).expect("reopen");
    let runs = store.runs(&scenario).expect("runs");
    let provisional = runs
        .iter()
        .filter(|r| r.state == LookupState::Provisional)
        .count();
    assert!(provisional <= 1, "saw {} provisional runs", provisional);
    let mut digests: Vec<_> = runs.iter().map(|r| r.values.digest()).collect();
    digests.sort();
    digests.dedup();
    assert_eq!(digests.len(), runs.len(), "duplicate vectors stored");
}
