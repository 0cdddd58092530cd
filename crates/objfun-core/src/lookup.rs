//! Exact-match vector lookup and the provisional-slot rule.

use rusqlite::{params, Connection, TransactionBehavior};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{ObjFunError, Result};
use crate::params::ParameterVector;
use crate::registry::Scenario;
use crate::run::{LookupOutcome, Run};
use crate::state::LookupState;
use crate::store::{self, Store};

/// Finds the run bound to exactly `vector`, lowest id first.
///
/// Candidates come from the digest index; each is then compared value by
/// value so a digest collision can never match.
pub(crate) fn find_run(
    conn: &Connection,
    scenario: &Scenario,
    vector: &ParameterVector,
) -> Result<Option<Run>> {
    let ids: Vec<i64> = {
        let mut stmt = conn.prepare(
            "SELECT id FROM runs WHERE scenario_id = ?1 AND vector_digest = ?2 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![scenario.id, vector.digest()], |r| r.get(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
    };
    for id in ids {
        if let Some(run) = store::load_run(conn, scenario, id)? {
            if run.values == *vector {
                return Ok(Some(run));
            }
        }
    }
    Ok(None)
}

impl Store {
    /// Resolves a vector to a run, creating or evicting the scenario's single
    /// provisional run as needed.
    ///
    /// The whole check-then-write sequence holds the database write lock.
    pub fn lookup_run(&mut self, scenario: &Scenario, parameters: &Value) -> Result<LookupOutcome> {
        let vector = ParameterVector::from_json(&scenario.parameters, parameters)?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let outcome = match find_run(&tx, scenario, &vector)? {
            Some(mut run) => {
                if run.state == LookupState::Provisional {
                    run.confirm()?;
                    store::write_state(&tx, run.id, run.state)?;
                    info!(scenario = %scenario.name, run = run.id, "confirmed provisional run");
                } else {
                    debug!(scenario = %scenario.name, run = run.id, state = %run.state, "lookup hit");
                }
                LookupOutcome::Found(run)
            }
            None => match store::first_run_in_state(&tx, scenario.id, LookupState::Provisional)? {
                Some(evicted) => {
                    store::delete_run(&tx, evicted)?;
                    info!(scenario = %scenario.name, run = evicted, "evicted provisional run");
                    LookupOutcome::Waiting
                }
                None => {
                    let run = store::insert_run(&tx, scenario, vector)?;
                    info!(scenario = %scenario.name, run = run.id, "created provisional run");
                    LookupOutcome::Provisional(run)
                }
            },
        };
        tx.commit()?;
        Ok(outcome)
    }

    /// Read-only lookup: no provisional side effects.
    pub fn get_run(&self, scenario: &Scenario, parameters: &Value) -> Result<Run> {
        let vector = ParameterVector::from_json(&scenario.parameters, parameters)?;
        find_run(&self.conn, scenario, &vector)?.ok_or_else(|| {
            ObjFunError::NotFound(format!("no run for parameters in scenario {}", scenario.name))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scenario_store() -> (Store, Scenario) {
        let mut store = Store::open_in_memory().expect("open");
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
    fn second_sighting_confirms_the_same_run() {
        let (mut store, scenario) = scenario_store();
        let v = json!({"a": 0, "b": 50});
        let first = match store.lookup_run(&scenario, &v).expect("first") {
            LookupOutcome::Provisional(run) => run,
            other => panic!("expected provisional, got {:?}", other),
        };
        assert_eq!(first.state, LookupState::Provisional);
        match store.lookup_run(&scenario, &v).expect("second") {
            LookupOutcome::Found(run) => {
                assert_eq!(run.id, first.id);
                assert_eq!(run.state, LookupState::New);
            }
            other => panic!("expected found, got {:?}", other),
        }
        match store.lookup_run(&scenario, &v).expect("third") {
            LookupOutcome::Found(run) => assert_eq!(run.state, LookupState::New),
            other => panic!("expected found, got {:?}", other),
        }
    }

    #[test]
    fn distinct_vector_evicts_outstanding_provisional() {
        let (mut store, scenario) = scenario_store();
        let v1 = json!({"a": 0, "b": 50});
        let v2 = json!({"a": 1, "b": 2});
        let evicted = match store.lookup_run(&scenario, &v1).expect("v1") {
            LookupOutcome::Provisional(run) => run,
            other => panic!("expected provisional, got {:?}", other),
        };
        assert_eq!(
            store.lookup_run(&scenario, &v2).expect("v2"),
            LookupOutcome::Waiting
        );
        assert!(store.runs(&scenario).expect("runs").is_empty());

        match store.lookup_run(&scenario, &v1).expect("v1 again") {
            LookupOutcome::Provisional(run) => assert_ne!(run.id, evicted.id),
            other => panic!("expected fresh provisional, got {:?}", other),
        }
    }

    #[test]
    fn confirmed_runs_do_not_block_new_vectors() {
        let (mut store, scenario) = scenario_store();
        let v1 = json!({"a": 0, "b": 50});
        store.lookup_run(&scenario, &v1).expect("v1");
        store.lookup_run(&scenario, &v1).expect("confirm v1");
        match store
            .lookup_run(&scenario, &json!({"a": 0, "b": 51}))
            .expect("v2")
        {
            LookupOutcome::Provisional(_) => {}
            other => panic!("expected provisional, got {:?}", other),
        }
        assert_eq!(store.runs(&scenario).expect("runs").len(), 2);
    }

    #[test]
    fn get_run_never_mutates() {
        let (mut store, scenario) = scenario_store();
        let err = store
            .get_run(&scenario, &json!({"a": 0, "b": 50}))
            .expect_err("unknown vector");
        assert!(matches!(err, ObjFunError::NotFound(_)));
        assert!(store.runs(&scenario).expect("runs").is_empty());

        store
            .lookup_run(&scenario, &json!({"a": 0, "b": 50}))
            .expect("create");
        let run = store
            .get_run(&scenario, &json!({"b": 50, "a": 0.0}))
            .expect("found");
        assert_eq!(run.state, LookupState::Provisional);
        assert_eq!(run.values.to_json(), json!({"a": 0.0, "b": 50}));
    }

    #[test]
    fn malformed_vector_is_rejected_before_touching_runs() {
        let (mut store, scenario) = scenario_store();
        let err = store
            .lookup_run(&scenario, &json!({"a": 0}))
            .expect_err("missing b");
        assert!(matches!(err, ObjFunError::InvalidParameters(_)), "{}", err);
        assert!(store.runs(&scenario).expect("runs").is_empty());
    }
}
