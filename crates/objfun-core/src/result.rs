use rusqlite::{params, TransactionBehavior};
use serde_json::Value;
use tracing::info;

use crate::error::{ObjFunError, Result};
use crate::kind::RunValue;
use crate::registry::Scenario;
use crate::run::Run;
use crate::state::LookupState;
use crate::store::{self, Store};

impl Store {
    pub fn run(&self, scenario: &Scenario, id: i64) -> Result<Run> {
        store::load_run(&self.conn, scenario, id)?
            .ok_or_else(|| ObjFunError::NotFound(format!("run {}", id)))
    }

    pub fn runs(&self, scenario: &Scenario) -> Result<Vec<Run>> {
        let ids: Vec<i64> = {
            let mut stmt = self
                .conn
                .prepare("SELECT id FROM runs WHERE scenario_id = ?1 ORDER BY id")?;
            let rows = stmt.query_map(params![scenario.id], |r| r.get(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(run) = store::load_run(&self.conn, scenario, id)? {
                out.push(run);
            }
        }
        Ok(out)
    }

    pub fn get_value(&self, scenario: &Scenario, id: i64) -> Result<RunValue> {
        self.run(scenario, id)?.value().cloned()
    }

    /// Stores a result payload and completes the run.
    pub fn set_value(
        &mut self,
        scenario: &Scenario,
        id: i64,
        payload: &Value,
        force: bool,
    ) -> Result<Run> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut run = store::load_run(&tx, scenario, id)?
            .ok_or_else(|| ObjFunError::NotFound(format!("run {}", id)))?;
        let from = run.state;
        run.set_value(scenario.kind, payload, force)?;
        store::write_result(&tx, &run)?;
        tx.commit()?;
        info!(scenario = %scenario.name, run = id, from = %from, force, "stored run value");
        Ok(run)
    }

    /// Administrative state write; see [`Run::set_state`].
    ///
    /// A run may only enter `PROVISIONAL` while no other run of the
    /// scenario holds that slot.
    pub fn set_state(
        &mut self,
        scenario: &Scenario,
        id: i64,
        state: LookupState,
        force: bool,
    ) -> Result<Run> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut run = store::load_run(&tx, scenario, id)?
            .ok_or_else(|| ObjFunError::NotFound(format!("run {}", id)))?;
        let from = run.state;
        if state == LookupState::Provisional && from != LookupState::Provisional {
            if let Some(holder) =
                store::first_run_in_state(&tx, scenario.id, LookupState::Provisional)?
            {
                return Err(ObjFunError::Conflict(format!(
                    "run {} already holds the provisional slot",
                    holder
                )));
            }
        }
        run.set_state(state, force)?;
        store::write_state(&tx, id, run.state)?;
        tx.commit()?;
        info!(scenario = %scenario.name, run = id, from = %from, to = %state, force, "set run state");
        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::LookupOutcome;
    use serde_json::json;

    fn store_with_run(kind: &str) -> (Store, Scenario, Run) {
        let mut store = Store::open_in_memory().expect("open");
        store.init_schema().expect("schema");
        let app = store.create_app("test", "testpw").expect("app");
        let study = store
            .create_study(
                &app,
                "s",
                &json!({"a": {"type": "float", "minv": 0.0, "maxv": 1.0, "resolution": 0.5}}),
            )
            .expect("study");
        let scenario = store.create_scenario(&study, "sc", kind).expect("scenario");
        let run = match store.lookup_run(&scenario, &json!({"a": 0.5})).expect("lookup") {
            LookupOutcome::Provisional(run) => run,
            other => panic!("expected provisional, got {:?}", other),
        };
        (store, scenario, run)
    }

    #[test]
    fn value_round_trips_for_path_runs() {
        let (mut store, scenario, run) = store_with_run("PATH");
        assert!(matches!(
            store.get_value(&scenario, run.id),
            Err(ObjFunError::NotFound(_))
        ));
        store
            .set_state(&scenario, run.id, LookupState::Run, false)
            .expect("advance");
        store
            .set_value(&scenario, run.id, &json!({"value": "/some/path"}), false)
            .expect("set");
        let reloaded = store.run(&scenario, run.id).expect("reload");
        assert_eq!(reloaded.state, LookupState::Completed);
        assert_eq!(
            store.get_value(&scenario, run.id).expect("value").to_json(),
            json!("/some/path")
        );
    }

    #[test]
    fn guard_failure_is_not_persisted() {
        let (mut store, scenario, run) = store_with_run("MISFIT");
        let err = store
            .set_value(&scenario, run.id, &json!({"value": 10}), false)
            .expect_err("provisional");
        assert!(matches!(err, ObjFunError::InvalidStateTransition { .. }));
        let reloaded = store.run(&scenario, run.id).expect("reload");
        assert_eq!(reloaded.state, LookupState::Provisional);
        assert!(reloaded.value.is_none());

        store
            .set_value(&scenario, run.id, &json!({"value": 10, "force": true}), true)
            .expect("forced");
        assert_eq!(
            store.get_value(&scenario, run.id).expect("value"),
            RunValue::Misfit(10.0)
        );
    }

    #[test]
    fn set_state_respects_order_and_provisional_slot() {
        let (mut store, scenario, run) = store_with_run("MISFIT");
        store
            .set_state(&scenario, run.id, LookupState::Completed, false)
            .expect("forward");
        assert!(matches!(
            store.set_state(&scenario, run.id, LookupState::New, false),
            Err(ObjFunError::InvalidStateTransition { .. })
        ));
        store
            .set_state(&scenario, run.id, LookupState::New, true)
            .expect("forced back");

        match store.lookup_run(&scenario, &json!({"a": 1.0})).expect("other") {
            LookupOutcome::Provisional(_) => {}
            other => panic!("expected provisional, got {:?}", other),
        }
        assert!(matches!(
            store.set_state(&scenario, run.id, LookupState::Provisional, true),
            Err(ObjFunError::Conflict(_))
        ));
    }

    #[test]
    fn unknown_run_id_is_not_found() {
        let (mut store, scenario, _) = store_with_run("MISFIT");
        assert!(matches!(store.run(&scenario, 99), Err(ObjFunError::NotFound(_))));
        assert!(matches!(
            store.set_value(&scenario, 99, &json!({"value": 1}), true),
            Err(ObjFunError::NotFound(_))
        ));
    }
}
