use serde_json::{json, Value};

use crate::error::{ObjFunError, Result};
use crate::kind::{RunKind, RunValue};
use crate::params::ParameterVector;
use crate::state::LookupState;

/// One evaluation attempt for a bound parameter vector.
#[derive(Debug, Clone, PartialEq)]
pub struct Run {
    pub id: i64,
    pub scenario_id: i64,
    pub state: LookupState,
    pub value: Option<RunValue>,
    pub values: ParameterVector,
}

/// Result of [`crate::Store::lookup_run`].
#[derive(Debug, Clone, PartialEq)]
pub enum LookupOutcome {
    /// The vector was already known; provisional runs come back confirmed.
    Found(Run),
    /// First sighting of the vector; a provisional run was created.
    Provisional(Run),
    /// Another vector held the provisional slot and was evicted.
    Waiting,
}

impl LookupOutcome {
    pub fn to_json(&self) -> Value {
        match self {
            LookupOutcome::Found(run) => run.to_json(),
            LookupOutcome::Provisional(_) => json!({"status": "provisional"}),
            LookupOutcome::Waiting => json!({"status": "waiting"}),
        }
    }
}

impl Run {
    /// Second sighting of a provisional vector.
    pub fn confirm(&mut self) -> Result<()> {
        if self.state != LookupState::Provisional {
            return Err(ObjFunError::InvalidStateTransition {
                from: self.state,
                to: LookupState::New,
            });
        }
        self.state = LookupState::New;
        Ok(())
    }

    /// Stores a result and completes the run.
    ///
    /// Without `force` the run must be past `CONFIGURED` and not yet
    /// `COMPLETED`. The state guard is checked before the payload.
    pub fn set_value(&mut self, kind: RunKind, payload: &Value, force: bool) -> Result<()> {
        if !force && !self.state.accepts_result() {
            return Err(ObjFunError::InvalidStateTransition {
                from: self.state,
                to: LookupState::Completed,
            });
        }
        self.value = Some(RunValue::from_payload(kind, payload)?);
        self.state = LookupState::Completed;
        Ok(())
    }

    /// Administrative state write. Backward moves need `force`.
    pub fn set_state(&mut self, state: LookupState, force: bool) -> Result<()> {
        if !force && self.state.is_after(state) {
            return Err(ObjFunError::InvalidStateTransition {
                from: self.state,
                to: state,
            });
        }
        self.state = state;
        Ok(())
    }

    pub fn value(&self) -> Result<&RunValue> {
        self.value
            .as_ref()
            .ok_or_else(|| ObjFunError::NotFound(format!("run {} has no value", self.id)))
    }

    pub fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "state": self.state.as_str(),
            "value": self.value.as_ref().map(RunValue::to_json),
        })
    }

    /// Like [`Run::to_json`] but also carries the bound vector, for workers.
    pub fn to_json_with_values(&self) -> Value {
        let mut out = self.to_json();
        out["values"] = self.values.to_json();
        out
    }
}
