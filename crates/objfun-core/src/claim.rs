use rusqlite::TransactionBehavior;
use tracing::info;

use crate::error::{ObjFunError, Result};
use crate::registry::Scenario;
use crate::run::Run;
use crate::state::LookupState;
use crate::store::{self, Store};

impl Store {
    /// Picks the lowest-id run in `state` and, when `new_state` is given,
    /// advances it.
    ///
    /// The select and the update share one `IMMEDIATE` transaction, so two
    /// concurrent claimers never advance the same run.
    pub fn get_run_with_state(
        &mut self,
        scenario: &Scenario,
        state: LookupState,
        new_state: Option<LookupState>,
    ) -> Result<Run> {
        if let Some(to) = new_state {
            if state.is_after(to) {
                return Err(ObjFunError::InvalidStateTransition { from: state, to });
            }
        }
        let behavior = if new_state.is_some() {
            TransactionBehavior::Immediate
        } else {
            TransactionBehavior::Deferred
        };
        let tx = self.conn.transaction_with_behavior(behavior)?;
        let id = store::first_run_in_state(&tx, scenario.id, state)?.ok_or_else(|| {
            ObjFunError::NotFound(format!(
                "no run in state {} for scenario {}",
                state, scenario.name
            ))
        })?;
        if let Some(to) = new_state {
            store::write_state(&tx, id, to)?;
        }
        let run = store::load_run(&tx, scenario, id)?
            .ok_or_else(|| ObjFunError::NotFound(format!("run {}", id)))?;
        tx.commit()?;
        if let Some(to) = new_state {
            info!(scenario = %scenario.name, run = id, from = %state, to = %to, "claimed run");
        }
        Ok(run)
    }
}
