//! Run lifecycle and deduplication engine for objective function evaluations.
//!
//! Clients submit parameter vectors per scenario; [`Store::lookup_run`]
//! returns an existing run or coordinates a single provisional one, workers
//! pick up pending runs with [`Store::get_run_with_state`] and report back
//! through [`Store::set_value`].

pub mod auth;
mod claim;
pub mod error;
pub mod kind;
mod lookup;
pub mod params;
pub mod registry;
mod result;
pub mod run;
pub mod state;
pub mod store;

pub use error::{ObjFunError, Result};
pub use kind::{RunKind, RunValue};
pub use params::{BoundValue, ParamKind, ParameterDef, ParameterVector};
pub use registry::{App, Scenario, Study};
pub use run::{LookupOutcome, Run};
pub use state::LookupState;
pub use store::Store;
