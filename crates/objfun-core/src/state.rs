//! Run lifecycle states.
//!
//! The ordering used by guards lives in [`LookupState::ORDER`]; the enum's
//! declaration order carries no meaning.

use std::fmt;
use std::str::FromStr;

use crate::error::ObjFunError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LookupState {
    /// New entry under consideration.
    Provisional,
    /// Parameter set confirmed by a second sighting.
    New,
    Configuring,
    Configured,
    /// Being computed by a worker.
    Active,
    /// The model has run.
    Run,
    Postprocessing,
    Completed,
}

impl LookupState {
    pub const ORDER: [LookupState; 8] = [
        LookupState::Provisional,
        LookupState::New,
        LookupState::Configuring,
        LookupState::Configured,
        LookupState::Active,
        LookupState::Run,
        LookupState::Postprocessing,
        LookupState::Completed,
    ];

    /// Position in the lifecycle, starting at 1 for `PROVISIONAL`.
    pub fn rank(self) -> u8 {
        match self {
            LookupState::Provisional => 1,
            LookupState::New => 2,
            LookupState::Configuring => 3,
            LookupState::Configured => 4,
            LookupState::Active => 5,
            LookupState::Run => 6,
            LookupState::Postprocessing => 7,
            LookupState::Completed => 8,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LookupState::Provisional => "PROVISIONAL",
            LookupState::New => "NEW",
            LookupState::Configuring => "CONFIGURING",
            LookupState::Configured => "CONFIGURED",
            LookupState::Active => "ACTIVE",
            LookupState::Run => "RUN",
            LookupState::Postprocessing => "POSTPROCESSING",
            LookupState::Completed => "COMPLETED",
        }
    }

    pub fn is_after(self, other: LookupState) -> bool {
        self.rank() > other.rank()
    }

    /// Whether a result may be stored without forcing.
    pub fn accepts_result(self) -> bool {
        self.is_after(LookupState::Configured) && self != LookupState::Completed
    }
}

impl fmt::Display for LookupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LookupState {
    type Err = ObjFunError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LookupState::ORDER
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| ObjFunError::InvalidState(s.to_string()))
    }
}
