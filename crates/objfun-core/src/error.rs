use thiserror::Error;

use crate::state::LookupState;

pub type Result<T> = std::result::Result<T, ObjFunError>;

#[derive(Debug, Error)]
pub enum ObjFunError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: LookupState, to: LookupState },

    #[error("bad payload: {0}")]
    BadPayload(String),

    #[error("unknown run kind `{0}`")]
    UnknownKind(String),

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("invalid state `{0}`")]
    InvalidState(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ObjFunError {
    /// Short machine-readable code used in error payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::InvalidStateTransition { .. } => "invalid_state_transition",
            Self::BadPayload(_) => "bad_payload",
            Self::UnknownKind(_) => "unknown_kind",
            Self::InvalidParameters(_) => "invalid_parameters",
            Self::InvalidState(_) => "invalid_state",
            Self::Conflict(_) => "conflict",
            Self::Unauthorized => "unauthorized",
            Self::Storage(_) => "storage",
            Self::Json(_) => "json",
        }
    }
}
