use std::fmt;
use std::str::FromStr;

use serde_json::{json, Value};

use crate::error::{ObjFunError, Result};

/// What a scenario's runs store as their result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    /// A scalar misfit value.
    Misfit,
    /// A path to the model output.
    Path,
}

impl RunKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RunKind::Misfit => "MISFIT",
            RunKind::Path => "PATH",
        }
    }
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunKind {
    type Err = ObjFunError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "MISFIT" => Ok(RunKind::Misfit),
            "PATH" => Ok(RunKind::Path),
            other => Err(ObjFunError::UnknownKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunValue {
    Misfit(f64),
    Path(String),
}

impl RunValue {
    /// Extracts the `value` field of a result payload for the given kind.
    pub fn from_payload(kind: RunKind, payload: &Value) -> Result<Self> {
        let value = payload
            .get("value")
            .ok_or_else(|| ObjFunError::BadPayload("missing key: value".to_string()))?;
        match kind {
            RunKind::Misfit => value
                .as_f64()
                .filter(|v| v.is_finite())
                .map(RunValue::Misfit)
                .ok_or_else(|| {
                    ObjFunError::BadPayload(format!("MISFIT value must be a number, got {}", value))
                }),
            RunKind::Path => value
                .as_str()
                .map(|s| RunValue::Path(s.to_string()))
                .ok_or_else(|| {
                    ObjFunError::BadPayload(format!("PATH value must be a string, got {}", value))
                }),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            RunValue::Misfit(v) => json!(v),
            RunValue::Path(p) => json!(p),
        }
    }
}
