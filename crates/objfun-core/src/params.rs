//! Parameter definitions and bound parameter vectors.

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{ObjFunError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum ParamKind {
    Int { minv: i64, maxv: i64 },
    Float { minv: f64, maxv: f64, resolution: f64 },
}

impl ParamKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            ParamKind::Int { .. } => "int",
            ParamKind::Float { .. } => "float",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParameterDef {
    pub name: String,
    pub kind: ParamKind,
}

impl ParameterDef {
    pub fn from_json(name: &str, def: &Value) -> Result<Self> {
        if name.trim().is_empty() {
            return Err(ObjFunError::InvalidParameters(
                "parameter name cannot be empty".to_string(),
            ));
        }
        let obj = def.as_object().ok_or_else(|| {
            ObjFunError::InvalidParameters(format!("parameter {}: expected an object", name))
        })?;
        let type_name = obj.get("type").and_then(Value::as_str).ok_or_else(|| {
            ObjFunError::InvalidParameters(format!("parameter {}: missing type", name))
        })?;
        let kind = match type_name {
            "int" => {
                let minv = int_field(name, obj, "minv")?;
                let maxv = int_field(name, obj, "maxv")?;
                if minv > maxv {
                    return Err(ObjFunError::InvalidParameters(format!(
                        "parameter {}: minv {} > maxv {}",
                        name, minv, maxv
                    )));
                }
                ParamKind::Int { minv, maxv }
            }
            "float" => {
                let minv = float_field(name, obj, "minv")?;
                let maxv = float_field(name, obj, "maxv")?;
                let resolution = float_field(name, obj, "resolution")?;
                if minv > maxv {
                    return Err(ObjFunError::InvalidParameters(format!(
                        "parameter {}: minv {} > maxv {}",
                        name, minv, maxv
                    )));
                }
                if resolution <= 0.0 {
                    return Err(ObjFunError::InvalidParameters(format!(
                        "parameter {}: resolution must be positive",
                        name
                    )));
                }
                ParamKind::Float {
                    minv,
                    maxv,
                    resolution,
                }
            }
            other => {
                return Err(ObjFunError::InvalidParameters(format!(
                    "parameter {}: unknown type {}",
                    name, other
                )))
            }
        };
        Ok(ParameterDef {
            name: name.to_string(),
            kind,
        })
    }

    pub fn to_json(&self) -> Value {
        match &self.kind {
            ParamKind::Int { minv, maxv } => json!({
                "type": "int",
                "minv": minv,
                "maxv": maxv
            }),
            ParamKind::Float {
                minv,
                maxv,
                resolution,
            } => json!({
                "type": "float",
                "minv": minv,
                "maxv": maxv,
                "resolution": resolution
            }),
        }
    }

    fn bind(&self, value: &Value) -> Result<BoundValue> {
        match self.kind {
            ParamKind::Int { .. } => json_as_integral(value).map(BoundValue::Int).ok_or_else(|| {
                ObjFunError::InvalidParameters(format!(
                    "parameter {}: expected an integer, got {}",
                    self.name, value
                ))
            }),
            ParamKind::Float { .. } => value
                .as_f64()
                .filter(|v| !v.is_nan())
                // fold -0.0 so it matches 0.0 in the digest
                .map(|v| BoundValue::Real(if v == 0.0 { 0.0 } else { v }))
                .ok_or_else(|| {
                    ObjFunError::InvalidParameters(format!(
                        "parameter {}: expected a number, got {}",
                        self.name, value
                    ))
                }),
        }
    }
}

fn int_field(param: &str, obj: &Map<String, Value>, key: &str) -> Result<i64> {
    obj.get(key).and_then(json_as_integral).ok_or_else(|| {
        ObjFunError::InvalidParameters(format!("parameter {}: {} must be an integer", param, key))
    })
}

fn float_field(param: &str, obj: &Map<String, Value>, key: &str) -> Result<f64> {
    obj.get(key)
        .and_then(Value::as_f64)
        .filter(|v| v.is_finite())
        .ok_or_else(|| {
            ObjFunError::InvalidParameters(format!("parameter {}: {} must be a number", param, key))
        })
}

fn json_as_integral(value: &Value) -> Option<i64> {
    if let Some(v) = value.as_i64() {
        return Some(v);
    }
    let v = value.as_f64()?;
    // 2^63 itself is out of range; `i64::MAX as f64` rounds up to it
    if v.fract() == 0.0 && v >= i64::MIN as f64 && v < 9_223_372_036_854_775_808.0 {
        Some(v as i64)
    } else {
        None
    }
}

/// A single bound value. Comparison is exact.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BoundValue {
    Int(i64),
    Real(f64),
}

impl BoundValue {
    pub fn to_json(self) -> Value {
        match self {
            BoundValue::Int(v) => json!(v),
            BoundValue::Real(v) => json!(v),
        }
    }
}

/// One value per parameter definition, keyed by parameter name.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParameterVector {
    values: BTreeMap<String, BoundValue>,
}

impl ParameterVector {
    /// Binds a submitted JSON object against the scenario's definitions.
    ///
    /// The key set must equal the definition names exactly.
    pub fn from_json(defs: &[ParameterDef], submitted: &Value) -> Result<Self> {
        let obj = submitted.as_object().ok_or_else(|| {
            ObjFunError::InvalidParameters("parameters must be a JSON object".to_string())
        })?;
        if let Some(extra) = obj.keys().find(|k| !defs.iter().any(|d| &d.name == *k)) {
            return Err(ObjFunError::InvalidParameters(format!(
                "unknown parameter: {}",
                extra
            )));
        }
        let mut values = BTreeMap::new();
        for def in defs {
            let raw = obj.get(&def.name).ok_or_else(|| {
                ObjFunError::InvalidParameters(format!("missing parameter: {}", def.name))
            })?;
            values.insert(def.name.clone(), def.bind(raw)?);
        }
        Ok(ParameterVector { values })
    }

    pub(crate) fn from_bound(values: BTreeMap<String, BoundValue>) -> Self {
        ParameterVector { values }
    }

    pub fn get(&self, name: &str) -> Option<BoundValue> {
        self.values.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, BoundValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Hex SHA-256 over the name-ordered canonical encoding of the vector.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for (name, value) in &self.values {
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
            match value {
                BoundValue::Int(v) => {
                    hasher.update(b"i");
                    hasher.update(v.to_be_bytes());
                }
                BoundValue::Real(v) => {
                    hasher.update(b"f");
                    hasher.update(v.to_bits().to_be_bytes());
                }
            }
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }

    pub fn to_json(&self) -> Value {
        let mut out = Map::new();
        for (name, value) in &self.values {
            out.insert(name.clone(), value.to_json());
        }
        Value::Object(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defs() -> Vec<ParameterDef> {
        vec![
            ParameterDef::from_json(
                "paramA",
                &json!({"type": "float", "minv": -10.0, "maxv": 10.0, "resolution": 0.1}),
            )
            .expect("float def"),
            ParameterDef::from_json("paramB", &json!({"type": "int", "minv": 10, "maxv": 100}))
                .expect("int def"),
        ]
    }

    #[test]
    fn definitions_serialize_back_to_submitted_shape() {
        let float = json!({"type": "float", "minv": -10.0, "maxv": 10.0, "resolution": 0.1});
        let int = json!({"type": "int", "minv": 10, "maxv": 100});
        assert_eq!(
            ParameterDef::from_json("a", &float).expect("float").to_json(),
            float
        );
        assert_eq!(ParameterDef::from_json("b", &int).expect("int").to_json(), int);
    }

    #[test]
    fn definitions_reject_bad_types() {
        assert!(ParameterDef::from_json("p", &json!({})).is_err());
        assert!(ParameterDef::from_json("p", &json!({"type": "wrong"})).is_err());
        assert!(ParameterDef::from_json("p", &json!({"type": "float", "minv": 0, "maxv": 1})).is_err());
        assert!(ParameterDef::from_json("p", &json!({"type": "int", "minv": 5, "maxv": 1})).is_err());
    }

    #[test]
    fn vector_binds_by_kind() {
        let v = ParameterVector::from_json(&defs(), &json!({"paramA": 0, "paramB": 50.0}))
            .expect("bind");
        assert_eq!(v.get("paramA"), Some(BoundValue::Real(0.0)));
        assert_eq!(v.get("paramB"), Some(BoundValue::Int(50)));
        assert_eq!(v.to_json(), json!({"paramA": 0.0, "paramB": 50}));
    }

    #[test]
    fn vector_requires_exact_key_set() {
        let missing = ParameterVector::from_json(&defs(), &json!({"paramA": 0}))
            .expect_err("missing key");
        assert!(missing.to_string().contains("paramB"), "{}", missing);
        let extra = ParameterVector::from_json(
            &defs(),
            &json!({"paramA": 0, "paramB": 1, "paramC": 2}),
        )
        .expect_err("extra key");
        assert!(extra.to_string().contains("paramC"), "{}", extra);
        assert!(ParameterVector::from_json(&defs(), &json!("blub")).is_err());
        assert!(ParameterVector::from_json(&defs(), &json!({"paramA": 0, "paramB": 50.5})).is_err());
    }

    #[test]
    fn integral_floats_at_the_i64_edge() {
        assert_eq!(json_as_integral(&json!(i64::MAX)), Some(i64::MAX));
        assert_eq!(json_as_integral(&json!(9.223372036854775808e18)), None);
        assert_eq!(json_as_integral(&json!(-9.223372036854775808e18)), Some(i64::MIN));
        assert_eq!(json_as_integral(&json!(1e19)), None);

        let defs = vec![
            ParameterDef::from_json("b", &json!({"type": "int", "minv": 0, "maxv": 1}))
                .expect("int def"),
        ];
        assert!(ParameterVector::from_json(&defs, &json!({"b": i64::MAX})).is_ok());
        assert!(ParameterVector::from_json(&defs, &json!({"b": 9.223372036854775808e18})).is_err());
    }

    #[test]
    fn digest_is_exact_and_sign_of_zero_insensitive() {
        let a = ParameterVector::from_json(&defs(), &json!({"paramA": 0.0, "paramB": 50}))
            .expect("a");
        let b = ParameterVector::from_json(&defs(), &json!({"paramB": 50, "paramA": -0.0}))
            .expect("b");
        let c = ParameterVector::from_json(&defs(), &json!({"paramA": 1e-12, "paramB": 50}))
            .expect("c");
        assert_eq!(a, b);
        assert_eq!(a.digest(), b.digest());
        assert_ne!(a, c);
        assert_ne!(a.digest(), c.digest());
    }
}
