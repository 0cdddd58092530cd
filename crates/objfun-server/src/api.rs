//! Request routing for the `/api` surface.
//!
//! Everything here is transport-free: [`handle`] takes an [`ApiRequest`]
//! and a store and returns an [`ApiResponse`], so the HTTP layer only has
//! to translate bytes.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use objfun_core::{auth, App, LookupState, ObjFunError, Result, Scenario, Store};
use percent_encoding::percent_decode_str;
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Other,
}

#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    /// Raw request target, possibly percent-encoded and with a query string.
    pub url: String,
    pub authorization: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    fn ok(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    fn error(err: &ObjFunError) -> Self {
        Self {
            status: status_for(err),
            body: json_error(err.code(), err.to_string()),
        }
    }
}

pub fn json_error(code: &str, message: String) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message
        }
    })
}

pub fn status_for(err: &ObjFunError) -> u16 {
    match err {
        ObjFunError::NotFound(_) => 404,
        ObjFunError::InvalidStateTransition { .. } => 403,
        ObjFunError::BadPayload(_)
        | ObjFunError::InvalidParameters(_)
        | ObjFunError::InvalidState(_)
        | ObjFunError::Json(_) => 400,
        ObjFunError::Conflict(_) => 409,
        ObjFunError::Unauthorized => 401,
        ObjFunError::UnknownKind(_) | ObjFunError::Storage(_) => 500,
    }
}

pub fn handle(store: &mut Store, secret: &[u8], req: &ApiRequest) -> ApiResponse {
    let app = match authenticate(store, secret, req.authorization.as_deref()) {
        Ok(app) => app,
        Err(err) => return ApiResponse::error(&err),
    };
    let segments = match split_path(&req.url) {
        Some(segments) => segments,
        None => {
            return ApiResponse::error(&ObjFunError::NotFound(format!(
                "malformed path {}",
                req.url
            )))
        }
    };
    let segments: Vec<&str> = segments.iter().map(String::as_str).collect();
    match route(store, secret, &app, req, &segments) {
        Ok((status, body)) => ApiResponse::ok(status, body),
        Err(err) => ApiResponse::error(&err),
    }
}

fn authenticate(store: &Store, secret: &[u8], header: Option<&str>) -> Result<App> {
    let encoded = header
        .and_then(|h| h.strip_prefix("Basic "))
        .ok_or(ObjFunError::Unauthorized)?;
    let decoded = STANDARD
        .decode(encoded.trim())
        .map_err(|_| ObjFunError::Unauthorized)?;
    let decoded = String::from_utf8(decoded).map_err(|_| ObjFunError::Unauthorized)?;
    let (user, password) = decoded.split_once(':').ok_or(ObjFunError::Unauthorized)?;
    store.authenticate(user, password, secret)
}

fn route(
    store: &mut Store,
    secret: &[u8],
    app: &App,
    req: &ApiRequest,
    segments: &[&str],
) -> Result<(u16, Value)> {
    use Method::{Get, Post, Put};

    match (req.method, segments) {
        (Get, ["api", "token"]) => {
            let token = auth::issue_token(app.id, secret)?;
            Ok((200, json!({ "token": token })))
        }
        (Get, ["api", "studies"]) => {
            let data = store
                .studies(app)?
                .iter()
                .map(|s| store.study_json(s))
                .collect::<Result<Vec<_>>>()?;
            Ok((200, json!({ "data": data })))
        }
        (Post, ["api", "create_study"]) => {
            let body = json_body(req)?;
            let name = required_str(&body, "name")?;
            let parameters = required(&body, "parameters")?;
            let study = store.create_study(app, name, parameters)?;
            Ok((201, store.study_json(&study)?))
        }
        (Get, ["api", "studies", study]) => {
            let study = store.study(app, study)?;
            Ok((200, store.study_json(&study)?))
        }
        (Get, ["api", "studies", study, "parameters"]) => {
            let study = store.study(app, study)?;
            let mut out = serde_json::Map::new();
            for def in store.parameters(&study)? {
                out.insert(def.name.clone(), def.to_json());
            }
            Ok((200, Value::Object(out)))
        }
        (Post, ["api", "studies", study, "create_scenario"]) => {
            let study = store.study(app, study)?;
            let body = json_body(req)?;
            let name = required_str(&body, "name")?;
            let runtype = required_str(&body, "runtype")?;
            let scenario = store.create_scenario(&study, name, runtype)?;
            Ok((201, store.scenario_json(&scenario)?))
        }
        (Get, ["api", "studies", study, "observation_names"]) => {
            let study = store.study(app, study)?;
            Ok((200, json!({"obsnames": store.obsnames(&study)?})))
        }
        (Put, ["api", "studies", study, "observation_names"]) => {
            let study = store.study(app, study)?;
            let body = json_body(req)?;
            let names = required(&body, "obsnames")?
                .as_array()
                .and_then(|names| {
                    names
                        .iter()
                        .map(|n| n.as_str().map(str::to_string))
                        .collect::<Option<Vec<_>>>()
                })
                .ok_or_else(|| {
                    ObjFunError::BadPayload("obsnames must be a list of strings".to_string())
                })?;
            store.set_obsnames(&study, &names)?;
            Ok((201, json!({ "obsnames": names })))
        }
        (Get, ["api", "studies", study, "scenarios"]) => {
            let study = store.study(app, study)?;
            let data = store
                .scenarios(&study)?
                .iter()
                .map(|s| store.scenario_json(s))
                .collect::<Result<Vec<_>>>()?;
            Ok((200, json!({ "data": data })))
        }
        (Get, ["api", "studies", study, "scenarios", scenario, "runs"]) => {
            let scenario = load_scenario(store, app, study, scenario)?;
            let data: Vec<Value> = store.runs(&scenario)?.iter().map(|r| r.to_json()).collect();
            Ok((200, json!({ "data": data })))
        }
        (Post, ["api", "studies", study, "scenarios", scenario, "get_run"]) => {
            let body = json_body(req)?;
            let parameters = required(&body, "parameters")?;
            let scenario = load_scenario(store, app, study, scenario)?;
            let run = store.get_run(&scenario, parameters)?;
            Ok((201, run.to_json()))
        }
        (Post, ["api", "studies", study, "scenarios", scenario, "lookup_run"]) => {
            let body = json_body(req)?;
            let parameters = required(&body, "parameters")?;
            let scenario = load_scenario(store, app, study, scenario)?;
            let outcome = store.lookup_run(&scenario, parameters)?;
            Ok((201, outcome.to_json()))
        }
        (Post, ["api", "studies", study, "scenarios", scenario, "runs", "with_state"]) => {
            let body = json_body(req)?;
            let state: LookupState = required_str(&body, "state")?.parse()?;
            let new_state = match body.get("new_state") {
                None | Some(Value::Null) => None,
                Some(v) => Some(
                    v.as_str()
                        .ok_or_else(|| ObjFunError::InvalidState(v.to_string()))?
                        .parse::<LookupState>()?,
                ),
            };
            let scenario = load_scenario(store, app, study, scenario)?;
            let run = store.get_run_with_state(&scenario, state, new_state)?;
            Ok((201, run.to_json_with_values()))
        }
        (Get, ["api", "studies", study, "scenarios", scenario, "runs", id]) => {
            let scenario = load_scenario(store, app, study, scenario)?;
            Ok((200, store.run(&scenario, run_id(id)?)?.to_json()))
        }
        (Get, ["api", "studies", study, "scenarios", scenario, "runs", id, "state"]) => {
            let scenario = load_scenario(store, app, study, scenario)?;
            let run = store.run(&scenario, run_id(id)?)?;
            Ok((200, json!({"state": run.state.as_str()})))
        }
        (Put, ["api", "studies", study, "scenarios", scenario, "runs", id, "state"]) => {
            let body = json_body(req)?;
            let state: LookupState = required_str(&body, "state")?.parse()?;
            let force = force_flag(&body)?;
            let scenario = load_scenario(store, app, study, scenario)?;
            let run = store.set_state(&scenario, run_id(id)?, state, force)?;
            Ok((201, json!({"state": run.state.as_str()})))
        }
        (Get, ["api", "studies", study, "scenarios", scenario, "runs", id, "value"]) => {
            let scenario = load_scenario(store, app, study, scenario)?;
            let value = store.get_value(&scenario, run_id(id)?)?;
            Ok((200, json!({"value": value.to_json()})))
        }
        (Put, ["api", "studies", study, "scenarios", scenario, "runs", id, "value"]) => {
            let body = json_body(req)?;
            let force = force_flag(&body)?;
            let scenario = load_scenario(store, app, study, scenario)?;
            let run = store.set_value(&scenario, run_id(id)?, &body, force)?;
            Ok((201, run.to_json()))
        }
        _ => Err(ObjFunError::NotFound(format!("no route for {}", req.url))),
    }
}

fn load_scenario(store: &Store, app: &App, study: &str, scenario: &str) -> Result<Scenario> {
    let study = store.study(app, study)?;
    store.scenario(&study, scenario)
}

fn run_id(raw: &str) -> Result<i64> {
    raw.parse()
        .map_err(|_| ObjFunError::NotFound(format!("run {}", raw)))
}

fn json_body(req: &ApiRequest) -> Result<Value> {
    if req.body.iter().all(u8::is_ascii_whitespace) {
        return Err(ObjFunError::BadPayload("expected a JSON body".to_string()));
    }
    let body: Value = serde_json::from_slice(&req.body)
        .map_err(|e| ObjFunError::BadPayload(format!("invalid JSON: {}", e)))?;
    if !body.is_object() {
        return Err(ObjFunError::BadPayload(
            "expected a JSON object".to_string(),
        ));
    }
    Ok(body)
}

fn required<'a>(body: &'a Value, key: &str) -> Result<&'a Value> {
    body.get(key)
        .ok_or_else(|| ObjFunError::BadPayload(format!("missing key: {}", key)))
}

fn required_str<'a>(body: &'a Value, key: &str) -> Result<&'a str> {
    required(body, key)?
        .as_str()
        .ok_or_else(|| ObjFunError::BadPayload(format!("{} must be a string", key)))
}

fn force_flag(body: &Value) -> Result<bool> {
    match body.get("force") {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(b)) => Ok(*b),
        Some(other) => Err(ObjFunError::BadPayload(format!(
            "force must be a boolean, got {}",
            other
        ))),
    }
}

/// Splits the path part of a request target into percent-decoded segments.
fn split_path(url: &str) -> Option<Vec<String>> {
    let path = url.split(['?', '#']).next().unwrap_or_default();
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(|s| {
            percent_decode_str(s)
                .decode_utf8()
                .ok()
                .map(|decoded| decoded.into_owned())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_percent_decoded() {
        assert_eq!(
            split_path("/api/studies/test%20study/scenarios?x=1").expect("decode"),
            vec!["api", "studies", "test study", "scenarios"]
        );
        assert_eq!(
            split_path("/api/studies/bad%zz").expect("literal"),
            vec!["api", "studies", "bad%zz"]
        );
        assert!(split_path("/api/studies/%ff%fe").is_none());
    }

    #[test]
    fn error_kinds_map_to_statuses() {
        assert_eq!(status_for(&ObjFunError::NotFound("x".into())), 404);
        assert_eq!(
            status_for(&ObjFunError::InvalidStateTransition {
                from: LookupState::Completed,
                to: LookupState::Completed
            }),
            403
        );
        assert_eq!(status_for(&ObjFunError::BadPayload("x".into())), 400);
        assert_eq!(status_for(&ObjFunError::Conflict("x".into())), 409);
        assert_eq!(status_for(&ObjFunError::UnknownKind("x".into())), 500);
    }

    #[test]
    fn force_flag_must_be_boolean() {
        assert!(!force_flag(&json!({"value": 1})).expect("absent"));
        assert!(force_flag(&json!({"force": true})).expect("true"));
        assert!(force_flag(&json!({"force": "yes"})).is_err());
    }
}
