//! Applications, studies, parameter definitions, observation names and
//! scenarios.

use std::collections::BTreeSet;

use rusqlite::{ffi, params, Connection, OptionalExtension};
use serde_json::{json, Value};
use tracing::info;

use crate::auth;
use crate::error::{ObjFunError, Result};
use crate::kind::RunKind;
use crate::params::{ParamKind, ParameterDef};
use crate::store::Store;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct App {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Study {
    pub id: i64,
    pub name: String,
    pub app_id: i64,
    pub app: String,
}

/// A study scenario together with everything needed to match its runs.
#[derive(Debug, Clone, PartialEq)]
pub struct Scenario {
    pub id: i64,
    pub study_id: i64,
    pub study: String,
    pub name: String,
    pub kind: RunKind,
    /// Ordered by name.
    pub parameters: Vec<ParameterDef>,
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

impl Store {
    pub fn create_app(&mut self, name: &str, password: &str) -> Result<App> {
        if name.trim().is_empty() || password.is_empty() {
            return Err(ObjFunError::InvalidParameters(
                "app name and password are required".to_string(),
            ));
        }
        let hash = auth::hash_password(password);
        match self.conn.execute(
            "INSERT INTO apps(name, password_hash) VALUES(?1, ?2)",
            params![name, hash],
        ) {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(ObjFunError::Conflict(format!("app {} already exists", name)))
            }
            Err(e) => return Err(e.into()),
        }
        let id = self.conn.last_insert_rowid();
        info!(app = name, id, "created app");
        Ok(App {
            id,
            name: name.to_string(),
        })
    }

    pub fn app_by_id(&self, id: i64) -> Result<App> {
        self.conn
            .query_row("SELECT id, name FROM apps WHERE id = ?1", params![id], |r| {
                Ok(App {
                    id: r.get(0)?,
                    name: r.get(1)?,
                })
            })
            .optional()?
            .ok_or_else(|| ObjFunError::NotFound(format!("app {}", id)))
    }

    pub fn app_by_name(&self, name: &str) -> Result<App> {
        self.conn
            .query_row(
                "SELECT id, name FROM apps WHERE name = ?1",
                params![name],
                |r| {
                    Ok(App {
                        id: r.get(0)?,
                        name: r.get(1)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| ObjFunError::NotFound(format!("app {}", name)))
    }

    /// Resolves basic-auth credentials: `user` is tried as a token first,
    /// then as an app name with `password`.
    pub fn authenticate(&self, user: &str, password: &str, secret: &[u8]) -> Result<App> {
        if let Some(id) = auth::verify_token(user, secret) {
            return self.app_by_id(id).map_err(|_| ObjFunError::Unauthorized);
        }
        let stored: Option<(i64, String, String)> = self
            .conn
            .query_row(
                "SELECT id, name, password_hash FROM apps WHERE name = ?1",
                params![user],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()?;
        match stored {
            Some((id, name, hash)) if auth::verify_password(password, &hash) => {
                Ok(App { id, name })
            }
            _ => Err(ObjFunError::Unauthorized),
        }
    }

    /// Creates a study with its parameter definitions in one transaction.
    pub fn create_study(&mut self, app: &App, name: &str, parameters: &Value) -> Result<Study> {
        if name.trim().is_empty() {
            return Err(ObjFunError::InvalidParameters(
                "study name cannot be empty".to_string(),
            ));
        }
        let defs = parameters
            .as_object()
            .ok_or_else(|| {
                ObjFunError::InvalidParameters("parameters must be a JSON object".to_string())
            })?
            .iter()
            .map(|(pname, def)| ParameterDef::from_json(pname, def))
            .collect::<Result<Vec<_>>>()?;

        let tx = self.conn.transaction()?;
        match tx.execute(
            "INSERT INTO studies(name, app_id) VALUES(?1, ?2)",
            params![name, app.id],
        ) {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(ObjFunError::Conflict(format!(
                    "study {} already exists",
                    name
                )))
            }
            Err(e) => return Err(e.into()),
        }
        let study_id = tx.last_insert_rowid();
        {
            let mut stmt = tx.prepare(
                "INSERT INTO parameters(study_id, name, kind, minv, maxv, resolution)
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for def in &defs {
                match def.kind {
                    ParamKind::Int { minv, maxv } => stmt.execute(params![
                        study_id,
                        def.name,
                        def.kind.type_name(),
                        minv,
                        maxv,
                        Option::<f64>::None
                    ])?,
                    ParamKind::Float {
                        minv,
                        maxv,
                        resolution,
                    } => stmt.execute(params![
                        study_id,
                        def.name,
                        def.kind.type_name(),
                        minv,
                        maxv,
                        resolution
                    ])?,
                };
            }
        }
        tx.commit()?;
        info!(study = name, app = %app.name, parameters = defs.len(), "created study");
        Ok(Study {
            id: study_id,
            name: name.to_string(),
            app_id: app.id,
            app: app.name.clone(),
        })
    }

    pub fn studies(&self, app: &App) -> Result<Vec<Study>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name FROM studies WHERE app_id = ?1 ORDER BY id")?;
        let rows = stmt.query_map(params![app.id], |r| {
            Ok(Study {
                id: r.get(0)?,
                name: r.get(1)?,
                app_id: app.id,
                app: app.name.clone(),
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn study(&self, app: &App, name: &str) -> Result<Study> {
        self.conn
            .query_row(
                "SELECT id, name FROM studies WHERE app_id = ?1 AND name = ?2",
                params![app.id, name],
                |r| {
                    Ok(Study {
                        id: r.get(0)?,
                        name: r.get(1)?,
                        app_id: app.id,
                        app: app.name.clone(),
                    })
                },
            )
            .optional()?
            .ok_or_else(|| ObjFunError::NotFound(format!("study {}", name)))
    }

    pub fn study_json(&self, study: &Study) -> Result<Value> {
        let num_scenarios: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM scenarios WHERE study_id = ?1",
            params![study.id],
            |r| r.get(0),
        )?;
        Ok(json!({
            "id": study.id,
            "name": study.name,
            "app": study.app,
            "num_scenarios": num_scenarios
        }))
    }

    pub fn parameters(&self, study: &Study) -> Result<Vec<ParameterDef>> {
        load_parameters(&self.conn, study.id)
    }

    pub fn obsnames(&self, study: &Study) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM obsnames WHERE study_id = ?1 ORDER BY id")?;
        let rows = stmt.query_map(params![study.id], |r| r.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
    }

    /// The first write stores the names; later writes must repeat them.
    pub fn set_obsnames(&mut self, study: &Study, names: &[String]) -> Result<()> {
        let submitted: BTreeSet<&str> = names.iter().map(String::as_str).collect();
        if submitted.len() != names.len() {
            return Err(ObjFunError::InvalidParameters(
                "observation names must be unique".to_string(),
            ));
        }
        let tx = self.conn.transaction()?;
        let existing: Vec<String> = {
            let mut stmt = tx.prepare("SELECT name FROM obsnames WHERE study_id = ?1")?;
            let rows = stmt.query_map(params![study.id], |r| r.get(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        if existing.is_empty() {
            let mut stmt = tx.prepare("INSERT INTO obsnames(study_id, name) VALUES(?1, ?2)")?;
            for name in names {
                stmt.execute(params![study.id, name])?;
            }
        } else {
            let stored: BTreeSet<&str> = existing.iter().map(String::as_str).collect();
            if stored != submitted {
                return Err(ObjFunError::NotFound(format!(
                    "study {} has observation names {:?}, got {:?}",
                    study.name, stored, submitted
                )));
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn create_scenario(&mut self, study: &Study, name: &str, runtype: &str) -> Result<Scenario> {
        if name.trim().is_empty() {
            return Err(ObjFunError::InvalidParameters(
                "scenario name cannot be empty".to_string(),
            ));
        }
        let kind: RunKind = runtype.parse().map_err(|_| {
            ObjFunError::InvalidParameters(format!("unknown run type {}", runtype))
        })?;
        match self.conn.execute(
            "INSERT INTO scenarios(study_id, name, runtype) VALUES(?1, ?2, ?3)",
            params![study.id, name, kind.as_str()],
        ) {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(ObjFunError::Conflict(format!(
                    "scenario {} already exists",
                    name
                )))
            }
            Err(e) => return Err(e.into()),
        }
        let id = self.conn.last_insert_rowid();
        info!(study = %study.name, scenario = name, kind = %kind, "created scenario");
        Ok(Scenario {
            id,
            study_id: study.id,
            study: study.name.clone(),
            name: name.to_string(),
            kind,
            parameters: self.parameters(study)?,
        })
    }

    pub fn scenarios(&self, study: &Study) -> Result<Vec<Scenario>> {
        let rows: Vec<(i64, String, String)> = {
            let mut stmt = self.conn.prepare(
                "SELECT id, name, runtype FROM scenarios WHERE study_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![study.id], |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        let parameters = self.parameters(study)?;
        rows.into_iter()
            .map(|(id, name, runtype)| {
                Ok(Scenario {
                    id,
                    study_id: study.id,
                    study: study.name.clone(),
                    name,
                    kind: runtype.parse()?,
                    parameters: parameters.clone(),
                })
            })
            .collect()
    }

    /// Loads a scenario container. A stored run type outside the known set
    /// aborts with `UnknownKind`.
    pub fn scenario(&self, study: &Study, name: &str) -> Result<Scenario> {
        let (id, runtype): (i64, String) = self
            .conn
            .query_row(
                "SELECT id, runtype FROM scenarios WHERE study_id = ?1 AND name = ?2",
                params![study.id, name],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?
            .ok_or_else(|| ObjFunError::NotFound(format!("scenario {}", name)))?;
        Ok(Scenario {
            id,
            study_id: study.id,
            study: study.name.clone(),
            name: name.to_string(),
            kind: runtype.parse()?,
            parameters: self.parameters(study)?,
        })
    }

    pub fn scenario_json(&self, scenario: &Scenario) -> Result<Value> {
        let num_runs: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM runs WHERE scenario_id = ?1",
            params![scenario.id],
            |r| r.get(0),
        )?;
        Ok(json!({
            "study": scenario.study,
            "name": scenario.name,
            "runtype": scenario.kind.as_str(),
            "num_runs": num_runs
        }))
    }
}

fn load_parameters(conn: &Connection, study_id: i64) -> Result<Vec<ParameterDef>> {
    let mut stmt = conn.prepare(
        "SELECT name, kind, minv, maxv, resolution FROM parameters
         WHERE study_id = ?1 ORDER BY name",
    )?;
    let mut rows = stmt.query(params![study_id])?;
    let mut out = Vec::new();
    while let Some(r) = rows.next()? {
        let name: String = r.get(0)?;
        let kind: String = r.get(1)?;
        let kind = match kind.as_str() {
            "int" => ParamKind::Int {
                minv: r.get(2)?,
                maxv: r.get(3)?,
            },
            "float" => ParamKind::Float {
                minv: r.get(2)?,
                maxv: r.get(3)?,
                resolution: r.get(4)?,
            },
            other => {
                return Err(ObjFunError::InvalidParameters(format!(
                    "parameter {} has unknown type {}",
                    name, other
                )))
            }
        };
        out.push(ParameterDef { name, kind });
    }
    Ok(out)
}
