//! SQLite persistence shared by every client and worker process.
//!
//! Each caller owns its own [`Store`] (one connection). Cross-process
//! atomicity comes from SQLite transactions, never from in-process locks.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{ObjFunError, Result};
use crate::kind::{RunKind, RunValue};
use crate::params::{BoundValue, ParameterVector};
use crate::registry::Scenario;
use crate::run::Run;
use crate::state::LookupState;

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

pub struct Store {
    pub(crate) conn: Connection,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    pub fn open_with_timeout(path: &Path, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::configure(conn, busy_timeout)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::configure(conn, DEFAULT_BUSY_TIMEOUT)
    }

    fn configure(conn: Connection, busy_timeout: Duration) -> Result<Self> {
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA foreign_keys=ON;",
        )?;
        Ok(Store { conn })
    }

    pub fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS apps(
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS studies(
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                app_id INTEGER NOT NULL REFERENCES apps(id) ON DELETE CASCADE,
                UNIQUE(name, app_id)
             );
             CREATE TABLE IF NOT EXISTS parameters(
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                study_id INTEGER NOT NULL REFERENCES studies(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                minv,
                maxv,
                resolution,
                UNIQUE(name, study_id)
             );
             CREATE TABLE IF NOT EXISTS obsnames(
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                study_id INTEGER NOT NULL REFERENCES studies(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                UNIQUE(name, study_id)
             );
             CREATE TABLE IF NOT EXISTS scenarios(
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                study_id INTEGER NOT NULL REFERENCES studies(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                runtype TEXT NOT NULL,
                UNIQUE(name, study_id)
             );
             CREATE TABLE IF NOT EXISTS runs(
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                scenario_id INTEGER NOT NULL REFERENCES scenarios(id) ON DELETE CASCADE,
                state TEXT NOT NULL,
                misfit REAL,
                path TEXT,
                vector_digest TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS run_values(
                run_id INTEGER NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                int_value INTEGER,
                real_value REAL,
                PRIMARY KEY(run_id, name)
             );
             CREATE INDEX IF NOT EXISTS runs_vector_idx ON runs(scenario_id, vector_digest);
             CREATE INDEX IF NOT EXISTS runs_state_idx ON runs(scenario_id, state);",
        )?;
        Ok(())
    }

    pub fn drop_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            "DROP TABLE IF EXISTS run_values;
             DROP TABLE IF EXISTS runs;
             DROP TABLE IF EXISTS scenarios;
             DROP TABLE IF EXISTS obsnames;
             DROP TABLE IF EXISTS parameters;
             DROP TABLE IF EXISTS studies;
             DROP TABLE IF EXISTS apps;",
        )?;
        Ok(())
    }
}

pub(crate) fn load_run(conn: &Connection, scenario: &Scenario, id: i64) -> Result<Option<Run>> {
    let row = conn
        .query_row(
            "SELECT state, misfit, path FROM runs WHERE id = ?1 AND scenario_id = ?2",
            params![id, scenario.id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, Option<f64>>(1)?,
                    r.get::<_, Option<String>>(2)?,
                ))
            },
        )
        .optional()?;
    let Some((state, misfit, path)) = row else {
        return Ok(None);
    };
    let state: LookupState = state.parse()?;
    let value = match scenario.kind {
        RunKind::Misfit => misfit.map(RunValue::Misfit),
        RunKind::Path => path.map(RunValue::Path),
    };

    let mut stmt =
        conn.prepare("SELECT name, int_value, real_value FROM run_values WHERE run_id = ?1")?;
    let rows = stmt.query_map(params![id], |r| {
        Ok((
            r.get::<_, String>(0)?,
            r.get::<_, Option<i64>>(1)?,
            r.get::<_, Option<f64>>(2)?,
        ))
    })?;
    let mut bound = BTreeMap::new();
    for row in rows {
        let (name, int_value, real_value) = row?;
        let value = match (int_value, real_value) {
            (Some(v), _) => BoundValue::Int(v),
            (None, Some(v)) => BoundValue::Real(v),
            (None, None) => {
                return Err(ObjFunError::NotFound(format!(
                    "run {} has no value bound for {}",
                    id, name
                )))
            }
        };
        bound.insert(name, value);
    }

    Ok(Some(Run {
        id,
        scenario_id: scenario.id,
        state,
        value,
        values: ParameterVector::from_bound(bound),
    }))
}

pub(crate) fn insert_run(
    conn: &Connection,
    scenario: &Scenario,
    vector: ParameterVector,
) -> Result<Run> {
    conn.execute(
        "INSERT INTO runs(scenario_id, state, vector_digest) VALUES(?1, ?2, ?3)",
        params![
            scenario.id,
            LookupState::Provisional.as_str(),
            vector.digest()
        ],
    )?;
    let id = conn.last_insert_rowid();
    let mut stmt = conn.prepare(
        "INSERT INTO run_values(run_id, name, int_value, real_value) VALUES(?1, ?2, ?3, ?4)",
    )?;
    for (name, value) in vector.iter() {
        let (int_value, real_value) = match value {
            BoundValue::Int(v) => (Some(v), None),
            BoundValue::Real(v) => (None, Some(v)),
        };
        stmt.execute(params![id, name, int_value, real_value])?;
    }
    Ok(Run {
        id,
        scenario_id: scenario.id,
        state: LookupState::Provisional,
        value: None,
        values: vector,
    })
}

pub(crate) fn delete_run(conn: &Connection, id: i64) -> Result<()> {
    conn.execute("DELETE FROM run_values WHERE run_id = ?1", params![id])?;
    conn.execute("DELETE FROM runs WHERE id = ?1", params![id])?;
    Ok(())
}

pub(crate) fn write_state(conn: &Connection, id: i64, state: LookupState) -> Result<()> {
    conn.execute(
        "UPDATE runs SET state = ?1 WHERE id = ?2",
        params![state.as_str(), id],
    )?;
    Ok(())
}

pub(crate) fn write_result(conn: &Connection, run: &Run) -> Result<()> {
    let (misfit, path) = match &run.value {
        Some(RunValue::Misfit(v)) => (Some(*v), None),
        Some(RunValue::Path(p)) => (None, Some(p.as_str())),
        None => (None, None),
    };
    conn.execute(
        "UPDATE runs SET state = ?1, misfit = ?2, path = ?3 WHERE id = ?4",
        params![run.state.as_str(), misfit, path, run.id],
    )?;
    Ok(())
}

pub(crate) fn first_run_in_state(
    conn: &Connection,
    scenario_id: i64,
    state: LookupState,
) -> Result<Option<i64>> {
    let id = conn
        .query_row(
            "SELECT id FROM runs WHERE scenario_id = ?1 AND state = ?2 ORDER BY id LIMIT 1",
            params![scenario_id, state.as_str()],
            |r| r.get(0),
        )
        .optional()?;
    Ok(id)
}
