use anyhow::Result;
use clap::{Parser, Subcommand};
use objfun_core::Store;
use objfun_server::ServerConfig;
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "objfun",
    version,
    about = "Run coordination service for objective-function evaluations"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP API.
    Serve {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        bind: Option<String>,
        #[arg(long)]
        database: Option<PathBuf>,
        #[arg(long)]
        threads: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    /// Create all tables.
    InitDb {
        #[arg(long)]
        database: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Drop all tables.
    DeleteDb {
        #[arg(long)]
        database: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Register a client application.
    AddApp {
        #[arg(long)]
        app: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        database: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Serve {
            config,
            bind,
            database,
            threads,
            json,
        } => {
            let mut resolved = ServerConfig::load(config.as_deref())?;
            if let Some(bind) = bind {
                resolved.bind = bind;
            }
            if let Some(database) = database {
                resolved.database = database;
            }
            if let Some(threads) = threads {
                resolved.threads = threads;
            }
            resolved.validate()?;
            if json {
                emit_json(&serve_started_json(&resolved));
            }
            objfun_server::serve(&resolved)?;
        }
        Commands::InitDb { database, json } => {
            let path = database_path(database)?;
            let store = Store::open(&path)?;
            store.init_schema()?;
            tracing::info!(database = %path.display(), "initialized database");
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "init-db",
                    "database": path.display().to_string()
                })));
            }
            println!("initialized {}", path.display());
        }
        Commands::DeleteDb { database, json } => {
            let path = database_path(database)?;
            let store = Store::open(&path)?;
            store.drop_schema()?;
            tracing::info!(database = %path.display(), "dropped all tables");
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "delete-db",
                    "database": path.display().to_string()
                })));
            }
            println!("deleted all tables in {}", path.display());
        }
        Commands::AddApp {
            app,
            password,
            database,
            json,
        } => {
            let path = database_path(database)?;
            let mut store = Store::open(&path)?;
            let created = store.create_app(&app, &password)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "add-app",
                    "app": {"id": created.id, "name": created.name}
                })));
            }
            println!("app_id: {}", created.id);
            println!("app: {}", created.name);
        }
    }
    Ok(None)
}

/// Printed before the listener blocks.
fn serve_started_json(config: &ServerConfig) -> Value {
    json!({
        "ok": true,
        "command": "serve",
        "bind": config.bind,
        "database": config.database.display().to_string(),
        "threads": config.threads
    })
}

/// `--database` wins over `DATABASE_URL`, which wins over the default.
fn database_path(flag: Option<PathBuf>) -> Result<PathBuf> {
    match flag {
        Some(path) => Ok(path),
        None => Ok(ServerConfig::load(None)?.database),
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Serve { json, .. }
        | Commands::InitDb { json, .. }
        | Commands::DeleteDb { json, .. }
        | Commands::AddApp { json, .. } => *json,
    }
}
