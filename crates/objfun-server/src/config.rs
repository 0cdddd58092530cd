use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_SECRET_KEY: &str = "objfun-is-not-so-secret";

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub bind: String,
    pub database: PathBuf,
    pub secret_key: String,
    pub threads: usize,
    pub busy_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:5000".to_string(),
            database: PathBuf::from("objfun.db"),
            secret_key: DEFAULT_SECRET_KEY.to_string(),
            threads: 4,
            busy_timeout: Duration::from_millis(5000),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    bind: Option<String>,
    #[serde(default)]
    database: Option<String>,
    #[serde(default)]
    secret_key: Option<String>,
    #[serde(default)]
    threads: Option<usize>,
    #[serde(default)]
    busy_timeout_ms: Option<u64>,
}

impl ServerConfig {
    /// Defaults, then the optional YAML file, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(path) = path {
            let raw = fs::read_to_string(path)
                .map_err(|e| anyhow!("failed to read config {}: {}", path.display(), e))?;
            config.apply_file(&raw)?;
        }
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn apply_file(&mut self, raw: &str) -> Result<()> {
        let file: ConfigFile = serde_yaml::from_str(raw)?;
        if let Some(bind) = file.bind {
            self.bind = bind;
        }
        if let Some(database) = file.database {
            self.database = database_path(&database);
        }
        if let Some(secret) = file.secret_key {
            self.secret_key = secret;
        }
        if let Some(threads) = file.threads {
            self.threads = threads;
        }
        if let Some(ms) = file.busy_timeout_ms {
            self.busy_timeout = Duration::from_millis(ms);
        }
        self.validate()
    }

    fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(bind) = get("OBJFUN_BIND") {
            self.bind = bind;
        }
        if let Some(url) = get("DATABASE_URL") {
            self.database = database_path(&url);
        }
        if let Some(secret) = get("SECRET_KEY") {
            self.secret_key = secret;
        }
        if let Some(threads) = get("OBJFUN_THREADS") {
            self.threads = threads
                .parse()
                .map_err(|_| anyhow!("OBJFUN_THREADS must be a positive integer: {}", threads))?;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(anyhow!("threads must be at least 1"));
        }
        if self.secret_key.is_empty() {
            return Err(anyhow!("secret_key cannot be empty"));
        }
        Ok(())
    }
}

/// Accepts `sqlite:///relative.db`, `sqlite:////absolute.db` or a bare path.
pub fn database_path(url: &str) -> PathBuf {
    PathBuf::from(url.strip_prefix("sqlite:///").unwrap_or(url))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn database_url_forms() {
        assert_eq!(
            database_path("sqlite:///var/objfun/app.db"),
            PathBuf::from("var/objfun/app.db")
        );
        assert_eq!(
            database_path("sqlite:////abs/app.db"),
            PathBuf::from("/abs/app.db")
        );
        assert_eq!(database_path("local.db"), PathBuf::from("local.db"));
    }

    #[test]
    fn file_then_env_layering() {
        let mut config = ServerConfig::default();
        config
            .apply_file("bind: 0.0.0.0:8080\nthreads: 2\nbusy_timeout_ms: 250\n")
            .expect("yaml");
        assert_eq!(config.bind, "0.0.0.0:8080");
        assert_eq!(config.threads, 2);
        assert_eq!(config.busy_timeout, Duration::from_millis(250));

        let env: BTreeMap<&str, &str> = [
            ("DATABASE_URL", "sqlite:////tmp/objfun.db"),
            ("SECRET_KEY", "s3cret"),
        ]
        .into_iter()
        .collect();
        config
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .expect("env");
        assert_eq!(config.database, PathBuf::from("/tmp/objfun.db"));
        assert_eq!(config.secret_key, "s3cret");
        assert_eq!(config.bind, "0.0.0.0:8080");
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let mut config = ServerConfig::default();
        assert!(config.apply_file("threads: 0\n").is_err());
        let mut config = ServerConfig::default();
        assert!(config.apply_file("colour: blue\n").is_err());
        let mut config = ServerConfig::default();
        assert!(config
            .apply_env(|k| (k == "OBJFUN_THREADS").then(|| "many".to_string()))
            .is_err());
    }
}
