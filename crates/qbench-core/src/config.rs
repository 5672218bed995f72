use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

const DEFAULT_WORKER_COUNT: usize = 5;
const DEFAULT_QUEUE_DEPTH: usize = 1;
const DEFAULT_POSTGRES_PORT: u16 = 5432;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of concurrent workers
    pub worker_count: usize,
    /// Tasks buffered per worker queue before the dispatcher blocks
    pub queue_depth: usize,
    /// CSV input with query parameters; stdin when unset
    pub file: Option<PathBuf>,
    pub postgres: PostgresConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            file: None,
            postgres: PostgresConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub db: String,
    pub ssl: bool,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_POSTGRES_PORT,
            user: "postgres".to_string(),
            password: String::new(),
            db: "postgres".to_string(),
            ssl: false,
        }
    }
}

/// Values given explicitly on the command line. `None` means "not given".
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub worker_count: Option<usize>,
    pub queue_depth: Option<usize>,
    pub file: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub db: Option<String>,
    pub ssl: Option<bool>,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("could not read config {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("could not parse config {}", path.display()))?;
        Ok(config)
    }

    /// Defaults, then the config file if any, then explicit flags.
    pub fn load(path: Option<&Path>, overrides: &Overrides) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply(overrides);
        config.validate()?;
        Ok(config)
    }

    pub fn apply(&mut self, o: &Overrides) {
        if let Some(v) = o.worker_count {
            self.worker_count = v;
        }
        if let Some(v) = o.queue_depth {
            self.queue_depth = v;
        }
        if let Some(v) = &o.file {
            self.file = Some(v.clone());
        }

        let pg = &mut self.postgres;
        if let Some(v) = &o.host {
            pg.host = v.clone();
        }
        if let Some(v) = o.port {
            pg.port = v;
        }
        if let Some(v) = &o.user {
            pg.user = v.clone();
        }
        if let Some(v) = &o.password {
            pg.password = v.clone();
        }
        if let Some(v) = &o.db {
            pg.db = v.clone();
        }
        if let Some(v) = o.ssl {
            pg.ssl = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            bail!("worker_count must be > 0");
        }
        if self.queue_depth == 0 {
            bail!("queue_depth must be > 0");
        }
        if self.postgres.host.is_empty() {
            bail!("postgres.host must not be empty");
        }
        Ok(())
    }
}
