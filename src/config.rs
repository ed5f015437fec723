use clap::ValueEnum;
use config::{Config, ConfigError, Environment, File, Source};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;

use crate::sync::EngineSettings;

const ENV_PREFIX: &str = "LEDGER_INDEX";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Network {
    Main,
    Test,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Main => write!(f, "main"),
            Network::Test => write!(f, "test"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// DuckDB file path
    pub database: String,
    pub network: NetworkProfiles,
    #[serde(default)]
    pub sync: SyncSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkProfiles {
    pub main: Credential,
    pub test: Credential,
}

#[derive(Clone, Deserialize)]
pub struct Credential {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl Credential {
    pub fn url(&self) -> String {
        let host = self.host.trim_end_matches('/');
        if host.starts_with("http://") || host.starts_with("https://") {
            format!("{}:{}", host, self.port)
        } else {
            format!("http://{}:{}", host, self.port)
        }
    }
}

// Keeps the password out of logged settings
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub poll_interval_ms: u64,
    pub request_timeout_secs: u64,
    pub retry_initial_ms: u64,
    pub retry_max_ms: u64,
    pub transaction_attempts: u32,
    pub fetch_concurrency: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 20_000,
            request_timeout_secs: 80,
            retry_initial_ms: 500,
            retry_max_ms: 30_000,
            transaction_attempts: 5,
            fetch_concurrency: 8,
        }
    }
}

impl Settings {
    /// Reads the settings file, then applies `LEDGER_INDEX_*` environment overrides
    /// (nested keys joined by `__`, e.g. `LEDGER_INDEX_NETWORK__MAIN__PASSWORD`).
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        Self::build(File::with_name(path).required(true), environment())
    }

    fn build<S>(file: S, env: Environment) -> Result<Self, ConfigError>
    where
        S: Source + Send + Sync + 'static,
    {
        let settings: Settings = Config::builder()
            .add_source(file)
            .add_source(env)
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.database.trim().is_empty() {
            return Err(ConfigError::Message("database path is empty".to_string()));
        }
        if self.sync.transaction_attempts == 0 {
            return Err(ConfigError::Message("sync.transaction_attempts must be at least 1".to_string()));
        }
        if self.sync.retry_initial_ms > self.sync.retry_max_ms {
            return Err(ConfigError::Message(
                "sync.retry_initial_ms exceeds sync.retry_max_ms".to_string(),
            ));
        }
        Ok(())
    }

    pub fn profile(&self, network: Network) -> &Credential {
        match network {
            Network::Main => &self.network.main,
            Network::Test => &self.network.test,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.sync.request_timeout_secs)
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            poll_interval: Duration::from_millis(self.sync.poll_interval_ms),
            retry_initial: Duration::from_millis(self.sync.retry_initial_ms),
            retry_max: Duration::from_millis(self.sync.retry_max_ms),
            fetch_attempts: self.sync.transaction_attempts,
            fetch_concurrency: self.sync.fetch_concurrency.max(1),
        }
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}
