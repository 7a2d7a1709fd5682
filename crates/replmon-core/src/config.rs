//! Monitor configuration.
//!
//! Loaded from a YAML file:
//!
//! ```yaml
//! databases:
//!   - name: src1
//!     host: primary.db.local
//!     port: 5432
//!     user: monitor
//!     password: secret
//!     dbname: app
//!     role: source
//!   - name: tgt1
//!     host: replica.db.local
//!     user: monitor
//!     dbname: app
//!     role: target
//!     sslmode: require
//! server:
//!   port: 8080
//!   refresh_interval: 5
//! monitoring:
//!   lag_threshold: 104857600
//! ```

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::aggregate::{DEFAULT_LAG_BYTES_THRESHOLD, Thresholds};
use crate::model::Role;

/// Error type for configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    /// The file could not be read.
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The file is not valid YAML for [`MonitorConfig`].
    Parse(String),
    /// The file parsed but violates a constraint.
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, source } => {
                write!(f, "failed to read config file {}: {}", path.display(), source)
            }
            ConfigError::Parse(msg) => write!(f, "failed to parse config file: {}", msg),
            ConfigError::Invalid(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MonitorConfig {
    #[serde(default)]
    pub databases: Vec<DatabaseConfig>,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// One monitored database.
#[derive(Clone, Deserialize)]
pub struct DatabaseConfig {
    pub name: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_db_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: String,
    pub dbname: String,
    pub role: Role,
    /// libpq `sslmode`: `disable`, `prefer` or `require`.
    #[serde(default = "default_sslmode")]
    pub sslmode: String,
    /// Skip certificate verification when TLS is used.
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"***")
            .field("dbname", &self.dbname)
            .field("role", &self.role)
            .field("sslmode", &self.sslmode)
            .finish()
    }
}

impl DatabaseConfig {
    /// libpq key=value connection string for this database.
    ///
    /// `connect_timeout` bounds connection establishment; query latency is
    /// bounded separately by the collector's poll deadline.
    pub fn connection_string(&self, connect_timeout: Duration) -> String {
        let mut parts = vec![
            format!("host={}", quote(&self.host)),
            format!("port={}", self.port),
            format!("user={}", quote(&self.user)),
            format!("dbname={}", quote(&self.dbname)),
            format!("sslmode={}", self.sslmode),
            format!("connect_timeout={}", connect_timeout.as_secs().max(1)),
            "application_name=replmon".to_string(),
        ];
        if !self.password.is_empty() {
            parts.push(format!("password={}", quote(&self.password)));
        }
        parts.join(" ")
    }
}

/// Quotes a libpq value when it contains spaces, quotes or backslashes.
fn quote(value: &str) -> String {
    if !value.is_empty() && !value.contains([' ', '\'', '\\']) {
        return value.to_string();
    }
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{}'", escaped)
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_port")]
    pub port: u16,
    /// Full listen address; overrides `port` when set.
    #[serde(default)]
    pub listen: Option<String>,
    /// Seconds between broadcast ticks.
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_server_port(),
            listen: None,
            refresh_interval: default_refresh_interval(),
        }
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> String {
        self.listen
            .clone()
            .unwrap_or_else(|| format!("0.0.0.0:{}", self.port))
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval)
    }
}

/// Health thresholds and timeouts.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringConfig {
    /// LSN distance in bytes above which a slot is reported as lagging.
    #[serde(default = "default_lag_threshold")]
    pub lag_threshold: u64,
    /// Replay lag in seconds above which a slot is reported as lagging.
    #[serde(default)]
    pub lag_seconds_threshold: Option<f64>,
    /// Reserved; not consulted by the health classification.
    #[serde(default)]
    pub inactive_threshold: u64,
    /// Upper bound in seconds for polling a single database.
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout: u64,
    /// Upper bound in seconds for writing one snapshot to one subscriber.
    #[serde(default = "default_write_timeout")]
    pub write_timeout: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            lag_threshold: default_lag_threshold(),
            lag_seconds_threshold: None,
            inactive_threshold: 0,
            poll_timeout: default_poll_timeout(),
            write_timeout: default_write_timeout(),
        }
    }
}

impl MonitoringConfig {
    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            lag_bytes: self.lag_threshold,
            lag_seconds: self.lag_seconds_threshold,
            inactive_slot: self.inactive_threshold,
        }
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout)
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_db_port() -> u16 {
    5432
}

fn default_sslmode() -> String {
    "prefer".to_string()
}

fn default_server_port() -> u16 {
    8080
}

fn default_refresh_interval() -> u64 {
    5
}

fn default_lag_threshold() -> u64 {
    DEFAULT_LAG_BYTES_THRESHOLD
}

fn default_poll_timeout() -> u64 {
    10
}

fn default_write_timeout() -> u64 {
    5
}

impl MonitorConfig {
    /// Reads, parses and validates the YAML file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    /// Parses and validates YAML text.
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let config: MonitorConfig =
            serde_yaml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.refresh_interval == 0 {
            return Err(ConfigError::Invalid(
                "server.refresh_interval must be greater than 0".to_string(),
            ));
        }
        if self.monitoring.poll_timeout == 0 {
            return Err(ConfigError::Invalid(
                "monitoring.poll_timeout must be greater than 0".to_string(),
            ));
        }
        if self.monitoring.write_timeout == 0 {
            return Err(ConfigError::Invalid(
                "monitoring.write_timeout must be greater than 0".to_string(),
            ));
        }
        if let Some(limit) = self.monitoring.lag_seconds_threshold
            && (!limit.is_finite() || limit < 0.0)
        {
            return Err(ConfigError::Invalid(
                "monitoring.lag_seconds_threshold must be a non-negative number".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for db in &self.databases {
            if db.name.trim().is_empty() {
                return Err(ConfigError::Invalid("database name must not be empty".to_string()));
            }
            if !seen.insert(db.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate database name: {}",
                    db.name
                )));
            }
            if !matches!(db.sslmode.as_str(), "disable" | "prefer" | "require") {
                return Err(ConfigError::Invalid(format!(
                    "database {}: unsupported sslmode {:?}",
                    db.name, db.sslmode
                )));
            }
        }
        Ok(())
    }
}
