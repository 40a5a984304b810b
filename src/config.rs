//! Process configuration for the relay binary.
//!
//! Precedence: CLI arguments, then environment variables, then the optional
//! TOML config file, then built-in defaults.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use serde::Deserialize;

use crate::envelope::{EnvelopeShapeValidator, JsonSchemaValidator, PayloadValidator};
use crate::relay::{RelayConfig, DEFAULT_MAX_CONNECTIONS, DEFAULT_QUEUE_CAPACITY};

pub const DEFAULT_BIND: &str = "0.0.0.0:7502";

/// Real-time message relay: clients connect with `?clientID=<id>` and
/// address each other by id.
#[derive(Parser, Debug, Default)]
#[command(name = "postoffice-relay", version, about)]
pub struct Cli {
    /// Listen address [env: POSTOFFICE_BIND] [default: 0.0.0.0:7502]
    #[arg(long, short = 'b')]
    pub bind: Option<String>,

    /// Maximum concurrent connections [env: POSTOFFICE_MAX_CONNECTIONS] [default: 20000]
    #[arg(long, short = 'm')]
    pub max_connections: Option<usize>,

    /// Per-connection inbound queue capacity [env: POSTOFFICE_QUEUE_CAPACITY] [default: 100]
    #[arg(long)]
    pub queue_capacity: Option<usize>,

    /// Drop frames whose from/to/type fields have the wrong shape
    /// [env: POSTOFFICE_VALIDATE_ENVELOPES]
    #[arg(long)]
    pub validate_envelopes: bool,

    /// JSON Schema every inbound frame must satisfy [env: POSTOFFICE_SCHEMA]
    #[arg(long, short = 's')]
    pub schema: Option<PathBuf>,

    /// TOML config file [env: POSTOFFICE_CONFIG]
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,
}

/// Settings accepted in the TOML config file. All optional.
#[derive(Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub bind: Option<String>,
    pub max_connections: Option<usize>,
    pub queue_capacity: Option<usize>,
    pub validate_envelopes: Option<bool>,
    pub schema: Option<PathBuf>,
}

#[derive(Debug)]
pub enum ConfigError {
    Io(PathBuf, std::io::Error),
    Toml(PathBuf, String),
    Schema(PathBuf, String),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(path, e) => write!(f, "cannot read {}: {e}", path.display()),
            ConfigError::Toml(path, e) => write!(f, "invalid config {}: {e}", path.display()),
            ConfigError::Schema(path, e) => write!(f, "invalid schema {}: {e}", path.display()),
            ConfigError::Invalid(e) => write!(f, "invalid setting: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        toml::from_str(&contents).map_err(|e| ConfigError::Toml(path.to_path_buf(), e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind_addr: String,
    pub max_connections: usize,
    pub queue_capacity: usize,
    pub validate_envelopes: bool,
    pub schema: Option<PathBuf>,
}

impl Config {
    pub fn from_cli_and_env(cli: Cli) -> Result<Self, ConfigError> {
        Self::resolve(cli, |key| std::env::var(key).ok())
    }

    /// Same as [`from_cli_and_env`](Self::from_cli_and_env) with an explicit
    /// environment lookup.
    pub fn resolve(cli: Cli, env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let config_path = cli
            .config
            .or_else(|| env("POSTOFFICE_CONFIG").map(PathBuf::from));
        let file = match config_path {
            Some(path) => FileConfig::load(&path)?,
            None => FileConfig::default(),
        };

        let bind_addr = cli
            .bind
            .or_else(|| env("POSTOFFICE_BIND"))
            .or(file.bind)
            .unwrap_or_else(|| DEFAULT_BIND.to_string());

        let max_connections = match cli.max_connections {
            Some(n) => n,
            None => match env("POSTOFFICE_MAX_CONNECTIONS") {
                Some(raw) => parse_env("POSTOFFICE_MAX_CONNECTIONS", &raw)?,
                None => file.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS),
            },
        };

        let queue_capacity = match cli.queue_capacity {
            Some(n) => n,
            None => match env("POSTOFFICE_QUEUE_CAPACITY") {
                Some(raw) => parse_env("POSTOFFICE_QUEUE_CAPACITY", &raw)?,
                None => file.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY),
            },
        };
        if queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "queue capacity must be at least 1".to_string(),
            ));
        }

        let validate_envelopes = cli.validate_envelopes
            || env("POSTOFFICE_VALIDATE_ENVELOPES")
                .map(|v| matches!(v.trim(), "1" | "true" | "yes" | "on"))
                .unwrap_or(false)
            || file.validate_envelopes.unwrap_or(false);

        let schema = cli
            .schema
            .or_else(|| env("POSTOFFICE_SCHEMA").map(PathBuf::from))
            .or(file.schema);

        Ok(Self {
            bind_addr,
            max_connections,
            queue_capacity,
            validate_envelopes,
            schema,
        })
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            max_connections: self.max_connections,
            queue_capacity: self.queue_capacity,
            ..RelayConfig::default()
        }
    }

    /// Build the frame validator this configuration asks for. A schema file
    /// takes precedence over the built-in envelope shape check.
    pub fn payload_validator(&self) -> Result<Option<Arc<dyn PayloadValidator>>, ConfigError> {
        if let Some(path) = &self.schema {
            return Ok(Some(Arc::new(load_schema(path)?)));
        }
        if self.validate_envelopes {
            return Ok(Some(Arc::new(EnvelopeShapeValidator)));
        }
        Ok(None)
    }
}

fn load_schema(path: &Path) -> Result<JsonSchemaValidator, ConfigError> {
    let contents =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
    let document: serde_json::Value = serde_json::from_str(&contents)
        .map_err(|e| ConfigError::Schema(path.to_path_buf(), e.to_string()))?;
    JsonSchemaValidator::new(&document).map_err(|e| ConfigError::Schema(path.to_path_buf(), e))
}

fn parse_env(key: &str, raw: &str) -> Result<usize, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{key}={raw} is not a number")))
}
