//! Service configuration.
//!
//! Loaded from TOML with per-field defaults; `WADDLE_PUBSUB_*` environment
//! variables override file values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use jid::BareJid;
use serde::Deserialize;
use tracing::info;

/// Lower bound of the write-behind flush interval.
pub const MIN_FLUSH_INTERVAL_SECS: u64 = 20;

/// Lower bound of the stored item purge interval.
pub const MIN_PURGE_INTERVAL_SECS: u64 = 60;

const ENV_PREFIX: &str = "WADDLE_PUBSUB_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration file not found at {path}")]
    FileNotFound { path: PathBuf },

    #[error("invalid TOML at line {line}, column {column}: {message}")]
    InvalidToml {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("I/O error reading configuration: {0}")]
    Io(#[from] std::io::Error),
}

/// Settings of one pubsub service.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Identifier the service stores its nodes under.
    pub service_id: String,
    /// JID of the service itself.
    pub address: String,
    /// Entities with full admin rights on every node.
    pub sysadmins: Vec<BareJid>,
    /// Only service admins may create nodes.
    pub node_creation_restricted: bool,
    /// Entities trusted to create nodes when creation is restricted.
    pub allowed_to_create: Vec<BareJid>,
    /// Whether an entity may hold several subscriptions to one node.
    pub multiple_subscriptions_enabled: bool,
    /// Owner of the root collection node; the service address when unset.
    pub root_creator: Option<String>,
    pub flush_interval_secs: u64,
    pub purge_interval_secs: u64,
    /// Queue depth that triggers an early flush.
    pub max_items_flush: usize,
    pub clustering_enabled: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            service_id: "pubsub".to_string(),
            address: "pubsub.localhost".to_string(),
            sysadmins: Vec::new(),
            node_creation_restricted: false,
            allowed_to_create: Vec::new(),
            multiple_subscriptions_enabled: true,
            root_creator: None,
            flush_interval_secs: 120,
            purge_interval_secs: 300,
            max_items_flush: 1000,
            clustering_enabled: false,
        }
    }
}

impl ServiceConfig {
    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.normalize()?;
        Ok(config)
    }

    /// Load from a TOML file, then apply environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConfigError::FileNotFound {
                    path: path.to_path_buf(),
                })
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };
        let mut config = Self::parse_toml(&contents)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.normalize()?;
        Ok(config)
    }

    /// Parse TOML without consulting the environment.
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let mut config = Self::parse_toml(toml_str)?;
        config.normalize()?;
        Ok(config)
    }

    fn parse_toml(toml_str: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml_str).map_err(|e| {
            let (line, column) = e.span().map_or((0, 0), |span| {
                let before = &toml_str[..span.start];
                let line = before.chars().filter(|&c| c == '\n').count() + 1;
                let column = before
                    .rfind('\n')
                    .map_or(span.start + 1, |nl| span.start - nl);
                (line, column)
            });
            ConfigError::InvalidToml {
                line,
                column,
                message: e.message().to_string(),
            }
        })
    }

    /// Apply `WADDLE_PUBSUB_<FIELD>` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(value) = var("SERVICE_ID") {
            self.service_id = value;
        }
        if let Some(value) = var("ADDRESS") {
            self.address = value;
        }
        if let Some(value) = var("SYSADMINS") {
            self.sysadmins = parse_jid_list("sysadmins", &value)?;
        }
        if let Some(value) = var("NODE_CREATION_RESTRICTED") {
            self.node_creation_restricted = parse_flag("node_creation_restricted", &value)?;
        }
        if let Some(value) = var("ALLOWED_TO_CREATE") {
            self.allowed_to_create = parse_jid_list("allowed_to_create", &value)?;
        }
        if let Some(value) = var("MULTIPLE_SUBSCRIPTIONS_ENABLED") {
            self.multiple_subscriptions_enabled =
                parse_flag("multiple_subscriptions_enabled", &value)?;
        }
        if let Some(value) = var("ROOT_CREATOR") {
            self.root_creator = Some(value);
        }
        if let Some(value) = var("FLUSH_INTERVAL_SECS") {
            self.flush_interval_secs = parse_number("flush_interval_secs", &value)?;
        }
        if let Some(value) = var("PURGE_INTERVAL_SECS") {
            self.purge_interval_secs = parse_number("purge_interval_secs", &value)?;
        }
        if let Some(value) = var("MAX_ITEMS_FLUSH") {
            self.max_items_flush = parse_number("max_items_flush", &value)?;
        }
        if let Some(value) = var("CLUSTERING_ENABLED") {
            self.clustering_enabled = parse_flag("clustering_enabled", &value)?;
        }
        Ok(())
    }

    /// Clamp intervals to their lower bounds and check the JID settings.
    fn normalize(&mut self) -> Result<(), ConfigError> {
        self.flush_interval_secs = self.flush_interval_secs.max(MIN_FLUSH_INTERVAL_SECS);
        self.purge_interval_secs = self.purge_interval_secs.max(MIN_PURGE_INTERVAL_SECS);
        self.max_items_flush = self.max_items_flush.max(1);
        self.address()?;
        self.root_creator()?;
        Ok(())
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs.max(MIN_FLUSH_INTERVAL_SECS))
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs.max(MIN_PURGE_INTERVAL_SECS))
    }

    /// JID of the service.
    pub fn address(&self) -> Result<BareJid, ConfigError> {
        parse_jid("address", &self.address)
    }

    /// Owner of the root collection node.
    pub fn root_creator(&self) -> Result<BareJid, ConfigError> {
        match &self.root_creator {
            Some(creator) => parse_jid("root_creator", creator),
            None => self.address(),
        }
    }

    /// Log the effective configuration.
    pub fn log_config(&self) {
        info!("PubSub service: {} ({})", self.service_id, self.address);
        info!("Service admins: {}", self.sysadmins.len());
        if self.node_creation_restricted {
            info!(
                "Node creation: restricted ({} trusted creators)",
                self.allowed_to_create.len()
            );
        } else {
            info!("Node creation: open");
        }
        info!(
            "Multiple subscriptions: {}",
            if self.multiple_subscriptions_enabled {
                "enabled"
            } else {
                "disabled"
            }
        );
        info!(
            "Item flush every {}s or at {} pending writes",
            self.flush_interval_secs, self.max_items_flush
        );
        info!("Stored item purge every {}s", self.purge_interval_secs);
        info!(
            "Clustering: {}",
            if self.clustering_enabled {
                "enabled"
            } else {
                "disabled"
            }
        );
    }
}

fn parse_jid(field: &str, value: &str) -> Result<BareJid, ConfigError> {
    value.trim().parse().map_err(|e: jid::Error| ConfigError::InvalidValue {
        field: field.to_string(),
        message: e.to_string(),
    })
}

fn parse_jid_list(field: &str, value: &str) -> Result<Vec<BareJid>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| parse_jid(field, s))
        .collect()
}

fn parse_flag(field: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            field: field.to_string(),
            message: format!("expected a boolean, got '{value}'"),
        }),
    }
}

fn parse_number<T: std::str::FromStr>(field: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue {
            field: field.to_string(),
            message: e.to_string(),
        })
}
