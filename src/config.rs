//! Service configuration.
//!
//! Built once at startup from, in increasing precedence: `tablewise.yaml` in
//! the working directory (optional), the file named by `TABLEWISE_CONFIG` or
//! passed on the command line, and `TABLEWISE__SECTION__KEY` environment
//! variables. Components receive the sections they need; nothing reads the
//! environment after [`Config::load`].

use std::path::PathBuf;

use ::config::{Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::graph::PlannerOptions;
use crate::model::{Table, Zone};
use crate::policy::VenuePolicy;

pub const CONFIG_ENV_VAR: &str = "TABLEWISE_CONFIG";
pub const CONFIG_ENV_PREFIX: &str = "TABLEWISE";
pub const DEFAULT_CONFIG_FILE: &str = "tablewise";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),
    #[error("restaurant {id}: {reason}")]
    Restaurant { id: Ulid, reason: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub engine: EngineConfig,
    pub coordinator: CoordinatorConfig,
    pub maintenance: MaintenanceConfig,
    pub features: FeatureFlags,
    pub log: LogConfig,
    pub restaurants: Vec<VenueConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// Prometheus exporter port. Disabled when unset.
    pub metrics_port: Option<u16>,
    pub data_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".into(),
            metrics_port: None,
            data_dir: PathBuf::from("./data"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub hold_ttl_secs: u64,
    /// Off is a degraded mode: merged tables need only share a zone.
    pub require_adjacency: bool,
    pub max_tables_per_merge: usize,
    pub max_overage: Option<u32>,
    pub max_evaluations: usize,
    pub allow_backdating: bool,
    pub past_grace_minutes: u32,
    /// WAL appends before the compactor rewrites the log.
    pub compact_threshold: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hold_ttl_secs: 120,
            require_adjacency: true,
            max_tables_per_merge: 3,
            max_overage: None,
            max_evaluations: 500,
            allow_backdating: false,
            past_grace_minutes: 5,
            compact_threshold: 1000,
        }
    }
}

impl EngineConfig {
    pub fn planner_options(&self) -> PlannerOptions {
        PlannerOptions {
            require_adjacency: self.require_adjacency,
            lock_zone: true,
            max_tables: self.max_tables_per_merge,
            max_overage: self.max_overage,
            max_evaluations: self.max_evaluations,
        }
    }
}

/// What auto-assignment does once every candidate is exhausted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnExhausted {
    /// Report no capacity; the booking stays as it was.
    #[default]
    Fail,
    /// Move the booking to `pending_allocation` for a later retry.
    Defer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub timeout_ms: u64,
    pub max_attempts: usize,
    pub on_exhausted: OnExhausted,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 3000,
            max_attempts: 8,
            on_exhausted: OnExhausted::Fail,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Run maintainers inside the service process.
    pub enabled: bool,
    pub sweep_interval_secs: u64,
    pub prune_interval_secs: u64,
    pub outbox_interval_secs: u64,
    pub retry_interval_secs: u64,
    pub compact_interval_secs: u64,
    pub batch_size: usize,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sweep_interval_secs: 5,
            prune_interval_secs: 60,
            outbox_interval_secs: 2,
            retry_interval_secs: 30,
            compact_interval_secs: 10,
            batch_size: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    /// Assign tables synchronously when a booking is created.
    pub auto_assign: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self { auto_assign: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub json: bool,
    /// `EnvFilter` directive; `RUST_LOG` overrides it.
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            json: false,
            filter: "tablewise=info,tower_http=info".into(),
        }
    }
}

/// One restaurant: identity, policy and floor plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueConfig {
    pub id: Ulid,
    pub name: String,
    #[serde(default)]
    pub policy: VenuePolicy,
    #[serde(default)]
    pub zones: Vec<Zone>,
    #[serde(default)]
    pub tables: Vec<Table>,
}

impl Config {
    /// Load layered configuration. `path` is an explicit file that must exist.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ::config::Config::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }
        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config: Config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML document with no other sources.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Config = ::config::Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for venue in &self.restaurants {
            if !seen.insert(venue.id) {
                return Err(ConfigError::Restaurant {
                    id: venue.id,
                    reason: "listed twice".into(),
                });
            }
            venue.policy.validate().map_err(|e| ConfigError::Restaurant {
                id: venue.id,
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }
}
