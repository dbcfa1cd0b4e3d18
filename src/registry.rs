use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use ulid::Ulid;

use crate::config::{Config, CoordinatorConfig, VenueConfig};
use crate::engine::{ConfirmRequest, Engine, EngineError};
use crate::graph::{GraphError, PlannerOptions, TableGraph};
use crate::limits::*;
use crate::maintenance;
use crate::model::{Assignment, Ms};
use crate::notify::NotifyHub;
use crate::outbox::OutboxSink;
use crate::policy::{PolicyError, VenuePolicy};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("restaurant {0} is already registered")]
    Duplicate(Ulid),
    #[error("too many restaurants")]
    LimitExceeded,
    #[error("restaurant name too long")]
    NameTooLong,
    #[error("invalid policy: {0}")]
    Policy(#[from] PolicyError),
    #[error("invalid floor plan: {0}")]
    Layout(#[from] GraphError),
    #[error("failed to open store: {0}")]
    Store(#[from] std::io::Error),
}

/// Per-restaurant knobs derived from the service configuration.
#[derive(Debug, Clone)]
pub struct VenueSettings {
    pub hold_ttl_ms: Ms,
    pub planner: PlannerOptions,
    pub allow_backdating: bool,
    pub past_grace_minutes: u32,
    pub coordinator: CoordinatorConfig,
    pub auto_assign: bool,
}

impl VenueSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            hold_ttl_ms: (config.engine.hold_ttl_secs as Ms * 1000).clamp(1, MAX_HOLD_TTL_MS),
            planner: config.engine.planner_options(),
            allow_backdating: config.engine.allow_backdating,
            past_grace_minutes: config.engine.past_grace_minutes,
            coordinator: config.coordinator.clone(),
            auto_assign: config.features.auto_assign,
        }
    }
}

/// One restaurant's runtime: store, floor plan, and current policy.
pub struct Venue {
    pub id: Ulid,
    pub name: String,
    pub engine: Arc<Engine>,
    pub graph: Arc<TableGraph>,
    pub settings: VenueSettings,
    policy: RwLock<Arc<VenuePolicy>>,
}

impl Venue {
    pub fn new(
        venue: &VenueConfig,
        settings: VenueSettings,
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
    ) -> Result<Self, RegistryError> {
        if venue.name.len() > MAX_NAME_LEN {
            return Err(RegistryError::NameTooLong);
        }
        venue.policy.validate()?;
        let graph = Arc::new(TableGraph::new(venue.zones.clone(), venue.tables.clone())?);
        let engine = Arc::new(Engine::new(venue.id, wal_path, graph.clone(), notify)?);
        Ok(Self {
            id: venue.id,
            name: venue.name.clone(),
            engine,
            graph,
            settings,
            policy: RwLock::new(Arc::new(venue.policy.clone())),
        })
    }

    /// Snapshot of the policy in force.
    pub async fn policy(&self) -> Arc<VenuePolicy> {
        self.policy.read().await.clone()
    }

    /// Install a new policy. Its version is bumped past the current one so
    /// holds quoted under the old policy fail with policy drift.
    pub async fn replace_policy(&self, mut policy: VenuePolicy) -> Result<u32, PolicyError> {
        policy.validate()?;
        let mut current = self.policy.write().await;
        policy.version = policy.version.max(current.version + 1);
        let version = policy.version;
        *current = Arc::new(policy);
        info!(restaurant_id = %self.id, version, "venue policy replaced");
        Ok(version)
    }
}

/// All loaded restaurants. Each gets its own engine, WAL file and maintainers.
pub struct Registry {
    venues: DashMap<Ulid, Arc<Venue>>,
    data_dir: PathBuf,
    config: Arc<Config>,
    sink: Arc<dyn OutboxSink>,
    notify: Arc<NotifyHub>,
    shutdown: CancellationToken,
}

impl Registry {
    pub fn new(config: Arc<Config>, sink: Arc<dyn OutboxSink>) -> Self {
        Self {
            venues: DashMap::new(),
            data_dir: config.server.data_dir.clone(),
            config,
            sink,
            notify: Arc::new(NotifyHub::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Build a registry with every restaurant listed in `config`.
    pub fn from_config(config: Arc<Config>, sink: Arc<dyn OutboxSink>) -> Result<Self, RegistryError> {
        std::fs::create_dir_all(&config.server.data_dir)?;
        let registry = Self::new(config.clone(), sink);
        if !config.engine.require_adjacency {
            warn!("engine.require_adjacency is off: merges may combine tables that are not next to each other");
        }
        for venue in &config.restaurants {
            registry.register(venue)?;
        }
        Ok(registry)
    }

    pub fn register(&self, venue: &VenueConfig) -> Result<Arc<Venue>, RegistryError> {
        if self.venues.contains_key(&venue.id) {
            return Err(RegistryError::Duplicate(venue.id));
        }
        if self.venues.len() >= MAX_RESTAURANTS {
            return Err(RegistryError::LimitExceeded);
        }
        let wal_path = self.data_dir.join(format!("{}.wal", venue.id));
        let settings = VenueSettings::from_config(&self.config);
        let runtime = Arc::new(Venue::new(venue, settings, wal_path, self.notify.clone())?);
        self.venues.insert(venue.id, runtime.clone());
        metrics::gauge!(crate::observability::RESTAURANTS_ACTIVE).set(self.venues.len() as f64);
        info!(restaurant_id = %venue.id, name = %venue.name, tables = runtime.graph.len(), "restaurant loaded");
        Ok(runtime)
    }

    pub fn get(&self, id: &Ulid) -> Option<Arc<Venue>> {
        self.venues.get(id).map(|v| v.value().clone())
    }

    pub fn venues(&self) -> Vec<Arc<Venue>> {
        let mut out: Vec<Arc<Venue>> = self.venues.iter().map(|v| v.value().clone()).collect();
        out.sort_by_key(|v| v.id);
        out
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn sink(&self) -> Arc<dyn OutboxSink> {
        self.sink.clone()
    }

    pub fn notify(&self) -> &Arc<NotifyHub> {
        &self.notify
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Spawn the periodic maintainers for every restaurant.
    pub fn start_maintainers(&self) {
        if !self.config.maintenance.enabled {
            info!("in-process maintenance disabled");
            return;
        }
        for venue in self.venues() {
            maintenance::spawn_all(venue, self.sink.clone(), &self.config, self.shutdown.clone());
        }
    }

    /// Stop maintainers. In-flight passes finish their current item.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Confirm a hold looked up by id across every restaurant.
    ///
    /// A booking that lives in another restaurant than the hold is reported
    /// as a restaurant mismatch, not as a missing booking.
    pub async fn confirm_hold(
        &self,
        hold_id: Ulid,
        booking_id: Ulid,
        table_ids: Option<Vec<Ulid>>,
    ) -> Result<Assignment, EngineError> {
        let venues = self.venues();
        let holder = venues
            .iter()
            .find(|v| v.engine.hold(&hold_id).is_some())
            .ok_or(EngineError::HoldNotFound(hold_id))?;

        if holder.engine.booking(&booking_id).is_none()
            && let Some(other) = venues
                .iter()
                .find(|v| v.engine.booking(&booking_id).is_some())
        {
            return Err(EngineError::HoldRestaurantMismatch {
                hold_id,
                hold_restaurant: holder.id,
                booking_restaurant: other.id,
            });
        }

        let policy_version = holder.policy().await.version;
        holder
            .engine
            .confirm_hold(
                hold_id,
                ConfirmRequest {
                    booking_id,
                    table_ids,
                    policy_version,
                },
            )
            .await
    }
}
