//! Startup orchestration.
//!
//! Builds every service over one store handle, in dependency order.
//! Any failure here is fatal to the caller.

use std::sync::Arc;

use crate::config::{shared, CoordinatorConfig, SharedConfig};
use crate::error::HcResult;
use crate::inventory::SqliteInventory;
use crate::pool::CredentialPool;
use crate::proxy::ProxySelector;
use crate::status::NodeStatusTracker;
use crate::store::Database;

/// The coordinator's services, sharing one store and one live config.
#[derive(Clone)]
pub struct Services {
    pub config: SharedConfig,
    pub db: Database,
    pub pool: Arc<CredentialPool>,
    pub proxies: ProxySelector,
    pub tracker: NodeStatusTracker,
    pub inventory: Arc<SqliteInventory>,
}

impl Services {
    /// Open the configured database and build services over it.
    pub fn start(config: CoordinatorConfig) -> HcResult<Self> {
        let db = Database::open(&config.database.path)?;
        Ok(Self::with_database(db, config))
    }

    /// Build services over an already opened store.
    pub fn with_database(db: Database, config: CoordinatorConfig) -> Self {
        let policy = config.status.transition_policy;
        let config = shared(config);
        tracing::debug!(transition_policy = ?policy, "Building coordinator services");

        Self {
            pool: Arc::new(CredentialPool::new(db.clone(), config.clone())),
            proxies: ProxySelector::new(db.clone()),
            tracker: NodeStatusTracker::new(db.clone(), config.clone()),
            inventory: Arc::new(SqliteInventory::new(db.clone())),
            config,
            db,
        }
    }
}
