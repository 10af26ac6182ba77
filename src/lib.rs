//! Health-check resource coordinator library.
//!
//! Mediates access to the scarce resources a fleet-wide health check needs:
//! a pool of login credentials time-shared across check sessions, a set of
//! forward proxies with failover, and per-node check state.

// Core subsystems
pub mod error;
pub mod inventory;
pub mod pool;
pub mod proxy;
pub mod status;
pub mod store;

// Orchestration
pub mod coordinator;

// Cross-cutting concerns
pub mod config;
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use config::schema::CoordinatorConfig;
pub use coordinator::{CheckExecutor, CheckScheduler, CheckWorkflow, StaleSessionReaper};
pub use error::{HcError, HcResult};
pub use lifecycle::shutdown::Shutdown;
pub use lifecycle::startup::Services;
pub use pool::{Credential, CredentialPool};
pub use proxy::{Proxy, ProxySelector};
pub use status::{NodeStatus, NodeStatusTracker};
pub use store::Database;
