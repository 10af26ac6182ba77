//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML, optional)
//!     → loader.rs (parse & deserialize)
//!     → environment overrides (DB_PATH, HC_POLL_INTERVAL, HC_MAX_WAIT, ...)
//!     → validation.rs (semantic checks)
//!     → CoordinatorConfig (validated)
//!     → shared via Arc<ArcSwap<_>> to pool and coordinator
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → atomic swap of the shared config
//!     → pool timings and admission cap observe new values on next use
//! ```
//!
//! # Design Decisions
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - Store location is read once at startup

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

use std::sync::Arc;

use arc_swap::ArcSwap;

pub use schema::{
    CheckConfig, CoordinatorConfig, DatabaseConfig, ObservabilityConfig, PoolConfig,
    StatusConfig, TransitionPolicy,
};

/// Live configuration handle, swapped atomically on reload.
pub type SharedConfig = Arc<ArcSwap<CoordinatorConfig>>;

/// Wrap a config for sharing.
pub fn shared(config: CoordinatorConfig) -> SharedConfig {
    Arc::new(ArcSwap::from_pointee(config))
}
