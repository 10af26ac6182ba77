//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Load config → Open store → Build pool, proxies, tracker, inventory
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Broadcast → Background loops exit → Report held sessions
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then store, then services
//! - Shutdown has a timeout: forced exit after the deadline

pub mod shutdown;
pub mod signals;
pub mod startup;
