//! Proxy selection subsystem.
//!
//! # Data Flow
//! ```text
//! Check workflow needs a relay
//!     → selector.rs select_proxy() (active, lowest priority value)
//!     or with_failover() (walk list_active() until one attempt succeeds)
//!     → external check runs through the proxy
//!     → record_success / record_failure (single UPDATE, success rate recomputed)
//! ```
//!
//! # Design Decisions
//! - No cached ordering: administrative changes apply on the next call
//! - Outcome recording is advisory bookkeeping, never blocks acquisition
//! - Recording against a vanished proxy is a silent no-op

pub mod selector;

pub use selector::{NewProxy, Proxy, ProxySelector};
