//! homedns: caching, filtering recursive-stub DNS server
//!
//! A small DNS server for home and edge networks. It answers from a local
//! resolution table when possible, forwards unknown names to upstream
//! resolvers (DNS-over-HTTPS first, classic UDP as fallback), caches the
//! answers, and refuses queries matching configured block patterns. An
//! admin HTTP endpoint exposes operational state and a cache-flush control.
//!
//! # Architecture
//!
//! ```text
//! Client → UDP:53 → Query Engine ──▶ Block check ──▶ 0.0.0.0
//!                        │
//!                        ├──▶ Resolution Table ── hit ──▶ cached answer
//!                        │
//!                        └──▶ Upstream Resolver (DoH → UDP) ──▶ answer
//!                                                │
//!                                     cache install (off-path)
//!
//! Control Plane: config reload (file watch) · blocklist fetch · admin HTTP
//! ```
//!
//! # Modules
//!
//! - [`config`]: configuration types and loading
//! - [`control`]: config reload, blocklist ingestion, shared-state wiring
//! - [`admin`]: admin HTTP endpoint
//! - [`engine`]: per-request query state machine
//! - [`error`]: error types
//! - [`matcher`]: exact/glob/regex domain pattern matching
//! - [`resolver`]: upstream resolver (DoH + classic UDP)
//! - [`server`]: UDP DNS listener
//! - [`stats`]: query statistics and metric ring
//! - [`table`]: the concurrent resolution table

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

pub mod admin;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod matcher;
pub mod resolver;
pub mod server;
pub mod stats;
pub mod table;

// Re-export commonly used types at the crate root
pub use admin::AdminState;
pub use config::{Config, DEFAULT_CONFIG_PATH};
pub use control::{ControlPlane, BLOCKLIST_URL};
pub use engine::{BlockMap, QueryEngine, WIRE_TTL};
pub use error::{DnsError, DnsResult};
pub use matcher::matches;
pub use resolver::{DnsResolver, DohClient, LookupOutcome, ResolvedAddress};
pub use server::DnsListener;
pub use stats::{Metric, MetricKind, Stats, StatsSnapshot};
pub use table::{Entry, HostsDump, ResolutionTable, BLOCKED_IP, NEVER_EXPIRES};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
