//! Configuration types and loading
//!
//! The config file is JSON at a fixed path (default `/config.json`):
//!
//! ```json
//! {
//!   "hosts":   { "router.lan.": "192.168.1.1", "*.lan.": "192.168.1.1" },
//!   "blocks":  { "*.doubleclick.net.": true },
//!   "servers": [ "1.1.1.1", "8.8.8.8" ],
//!   "dohServer": "cloudflare-dns.com",
//!   "dumpFile": "/app/hosts.txt"
//! }
//! ```
//!
//! `hosts` keys and `blocks` keys follow the [`crate::matcher`] pattern
//! rules. `servers` entries are bare IPs (port 53 is appended by the
//! resolver) or explicit `ip:port` pairs. `dohServer` and `dumpFile` are
//! optional.
//!
//! The loaded value is immutable; reloads build a fresh [`Config`] and the
//! control plane swaps derived state wholesale.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{DnsError, DnsResult};

/// Default config file location
pub const DEFAULT_CONFIG_PATH: &str = "/config.json";

/// Immutable configuration value object
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Static name-to-address mappings; keys may be patterns
    #[serde(default)]
    pub hosts: HashMap<String, String>,

    /// Block patterns; a `false` value keeps the pattern listed but inactive
    #[serde(default)]
    pub blocks: HashMap<String, bool>,

    /// Ordered classic upstream servers
    #[serde(default, rename = "servers")]
    pub dns_servers: Vec<String>,

    /// Optional DNS-over-HTTPS endpoint host, tried before classic DNS
    #[serde(
        default,
        rename = "dohServer",
        skip_serializing_if = "Option::is_none"
    )]
    pub doh_server: Option<String>,

    /// Optional hosts-file debug sink path
    #[serde(
        default,
        rename = "dumpFile",
        skip_serializing_if = "Option::is_none"
    )]
    pub dump_file: Option<PathBuf>,
}

impl Config {
    /// Read and parse the config file at `path`
    ///
    /// # Errors
    ///
    /// Returns `DnsError::Config` when the file cannot be read or is not
    /// valid JSON.
    pub fn load(path: &Path) -> DnsResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            DnsError::config_io(format!("failed to read {}", path.display()), e)
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            DnsError::config(format!("failed to parse {}: {e}", path.display()))
        })
    }

    /// Validate addresses without building anything
    ///
    /// # Errors
    ///
    /// Returns `DnsError::Config` for a host value that is not an IPv4
    /// literal or a server entry that is neither an IP nor `ip:port`.
    pub fn validate(&self) -> DnsResult<()> {
        for (name, ip) in &self.hosts {
            if ip.parse::<std::net::Ipv4Addr>().is_err() {
                return Err(DnsError::config(format!(
                    "host '{name}' maps to '{ip}', which is not an IPv4 address"
                )));
            }
        }
        for server in &self.dns_servers {
            let bare = server.parse::<IpAddr>().is_ok();
            let with_port = server.parse::<SocketAddr>().is_ok();
            if !bare && !with_port {
                return Err(DnsError::config(format!(
                    "upstream server '{server}' is not an IP address"
                )));
            }
        }
        Ok(())
    }
}
