//! Upstream resolver
//!
//! Performs A-record lookups for single names against a pool of upstream
//! servers. DNS-over-HTTPS is tried first when configured; any DoH failure
//! falls through silently to classic DNS over UDP, which rotates through
//! the server list deterministically with a bounded retry budget.
//!
//! # Rotation and retries
//!
//! The classic path makes at most `2 × len(servers)` attempts per lookup.
//! Attempt `n` targets `servers[n mod len(servers)]`, so every server is
//! tried at least twice before the lookup gives up. Only timed-out attempts
//! are retried; a non-NOERROR response code fails the lookup immediately
//! and an empty answer section is a success with zero addresses (the caller
//! decides what that means).
//!
//! Each call is self-contained: the resolver shares nothing mutable, so the
//! control plane can swap in a rebuilt instance at any time.
//!
//! # Example
//!
//! ```no_run
//! use homedns::resolver::DnsResolver;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let resolver = DnsResolver::new(
//!     &["1.1.1.1".to_string(), "8.8.8.8".to_string()],
//!     Some("cloudflare-dns.com"),
//! )?;
//!
//! let outcome = resolver.lookup("example.com").await?;
//! println!("answered by {}", outcome.server);
//! # Ok(())
//! # }
//! ```

mod doh;
mod udp;

pub use doh::DohClient;
pub(crate) use doh::build_http_client;

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tracing::debug;

use crate::error::{DnsError, DnsResult};

/// Default well-known DNS port appended to bare server IPs
pub const DNS_PORT: u16 = 53;

/// Default per-attempt deadline for classic DNS
const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);

/// One resolved A record
#[derive(Debug, Clone)]
pub struct ResolvedAddress {
    /// IPv4 address literal
    pub address: String,
    /// TTL reported by the upstream, seconds
    pub ttl: u32,
    /// Record owner name as the upstream spelled it
    pub name: String,
}

/// Result of a lookup, including which server produced it
#[derive(Debug, Clone)]
pub struct LookupOutcome {
    /// A records from the answer; may be empty
    pub addresses: Vec<ResolvedAddress>,
    /// Concrete origin: a URL for DoH, `host:port` for UDP
    pub server: String,
}

/// Upstream resolver with DoH preference and rotating UDP fallback
#[derive(Debug)]
pub struct DnsResolver {
    servers: Vec<SocketAddr>,
    retry_budget: usize,
    attempt_timeout: Duration,
    doh: Option<DohClient>,
}

impl DnsResolver {
    /// Build a resolver from config-style server strings
    ///
    /// Bare IPs get port 53 appended; explicit `ip:port` entries are kept
    /// as-is. `doh_server` is the optional DoH host name tried first.
    ///
    /// # Errors
    ///
    /// Returns `DnsError::Config` for an entry that is neither an IP nor an
    /// `ip:port` pair, or for an invalid DoH host.
    pub fn new(servers: &[String], doh_server: Option<&str>) -> DnsResult<Self> {
        let mut parsed = Vec::with_capacity(servers.len());
        for server in servers {
            let addr = if let Ok(ip) = server.parse::<IpAddr>() {
                SocketAddr::new(ip, DNS_PORT)
            } else {
                server.parse::<SocketAddr>().map_err(|e| {
                    DnsError::config(format!("invalid upstream server '{server}': {e}"))
                })?
            };
            parsed.push(addr);
        }

        let doh = doh_server.map(DohClient::new).transpose()?;

        Ok(Self {
            retry_budget: parsed.len() * 2,
            servers: parsed,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            doh,
        })
    }

    /// Override the per-attempt deadline for classic DNS
    #[must_use]
    pub fn with_attempt_timeout(mut self, attempt_timeout: Duration) -> Self {
        self.attempt_timeout = attempt_timeout;
        self
    }

    /// Replace the DoH client, keeping the classic server list
    ///
    /// Lets callers point the DoH path at an explicit endpoint URL.
    #[must_use]
    pub fn with_doh_client(mut self, client: DohClient) -> Self {
        self.doh = Some(client);
        self
    }

    /// The parsed classic upstream servers, in rotation order
    #[must_use]
    pub fn servers(&self) -> &[SocketAddr] {
        &self.servers
    }

    /// Maximum classic attempts per lookup
    #[must_use]
    pub fn retry_budget(&self) -> usize {
        self.retry_budget
    }

    /// Whether a DoH endpoint is configured
    #[must_use]
    pub fn has_doh(&self) -> bool {
        self.doh.is_some()
    }

    /// Resolve the A records for `host` (dot-trimmed domain)
    ///
    /// # Errors
    ///
    /// Returns the last classic-DNS error when every attempt fails, or
    /// `DnsError::Config` when no upstream is configured at all. DoH errors
    /// are never surfaced; they fall through to classic DNS.
    pub async fn lookup(&self, host: &str) -> DnsResult<LookupOutcome> {
        if let Some(doh) = &self.doh {
            match doh.lookup(host).await {
                Ok(addresses) => {
                    return Ok(LookupOutcome {
                        addresses,
                        server: doh.server_id().to_string(),
                    });
                }
                Err(e) => {
                    debug!(host = %host, error = %e, "DoH lookup failed, falling back to classic DNS");
                }
            }
        }

        self.lookup_udp(host).await
    }

    /// Classic DNS with deterministic rotation and timeout-only retries
    async fn lookup_udp(&self, host: &str) -> DnsResult<LookupOutcome> {
        if self.servers.is_empty() {
            return Err(DnsError::config("no upstream DNS servers configured"));
        }

        let mut last_timeout = None;
        for attempt in 0..self.retry_budget {
            let server = self.servers[attempt % self.servers.len()];
            if attempt > 0 {
                debug!(
                    host = %host,
                    server = %server,
                    attempt = attempt + 1,
                    budget = self.retry_budget,
                    "retrying classic DNS query"
                );
            }

            match udp::exchange(server, host, self.attempt_timeout).await {
                Ok(addresses) => {
                    return Ok(LookupOutcome {
                        addresses,
                        server: server.to_string(),
                    });
                }
                Err(e) if e.is_timeout() => {
                    last_timeout = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_timeout
            .unwrap_or_else(|| DnsError::config("no upstream DNS servers configured")))
    }
}
