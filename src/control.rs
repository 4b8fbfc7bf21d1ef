//! Control plane
//!
//! Everything that mutates the server's shared state while queries are in
//! flight: applying the config file (at startup and on file-change events),
//! ingesting the remote blocklist, and exposing the pieces the admin
//! endpoint needs.
//!
//! Reload is a merge, not a reset: static hosts are re-stored (request
//! counters survive), the resolver is rebuilt and swapped whole, the block
//! map is replaced atomically, and dynamic cache entries are left in place.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::{ArcSwap, ArcSwapOption};
use bytes::Bytes;
use http::{header, Method, Request, Uri};
use http_body_util::{BodyExt, Full};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::engine::BlockMap;
use crate::error::{DnsError, DnsResult};
use crate::resolver::{build_http_client, DnsResolver};
use crate::table::{Entry, HostsDump, ResolutionTable};

/// Remote blocklist location
pub const BLOCKLIST_URL: &str = "https://api.keith.sh/ls.json";

/// Deadline for the blocklist fetch
pub const BLOCKLIST_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Startup delay before the one-shot blocklist fetch
const BLOCKLIST_STARTUP_DELAY: Duration = Duration::from_secs(1);

/// Settle time after a file-change notification before reloading
const RELOAD_DEBOUNCE: Duration = Duration::from_millis(200);

/// Owner of the mutable server state
pub struct ControlPlane {
    config_path: PathBuf,
    table: Arc<ResolutionTable>,
    blocks: Arc<ArcSwap<BlockMap>>,
    resolver: Arc<ArcSwap<DnsResolver>>,
    dump: Arc<ArcSwapOption<HostsDump>>,
}

impl ControlPlane {
    /// Wire up the control plane over the shared state
    #[must_use]
    pub fn new(
        config_path: PathBuf,
        table: Arc<ResolutionTable>,
        blocks: Arc<ArcSwap<BlockMap>>,
        resolver: Arc<ArcSwap<DnsResolver>>,
        dump: Arc<ArcSwapOption<HostsDump>>,
    ) -> Self {
        Self {
            config_path,
            table,
            blocks,
            resolver,
            dump,
        }
    }

    /// Read, validate, and apply the config file
    ///
    /// # Errors
    ///
    /// Returns `DnsError::Config` when the file cannot be read, parsed, or
    /// validated; previously applied state is untouched in that case.
    pub fn load_and_apply(&self) -> DnsResult<()> {
        let config = Config::load(&self.config_path)?;
        config.validate()?;
        self.apply(&config)
    }

    /// Apply a parsed config to the live state
    ///
    /// # Errors
    ///
    /// Returns `DnsError::Config` when the resolver cannot be built from
    /// the server list; nothing is swapped in that case.
    pub fn apply(&self, config: &Config) -> DnsResult<()> {
        // Build before swapping anything, so a bad server list leaves the
        // previous resolver in service.
        let resolver = DnsResolver::new(&config.dns_servers, config.doh_server.as_deref())?;

        for (name, ip) in &config.hosts {
            self.table.store(Entry::static_host(name.as_str(), ip.as_str()));
        }
        self.blocks.store(Arc::new(config.blocks.clone()));
        self.resolver.store(Arc::new(resolver));
        self.dump.store(
            config
                .dump_file
                .as_ref()
                .map(|path| Arc::new(HostsDump::new(path))),
        );

        if let Some(dump) = self.dump.load_full() {
            if let Err(e) = dump.write(&self.table) {
                warn!(path = %dump.path().display(), error = %e, "hosts dump write failed");
            }
        }

        info!(
            hosts = config.hosts.len(),
            blocks = config.blocks.len(),
            servers = config.dns_servers.len(),
            doh = config.doh_server.is_some(),
            "configuration applied"
        );
        Ok(())
    }

    /// Watch the config file and reload on change
    ///
    /// Reload failures keep the previous configuration in service.
    ///
    /// # Errors
    ///
    /// Returns `DnsError::Config` when the watcher cannot be created or the
    /// config path cannot be watched (e.g. the file does not exist yet).
    pub fn spawn_watcher(self: &Arc<Self>) -> DnsResult<()> {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<()>(8);

        let mut watcher = notify::recommended_watcher(move |result: Result<Event, notify::Error>| {
            match result {
                Ok(event) => {
                    if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                        let _ = tx.blocking_send(());
                    }
                }
                Err(e) => debug!(error = %e, "config watch event error"),
            }
        })
        .map_err(|e| DnsError::config(format!("failed to create config watcher: {e}")))?;

        watcher
            .watch(&self.config_path, RecursiveMode::NonRecursive)
            .map_err(|e| {
                DnsError::config(format!(
                    "failed to watch {}: {e}",
                    self.config_path.display()
                ))
            })?;

        let control = Arc::clone(self);
        tokio::spawn(async move {
            // The watcher stops when dropped; park it in this task.
            let _watcher = watcher;
            while rx.recv().await.is_some() {
                tokio::time::sleep(RELOAD_DEBOUNCE).await;
                while rx.try_recv().is_ok() {}

                info!(path = %control.config_path.display(), "config file changed, reloading");
                if let Err(e) = control.load_and_apply() {
                    error!(error = %e, "config reload failed, keeping previous config");
                }
            }
        });

        Ok(())
    }

    /// Fetch the remote blocklist once, shortly after startup
    ///
    /// Failures are logged; the server keeps running without the list.
    pub fn spawn_blocklist_fetch(self: &Arc<Self>) {
        let control = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(BLOCKLIST_STARTUP_DELAY).await;
            match control.ingest_blocklist(BLOCKLIST_URL).await {
                Ok(count) => info!(patterns = count, "blocklist ingested"),
                Err(e) => warn!(error = %e, "blocklist fetch failed, continuing without it"),
            }
        });
    }

    /// Fetch a JSON array of host names and install block patterns
    ///
    /// Each name becomes a pattern-keyed entry covering the host and all of
    /// its subdomains.
    ///
    /// # Errors
    ///
    /// Returns `DnsError::Timeout`, `DnsError::Transport`, or
    /// `DnsError::Parse` when the list cannot be fetched or decoded.
    pub async fn ingest_blocklist(&self, url: &str) -> DnsResult<usize> {
        let uri: Uri = url
            .parse()
            .map_err(|e| DnsError::transport(format!("invalid blocklist URL '{url}': {e}")))?;

        let request = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header(header::ACCEPT, "application/json")
            .body(Full::new(Bytes::new()))
            .map_err(|e| DnsError::transport(format!("failed to build blocklist request: {e}")))?;

        let client = build_http_client();
        let response = timeout(BLOCKLIST_FETCH_TIMEOUT, client.request(request))
            .await
            .map_err(|_| DnsError::timeout(format!("blocklist fetch from {url}"), BLOCKLIST_FETCH_TIMEOUT))?
            .map_err(|e| DnsError::transport(format!("blocklist fetch failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DnsError::transport(format!(
                "blocklist endpoint returned HTTP {status}"
            )));
        }

        let body = timeout(BLOCKLIST_FETCH_TIMEOUT, response.into_body().collect())
            .await
            .map_err(|_| DnsError::timeout(format!("blocklist body from {url}"), BLOCKLIST_FETCH_TIMEOUT))?
            .map_err(|e| DnsError::transport(format!("failed to read blocklist body: {e}")))?
            .to_bytes();

        let hosts: Vec<String> = serde_json::from_slice(&body)
            .map_err(|e| DnsError::parse(format!("failed to decode blocklist: {e}")))?;

        for host in &hosts {
            self.table.store(Entry::blocked_pattern(host));
        }
        Ok(hosts.len())
    }
}

/// Fresh, empty shared state for a new server
///
/// Returns the table, block map, resolver slot, and dump slot that the
/// engine, control plane, and admin endpoint share.
#[must_use]
pub fn empty_state() -> (
    Arc<ResolutionTable>,
    Arc<ArcSwap<BlockMap>>,
    Arc<ArcSwap<DnsResolver>>,
    Arc<ArcSwapOption<HostsDump>>,
) {
    let resolver =
        DnsResolver::new(&[], None).unwrap_or_else(|_| unreachable!("empty server list is valid"));
    (
        Arc::new(ResolutionTable::new()),
        Arc::new(ArcSwap::from_pointee(HashMap::new())),
        Arc::new(ArcSwap::from_pointee(resolver)),
        Arc::new(ArcSwapOption::empty()),
    )
}
