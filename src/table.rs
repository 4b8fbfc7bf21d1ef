//! Resolution table
//!
//! The table is the single name space behind every answer the server gives:
//! static hosts from the config file, dynamic cache entries installed after
//! upstream lookups, and blocked names (pattern-keyed rules from the remote
//! blocklist plus exact-keyed promotions).
//!
//! # Keys
//!
//! Keys are either canonical FQDNs with a trailing dot (exact entries) or
//! patterns in any of the [`crate::matcher`] modes. Lookups are
//! case-insensitive on the query side.
//!
//! # Freshness
//!
//! The table never evicts by time. [`Entry::is_fresh`] reports whether an
//! entry is still within its TTL; the query engine decides what to do with
//! a stale hit. Entries with `ttl == u32::MAX` (static hosts, blocked
//! names) never expire.
//!
//! # Example
//!
//! ```
//! use homedns::table::{Entry, ResolutionTable};
//!
//! let table = ResolutionTable::new();
//! table.store(Entry::static_host("router.lan.", "192.168.1.1"));
//!
//! let entry = table.load_exact("router.lan.").expect("stored");
//! assert_eq!(entry.ip, "192.168.1.1");
//! assert_eq!(entry.requests, 1);
//! ```

use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::Serialize;

use crate::matcher;

/// Sentinel address string stored for blocked names
pub const BLOCKED_IP: &str = "Blocked!";

/// Origin identifier for entries synthesized locally (static hosts,
/// blocked names) rather than fetched from an upstream
pub const LOCAL_SERVER: &str = "127.0.0.1";

/// TTL value that marks an entry as never expiring
pub const NEVER_EXPIRES: u32 = u32::MAX;

/// Process-wide monotonic clock base
static CLOCK_BASE: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic nanoseconds since process start
#[must_use]
pub fn monotonic_nanos() -> u64 {
    u64::try_from(CLOCK_BASE.elapsed().as_nanos()).unwrap_or(u64::MAX)
}

/// One row of the resolution table
///
/// Entries are immutable once stored except for the `requests` counter,
/// which is incremented on each exact hit, and full-entry replacement on
/// refresh. Serialization matches the admin view's JSON shape.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    /// Canonical FQDN or pattern this entry is keyed by
    pub name: String,
    /// Monotonic install time in nanoseconds
    #[serde(rename = "time")]
    pub installed_at: u64,
    /// IPv4 literal, or [`BLOCKED_IP`] for blocked names
    pub ip: String,
    /// Whether queries for this name are refused
    pub block: bool,
    /// Number of queries answered from this entry
    pub requests: u64,
    /// Origin of the answer: upstream identifier, or [`LOCAL_SERVER`]
    pub server: String,
    /// Cache TTL in seconds; [`NEVER_EXPIRES`] disables expiry
    pub ttl: u32,
}

impl Entry {
    /// Entry for a static host from the config file
    ///
    /// Static hosts never expire and report a local origin.
    #[must_use]
    pub fn static_host(name: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            installed_at: monotonic_nanos(),
            ip: ip.into(),
            block: false,
            requests: 0,
            server: LOCAL_SERVER.to_string(),
            ttl: NEVER_EXPIRES,
        }
    }

    /// Blocked entry for an exact name or a pattern
    #[must_use]
    pub fn blocked(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            installed_at: monotonic_nanos(),
            ip: BLOCKED_IP.to_string(),
            block: true,
            requests: 0,
            server: LOCAL_SERVER.to_string(),
            ttl: NEVER_EXPIRES,
        }
    }

    /// Blocked pattern entry covering a host and all of its subdomains
    ///
    /// Used by blocklist ingestion: the stored key is a regex so one entry
    /// covers `host.` and `anything.host.`.
    #[must_use]
    pub fn blocked_pattern(host: &str) -> Self {
        Self::blocked(format!("^(.*\\.)?{host}\\.$"))
    }

    /// Dynamic cache entry installed after a successful upstream lookup
    #[must_use]
    pub fn cached(
        name: impl Into<String>,
        ip: impl Into<String>,
        ttl: u32,
        server: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            installed_at: monotonic_nanos(),
            ip: ip.into(),
            block: false,
            requests: 0,
            server: server.into(),
            ttl,
        }
    }

    /// Whether this entry is still within its TTL
    #[must_use]
    pub fn is_fresh(&self) -> bool {
        if self.ttl == NEVER_EXPIRES {
            return true;
        }
        let elapsed = monotonic_nanos().saturating_sub(self.installed_at);
        elapsed / 1_000_000_000 <= u64::from(self.ttl)
    }
}

/// Concurrent mapping of name-or-pattern to [`Entry`]
///
/// Readers and writers do not block each other at the top level; per-entry
/// mutation (the `requests` counter) happens under the shard lock of the
/// backing map, so it is atomic with respect to concurrent readers.
#[derive(Debug, Default)]
pub struct ResolutionTable {
    entries: DashMap<String, Entry>,
}

impl ResolutionTable {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries, patterns included
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// O(1) exact lookup
    ///
    /// Increments the entry's `requests` counter on a hit and returns a
    /// snapshot of the updated entry.
    pub fn load_exact(&self, name: &str) -> Option<Entry> {
        self.entries.get_mut(name).map(|mut entry| {
            entry.requests += 1;
            entry.clone()
        })
    }

    /// O(n) scan across all keys using the pattern matcher
    ///
    /// Returns the first entry whose key matches `name`. Iteration order is
    /// unspecified but stable within a single call.
    pub fn load_matching(&self, name: &str) -> Option<Entry> {
        for entry in self.entries.iter() {
            if matcher::matches(entry.key(), name) {
                return Some(entry.value().clone());
            }
        }
        None
    }

    /// Insert or update an entry under its own name
    ///
    /// On update the existing `requests` counter is preserved and bumped by
    /// one; the refresh itself counts as a request against the name.
    pub fn store(&self, entry: Entry) {
        match self.entries.entry(entry.name.clone()) {
            MapEntry::Occupied(mut occupied) => {
                let requests = occupied.get().requests + 1;
                let mut entry = entry;
                entry.requests = requests;
                occupied.insert(entry);
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(entry);
            }
        }
    }

    /// Remove an entry by exact key
    pub fn delete(&self, name: &str) -> Option<Entry> {
        self.entries.remove(name).map(|(_, entry)| entry)
    }

    /// Remove every non-blocked entry
    ///
    /// Blocked entries persist across flushes. Returns the number of
    /// entries removed.
    pub fn flush_dynamic(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.block);
        before - self.entries.len()
    }

    /// Clone all entries out of the table
    ///
    /// Used for admin serialization and the hosts dump so callers never
    /// iterate the live map.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Entry> {
        self.entries
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }
}

/// Optional hosts-file-style debug sink
///
/// When configured, the full table is written `ip name` per line after
/// cache installs, reloads, and flushes. Writes are serialized by a mutex
/// and always happen off the request path.
#[derive(Debug)]
pub struct HostsDump {
    path: PathBuf,
    lock: Mutex<()>,
}

impl HostsDump {
    /// Create a dump sink targeting `path`
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// The target path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the current table snapshot, sorted by name
    pub fn write(&self, table: &ResolutionTable) -> io::Result<()> {
        let mut entries = table.snapshot();
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        let mut out = String::new();
        for entry in entries {
            out.push_str(&entry.ip);
            out.push(' ');
            out.push_str(&entry.name);
            out.push('\n');
        }

        let _guard = self.lock.lock();
        std::fs::write(&self.path, out)
    }
}
