//! Query engine
//!
//! The per-request state machine in front of every inbound DNS question:
//!
//! ```text
//! Incoming question (QTYPE=A)
//!     |
//!     v
//! Block check (active config patterns)  ── match ──▶ blocked answer + promotion
//!     |
//!     v
//! Exact table lookup ── blocked ──▶ blocked answer
//!     |               ── fresh ───▶ cached answer
//!     v (miss/stale)
//! Pattern table scan ── blocked ──▶ blocked answer + promotion
//!     |               ── fresh ───▶ cached answer
//!     v (miss)
//! Upstream lookup ── success ──▶ answer now, install cache entry off-path
//!                 ── failure ──▶ empty answer
//! ```
//!
//! Every branch resolves to a tagged [`Resolution`] value; nothing in the
//! pipeline signals policy outcomes through errors.
//!
//! # Concurrency
//!
//! The engine is shared across one task per inbound datagram. The block map
//! and the resolver are dereferenced once per question via `arc-swap`, so a
//! concurrent reload never tears an in-flight query. Cache installs after a
//! miss run on a detached task; the reply does not wait for them, and two
//! concurrent misses for the same name may both fire upstream (last write
//! wins, request counters survive).
//!
//! # Crash containment
//!
//! Each question is polled under `catch_unwind`. A panicking question is
//! counted as failed and answered empty; sibling questions and the listener
//! loop are unaffected.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use arc_swap::{ArcSwap, ArcSwapOption};
use futures::FutureExt;
use hickory_proto::op::{Message, MessageType};
use hickory_proto::rr::{rdata, RData, Record, RecordType};
use tracing::{debug, error, info, warn};

use crate::matcher;
use crate::resolver::DnsResolver;
use crate::stats::{Metric, MetricKind, Stats};
use crate::table::{Entry, HostsDump, ResolutionTable, BLOCKED_IP, LOCAL_SERVER};

/// TTL stamped on every answer record
///
/// The wire TTL is decoupled from the internal cache TTL; clients always
/// get a short lease.
pub const WIRE_TTL: u32 = 60;

/// Address answered for blocked names
const BLOCKED_ANSWER: Ipv4Addr = Ipv4Addr::UNSPECIFIED;

/// Active block patterns, swapped whole on config reload
pub type BlockMap = HashMap<String, bool>;

/// How a single question was resolved
#[derive(Debug, Clone)]
enum Resolution {
    /// Answered from the resolution table
    Hit { ip: String, server: String },
    /// Answered by an upstream lookup
    Fetched { ip: String, server: String },
    /// Refused by policy
    Blocked,
    /// No answer available
    Failed,
}

/// Shared per-request state machine
pub struct QueryEngine {
    table: Arc<ResolutionTable>,
    blocks: Arc<ArcSwap<BlockMap>>,
    resolver: Arc<ArcSwap<DnsResolver>>,
    stats: Arc<Stats>,
    dump: Arc<ArcSwapOption<HostsDump>>,
}

impl QueryEngine {
    /// Wire up an engine over the shared server state
    #[must_use]
    pub fn new(
        table: Arc<ResolutionTable>,
        blocks: Arc<ArcSwap<BlockMap>>,
        resolver: Arc<ArcSwap<DnsResolver>>,
        stats: Arc<Stats>,
        dump: Arc<ArcSwapOption<HostsDump>>,
    ) -> Self {
        Self {
            table,
            blocks,
            resolver,
            stats,
            dump,
        }
    }

    /// The statistics block shared with the admin view
    #[must_use]
    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    /// Handle one raw datagram, returning the serialized reply
    ///
    /// Malformed datagrams are dropped silently (`None`).
    pub async fn handle_packet(&self, data: &[u8]) -> Option<Vec<u8>> {
        let request = match Message::from_vec(data) {
            Ok(message) => message,
            Err(e) => {
                debug!(error = %e, "dropping malformed datagram");
                return None;
            }
        };

        let response = self.handle_message(&request).await;
        match response.to_vec() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                error!(error = %e, "failed to serialize response");
                None
            }
        }
    }

    /// Process a parsed request into a response message
    ///
    /// The response mirrors the request id and questions and sets AA=1.
    /// Only QTYPE=A is answered; anything else gets an empty answer
    /// section.
    pub async fn handle_message(&self, request: &Message) -> Message {
        let mut response = Message::new();
        response.set_id(request.id());
        response.set_message_type(MessageType::Response);
        response.set_op_code(request.op_code());
        response.set_recursion_desired(request.recursion_desired());
        response.set_recursion_available(true);
        response.set_authoritative(true);
        for question in request.queries() {
            response.add_query(question.clone());
        }

        let first_is_a = request
            .queries()
            .first()
            .is_some_and(|q| q.query_type() == RecordType::A);
        if !first_is_a {
            return response;
        }

        for question in request.queries() {
            if question.query_type() != RecordType::A {
                continue;
            }

            let started = Instant::now();
            let qname = question.name().to_string().to_ascii_lowercase();

            let resolution = AssertUnwindSafe(self.resolve_question(&qname))
                .catch_unwind()
                .await
                .unwrap_or_else(|fault| {
                    // The fault payload and the request are distinct values;
                    // only the fault decides the outcome here.
                    let detail = fault
                        .downcast_ref::<&str>()
                        .map_or_else(String::new, ToString::to_string);
                    error!(domain = %qname, detail = %detail, "question handler panicked");
                    self.stats.record_failed();
                    Resolution::Failed
                });

            let elapsed_ms =
                u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            let (answer_ip, source) = match &resolution {
                Resolution::Hit { ip, server } | Resolution::Fetched { ip, server } => {
                    match ip.parse::<Ipv4Addr>() {
                        Ok(parsed) => (Some(parsed), server.clone()),
                        Err(_) => {
                            warn!(domain = %qname, ip = %ip, "cached address is not an IPv4 literal");
                            self.stats.record_failed();
                            (None, server.clone())
                        }
                    }
                }
                Resolution::Blocked => (Some(BLOCKED_ANSWER), LOCAL_SERVER.to_string()),
                Resolution::Failed => (None, String::new()),
            };

            if let Some(ip) = answer_ip {
                response.add_answer(Record::from_rdata(
                    question.name().clone(),
                    WIRE_TTL,
                    RData::A(rdata::A(ip)),
                ));
            }

            info!(
                domain = %qname,
                answer = %answer_ip.map_or_else(|| "none".to_string(), |ip| ip.to_string()),
                elapsed_ms,
                "processed question"
            );
            let metric_ip = match &resolution {
                Resolution::Blocked => BLOCKED_IP.to_string(),
                _ => answer_ip.map_or_else(String::new, |ip| ip.to_string()),
            };
            self.stats.push_metric(Metric::new(
                MetricKind::Answer,
                metric_ip,
                source,
                qname,
                elapsed_ms,
            ));
        }

        response
    }

    /// Classify one question and act on the outcome
    async fn resolve_question(&self, qname: &str) -> Resolution {
        // Active config patterns first.
        let blocks = self.blocks.load();
        for (pattern, active) in blocks.iter() {
            if *active && matcher::matches(pattern, qname) {
                warn!(domain = %qname, pattern = %pattern, "blocking query");
                self.stats.record_blocked();
                self.stats.push_metric(Metric::new(
                    MetricKind::Block,
                    BLOCKED_IP,
                    LOCAL_SERVER,
                    qname,
                    0,
                ));
                self.promote_block(qname);
                return Resolution::Blocked;
            }
        }
        drop(blocks);

        // Exact entry: O(1), bumps the request counter.
        if let Some(entry) = self.table.load_exact(qname) {
            if entry.block {
                self.stats.record_blocked();
                return Resolution::Blocked;
            }
            if entry.is_fresh() {
                self.stats.record_cached();
                return Resolution::Hit {
                    ip: entry.ip,
                    server: entry.server,
                };
            }
            // Stale: fall through and refresh upstream.
        }

        // Pattern scan over the whole table.
        if let Some(entry) = self.table.load_matching(qname) {
            if entry.block {
                warn!(domain = %qname, pattern = %entry.name, "blocking query");
                self.stats.record_blocked();
                self.promote_block(qname);
                return Resolution::Blocked;
            }
            if entry.is_fresh() {
                self.stats.record_cached();
                return Resolution::Hit {
                    ip: entry.ip,
                    server: entry.server,
                };
            }
        }

        self.fetch_upstream(qname).await
    }

    /// Install an exact-keyed block entry so future lookups hit in O(1)
    fn promote_block(&self, qname: &str) {
        self.table.store(Entry::blocked(qname));
    }

    /// Resolve a miss upstream and schedule the cache install
    async fn fetch_upstream(&self, qname: &str) -> Resolution {
        let resolver = self.resolver.load_full();
        let host = qname.trim_end_matches('.');
        info!(domain = %qname, "looking up upstream");

        let fetch_started = Instant::now();
        match resolver.lookup(host).await {
            Ok(outcome) if !outcome.addresses.is_empty() => {
                let first = &outcome.addresses[0];
                let ip = first.address.clone();
                let server = outcome.server.clone();
                self.stats.record_lookup();
                self.stats.push_metric(Metric::new(
                    MetricKind::Fetch,
                    ip.clone(),
                    server.clone(),
                    qname,
                    u64::try_from(fetch_started.elapsed().as_millis()).unwrap_or(u64::MAX),
                ));

                // Install off the request path; the reply goes out first.
                let entry = Entry::cached(qname, ip.clone(), first.ttl, server.clone());
                let table = Arc::clone(&self.table);
                let dump = self.dump.load_full();
                tokio::spawn(async move {
                    table.store(entry);
                    if let Some(dump) = dump {
                        let table = Arc::clone(&table);
                        let written =
                            tokio::task::spawn_blocking(move || dump.write(&table)).await;
                        if let Ok(Err(e)) = written {
                            warn!(error = %e, "hosts dump write failed");
                        }
                    }
                });

                Resolution::Fetched { ip, server }
            }
            Ok(outcome) => {
                warn!(domain = %qname, server = %outcome.server, "upstream answered with no A records");
                self.stats.record_failed();
                self.stats.record_failed_domain(qname);
                Resolution::Failed
            }
            Err(e) => {
                error!(domain = %qname, error = %e, "upstream lookup failed");
                self.stats.record_failed();
                self.stats.record_failed_domain(qname);
                Resolution::Failed
            }
        }
    }
}
