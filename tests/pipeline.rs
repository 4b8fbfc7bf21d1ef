//! End-to-end pipeline scenarios
//!
//! Exercises the full resolution pipeline against mock upstreams: real
//! localhost UDP sockets for classic DNS and a minimal HTTP/1.1 responder
//! for the DoH path, so no network access or TLS is needed.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::{ArcSwap, ArcSwapOption};
use hickory_proto::op::{Message, MessageType, Query};
use hickory_proto::rr::{rdata, Name, RData, Record, RecordType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UdpSocket;

use homedns::config::Config;
use homedns::control::ControlPlane;
use homedns::engine::{BlockMap, QueryEngine};
use homedns::resolver::{DnsResolver, DohClient};
use homedns::stats::Stats;
use homedns::table::{Entry, HostsDump, ResolutionTable};

// ============================================================================
// Helpers
// ============================================================================

struct TestServer {
    engine: Arc<QueryEngine>,
    table: Arc<ResolutionTable>,
    blocks: Arc<ArcSwap<BlockMap>>,
    resolver: Arc<ArcSwap<DnsResolver>>,
    stats: Arc<Stats>,
}

fn build_server(resolver: DnsResolver) -> TestServer {
    let table = Arc::new(ResolutionTable::new());
    let blocks = Arc::new(ArcSwap::from_pointee(BlockMap::new()));
    let resolver = Arc::new(ArcSwap::from_pointee(resolver));
    let stats = Arc::new(Stats::new());
    let dump: Arc<ArcSwapOption<HostsDump>> = Arc::new(ArcSwapOption::empty());

    let engine = Arc::new(QueryEngine::new(
        Arc::clone(&table),
        Arc::clone(&blocks),
        Arc::clone(&resolver),
        Arc::clone(&stats),
        dump,
    ));

    TestServer {
        engine,
        table,
        blocks,
        resolver,
        stats,
    }
}

fn a_query(domain: &str, id: u16) -> Message {
    let mut message = Message::new();
    message.set_id(id);
    message.set_recursion_desired(true);
    message.add_query(Query::query(
        Name::from_str(domain).unwrap(),
        RecordType::A,
    ));
    message
}

fn answer_addresses(response: &Message) -> Vec<String> {
    response
        .answers()
        .iter()
        .filter_map(|r| match r.data() {
            Some(RData::A(a)) => Some(a.0.to_string()),
            _ => None,
        })
        .collect()
}

/// Mock classic upstream answering every A query with `addr`
async fn spawn_udp_upstream(addr: Ipv4Addr, ttl: u32) -> (SocketAddr, Arc<AtomicUsize>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server = socket.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_clone = Arc::clone(&hits);

    tokio::spawn(async move {
        let mut buf = [0u8; 512];
        loop {
            let Ok((len, src)) = socket.recv_from(&mut buf).await else {
                break;
            };
            hits_clone.fetch_add(1, Ordering::SeqCst);
            let Ok(query) = Message::from_vec(&buf[..len]) else {
                continue;
            };

            let mut reply = Message::new();
            reply.set_id(query.id());
            reply.set_message_type(MessageType::Response);
            for q in query.queries() {
                reply.add_query(q.clone());
                reply.add_answer(Record::from_rdata(
                    q.name().clone(),
                    ttl,
                    RData::A(rdata::A(addr)),
                ));
            }
            if let Ok(bytes) = reply.to_vec() {
                let _ = socket.send_to(&bytes, src).await;
            }
        }
    });

    (server, hits)
}

/// Mock upstream that counts queries but never answers
async fn spawn_silent_upstream() -> (SocketAddr, Arc<AtomicUsize>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server = socket.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_clone = Arc::clone(&hits);

    tokio::spawn(async move {
        let mut buf = [0u8; 512];
        while socket.recv_from(&mut buf).await.is_ok() {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        }
    });

    (server, hits)
}

/// Mock DoH endpoint serving a fixed JSON body over plain HTTP
async fn spawn_doh_endpoint(body: &'static str) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 2048];
                let _ = stream.read(&mut buf).await;
                let reply = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/dns-json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(reply.as_bytes()).await;
            });
        }
    });

    addr
}

/// Poll until `predicate` holds or the deadline passes
async fn wait_for(deadline: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let started = std::time::Instant::now();
    while started.elapsed() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    predicate()
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn static_hit_answers_from_config() {
    let server = build_server(DnsResolver::new(&[], None).unwrap());

    let mut config = Config::default();
    config
        .hosts
        .insert("foo.test.".to_string(), "10.0.0.1".to_string());
    let control = ControlPlane::new(
        PathBuf::from("/unused"),
        Arc::clone(&server.table),
        Arc::clone(&server.blocks),
        Arc::clone(&server.resolver),
        Arc::new(ArcSwapOption::empty()),
    );
    control.apply(&config).unwrap();

    let response = server.engine.handle_message(&a_query("foo.test.", 1)).await;
    assert_eq!(answer_addresses(&response), vec!["10.0.0.1"]);
    assert_eq!(response.answers()[0].ttl(), 60);
    assert_eq!(server.stats.cached_requests(), 1);
}

#[tokio::test]
async fn glob_block_promotes_exact_entry() {
    let server = build_server(DnsResolver::new(&[], None).unwrap());

    let mut blocks = BlockMap::new();
    blocks.insert("*.ads.".to_string(), true);
    server.blocks.store(Arc::new(blocks));

    let response = server
        .engine
        .handle_message(&a_query("tracker.ads.", 1))
        .await;
    assert_eq!(answer_addresses(&response), vec!["0.0.0.0"]);
    assert_eq!(server.stats.blocked_requests(), 1);

    let promoted = server.table.load_exact("tracker.ads.").unwrap();
    assert!(promoted.block);
}

#[tokio::test]
async fn upstream_fetch_then_cache() {
    let (upstream, hits) = spawn_udp_upstream(Ipv4Addr::new(1, 2, 3, 4), 300).await;
    let server = build_server(DnsResolver::new(&[upstream.to_string()], None).unwrap());

    // First query goes upstream.
    let response = server.engine.handle_message(&a_query("x.test.", 1)).await;
    assert_eq!(answer_addresses(&response), vec!["1.2.3.4"]);
    assert_eq!(server.stats.lookup_requests(), 1);

    // The cache install is detached; wait for it to land.
    let table = Arc::clone(&server.table);
    assert!(
        wait_for(Duration::from_secs(2), move || {
            table.snapshot().iter().any(|e| e.name == "x.test.")
        })
        .await,
        "cache install did not land"
    );

    // Second query is served from the table without upstream contact.
    let response = server.engine.handle_message(&a_query("x.test.", 2)).await;
    assert_eq!(answer_addresses(&response), vec!["1.2.3.4"]);
    assert_eq!(server.stats.cached_requests(), 1);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn retry_on_timeout_rotates_to_second_server() {
    let (dead, dead_hits) = spawn_silent_upstream().await;
    let (live, live_hits) = spawn_udp_upstream(Ipv4Addr::new(9, 8, 7, 6), 120).await;

    let resolver = DnsResolver::new(&[dead.to_string(), live.to_string()], None)
        .unwrap()
        .with_attempt_timeout(Duration::from_millis(200));

    let outcome = resolver.lookup("x.test").await.unwrap();
    assert_eq!(outcome.addresses[0].address, "9.8.7.6");
    assert_eq!(outcome.server, live.to_string());
    assert_eq!(dead_hits.load(Ordering::SeqCst), 1);
    assert_eq!(live_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn doh_preferred_over_classic() {
    let doh_addr = spawn_doh_endpoint(
        r#"{ "Status": 0, "Answer": [ { "name": "a.test.", "type": 1, "TTL": 200, "data": "9.9.9.9" } ] }"#,
    )
    .await;
    let (udp, udp_hits) = spawn_silent_upstream().await;

    let resolver = DnsResolver::new(&[udp.to_string()], None)
        .unwrap()
        .with_doh_client(DohClient::with_url(&format!("http://{doh_addr}/dns-query")).unwrap());

    let outcome = resolver.lookup("a.test").await.unwrap();
    assert_eq!(outcome.addresses[0].address, "9.9.9.9");
    assert!(outcome.server.contains(&doh_addr.to_string()));
    // Classic DNS was never contacted.
    assert_eq!(udp_hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn doh_failure_falls_back_to_classic() {
    // Nothing listens on this endpoint; connection is refused.
    let resolver_endpoint = "http://127.0.0.1:1/dns-query";
    let (udp, udp_hits) = spawn_udp_upstream(Ipv4Addr::new(4, 4, 4, 4), 60).await;

    let resolver = DnsResolver::new(&[udp.to_string()], None)
        .unwrap()
        .with_doh_client(DohClient::with_url(resolver_endpoint).unwrap());

    let outcome = resolver.lookup("b.test").await.unwrap();
    assert_eq!(outcome.addresses[0].address, "4.4.4.4");
    assert_eq!(udp_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn config_reload_applies_new_hosts() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("config.json");
    std::fs::write(&config_path, "{}").unwrap();

    let server = build_server(DnsResolver::new(&[], None).unwrap());
    let control = Arc::new(ControlPlane::new(
        config_path.clone(),
        Arc::clone(&server.table),
        Arc::clone(&server.blocks),
        Arc::clone(&server.resolver),
        Arc::new(ArcSwapOption::empty()),
    ));
    control.load_and_apply().unwrap();
    control.spawn_watcher().unwrap();

    // Pre-existing dynamic state must survive the reload.
    server
        .table
        .store(Entry::cached("keep.test.", "7.7.7.7", 300, "8.8.8.8:53"));

    std::fs::write(
        &config_path,
        r#"{ "hosts": { "z.test.": "5.5.5.5" } }"#,
    )
    .unwrap();

    let table = Arc::clone(&server.table);
    assert!(
        wait_for(Duration::from_secs(3), move || {
            table.snapshot().iter().any(|e| e.name == "z.test.")
        })
        .await,
        "reload did not pick up the new host"
    );

    let response = server.engine.handle_message(&a_query("z.test.", 1)).await;
    assert_eq!(answer_addresses(&response), vec!["5.5.5.5"]);
    assert_eq!(server.stats.lookup_requests(), 0);
    assert!(server.table.load_exact("keep.test.").is_some());
}

#[tokio::test]
async fn flush_preserves_blocked_entries_end_to_end() {
    let server = build_server(DnsResolver::new(&[], None).unwrap());

    let mut blocks = BlockMap::new();
    blocks.insert("*.ads.".to_string(), true);
    server.blocks.store(Arc::new(blocks));

    // Promote a block, install a dynamic entry, then flush.
    server
        .engine
        .handle_message(&a_query("tracker.ads.", 1))
        .await;
    server
        .table
        .store(Entry::cached("x.test.", "1.2.3.4", 300, "8.8.8.8:53"));

    server.table.flush_dynamic();

    assert!(server.table.load_exact("tracker.ads.").is_some());
    assert!(server.table.load_exact("x.test.").is_none());
}

#[tokio::test]
async fn stampede_of_misses_converges() {
    let (upstream, _) = spawn_udp_upstream(Ipv4Addr::new(2, 2, 2, 2), 300).await;
    let server = build_server(DnsResolver::new(&[upstream.to_string()], None).unwrap());

    // Concurrent misses for the same name are all allowed to fire.
    let mut handles = Vec::new();
    for id in 0..8u16 {
        let engine = Arc::clone(&server.engine);
        handles.push(tokio::spawn(async move {
            engine.handle_message(&a_query("hot.test.", id)).await
        }));
    }
    for handle in handles {
        let response = handle.await.unwrap();
        assert_eq!(answer_addresses(&response), vec!["2.2.2.2"]);
    }

    let table = Arc::clone(&server.table);
    assert!(
        wait_for(Duration::from_secs(2), move || {
            table.snapshot().iter().any(|e| e.name == "hot.test.")
        })
        .await
    );

    // Last write wins; there is exactly one entry for the name.
    let entries: Vec<_> = server
        .table
        .snapshot()
        .into_iter()
        .filter(|e| e.name == "hot.test.")
        .collect();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].ip, "2.2.2.2");
}
