//! Admin HTTP endpoint
//!
//! A thin JSON view over the server's live state, served on its own port:
//!
//! - `GET /` — stats snapshot with domains sorted by request count;
//!   `?metrics=true` includes the metric ring. Browsers get an HTML
//!   wrapper, bots get 404, everything else gets bare JSON.
//! - `POST /flush` — drops every non-blocked table entry.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use tracing::{error, info};

use crate::error::{DnsError, DnsResult};
use crate::stats::Stats;
use crate::table::{HostsDump, ResolutionTable};

/// Shared state behind the admin routes
pub struct AdminState {
    table: Arc<ResolutionTable>,
    stats: Arc<Stats>,
    dump: Arc<ArcSwapOption<HostsDump>>,
}

impl AdminState {
    /// Bundle the state the admin view reads
    #[must_use]
    pub fn new(
        table: Arc<ResolutionTable>,
        stats: Arc<Stats>,
        dump: Arc<ArcSwapOption<HostsDump>>,
    ) -> Self {
        Self { table, stats, dump }
    }
}

/// Build the admin router
#[must_use]
pub fn router(state: Arc<AdminState>) -> Router {
    Router::new()
        .route("/", get(overview))
        .route("/flush", post(flush))
        .with_state(state)
}

/// Serve the admin endpoint until the process exits
///
/// # Errors
///
/// Returns `DnsError::Transport` when the port cannot be bound or the
/// server fails.
pub async fn serve(state: Arc<AdminState>, addr: SocketAddr) -> DnsResult<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| DnsError::transport_io(format!("failed to bind admin port {addr}"), e))?;
    info!(addr = %addr, "admin endpoint started");

    axum::serve(listener, router(state))
        .await
        .map_err(|e| DnsError::transport(format!("admin server failed: {e}")))
}

/// `GET /` — stats snapshot
async fn overview(
    State(state): State<Arc<AdminState>>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if is_bot(user_agent) {
        return (StatusCode::NOT_FOUND, "Not Found").into_response();
    }

    let include_metrics = params.get("metrics").map(String::as_str) == Some("true");
    let mut domains = state.table.snapshot();
    domains.sort_by(|a, b| b.requests.cmp(&a.requests));

    let snapshot = state.stats.snapshot(domains, include_metrics);

    if is_browser(user_agent) {
        if let Ok(pretty) = serde_json::to_string_pretty(&snapshot) {
            return Html(render_page(&pretty)).into_response();
        }
    }
    Json(snapshot).into_response()
}

/// `POST /flush` — drop all dynamic entries
async fn flush(State(state): State<Arc<AdminState>>) -> Response {
    let removed = state.table.flush_dynamic();
    info!(removed, "cache flushed");

    if let Some(dump) = state.dump.load_full() {
        if let Err(e) = dump.write(&state.table) {
            error!(path = %dump.path().display(), error = %e, "hosts dump write failed after flush");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Error Clearing DNS Cache\n",
            )
                .into_response();
        }
    }

    (StatusCode::OK, "Flushed!\n").into_response()
}

/// Crawler detection: crawlers get nothing from this endpoint
fn is_bot(user_agent: &str) -> bool {
    let ua = user_agent.to_ascii_lowercase();
    ["bot", "crawler", "spider", "slurp", "fetch"]
        .iter()
        .any(|marker| ua.contains(marker))
}

/// Interactive-browser detection for the HTML wrapper
///
/// Tools like curl fall through to bare JSON.
fn is_browser(user_agent: &str) -> bool {
    user_agent.contains("Mozilla/")
        && ["Chrome", "Firefox", "Safari", "Android"]
            .iter()
            .any(|marker| user_agent.contains(marker))
}

/// Wrap pretty-printed JSON in a minimal HTML page
fn render_page(json: &str) -> String {
    let escaped = json
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;");
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<title>homedns</title>\n<style>\n\
         body {{ background: #1e1e1e; color: #d4d4d4; font-family: monospace; margin: 2em; }}\n\
         pre {{ white-space: pre-wrap; }}\n\
         </style>\n</head>\n<body>\n<pre>{escaped}</pre>\n</body>\n</html>\n"
    )
}
