//! DNS-over-HTTPS client (JSON API)
//!
//! Speaks the JSON variant accepted by the major public resolvers:
//! `GET https://<host>/dns-query?name=<n>&type=A` with
//! `Accept: application/dns-json`, answered with the Google/Cloudflare
//! JSON schema.
//!
//! A DoH failure is never retried here; the resolver facade falls through
//! to classic DNS instead. Every request carries an explicit deadline.
//!
//! # Example
//!
//! ```no_run
//! use homedns::resolver::DohClient;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = DohClient::new("cloudflare-dns.com")?;
//! let addresses = client.lookup("example.com").await?;
//! for a in addresses {
//!     println!("{} (ttl {})", a.address, a.ttl);
//! }
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use bytes::Bytes;
use http::{header, Method, Request, Uri};
use http_body_util::{BodyExt, Full};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::Deserialize;
use tokio::time::timeout;

use super::ResolvedAddress;
use crate::error::{DnsError, DnsResult};

/// Media type of the JSON DoH API
const DOH_ACCEPT: &str = "application/dns-json";

/// Default per-request deadline
const DEFAULT_DOH_TIMEOUT: Duration = Duration::from_secs(5);

/// A-record type number in the JSON schema
const TYPE_A: u16 = 1;

/// Shared HTTPS-capable client type for outbound requests
pub(crate) type HttpClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Build an HTTP client trusting the webpki root store
///
/// Plain-http URLs are also accepted, which keeps local test endpoints
/// reachable without TLS.
pub(crate) fn build_http_client() -> HttpClient {
    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    let https = HttpsConnectorBuilder::new()
        .with_tls_config(tls_config)
        .https_or_http()
        .enable_all_versions()
        .build();

    Client::builder(TokioExecutor::new()).build(https)
}

/// DNS-over-HTTPS JSON client
pub struct DohClient {
    /// Full query endpoint, e.g. `https://cloudflare-dns.com/dns-query`
    endpoint: String,
    /// Identifier reported as the answer's origin server
    server_id: String,
    client: HttpClient,
    request_timeout: Duration,
}

impl std::fmt::Debug for DohClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DohClient")
            .field("endpoint", &self.endpoint)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl DohClient {
    /// Create a client for the given DoH host name
    ///
    /// # Errors
    ///
    /// Returns `DnsError::Config` when the derived endpoint URL is invalid.
    pub fn new(host: &str) -> DnsResult<Self> {
        let mut client = Self::with_url(&format!("https://{host}/dns-query"))?;
        client.server_id = format!("https://{host}");
        Ok(client)
    }

    /// Create a client for an explicit endpoint URL
    ///
    /// Accepts `http://` endpoints as well, which local integration setups
    /// use to avoid TLS.
    ///
    /// # Errors
    ///
    /// Returns `DnsError::Config` when the URL does not parse.
    pub fn with_url(url: &str) -> DnsResult<Self> {
        url.parse::<Uri>()
            .map_err(|e| DnsError::config(format!("invalid DoH endpoint '{url}': {e}")))?;

        Ok(Self {
            endpoint: url.to_string(),
            server_id: url.to_string(),
            client: build_http_client(),
            request_timeout: DEFAULT_DOH_TIMEOUT,
        })
    }

    /// Override the per-request deadline
    #[must_use]
    pub fn with_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    /// Identifier reported for answers from this endpoint
    #[must_use]
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Resolve the A records for `host`
    ///
    /// A reply with `Status != 0` or no A answers yields an empty list;
    /// only transport, HTTP, and decode problems are errors.
    ///
    /// # Errors
    ///
    /// Returns `DnsError::Timeout`, `DnsError::Transport`, or
    /// `DnsError::Parse`; the caller treats any of them as a signal to fall
    /// through to classic DNS.
    pub async fn lookup(&self, host: &str) -> DnsResult<Vec<ResolvedAddress>> {
        let uri: Uri = format!("{}?name={host}&type=A", self.endpoint)
            .parse()
            .map_err(|e| DnsError::transport(format!("invalid DoH request URI: {e}")))?;

        let request = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header(header::ACCEPT, DOH_ACCEPT)
            .body(Full::new(Bytes::new()))
            .map_err(|e| DnsError::transport(format!("failed to build DoH request: {e}")))?;

        let response = timeout(self.request_timeout, self.client.request(request))
            .await
            .map_err(|_| {
                DnsError::timeout(
                    format!("DoH request to {}", self.endpoint),
                    self.request_timeout,
                )
            })?
            .map_err(|e| DnsError::transport(format!("DoH request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DnsError::transport(format!(
                "DoH endpoint {} returned HTTP {status}",
                self.endpoint
            )));
        }

        let body = timeout(self.request_timeout, response.into_body().collect())
            .await
            .map_err(|_| {
                DnsError::timeout(
                    format!("DoH response body from {}", self.endpoint),
                    self.request_timeout,
                )
            })?
            .map_err(|e| DnsError::transport(format!("failed to read DoH response body: {e}")))?
            .to_bytes();

        let parsed: DohResponse = serde_json::from_slice(&body)
            .map_err(|e| DnsError::parse(format!("failed to decode DoH response: {e}")))?;

        Ok(parsed.into_addresses())
    }
}

/// JSON schema of the DoH answer, Google/Cloudflare dialect
#[derive(Debug, Deserialize)]
struct DohResponse {
    #[serde(default, rename = "Status")]
    status: i32,
    #[serde(default, rename = "Answer")]
    answer: Vec<DohAnswer>,
}

#[derive(Debug, Deserialize)]
struct DohAnswer {
    #[serde(default)]
    name: String,
    #[serde(default, rename = "type")]
    record_type: u16,
    #[serde(default, rename = "TTL")]
    ttl: u32,
    #[serde(default)]
    data: String,
}

impl DohResponse {
    /// Keep only the A records of a NOERROR reply
    fn into_addresses(self) -> Vec<ResolvedAddress> {
        if self.status != 0 {
            return Vec::new();
        }
        self.answer
            .into_iter()
            .filter(|answer| answer.record_type == TYPE_A)
            .map(|answer| ResolvedAddress {
                address: answer.data,
                ttl: answer.ttl,
                name: answer.name,
            })
            .collect()
    }
}
