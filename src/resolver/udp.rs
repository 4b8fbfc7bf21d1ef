//! Classic DNS over UDP
//!
//! One attempt per call: compose a standard query (random 16-bit id, RD=1,
//! QTYPE=A, QCLASS=IN), send it over a fresh socket, and wait for the reply
//! within the attempt deadline. Retry and rotation policy live in the
//! resolver facade, not here.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use hickory_proto::op::{Message, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use tokio::net::UdpSocket;
use tokio::time::timeout;

use super::ResolvedAddress;
use crate::error::{DnsError, DnsResult};

/// Receive buffer size; large enough for EDNS0 responses
const UDP_RECV_BUFFER_SIZE: usize = 4096;

/// Perform a single A-record query attempt against `server`
///
/// Returns every A record in the answer section; CNAMEs and other record
/// types are dropped. An empty answer section is a successful result with
/// zero addresses.
///
/// # Errors
///
/// - `DnsError::Timeout` when no reply arrives within `attempt_timeout`
/// - `DnsError::Rcode` when the upstream answers non-NOERROR
/// - `DnsError::Transport` for socket failures or a mismatched reply
pub(crate) async fn exchange(
    server: SocketAddr,
    host: &str,
    attempt_timeout: Duration,
) -> DnsResult<Vec<ResolvedAddress>> {
    let fqdn = if host.ends_with('.') {
        host.to_string()
    } else {
        format!("{host}.")
    };
    let name = Name::from_str(&fqdn)
        .map_err(|e| DnsError::parse(format!("invalid query name '{fqdn}': {e}")))?;

    let mut query = Message::new();
    query.set_id(rand::random());
    query.set_recursion_desired(true);
    query.add_query(Query::query(name, RecordType::A));

    let query_bytes = query
        .to_vec()
        .map_err(|e| DnsError::serialize(format!("failed to serialize DNS query: {e}")))?;

    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|e| DnsError::transport_io("failed to bind UDP socket", e))?;

    socket
        .send_to(&query_bytes, server)
        .await
        .map_err(|e| DnsError::transport_io(format!("failed to send query to {server}"), e))?;

    let mut recv_buf = vec![0u8; UDP_RECV_BUFFER_SIZE];
    let (len, src) = match timeout(attempt_timeout, socket.recv_from(&mut recv_buf)).await {
        Ok(Ok(received)) => received,
        Ok(Err(e)) => {
            return Err(DnsError::transport_io(
                format!("failed to receive reply from {server}"),
                e,
            ));
        }
        Err(_) => {
            return Err(DnsError::timeout(
                format!("UDP query to {server}"),
                attempt_timeout,
            ));
        }
    };

    if src != server {
        return Err(DnsError::transport(format!(
            "reply from unexpected source {src} (expected {server})"
        )));
    }

    let response = Message::from_vec(&recv_buf[..len])
        .map_err(|e| DnsError::parse(format!("failed to parse DNS response: {e}")))?;

    if response.id() != query.id() {
        return Err(DnsError::transport(format!(
            "reply id {:#06x} does not match query id {:#06x}",
            response.id(),
            query.id()
        )));
    }

    if response.response_code() != ResponseCode::NoError {
        return Err(DnsError::rcode(
            server.to_string(),
            format!("{:?}", response.response_code()),
        ));
    }

    Ok(extract_a_records(&response))
}

/// Pull the A records out of an answer section
pub(crate) fn extract_a_records(response: &Message) -> Vec<ResolvedAddress> {
    response
        .answers()
        .iter()
        .filter_map(|record| match record.data() {
            Some(RData::A(a)) => Some(ResolvedAddress {
                address: a.0.to_string(),
                ttl: record.ttl(),
                name: record.name().to_string(),
            }),
            _ => None,
        })
        .collect()
}
