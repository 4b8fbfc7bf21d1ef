//! UDP DNS listener
//!
//! Binds the query socket and dispatches one task per inbound datagram to
//! the query engine. The listener loop itself never processes queries, so a
//! slow upstream or a faulting handler cannot stall the socket.

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::net::UdpSocket;
use tracing::{debug, info, trace, warn};

use crate::engine::QueryEngine;
use crate::error::{DnsError, DnsResult};

/// Maximum inbound datagram size (EDNS0-sized)
pub const MAX_DATAGRAM_SIZE: usize = 4096;

/// UDP DNS server
pub struct DnsListener {
    socket: Arc<UdpSocket>,
    engine: Arc<QueryEngine>,
    local_addr: SocketAddr,
}

impl DnsListener {
    /// Bind the listener socket
    ///
    /// # Errors
    ///
    /// Returns `DnsError::Transport` when the socket cannot be bound
    /// (typically a privilege problem on port 53).
    pub async fn bind(addr: SocketAddr, engine: Arc<QueryEngine>) -> DnsResult<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| DnsError::transport_io(format!("failed to bind {addr}"), e))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| DnsError::transport_io("failed to read local address", e))?;

        Ok(Self {
            socket: Arc::new(socket),
            engine,
            local_addr,
        })
    }

    /// The bound address
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until the shutdown signal fires
    ///
    /// # Errors
    ///
    /// Returns `DnsError::Transport` on a fatal socket error; transient
    /// receive errors are logged and skipped.
    pub async fn run_until_shutdown(
        &self,
        mut shutdown_rx: tokio::sync::oneshot::Receiver<()>,
    ) -> DnsResult<()> {
        info!(addr = %self.local_addr, "DNS listener started");

        let mut recv_buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut recv_buf) => {
                    match received {
                        Ok((len, src)) => self.dispatch(&recv_buf[..len], src),
                        Err(e) => {
                            debug!(error = %e, "recv_from failed");
                        }
                    }
                }
                _ = &mut shutdown_rx => {
                    info!("DNS listener shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Hand one datagram to a fresh task
    ///
    /// The task catches panics from the handler: a faulting query is
    /// counted as failed and dropped without a reply, and the listener loop
    /// keeps running.
    fn dispatch(&self, packet: &[u8], src: SocketAddr) {
        trace!(src = %src, len = packet.len(), "received datagram");
        let packet = packet.to_vec();
        let engine = Arc::clone(&self.engine);
        let socket = Arc::clone(&self.socket);

        tokio::spawn(async move {
            let reply = AssertUnwindSafe(engine.handle_packet(&packet))
                .catch_unwind()
                .await;
            match reply {
                Ok(Some(bytes)) => {
                    if let Err(e) = socket.send_to(&bytes, src).await {
                        warn!(dst = %src, error = %e, "failed to send reply");
                    }
                }
                Ok(None) => {}
                Err(_) => {
                    engine.stats().record_failed();
                    warn!(client = %src, "query task panicked, dropping reply");
                }
            }
        });
    }
}
