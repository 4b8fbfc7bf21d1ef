//! Error types for the resolver pipeline
//!
//! This module defines the error hierarchy shared by the upstream resolver,
//! the query engine, and the control plane.
//!
//! # Error Categories
//!
//! - **Parse/Serialize errors**: DNS message encoding/decoding failures
//! - **Transport errors**: socket I/O and HTTP failures
//! - **Timeout errors**: an upstream attempt exceeded its deadline
//! - **Rcode errors**: an upstream answered with a non-NOERROR response code
//! - **Config errors**: unreadable or invalid configuration
//!
//! # Example
//!
//! ```
//! use homedns::error::DnsError;
//!
//! let err = DnsError::timeout("query to 8.8.8.8:53", std::time::Duration::from_secs(2));
//! assert!(err.is_timeout());
//! assert!(err.is_recoverable());
//! ```

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Error type for resolver and control-plane operations
///
/// Errors are classified as either recoverable or non-recoverable:
/// - **Recoverable**: transient issues that may succeed on retry (timeouts,
///   transport failures)
/// - **Non-recoverable**: definitive upstream answers or configuration
///   problems that retrying cannot fix
#[derive(Debug, Error)]
pub enum DnsError {
    /// DNS message or upstream payload could not be decoded
    #[error("failed to parse DNS data: {reason}")]
    Parse {
        /// Description of what went wrong during parsing
        reason: String,
    },

    /// DNS message could not be encoded for transmission
    #[error("failed to serialize DNS message: {reason}")]
    Serialize {
        /// Description of what went wrong during serialization
        reason: String,
    },

    /// Socket or HTTP transport failure
    #[error("transport error: {reason}")]
    Transport {
        /// Description of the transport failure
        reason: String,
        /// The underlying I/O error, if available
        #[source]
        source: Option<io::Error>,
    },

    /// An upstream attempt did not answer within its deadline
    #[error("query timed out after {timeout:?}: {context}")]
    Timeout {
        /// Description of what timed out
        context: String,
        /// The deadline that was exceeded
        timeout: Duration,
    },

    /// An upstream answered with a non-NOERROR response code
    ///
    /// These are definitive answers (NXDOMAIN, SERVFAIL, REFUSED, ...) and
    /// are never retried.
    #[error("upstream {server} answered {rcode}")]
    Rcode {
        /// The upstream server that produced the response
        server: String,
        /// The response code name
        rcode: String,
    },

    /// Configuration could not be read or is invalid
    #[error("configuration error: {reason}")]
    Config {
        /// Description of the configuration problem
        reason: String,
        /// The underlying I/O error, if available
        #[source]
        source: Option<io::Error>,
    },
}

impl DnsError {
    /// Create a parse error
    pub fn parse(reason: impl Into<String>) -> Self {
        Self::Parse {
            reason: reason.into(),
        }
    }

    /// Create a serialization error
    pub fn serialize(reason: impl Into<String>) -> Self {
        Self::Serialize {
            reason: reason.into(),
        }
    }

    /// Create a transport error
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
            source: None,
        }
    }

    /// Create a transport error from an I/O error
    pub fn transport_io(reason: impl Into<String>, source: io::Error) -> Self {
        Self::Transport {
            reason: reason.into(),
            source: Some(source),
        }
    }

    /// Create a timeout error
    pub fn timeout(context: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            context: context.into(),
            timeout,
        }
    }

    /// Create an upstream response-code error
    pub fn rcode(server: impl Into<String>, rcode: impl Into<String>) -> Self {
        Self::Rcode {
            server: server.into(),
            rcode: rcode.into(),
        }
    }

    /// Create a configuration error
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
            source: None,
        }
    }

    /// Create a configuration error from an I/O error
    pub fn config_io(reason: impl Into<String>, source: io::Error) -> Self {
        Self::Config {
            reason: reason.into(),
            source: Some(source),
        }
    }

    /// Whether this error is a timeout
    ///
    /// The classic-DNS retry loop only retries timed-out attempts; every
    /// other failure is surfaced immediately.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Whether a retry could plausibly succeed
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Transport { .. })
    }

    /// Whether this is a definitive upstream response-code failure
    #[must_use]
    pub fn is_rcode(&self) -> bool {
        matches!(self, Self::Rcode { .. })
    }
}

/// Result alias for resolver operations
pub type DnsResult<T> = Result<T, DnsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_classification() {
        let err = DnsError::timeout("udp attempt", Duration::from_secs(2));
        assert!(err.is_timeout());
        assert!(err.is_recoverable());
        assert!(!err.is_rcode());
    }

    #[test]
    fn test_rcode_is_not_recoverable() {
        let err = DnsError::rcode("8.8.8.8:53", "NXDomain");
        assert!(!err.is_recoverable());
        assert!(err.is_rcode());
        assert!(err.to_string().contains("NXDomain"));
    }

    #[test]
    fn test_transport_preserves_source() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let err = DnsError::transport_io("send failed", io_err);
        assert!(err.is_recoverable());
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_config_error_display() {
        let err = DnsError::config("servers list is empty");
        assert!(err.to_string().contains("servers list is empty"));
    }
}
