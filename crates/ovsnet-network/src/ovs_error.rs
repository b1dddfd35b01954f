//! Adapter-level error types for the OVSDB and netlink backends
//!
//! These distinguish "the operation failed" from "the object was already in
//! the target state" and from "the backend could not be reached", which is
//! what the retry and idempotence logic above the adapters keys on.

use ovsnet_core::{Backend, Error};
use thiserror::Error;

/// OVSDB / netlink adapter errors
#[derive(Error, Debug)]
pub enum OvsError {
    // ========================================================================
    // Connection Errors
    // ========================================================================
    #[error("OVSDB socket not found at {0}")]
    SocketNotFound(String),

    #[error("Failed to connect to {0}: {1}")]
    Connection(String, #[source] std::io::Error),

    #[error("Connection to {0} closed before a response arrived")]
    ConnectionClosed(String),

    #[error("Timeout after {0}ms waiting for {1}")]
    Timeout(u64, String),

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    #[error("Unsupported connection string: {0}")]
    InvalidEndpoint(String),

    #[error("OVSDB RPC error: {0}")]
    Rpc(String),

    #[error("OVSDB transaction failed: {error}: {details}")]
    Transaction { error: String, details: String },

    #[error("Malformed OVSDB response: {0}")]
    Parse(String),

    // ========================================================================
    // Object State Errors
    // ========================================================================
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    // ========================================================================
    // Netlink Errors
    // ========================================================================
    #[error("Netlink operation on {0} failed: {1}")]
    Netlink(String, String),

    #[error("Operation requires CAP_NET_ADMIN")]
    PermissionDenied,
}

impl OvsError {
    /// Errors worth retrying with backoff: the backend may come back.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OvsError::SocketNotFound(_)
                | OvsError::Connection(_, _)
                | OvsError::ConnectionClosed(_)
                | OvsError::Timeout(_, _)
        )
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            OvsError::NotFound(_) => true,
            OvsError::Transaction { error, details } => {
                error.contains("not found") || details.contains("no row")
            }
            _ => false,
        }
    }

    pub fn is_already_exists(&self) -> bool {
        match self {
            OvsError::AlreadyExists(_) => true,
            OvsError::Transaction { error, details } => {
                error == "constraint violation"
                    || details.contains("already exists")
                    || details.contains("duplicate")
            }
            _ => false,
        }
    }

    /// A `wait` guard in the transaction did not hold: the rows changed
    /// between our read and our write.
    pub fn is_guard_failed(&self) -> bool {
        matches!(self, OvsError::Transaction { error, .. } if error == "timed out")
    }

    /// Get a helpful suggestion for resolving this error
    pub fn suggestion(&self) -> &'static str {
        match self {
            OvsError::SocketNotFound(_) => "Start OVS: systemctl start openvswitch-switch",
            OvsError::Connection(_, _) | OvsError::Timeout(_, _) => {
                "Check that ovsdb-server / ovn-northd are running and reachable"
            }
            OvsError::PermissionDenied => "Run with CAP_NET_ADMIN or as root",
            OvsError::InvalidEndpoint(_) => "Use tcp:<host>:<port> or unix:<path>",
            _ => "Check system logs for more details",
        }
    }

    /// Convert into the lifecycle taxonomy, tagging which backend failed.
    pub fn into_error(self, backend: Backend) -> Error {
        if self.is_transient() {
            Error::unavailable(backend, self.to_string())
        } else if matches!(self, OvsError::InvalidEndpoint(_)) {
            Error::configuration(self.to_string())
        } else {
            Error::backend(backend, self.to_string())
        }
    }
}

pub type OvsResult<T> = std::result::Result<T, OvsError>;
