//! Error taxonomy shared by every ovsnet crate
//!
//! Each lifecycle operation either succeeds completely or reports exactly one
//! of these errors. Adapter and store crates convert their own error types
//! into this one at the crate boundary.

use thiserror::Error;

/// Which external control plane an operation was talking to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Local virtual switch (Open_vSwitch database)
    Bridge,
    /// SDN logical control plane (OVN northbound database)
    Sdn,
    /// Host network links (netlink)
    Link,
    /// Container runtime used for control-plane auto-provisioning
    Runtime,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Backend::Bridge => "bridge",
            Backend::Sdn => "sdn",
            Backend::Link => "link",
            Backend::Runtime => "runtime",
        };
        f.write_str(name)
    }
}

/// Main error type for ovsnet operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("address pool exhausted on network {0}")]
    AddressExhausted(String),

    #[error("address {address} conflicts on network {network}: {reason}")]
    AddressConflict {
        network: String,
        address: String,
        reason: String,
    },

    #[error("{backend} backend unavailable: {message}")]
    BackendUnavailable { backend: Backend, message: String },

    #[error("{backend} operation failed: {message}")]
    Backend { backend: Backend, message: String },

    #[error("state corruption: {0}")]
    StateCorruption(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        Error::Precondition(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn conflict(
        network: impl Into<String>,
        address: impl std::fmt::Display,
        reason: impl Into<String>,
    ) -> Self {
        Error::AddressConflict {
            network: network.into(),
            address: address.to_string(),
            reason: reason.into(),
        }
    }

    pub fn unavailable(backend: Backend, msg: impl Into<String>) -> Self {
        Error::BackendUnavailable {
            backend,
            message: msg.into(),
        }
    }

    pub fn backend(backend: Backend, msg: impl Into<String>) -> Self {
        Error::Backend {
            backend,
            message: msg.into(),
        }
    }

    /// Stable machine-readable name, used in protocol error responses
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Configuration(_) => "ConfigurationError",
            Error::Precondition(_) => "PreconditionError",
            Error::AddressExhausted(_) => "AddressExhaustedError",
            Error::AddressConflict { .. } => "AddressConflictError",
            Error::BackendUnavailable { .. } => "BackendUnavailableError",
            Error::Backend { .. } => "BackendError",
            Error::StateCorruption(_) => "StateCorruptionError",
            Error::NotFound(_) => "NotFoundError",
            Error::Io(_) => "IoError",
            Error::Serialization(_) => "SerializationError",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        assert_eq!(Error::configuration("x").kind(), "ConfigurationError");
        assert_eq!(
            Error::unavailable(Backend::Sdn, "down").kind(),
            "BackendUnavailableError"
        );
        assert_eq!(
            Error::AddressExhausted("n1".into()).kind(),
            "AddressExhaustedError"
        );
    }

    #[test]
    fn test_display_includes_backend() {
        let err = Error::backend(Backend::Bridge, "no such bridge");
        assert_eq!(err.to_string(), "bridge operation failed: no such bridge");
    }
}
