//! Customized unified error type carrying the cluster fault taxonomy.

use std::error;
use std::fmt;
use std::io;
use std::net;
use std::num;
use std::string;

use bytes::Bytes;

/// Customized error type for replicall.
///
/// Cluster faults that a caller may act on get their own variants; everything
/// else collapses into the `Msg` catch-all.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ReplicallError {
    /// A registration attempt hit an identity that is already registered on
    /// this node. Fatal to that attempt; never retried automatically.
    DuplicateRegistration(String),

    /// No target is registered under the identity on this node. Expected and
    /// retryable while cluster membership convergence is in progress.
    NotRegistered(String),

    /// No live endpoint is left to try for the service.
    NoEndpointAvailable(String),

    /// Retryable cluster routing fault reported by a server.
    Routing(String),

    /// Application-level fault payload, passed through unmodified.
    Application(Bytes),

    /// Everything else.
    Msg(String),
}

impl ReplicallError {
    pub fn msg(msg: impl ToString) -> Self {
        ReplicallError::Msg(msg.to_string())
    }

    /// Whether this layer considers the failed call safe to retry against
    /// another replicant.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            ReplicallError::NotRegistered(_) | ReplicallError::Routing(_)
        )
    }
}

impl fmt::Display for ReplicallError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ReplicallError::DuplicateRegistration(s) => {
                write!(f, "duplicate registration: {}", s)
            }
            ReplicallError::NotRegistered(s) => {
                write!(f, "not registered: {}", s)
            }
            ReplicallError::NoEndpointAvailable(s) => {
                write!(f, "no endpoint available: {}", s)
            }
            ReplicallError::Routing(s) => write!(f, "cluster routing: {}", s),
            ReplicallError::Application(payload) => {
                write!(f, "application fault ({} bytes)", payload.len())
            }
            ReplicallError::Msg(s) => write!(f, "{}", s), // no literal quotes
        }
    }
}

impl error::Error for ReplicallError {}

// Helper macro for saving boiler-plate `impl From<X>`s for transparent
// conversion from various common error types to `ReplicallError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for ReplicallError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                ReplicallError::msg(e.to_string())
            }
        }
    };
}

// Helper macro for saving boiler-plate `impl From<X<T>>`s for transparent
// conversion from various common generic error types to `ReplicallError`.
macro_rules! impl_from_error_generic {
    ($error:ty) => {
        impl<T> From<$error> for ReplicallError {
            fn from(e: $error) -> ReplicallError {
                ReplicallError::msg(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(string::FromUtf8Error);
impl_from_error!(num::ParseIntError);
impl_from_error!(net::AddrParseError);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::de::Error);

impl_from_error_generic!(tokio::sync::mpsc::error::SendError<T>);
impl_from_error_generic!(tokio::sync::watch::error::SendError<T>);
