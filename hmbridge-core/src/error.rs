//! Error types for the bridge.

use std::time::Duration;

use thiserror::Error;

/// Result type alias using [`BridgeError`].
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Errors raised by a single RPC exchange with a controller.
///
/// These are soft failures: they are logged where they happen and handed
/// back to the caller, never escalated into a bridge-wide error.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RpcError {
    /// The request never got an answer (DNS, connect, HTTP failure).
    #[error("Transport error: {0}")]
    Transport(String),

    /// The remote answered with a fault.
    #[error("RPC fault {code}: {message}")]
    Fault { code: i64, message: String },

    /// The remote answered with something we could not interpret.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// The configured request timeout elapsed.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
}

impl RpcError {
    /// Create a fault.
    pub fn fault(code: i64, message: impl Into<String>) -> Self {
        Self::Fault {
            code,
            message: message.into(),
        }
    }

    /// Fault used for malformed inbound parameters.
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::fault(-32602, message)
    }

    /// Whether the remote actually answered (faults) or was unreachable.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout(_))
    }
}

/// Errors that can occur in the bridge.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file not found.
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// Configuration parse error.
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(String),

    /// Configuration validation error.
    #[error("Configuration validation failed: {0}")]
    ConfigValidation(String),

    /// None of the configured remotes could be set up.
    #[error("No remote could be connected")]
    NoRemotes,

    /// The named remote is not configured or not connected.
    #[error("Unknown remote: {0}")]
    UnknownRemote(String),

    /// No node (or no node-table entry) for the given address or name.
    #[error("Unknown node {name} on {address}")]
    UnknownNode { address: String, name: String },

    /// A value could not be converted to the requested type.
    #[error("Unexpected value for {key}: {value}")]
    UnexpectedValue { key: String, value: String },

    /// Lifecycle method called in the wrong state.
    #[error("Invalid bridge state: expected {expected}, found {actual}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    /// RPC error bubbled up from a single call.
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// Callback server error.
    #[error("Callback server error: {0}")]
    Server(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a configuration validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ConfigValidation(msg.into())
    }

    /// Create a server error.
    pub fn server(msg: impl Into<String>) -> Self {
        Self::Server(msg.into())
    }

    /// Create an unknown-node error.
    pub fn unknown_node(address: impl Into<String>, name: impl Into<String>) -> Self {
        Self::UnknownNode {
            address: address.into(),
            name: name.into(),
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<hmbridge_common::Error> for BridgeError {
    fn from(err: hmbridge_common::Error) -> Self {
        Self::Config(err.to_string())
    }
}
