//! Error types.

use thiserror::Error;

use crate::connector::ConnectorId;

/// Errors raised by the connector tracker and the session around it.
///
/// All of these indicate a programming error in the surrounding framework code rather than
/// something the end user did.
#[derive(Debug, Error)]
pub enum TrackerError {
    /// A different connector instance is already registered under this id.
    #[error("a connector with id {id} is already registered")]
    ConflictingRegistration { id: ConnectorId },

    /// The connector being unregistered is not the one registered under its id.
    #[error("the given connector with id {id} is not the one that was registered for that id")]
    ForeignConnector { id: ConnectorId },

    /// The operation needs a registered connector.
    #[error("connector {id} is not registered")]
    NotRegistered { id: ConnectorId },

    /// The operation needs a connector id, but none has been assigned yet.
    #[error("{connector} has no connector id; register it first")]
    MissingId { connector: String },

    /// Connectors must not change while a response is being written.
    #[error("{connector} was marked as dirty while a response is being written")]
    DirtyWhileWriting { connector: String },

    /// `set_writing_response` was called with the current value.
    #[error("writing response is already {writing}")]
    WritingStateUnchanged { writing: bool },

    /// The requested change would break the tree (cycles, detaching the root).
    #[error("invalid hierarchy change: {reason}")]
    InvalidHierarchy { reason: String },

    /// A connector’s shared state could not be encoded.
    #[error("failed to encode state of connector {id}: {source}")]
    State {
        id: ConnectorId,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors from loading a [`SessionConfig`](crate::SessionConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("environment variable error: {0}")]
    Env(#[from] envy::Error),
}
