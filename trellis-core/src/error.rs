//! Error types for the Trellis engine.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong while reading, writing, or dispatching.
#[derive(Debug, Error)]
pub enum Error {
    /// A tracked read ran without a consumer in scope.
    #[error("tracked read of `{target}` with no consumer in scope")]
    NoConsumerInScope { target: String },

    /// A write or command ran without a causal batch in scope.
    #[error("write to `{target}` with no causal batch in scope")]
    NoBatchInScope { target: String },

    /// A query's read expression failed for a synchronous caller.
    #[error("query `{key}` failed: {source}")]
    QueryFailed {
        key: String,
        #[source]
        source: Box<Error>,
    },

    /// A command body returned an error. Writes committed before the
    /// failure stay committed.
    #[error("command `{key}` failed: {source}")]
    CommandFailed {
        key: String,
        #[source]
        source: Box<Error>,
    },

    /// A query's background forwarder stopped after its expression failed.
    #[error("forwarder for query `{key}` stopped: {source}")]
    ForwarderFailed {
        key: String,
        #[source]
        source: Box<Error>,
    },

    /// A write was attempted by a single-flight run that has since been
    /// replaced by a newer one.
    #[error("single-flight run on `{slot}` was superseded")]
    Superseded { slot: String },

    #[error("domain `{domain}` has no query named `{name}`")]
    UnknownQuery { domain: String, name: String },

    #[error("domain `{domain}` has no command named `{name}`")]
    UnknownCommand { domain: String, name: String },

    /// A typed lookup asked for the wrong value or argument type.
    #[error("`{name}` in domain `{domain}` is not a {expected}")]
    HandleTypeMismatch {
        domain: String,
        name: String,
        expected: &'static str,
    },

    #[error("domain `{domain}` registers `{name}` twice")]
    DuplicateEntry { domain: String, name: String },

    /// The runtime was created outside of a tokio runtime.
    #[error("no tokio runtime available to drive background tasks")]
    NoAsyncRuntime,

    #[error("invalid runtime configuration: {0}")]
    Config(#[from] serde_json::Error),

    /// Free-form failure raised by user code (query expressions, command
    /// bodies, batch tasks).
    #[error("{0}")]
    Message(String),
}

impl Error {
    /// Build a free-form failure from anything printable.
    pub fn msg(message: impl std::fmt::Display) -> Self {
        Self::Message(message.to_string())
    }
}
