//! Error types for the upstream client, the downstream server and the
//! command-handler layer.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Failures surfaced by [`crate::upstream::UpstreamClient`].
#[derive(Debug, Clone, Error, PartialEq)]
pub enum UpstreamError {
    /// Local deadline elapsed before a matching response arrived.
    #[error("upstream request timed out after {0:?}")]
    Timeout(Duration),

    /// The connection dropped while the request was in flight.
    #[error("upstream connection lost")]
    Disconnected,

    /// No connection is open.
    #[error("not connected to upstream")]
    NotConnected,

    /// The upstream API answered with an `error` object.
    #[error("upstream error {code}: {message}")]
    Api { code: String, message: String },

    /// Socket open/write failure.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid request payload: {0}")]
    InvalidPayload(String),

    #[error("subscribe response carried no subscription id")]
    MissingSubscriptionId,
}

impl UpstreamError {
    /// `true` for failures caused by the connection rather than the request.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Disconnected | Self::NotConnected | Self::Transport(_)
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for UpstreamError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

/// Failures surfaced by [`crate::downstream::DownstreamServer`].
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("downstream server is already running")]
    AlreadyRunning,

    #[error("client {0} is not connected")]
    ClientNotFound(uuid::Uuid),

    /// The client's outbound queue is full; the frame was dropped.
    #[error("client {0} outbound queue is full")]
    ClientBackpressure(uuid::Uuid),

    #[error("failed to serialize frame: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A handler-layer failure, carried to the client in the response
/// envelope's `error` object.
#[derive(Debug, Clone, Error, PartialEq, Serialize)]
#[error("{code}: {message}")]
pub struct CommandError {
    pub code: String,
    pub message: String,
}

impl CommandError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}
