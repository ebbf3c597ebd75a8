use std::time::Duration;

use thiserror::Error;

use crate::registry::SubscriptionId;

/// Defines the primary error types surfaced by the client.
///
/// Errors are delivered both as `Result` values from the public API and over
/// the shared error channel (see [`crate::client::StargridClient::errors`]).
/// The channel fans out to every listener, so variants carry owned, clonable
/// payloads; transport and decode causes are rendered to strings at the
/// boundary where they occur.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The transport did not report "open" within the configured deadline.
    /// Recoverable: the caller may retry `connect`.
    #[error("connection attempt timed out after {0:?}")]
    ConnectionTimeout(Duration),

    /// An operation requiring an open session was invoked while disconnected.
    #[error("not connected to a Stargrid server")]
    NotConnected,

    /// The server rejected a transaction subscription. Emitted exactly once
    /// on the error channel, keyed by the id of the originating request.
    #[error("subscription {id} failed: {message}")]
    Subscription { id: SubscriptionId, message: String },

    /// An inbound payload could not be decoded. Non-fatal: message
    /// processing continues with the next frame.
    #[error("malformed server payload: {0}")]
    Decode(String),

    /// A transport-level failure, forwarded verbatim. Typically followed by
    /// the terminal close signal.
    #[error("transport error: {0}")]
    Transport(String),

    /// A user-supplied connect handler returned an error. Redirected to the
    /// error channel so a misbehaving handler never disturbs dispatch.
    #[error("connect handler failed: {0}")]
    Handler(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ClientError::Transport(err.to_string())
    }
}
