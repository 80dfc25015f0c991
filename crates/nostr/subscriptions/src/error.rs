//! Errors surfaced by connections, the pool and the client handle.

use crate::message::MessageError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    /// Transport-level failure while opening or using a socket
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Connection error: {0}")]
    Connection(String),

    /// Relay URLs must use `ws://` or `wss://`
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// A frame could not be encoded or decoded
    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Not connected to relay")]
    NotConnected,

    #[error("Already connected to relay")]
    AlreadyConnected,

    /// The connection reached `Closed` or `Error` and cannot be reopened
    #[error("Connection to {0} is terminated, a new connection is required")]
    ConnectionTerminated(String),

    #[error("No relay could be connected ({0} attempted)")]
    NoRelaysConnected(usize),

    #[error("Unknown relay: {0}")]
    UnknownRelay(String),

    /// No relay accepted the event
    #[error("Event publish failed: {0}")]
    PublishFailed(String),

    /// The subscription coordinator has shut down
    #[error("Subscription coordinator is disposed")]
    Disposed,
}

impl ClientError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClientError::WebSocket(_)
                | ClientError::Connection(_)
                | ClientError::Timeout(_)
                | ClientError::NotConnected
                | ClientError::ConnectionTerminated(_)
                | ClientError::NoRelaysConnected(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
