//! Message transport seam between a relay connection and the network.
//!
//! A [`Connector`] opens one bidirectional text channel to a relay URL and
//! hands back a [`Transport`] for writing plus a receiver of
//! [`TransportEvent`]s for everything the peer does. The future returned by
//! [`Connector::connect`] resolving is the "open" notification.

use crate::error::{ClientError, Result};
use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

/// Inbound notifications from an open transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A text frame
    Message(String),
    /// The peer closed the channel
    Closed { reason: Option<String> },
    /// The channel failed
    Error(String),
}

/// Write half of an open transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one text frame.
    async fn send(&self, text: String) -> Result<()>;

    /// Close the channel. No further events are reported after this returns.
    async fn close(&self) -> Result<()>;
}

/// An open transport and its inbound event stream.
pub struct TransportHandle {
    pub transport: Box<dyn Transport>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens transports to relay URLs.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<TransportHandle>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket connector backed by `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &Url) -> Result<TransportHandle> {
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| ClientError::WebSocket(e.to_string()))?;
        let (sink, mut stream) = stream.split();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let relay = url.to_string();

        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let event = match frame {
                    Ok(Message::Text(text)) => TransportEvent::Message(text.to_string()),
                    Ok(Message::Close(frame)) => {
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .filter(|r| !r.is_empty());
                        let _ = events_tx.send(TransportEvent::Closed { reason });
                        return;
                    }
                    // Pings are answered by tungstenite on the next read
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("WebSocket error from {}: {}", relay, e);
                        let _ = events_tx.send(TransportEvent::Error(e.to_string()));
                        return;
                    }
                };
                if events_tx.send(event).is_err() {
                    debug!("Transport listener for {} dropped", relay);
                    return;
                }
            }
            let _ = events_tx.send(TransportEvent::Closed { reason: None });
        });

        Ok(TransportHandle {
            transport: Box::new(WebSocketTransport {
                sink: Mutex::new(sink),
                reader,
            }),
            events: events_rx,
        })
    }
}

struct WebSocketTransport {
    sink: Mutex<SplitSink<WsStream, Message>>,
    reader: JoinHandle<()>,
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&self, text: String) -> Result<()> {
        self.sink
            .lock()
            .await
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| ClientError::WebSocket(e.to_string()))
    }

    async fn close(&self) -> Result<()> {
        self.reader.abort();
        self.sink
            .lock()
            .await
            .close()
            .await
            .map_err(|e| ClientError::WebSocket(e.to_string()))
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
