//! WebSocket connector built on `tokio-tungstenite`.
//!
//! Each connection runs as one spawned task: it performs the handshake,
//! splits the socket, spawns a writer task fed by an unbounded channel (the
//! [`Transport`] handed to the session), and then reads frames until the
//! socket closes or errors. Text frames become `ConnectionEvent::Message`.

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::{ConnectionEvent, ConnectionEventSender, ConnectionId, Connector, Transport};
use crate::error::{Result, StreamError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens plain or TLS WebSocket connections (`ws://` / `wss://`).
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for WebSocketConnector {
    fn connect(&self, endpoint: &str, conn_id: ConnectionId, events: ConnectionEventSender) {
        tokio::spawn(run_connection(endpoint.to_string(), conn_id, events));
    }
}

/// Outbound half: frames are queued for the writer task.
#[derive(Debug)]
pub struct WebSocketTransport {
    tx: mpsc::UnboundedSender<Message>,
}

impl Transport for WebSocketTransport {
    fn send_text(&mut self, text: String) -> Result<()> {
        self.tx
            .send(Message::Text(text.into()))
            .map_err(|_| StreamError::TransportFailure("websocket writer has stopped".into()))
    }

    fn close(&mut self) {
        let _ = self.tx.send(Message::Close(None));
    }
}

async fn run_connection(endpoint: String, conn_id: ConnectionId, events: ConnectionEventSender) {
    let ws_stream = match connect_async(endpoint.as_str()).await {
        Ok((stream, _response)) => stream,
        Err(e) => {
            error!(conn_id, %endpoint, "websocket handshake failed: {e}");
            let _ = events.send(ConnectionEvent::Failed {
                conn_id,
                reason: format!("handshake failed: {e}"),
            });
            return;
        }
    };

    info!(conn_id, %endpoint, "websocket connected");

    let (write, read) = ws_stream.split();
    let (out_tx, out_rx) = mpsc::unbounded_channel::<Message>();
    tokio::spawn(write_task(write, out_rx, conn_id));

    let opened = ConnectionEvent::Opened {
        conn_id,
        transport: Box::new(WebSocketTransport { tx: out_tx }),
    };
    if events.send(opened).is_err() {
        debug!(conn_id, "session gone before connection opened");
        return;
    }

    read_task(read, conn_id, events).await;
}

/// WebSocket write task
async fn write_task(
    mut write: futures_util::stream::SplitSink<WsStream, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
    conn_id: ConnectionId,
) {
    while let Some(msg) = rx.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if let Err(e) = write.send(msg).await {
            error!(conn_id, "failed to send websocket frame: {e}");
            break;
        }
        if closing {
            break;
        }
    }

    let _ = write.close().await;
    debug!(conn_id, "websocket write task ended");
}

/// WebSocket read task
async fn read_task(
    mut read: futures_util::stream::SplitStream<WsStream>,
    conn_id: ConnectionId,
    events: ConnectionEventSender,
) {
    while let Some(frame) = read.next().await {
        let event = match frame {
            Ok(Message::Text(text)) => ConnectionEvent::Message {
                conn_id,
                text: text.as_str().to_string(),
            },
            Ok(Message::Binary(data)) => {
                warn!(conn_id, bytes = data.len(), "ignoring binary frame");
                continue;
            }
            Ok(Message::Close(frame)) => {
                let reason = frame
                    .map(|f| f.reason.as_str().to_string())
                    .filter(|r| !r.is_empty());
                let _ = events.send(ConnectionEvent::Closed { conn_id, reason });
                debug!(conn_id, "websocket read task ended on close frame");
                return;
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => continue,
            Err(e) => {
                error!(conn_id, "websocket error: {e}");
                let _ = events.send(ConnectionEvent::Failed {
                    conn_id,
                    reason: e.to_string(),
                });
                return;
            }
        };

        if events.send(event).is_err() {
            debug!(conn_id, "session gone, dropping connection");
            return;
        }
    }

    let _ = events.send(ConnectionEvent::Closed {
        conn_id,
        reason: None,
    });
    debug!(conn_id, "websocket read task ended");
}
