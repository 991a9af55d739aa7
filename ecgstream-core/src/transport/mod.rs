//! Connection lifecycle to the analysis service.
//!
//! ## State machine
//!
//! ```text
//! Idle ──connect()──► Connecting ──opened──► Open ──remote close / close()──► Closed
//!                         │                    └──transport error──────────► Failed
//!                         └──handshake error──────────────────────────────► Failed
//! ```
//!
//! Socket I/O lives behind two traits: a [`Connector`] starts a connection in
//! the background and reports back through [`ConnectionEvent`]s, and the
//! [`Transport`] it hands over on open carries outbound frames. Every
//! `connect()` allocates a new [`ConnectionId`]; events tagged with any other
//! id belong to a superseded socket and are ignored.
//!
//! Reconnection only ever happens through an explicit `connect()`.

pub mod websocket;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{Result, StreamError};

pub use websocket::WebSocketConnector;

/// Identifies one connection attempt.
pub type ConnectionId = u64;

/// Lifecycle state of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Open,
    Closed,
    Failed,
}

/// Outbound half of an open connection.
pub trait Transport: Send + 'static {
    /// Queue one text frame for transmission.
    ///
    /// # Errors
    /// `StreamError::TransportFailure` if the underlying socket is gone.
    fn send_text(&mut self, text: String) -> Result<()>;

    /// Begin a graceful close. Further sends are not expected.
    fn close(&mut self);
}

/// Notifications from a background connection task.
pub enum ConnectionEvent {
    Opened {
        conn_id: ConnectionId,
        transport: Box<dyn Transport>,
    },
    Message {
        conn_id: ConnectionId,
        text: String,
    },
    Closed {
        conn_id: ConnectionId,
        reason: Option<String>,
    },
    Failed {
        conn_id: ConnectionId,
        reason: String,
    },
}

impl ConnectionEvent {
    pub fn conn_id(&self) -> ConnectionId {
        match self {
            Self::Opened { conn_id, .. }
            | Self::Message { conn_id, .. }
            | Self::Closed { conn_id, .. }
            | Self::Failed { conn_id, .. } => *conn_id,
        }
    }
}

impl fmt::Debug for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Opened { conn_id, .. } => f
                .debug_struct("Opened")
                .field("conn_id", conn_id)
                .finish_non_exhaustive(),
            Self::Message { conn_id, text } => f
                .debug_struct("Message")
                .field("conn_id", conn_id)
                .field("bytes", &text.len())
                .finish(),
            Self::Closed { conn_id, reason } => f
                .debug_struct("Closed")
                .field("conn_id", conn_id)
                .field("reason", reason)
                .finish(),
            Self::Failed { conn_id, reason } => f
                .debug_struct("Failed")
                .field("conn_id", conn_id)
                .field("reason", reason)
                .finish(),
        }
    }
}

pub type ConnectionEventSender = mpsc::UnboundedSender<ConnectionEvent>;
pub type ConnectionEventReceiver = mpsc::UnboundedReceiver<ConnectionEvent>;

/// Starts connections in the background.
///
/// Implementations must report the outcome of every attempt through
/// `events`, tagged with `conn_id`: `Opened` or `Failed`, then any number of
/// `Message`s, then at most one `Closed` or `Failed`.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, endpoint: &str, conn_id: ConnectionId, events: ConnectionEventSender);
}

/// What a connection event meant for the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionUpdate {
    /// Event from a superseded connection, or out of order.
    Ignored,
    Opened,
    Message(String),
    Closed(Option<String>),
    Failed(String),
}

/// Owns the physical connection handle and its lifecycle state.
pub struct ConnectionManager {
    endpoint: String,
    connector: Arc<dyn Connector>,
    events: ConnectionEventSender,
    state: ConnectionState,
    next_conn_id: ConnectionId,
    active: Option<ConnectionId>,
    transport: Option<Box<dyn Transport>>,
}

impl ConnectionManager {
    pub fn new(
        endpoint: impl Into<String>,
        connector: Arc<dyn Connector>,
        events: ConnectionEventSender,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            connector,
            events,
            state: ConnectionState::Idle,
            next_conn_id: 1,
            active: None,
            transport: None,
        }
    }

    /// Open a new connection, closing any previous one first.
    pub fn connect(&mut self) -> ConnectionId {
        if self.active.is_some() {
            self.close();
        }
        let conn_id = self.next_conn_id;
        self.next_conn_id += 1;
        self.active = Some(conn_id);
        self.state = ConnectionState::Connecting;
        info!(endpoint = %self.endpoint, conn_id, "connecting to analysis service");
        self.connector
            .connect(&self.endpoint, conn_id, self.events.clone());
        conn_id
    }

    /// Close the current connection, if any. Idempotent.
    pub fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        if self.active.take().is_some() {
            info!(endpoint = %self.endpoint, "connection closed by client");
            self.state = ConnectionState::Closed;
        }
    }

    /// Send one text frame.
    ///
    /// # Errors
    /// - `StreamError::NotConnected` unless the connection is `Open`.
    /// - `StreamError::TransportFailure` if the socket rejected the frame;
    ///   the connection moves to `Failed`.
    pub fn send(&mut self, text: String) -> Result<()> {
        if self.state != ConnectionState::Open {
            return Err(StreamError::NotConnected);
        }
        let Some(transport) = self.transport.as_mut() else {
            return Err(StreamError::NotConnected);
        };
        if let Err(e) = transport.send_text(text) {
            warn!(error = %e, "send failed, marking connection failed");
            self.transport = None;
            self.active = None;
            self.state = ConnectionState::Failed;
            return Err(e);
        }
        Ok(())
    }

    /// Apply one event from a background connection task.
    pub fn handle_event(&mut self, event: ConnectionEvent) -> ConnectionUpdate {
        if self.active != Some(event.conn_id()) {
            debug!(event = ?event, "ignoring event from superseded connection");
            if let ConnectionEvent::Opened { mut transport, .. } = event {
                transport.close();
            }
            return ConnectionUpdate::Ignored;
        }

        match event {
            ConnectionEvent::Opened { mut transport, conn_id } => {
                if self.state != ConnectionState::Connecting {
                    transport.close();
                    return ConnectionUpdate::Ignored;
                }
                self.transport = Some(transport);
                self.state = ConnectionState::Open;
                info!(conn_id, "connection open");
                ConnectionUpdate::Opened
            }
            ConnectionEvent::Message { text, .. } => {
                if self.state != ConnectionState::Open {
                    return ConnectionUpdate::Ignored;
                }
                ConnectionUpdate::Message(text)
            }
            ConnectionEvent::Closed { reason, conn_id } => {
                info!(conn_id, reason = ?reason, "connection closed by remote");
                self.transport = None;
                self.active = None;
                self.state = ConnectionState::Closed;
                ConnectionUpdate::Closed(reason)
            }
            ConnectionEvent::Failed { reason, conn_id } => {
                warn!(conn_id, %reason, "connection failed");
                self.transport = None;
                self.active = None;
                self.state = ConnectionState::Failed;
                ConnectionUpdate::Failed(reason)
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Change the endpoint used by the next `connect()`.
    pub fn set_endpoint(&mut self, endpoint: impl Into<String>) {
        self.endpoint = endpoint.into();
    }

    /// Id of the connection currently connecting or open.
    pub fn active_connection(&self) -> Option<ConnectionId> {
        self.active
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("endpoint", &self.endpoint)
            .field("state", &self.state)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}
