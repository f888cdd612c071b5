//! Connection wrapper bound to one accepted socket.
//!
//! The socket itself is owned by the connection task; everything else talks
//! to it through the outbound queue held here. Outbound packets go through a
//! per-class [`PacketDeliverer`].

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info};

use super::handler::ConnectionKind;
use crate::error::DeliveryError;

pub const STREAM_NS: &str = "http://etherx.jabber.org/streams";
pub const STREAM_CLOSE: &str = "</stream:stream>";
const STREAMS_ERROR_NS: &str = "urn:ietf:params:xml:ns:xmpp-streams";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionState {
    Accepted = 0,
    Handshaking = 1,
    Established = 2,
    Closing = 3,
    Closed = 4,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Accepted,
            1 => ConnectionState::Handshaking,
            2 => ConnectionState::Established,
            3 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// RFC 6120 §4.9.3 stream error conditions used by this server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorCondition {
    BadFormat,
    ConnectionTimeout,
    HostUnknown,
    ImproperAddressing,
    InternalServerError,
    InvalidNamespace,
    NotAuthorized,
    NotWellFormed,
    PolicyViolation,
    SystemShutdown,
    UnsupportedEncoding,
    UnsupportedStanzaType,
}

impl StreamErrorCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamErrorCondition::BadFormat => "bad-format",
            StreamErrorCondition::ConnectionTimeout => "connection-timeout",
            StreamErrorCondition::HostUnknown => "host-unknown",
            StreamErrorCondition::ImproperAddressing => "improper-addressing",
            StreamErrorCondition::InternalServerError => "internal-server-error",
            StreamErrorCondition::InvalidNamespace => "invalid-namespace",
            StreamErrorCondition::NotAuthorized => "not-authorized",
            StreamErrorCondition::NotWellFormed => "not-well-formed",
            StreamErrorCondition::PolicyViolation => "policy-violation",
            StreamErrorCondition::SystemShutdown => "system-shutdown",
            StreamErrorCondition::UnsupportedEncoding => "unsupported-encoding",
            StreamErrorCondition::UnsupportedStanzaType => "unsupported-stanza-type",
        }
    }

    pub fn to_xml(&self) -> String {
        format!(
            "<stream:error><{} xmlns='{}'/></stream:error>",
            self.as_str(),
            STREAMS_ERROR_NS
        )
    }
}

impl fmt::Display for StreamErrorCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opening stream header sent by the server.
pub fn stream_header(kind: ConnectionKind, domain: &str, stream_id: &str) -> String {
    format!(
        "<?xml version='1.0'?><stream:stream xmlns:stream='{}' xmlns='{}' from='{}' id='{}' version='1.0'>",
        STREAM_NS,
        kind.namespace(),
        domain,
        stream_id
    )
}

/// Item queued for the connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    /// Flush what is queued, then shut the socket down.
    Close,
}

/// Outbound packet delivery, chosen per connection class.
pub trait PacketDeliverer: Send + Sync {
    fn deliver(&self, connection: &Connection, stanza: String) -> Result<(), DeliveryError>;
}

/// Writes straight to the connection's own socket.
#[derive(Debug, Default)]
pub struct SocketDeliverer;

impl PacketDeliverer for SocketDeliverer {
    fn deliver(&self, connection: &Connection, stanza: String) -> Result<(), DeliveryError> {
        connection.write_raw(stanza)
    }
}

/// Live connections of each connection manager, keyed by the manager's
/// stream `from` address. A manager may open several connections; any of
/// them can carry traffic for the clients behind it.
#[derive(Debug, Default)]
pub struct MultiplexerRegistry {
    groups: DashMap<String, Vec<Weak<Connection>>>,
    members: DashMap<u64, String>,
}

impl MultiplexerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, connection: &Arc<Connection>) {
        self.unregister(connection.id());
        let mut group = self.groups.entry(name.to_string()).or_default();
        group.retain(|c| c.strong_count() > 0);
        group.push(Arc::downgrade(connection));
        drop(group);
        self.members.insert(connection.id(), name.to_string());
        info!(multiplexer = %name, conn_id = connection.id(), "Connection manager session registered");
    }

    pub fn unregister(&self, connection_id: u64) {
        let Some((_, name)) = self.members.remove(&connection_id) else {
            return;
        };
        let empty = match self.groups.get_mut(&name) {
            Some(mut group) => {
                group.retain(|c| {
                    c.upgrade()
                        .map(|c| c.id() != connection_id)
                        .unwrap_or(false)
                });
                group.is_empty()
            }
            None => false,
        };
        if empty {
            self.groups.remove_if(&name, |_, group| group.is_empty());
        }
    }

    /// Open connections registered under `name`.
    pub fn connections(&self, name: &str) -> Vec<Arc<Connection>> {
        self.groups
            .get(name)
            .map(|group| {
                group
                    .iter()
                    .filter_map(Weak::upgrade)
                    .filter(|c| !c.is_closing())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Open connections of the same manager, other than `connection_id`.
    pub fn alternatives(&self, connection_id: u64) -> Vec<Arc<Connection>> {
        let Some(name) = self.members.get(&connection_id).map(|n| n.value().clone()) else {
            return Vec::new();
        };
        self.connections(&name)
            .into_iter()
            .filter(|c| c.id() != connection_id)
            .collect()
    }

    pub fn name_of(&self, connection_id: u64) -> Option<String> {
        self.members.get(&connection_id).map(|n| n.value().clone())
    }
}

/// Delivers to the connection itself while it is open, otherwise through
/// another open connection of the same connection manager.
pub struct MultiplexerDeliverer {
    registry: Arc<MultiplexerRegistry>,
}

impl MultiplexerDeliverer {
    pub fn new(registry: Arc<MultiplexerRegistry>) -> Self {
        Self { registry }
    }
}

impl PacketDeliverer for MultiplexerDeliverer {
    fn deliver(&self, connection: &Connection, stanza: String) -> Result<(), DeliveryError> {
        if !connection.is_closing() {
            if let Ok(()) = connection.write_raw(stanza.clone()) {
                return Ok(());
            }
        }
        for alternative in self.registry.alternatives(connection.id()) {
            if alternative.write_raw(stanza.clone()).is_ok() {
                debug!(
                    conn_id = connection.id(),
                    via = alternative.id(),
                    "Rerouted packet through another connection manager session"
                );
                return Ok(());
            }
        }
        let name = self
            .registry
            .name_of(connection.id())
            .unwrap_or_else(|| connection.peer_addr().ip().to_string());
        Err(DeliveryError::NoRoute(name))
    }
}

pub struct Connection {
    id: u64,
    kind: ConnectionKind,
    peer_addr: SocketAddr,
    domain: Arc<str>,
    state: AtomicU8,
    header_sent: AtomicBool,
    outbound: mpsc::UnboundedSender<Outbound>,
    deliverer: Arc<dyn PacketDeliverer>,
    closed: Notify,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    pub fn new(
        id: u64,
        kind: ConnectionKind,
        peer_addr: SocketAddr,
        domain: Arc<str>,
        deliverer: Arc<dyn PacketDeliverer>,
    ) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let connection = Self {
            id,
            kind,
            peer_addr,
            domain,
            state: AtomicU8::new(ConnectionState::Accepted as u8),
            header_sent: AtomicBool::new(false),
            outbound,
            deliverer,
            closed: Notify::new(),
        };
        (connection, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Move forward in the state machine. Never moves backwards and never
    /// leaves `Closing`/`Closed` through this path.
    pub fn advance(&self, next: ConnectionState) {
        let _ = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current < next as u8 && current < ConnectionState::Closing as u8)
                    .then_some(next as u8)
            });
    }

    pub fn is_closing(&self) -> bool {
        self.state() >= ConnectionState::Closing
    }

    /// Deliver an outbound packet through this connection's deliverer.
    pub fn deliver(&self, stanza: String) -> Result<(), DeliveryError> {
        self.deliverer.deliver(self, stanza)
    }

    /// Queue text for the socket, bypassing the deliverer.
    pub fn write_raw(&self, text: impl Into<String>) -> Result<(), DeliveryError> {
        if self.is_closing() {
            return Err(DeliveryError::ConnectionClosed(self.id));
        }
        self.outbound
            .send(Outbound::Text(text.into()))
            .map_err(|_| DeliveryError::ConnectionClosed(self.id))
    }

    /// Send our stream header. Allowed again on stream restart.
    pub fn send_header(&self, stream_id: &str) -> Result<(), DeliveryError> {
        self.write_raw(stream_header(self.kind, &self.domain, stream_id))?;
        self.header_sent.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn header_sent(&self) -> bool {
        self.header_sent.load(Ordering::SeqCst)
    }

    /// Close the stream normally.
    pub fn close(&self) {
        if !self.begin_close() {
            return;
        }
        if self.header_sent() {
            let _ = self.outbound.send(Outbound::Text(STREAM_CLOSE.to_string()));
        }
        self.finish_close();
    }

    /// Close the stream with a stream error. A header goes out first if the
    /// peer has not seen one yet.
    pub fn close_with_error(&self, condition: StreamErrorCondition) {
        if !self.begin_close() {
            return;
        }
        let mut text = String::new();
        if !self.header_sent() {
            text.push_str(&stream_header(
                self.kind,
                &self.domain,
                &uuid::Uuid::new_v4().to_string(),
            ));
        }
        text.push_str(&condition.to_xml());
        text.push_str(STREAM_CLOSE);
        let _ = self.outbound.send(Outbound::Text(text));
        debug!(conn_id = self.id, condition = %condition, "Stream error sent");
        self.finish_close();
    }

    /// Resolves once `close` or `close_with_error` has run. Intended for the
    /// single task driving this connection.
    pub async fn closed(&self) {
        if self.is_closing() {
            return;
        }
        self.closed.notified().await;
    }

    pub(crate) fn mark_closed(&self) {
        self.state
            .store(ConnectionState::Closed as u8, Ordering::SeqCst);
    }

    fn begin_close(&self) -> bool {
        self.state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current < ConnectionState::Closing as u8)
                    .then_some(ConnectionState::Closing as u8)
            })
            .is_ok()
    }

    fn finish_close(&self) {
        let _ = self.outbound.send(Outbound::Close);
        self.closed.notify_one();
    }
}
