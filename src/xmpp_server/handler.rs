//! Connection handler: wires a freshly accepted socket to its connection
//! class.
//!
//! Every class (client, server, component, connection manager) is handled by
//! the same [`ConnectionHandler`]; a [`ConnectionPolicy`] supplies the idle
//! timeout property, the stanza handler and the packet deliverer.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use super::codec::{TrafficStats, XmppCodec};
use super::connection::{
    Connection, MultiplexerDeliverer, MultiplexerRegistry, Outbound, PacketDeliverer,
    SocketDeliverer,
};
use super::framing::DEFAULT_MAX_BUFFER_SIZE;
use super::router::PacketRouter;
use super::stanza::{
    ClientStanzaHandler, ComponentStanzaHandler, MultiplexerStanzaHandler, ServerStanzaHandler,
    StanzaHandler,
};
use crate::config::ServerProperties;
use crate::error::ConnectionError;

/// Property holding the parser's pending-data cap, in bytes.
pub const PARSER_BUFFER_SIZE_PROPERTY: &str = "xmpp.parser.buffer.size";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    Client,
    Server,
    Component,
    Multiplexer,
}

impl ConnectionKind {
    pub const ALL: [ConnectionKind; 4] = [
        ConnectionKind::Client,
        ConnectionKind::Server,
        ConnectionKind::Component,
        ConnectionKind::Multiplexer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionKind::Client => "client",
            ConnectionKind::Server => "server",
            ConnectionKind::Component => "component",
            ConnectionKind::Multiplexer => "multiplexer",
        }
    }

    pub fn idle_property(&self) -> &'static str {
        match self {
            ConnectionKind::Client => "xmpp.client.idle",
            ConnectionKind::Server => "xmpp.server.idle",
            ConnectionKind::Component => "xmpp.component.idle",
            ConnectionKind::Multiplexer => "xmpp.multiplex.idle",
        }
    }

    /// Idle timeout in milliseconds when the property is not set.
    pub fn default_idle_ms(&self) -> i64 {
        match self {
            ConnectionKind::Multiplexer => 5 * 60 * 1000,
            _ => 6 * 60 * 1000,
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            ConnectionKind::Client => 5222,
            ConnectionKind::Server => 5269,
            ConnectionKind::Component => 5275,
            ConnectionKind::Multiplexer => 5262,
        }
    }

    /// Default namespace of streams of this class.
    pub fn namespace(&self) -> &'static str {
        match self {
            ConnectionKind::Client => "jabber:client",
            ConnectionKind::Server => "jabber:server",
            ConnectionKind::Component => "jabber:component:accept",
            ConnectionKind::Multiplexer => "jabber:connectionmanager",
        }
    }
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type StanzaHandlerFactory = Arc<
    dyn Fn(Arc<Connection>, Arc<dyn PacketRouter>, &str) -> Result<Box<dyn StanzaHandler>, ConnectionError>
        + Send
        + Sync,
>;

pub type DelivererFactory =
    Arc<dyn Fn(&IoSession) -> Result<Arc<dyn PacketDeliverer>, ConnectionError> + Send + Sync>;

/// Per-class connection policy. One per connection class, shared by all of
/// its connections.
#[derive(Clone)]
pub struct ConnectionPolicy {
    pub kind: ConnectionKind,
    pub idle_timeout_key: String,
    pub default_idle_ms: i64,
    pub handler_factory: StanzaHandlerFactory,
    pub deliverer_factory: DelivererFactory,
}

impl fmt::Debug for ConnectionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPolicy")
            .field("kind", &self.kind)
            .field("idle_timeout_key", &self.idle_timeout_key)
            .field("default_idle_ms", &self.default_idle_ms)
            .finish_non_exhaustive()
    }
}

pub fn handler_factory<F>(factory: F) -> StanzaHandlerFactory
where
    F: Fn(Arc<Connection>, Arc<dyn PacketRouter>, &str) -> Result<Box<dyn StanzaHandler>, ConnectionError>
        + Send
        + Sync
        + 'static,
{
    Arc::new(factory)
}

pub fn deliverer_factory<F>(factory: F) -> DelivererFactory
where
    F: Fn(&IoSession) -> Result<Arc<dyn PacketDeliverer>, ConnectionError> + Send + Sync + 'static,
{
    Arc::new(factory)
}

fn socket_deliverer() -> DelivererFactory {
    deliverer_factory(|_| Ok(Arc::new(SocketDeliverer) as Arc<dyn PacketDeliverer>))
}

impl ConnectionPolicy {
    fn with_defaults(
        kind: ConnectionKind,
        handler_factory: StanzaHandlerFactory,
        deliverer_factory: DelivererFactory,
    ) -> Self {
        Self {
            kind,
            idle_timeout_key: kind.idle_property().to_string(),
            default_idle_ms: kind.default_idle_ms(),
            handler_factory,
            deliverer_factory,
        }
    }

    pub fn client() -> Self {
        Self::with_defaults(
            ConnectionKind::Client,
            handler_factory(|connection, router, domain| {
                Ok(Box::new(ClientStanzaHandler::new(connection, router, domain)) as Box<dyn StanzaHandler>)
            }),
            socket_deliverer(),
        )
    }

    pub fn server() -> Self {
        Self::with_defaults(
            ConnectionKind::Server,
            handler_factory(|connection, router, domain| {
                Ok(Box::new(ServerStanzaHandler::new(connection, router, domain)) as Box<dyn StanzaHandler>)
            }),
            socket_deliverer(),
        )
    }

    pub fn component() -> Self {
        Self::with_defaults(
            ConnectionKind::Component,
            handler_factory(|connection, router, domain| {
                Ok(Box::new(ComponentStanzaHandler::new(connection, router, domain)) as Box<dyn StanzaHandler>)
            }),
            socket_deliverer(),
        )
    }

    pub fn multiplexer(registry: Arc<MultiplexerRegistry>) -> Self {
        let for_handler = registry.clone();
        Self::with_defaults(
            ConnectionKind::Multiplexer,
            handler_factory(move |connection, router, domain| {
                Ok(Box::new(MultiplexerStanzaHandler::new(
                    connection,
                    router,
                    domain,
                    for_handler.clone(),
                )) as Box<dyn StanzaHandler>)
            }),
            deliverer_factory(move |_| {
                Ok(Arc::new(MultiplexerDeliverer::new(registry.clone())) as Arc<dyn PacketDeliverer>)
            }),
        )
    }

    pub fn for_kind(kind: ConnectionKind, registry: &Arc<MultiplexerRegistry>) -> Self {
        match kind {
            ConnectionKind::Client => Self::client(),
            ConnectionKind::Server => Self::server(),
            ConnectionKind::Component => Self::component(),
            ConnectionKind::Multiplexer => Self::multiplexer(registry.clone()),
        }
    }
}

/// Typed per-session attribute store, at most one value per type.
#[derive(Default)]
pub struct SessionAttributes {
    values: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl SessionAttributes {
    pub fn insert<T: Any + Send + Sync>(&mut self, value: T) -> Option<T> {
        self.values
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.values
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    pub fn remove<T: Any + Send + Sync>(&mut self) -> Option<T> {
        self.values
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }

    pub fn contains<T: Any + Send + Sync>(&self) -> bool {
        self.values.contains_key(&TypeId::of::<T>())
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Debug for SessionAttributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionAttributes")
            .field("len", &self.values.len())
            .finish()
    }
}

/// Low-level view of an accepted socket, before any protocol wiring.
#[derive(Debug)]
pub struct IoSession {
    id: u64,
    peer_addr: SocketAddr,
    idle_time: Option<Duration>,
    attributes: SessionAttributes,
}

impl IoSession {
    pub fn new(id: u64, peer_addr: SocketAddr) -> Self {
        Self {
            id,
            peer_addr,
            idle_time: None,
            attributes: SessionAttributes::default(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Read inactivity after which the connection is closed. `None` disables
    /// the timeout.
    pub fn idle_time(&self) -> Option<Duration> {
        self.idle_time
    }

    pub fn set_idle_time(&mut self, idle_time: Option<Duration>) {
        self.idle_time = idle_time;
    }

    pub fn attributes(&self) -> &SessionAttributes {
        &self.attributes
    }

    pub fn attributes_mut(&mut self) -> &mut SessionAttributes {
        &mut self.attributes
    }

    /// The connection wired to this session, if accept succeeded.
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.attributes.get::<Arc<Connection>>().cloned()
    }
}

/// Per-connection parts the connection task takes ownership of once wiring
/// succeeded. The [`Connection`] itself stays in the session's attributes.
pub struct AcceptedConnection {
    pub stanza_handler: Box<dyn StanzaHandler>,
    pub codec: XmppCodec,
    pub outbound: mpsc::UnboundedReceiver<Outbound>,
}

pub struct ConnectionHandler {
    policy: ConnectionPolicy,
    router: Arc<dyn PacketRouter>,
    properties: Arc<ServerProperties>,
    domain: Arc<str>,
    stats: Arc<TrafficStats>,
}

impl ConnectionHandler {
    pub fn new(
        policy: ConnectionPolicy,
        router: Arc<dyn PacketRouter>,
        properties: Arc<ServerProperties>,
        domain: &str,
        stats: Arc<TrafficStats>,
    ) -> Self {
        Self {
            policy,
            router,
            properties,
            domain: Arc::from(domain),
            stats,
        }
    }

    pub fn kind(&self) -> ConnectionKind {
        self.policy.kind
    }

    /// Idle timeout for new connections of this class. The property is in
    /// milliseconds and is truncated to whole seconds; anything below one
    /// second disables the timeout.
    pub fn idle_timeout(&self) -> Option<Duration> {
        let millis = self
            .properties
            .get_i64(&self.policy.idle_timeout_key, self.policy.default_idle_ms);
        let secs = millis / 1000;
        (secs > 0).then(|| Duration::from_secs(secs as u64))
    }

    pub fn max_buffer_size(&self) -> usize {
        self.properties
            .get_usize(PARSER_BUFFER_SIZE_PROPERTY, DEFAULT_MAX_BUFFER_SIZE)
    }

    /// Wire a freshly accepted session. Nothing is attached to the session
    /// unless every part was built; on error the caller drops the socket.
    pub fn on_connection_accepted(
        &self,
        session: &mut IoSession,
    ) -> Result<AcceptedConnection, ConnectionError> {
        let deliverer = (self.policy.deliverer_factory)(session)?;
        let (connection, outbound) = Connection::new(
            session.id(),
            self.policy.kind,
            session.peer_addr(),
            self.domain.clone(),
            deliverer,
        );
        let connection = Arc::new(connection);
        let stanza_handler =
            (self.policy.handler_factory)(connection.clone(), self.router.clone(), &self.domain)?;
        let codec = XmppCodec::new(self.max_buffer_size(), self.stats.clone());

        let idle_time = self.idle_timeout();
        session.set_idle_time(idle_time);
        session.attributes_mut().insert(connection);

        debug!(
            conn_id = session.id(),
            kind = %self.policy.kind,
            peer = %session.peer_addr(),
            idle_secs = idle_time.map(|d| d.as_secs()).unwrap_or(0),
            "Connection wired"
        );

        Ok(AcceptedConnection {
            stanza_handler,
            codec,
            outbound,
        })
    }
}
