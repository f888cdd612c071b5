//! Protocol-level handling of framed stanzas, one handler per connection
//! class.
//!
//! All classes share stream negotiation: validate the peer's stream header,
//! answer with our own, close on `</stream:stream>`. They differ in which
//! elements they accept and what they require before routing.

use std::sync::Arc;

use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::{debug, warn};
use uuid::Uuid;

use super::connection::{Connection, ConnectionState, MultiplexerRegistry, StreamErrorCondition, STREAM_NS};
use super::framing::{is_stream_close_tag, is_stream_open_tag};
use super::router::PacketRouter;
use crate::error::{PacketError, RouteError};

const STREAM_FEATURES: &str = "<stream:features/>";

/// Receives every unit framed on one connection, in order.
pub trait StanzaHandler: Send {
    /// An `Err` closes the stream with that condition.
    fn process(&mut self, stanza: &str) -> Result<(), StreamErrorCondition>;

    /// Id of the current stream, once a header has been answered.
    fn stream_id(&self) -> Option<&str>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Message,
    Presence,
    Iq,
    Other,
}

impl PacketKind {
    fn from_name(name: &str) -> Self {
        match name {
            "message" => PacketKind::Message,
            "presence" => PacketKind::Presence,
            "iq" => PacketKind::Iq,
            _ => PacketKind::Other,
        }
    }
}

/// Structured view of a framed stanza, as handed to the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketKind,
    pub name: String,
    pub to: Option<String>,
    pub from: Option<String>,
    pub id: Option<String>,
    pub stanza_type: Option<String>,
    pub xml: String,
    pub connection_id: u64,
}

impl Packet {
    /// Read the top-level element's addressing. The whole element is run
    /// through quick-xml so that syntax the framer does not check (attribute
    /// quoting, duplicate attributes) is rejected here.
    pub fn parse(xml: &str, connection_id: u64) -> Result<Packet, PacketError> {
        let mut reader = Reader::from_str(xml);
        let mut packet = None;

        loop {
            match reader.read_event()? {
                Event::Start(e) | Event::Empty(e) if packet.is_none() => {
                    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    let mut parsed = Packet {
                        kind: PacketKind::from_name(&name),
                        name,
                        to: None,
                        from: None,
                        id: None,
                        stanza_type: None,
                        xml: xml.to_string(),
                        connection_id,
                    };
                    for attr in e.attributes() {
                        let attr = attr?;
                        let value = attr.unescape_value()?.into_owned();
                        match attr.key.as_ref() {
                            b"to" => parsed.to = Some(value),
                            b"from" => parsed.from = Some(value),
                            b"id" => parsed.id = Some(value),
                            b"type" => parsed.stanza_type = Some(value),
                            _ => {}
                        }
                    }
                    packet = Some(parsed);
                }
                Event::Start(e) | Event::Empty(e) => {
                    for attr in e.attributes() {
                        attr?;
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }
        packet.ok_or(PacketError::NoElement)
    }
}

/// Attributes of a peer's stream header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamHeader {
    pub to: Option<String>,
    pub from: Option<String>,
    pub version: Option<String>,
    pub lang: Option<String>,
    pub default_ns: Option<String>,
    pub stream_ns: Option<String>,
}

impl StreamHeader {
    pub fn parse(text: &str) -> Result<StreamHeader, PacketError> {
        let mut reader = Reader::from_str(text);
        reader.config_mut().check_end_names = false;

        loop {
            match reader.read_event()? {
                Event::Start(e) | Event::Empty(e) => {
                    // The element's own prefix, whatever the peer chose, names
                    // the streams namespace declaration.
                    let prefix = e.name().prefix().map(|p| p.as_ref().to_vec());
                    let mut header = StreamHeader::default();
                    for attr in e.attributes() {
                        let attr = attr?;
                        let value = attr.unescape_value()?.into_owned();
                        let key = attr.key.as_ref();
                        match key {
                            b"to" => header.to = Some(value),
                            b"from" => header.from = Some(value),
                            b"version" => header.version = Some(value),
                            b"xml:lang" => header.lang = Some(value),
                            b"xmlns" if prefix.is_none() => header.stream_ns = Some(value),
                            b"xmlns" => header.default_ns = Some(value),
                            _ => {
                                let declared = key.strip_prefix(b"xmlns:");
                                if declared.is_some() && declared == prefix.as_deref() {
                                    header.stream_ns = Some(value);
                                }
                            }
                        }
                    }
                    return Ok(header);
                }
                Event::Eof => return Err(PacketError::NoElement),
                _ => {}
            }
        }
    }
}

/// Content of a connection manager `<route>` wrapper.
pub fn unwrap_route(xml: &str) -> Result<&str, PacketError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().check_end_names = false;

    loop {
        match reader.read_event()? {
            Event::Start(_) => {
                let start = reader.buffer_position() as usize;
                let end = xml
                    .rfind("</")
                    .filter(|&end| end >= start)
                    .ok_or(PacketError::NoElement)?;
                let inner = xml[start..end].trim();
                if inner.is_empty() {
                    return Err(PacketError::NoElement);
                }
                return Ok(inner);
            }
            Event::Empty(_) | Event::Eof => return Err(PacketError::NoElement),
            _ => {}
        }
    }
}

/// Which `to` values a stream header may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HostRule {
    /// Served domain, or no `to` at all.
    DomainOrAbsent,
    /// Exactly the served domain.
    Domain,
    /// A subdomain of the served domain.
    Subdomain,
}

fn host_allowed(rule: HostRule, to: Option<&str>, domain: &str) -> bool {
    match (rule, to) {
        (HostRule::DomainOrAbsent, None) => true,
        (_, None) => false,
        (HostRule::Domain | HostRule::DomainOrAbsent, Some(to)) => to.eq_ignore_ascii_case(domain),
        (HostRule::Subdomain, Some(to)) => {
            if to.len() <= domain.len() + 1 {
                return false;
            }
            let (head, tail) = to.as_bytes().split_at(to.len() - domain.len());
            tail.eq_ignore_ascii_case(domain.as_bytes()) && head.ends_with(b".")
        }
    }
}

enum Step<'a> {
    Opened(StreamHeader),
    Element(&'a str),
    Handled,
}

/// Stream negotiation shared by every handler.
struct StreamSession {
    connection: Arc<Connection>,
    router: Arc<dyn PacketRouter>,
    domain: String,
    host_rule: HostRule,
    stream_id: Option<String>,
}

impl StreamSession {
    fn new(
        connection: Arc<Connection>,
        router: Arc<dyn PacketRouter>,
        domain: &str,
        host_rule: HostRule,
    ) -> Self {
        Self {
            connection,
            router,
            domain: domain.to_string(),
            host_rule,
            stream_id: None,
        }
    }

    fn preprocess<'a>(&mut self, stanza: &'a str) -> Result<Step<'a>, StreamErrorCondition> {
        if is_stream_close_tag(stanza) {
            debug!(conn_id = self.connection.id(), "Peer closed the stream");
            self.connection.close();
            return Ok(Step::Handled);
        }
        if is_stream_open_tag(stanza) {
            return self.open(stanza).map(Step::Opened);
        }
        if stanza.trim_start().starts_with("<?xml") {
            return Ok(Step::Handled);
        }
        if self.stream_id.is_none() {
            debug!(
                conn_id = self.connection.id(),
                "Ignoring stanza received before the stream header"
            );
            return Ok(Step::Handled);
        }
        Ok(Step::Element(stanza))
    }

    fn open(&mut self, text: &str) -> Result<StreamHeader, StreamErrorCondition> {
        let header = StreamHeader::parse(text).map_err(|e| {
            debug!(conn_id = self.connection.id(), error = %e, "Unreadable stream header");
            StreamErrorCondition::NotWellFormed
        })?;

        if header.stream_ns.as_deref() != Some(STREAM_NS) {
            return Err(StreamErrorCondition::InvalidNamespace);
        }
        let expected_ns = self.connection.kind().namespace();
        if header.default_ns.as_deref().is_some_and(|ns| ns != expected_ns) {
            return Err(StreamErrorCondition::InvalidNamespace);
        }
        if !host_allowed(self.host_rule, header.to.as_deref(), &self.domain) {
            debug!(
                conn_id = self.connection.id(),
                to = header.to.as_deref().unwrap_or(""),
                "Stream addressed to a host we do not serve"
            );
            return Err(StreamErrorCondition::HostUnknown);
        }

        let stream_id = Uuid::new_v4().to_string();
        self.connection
            .send_header(&stream_id)
            .map_err(|_| StreamErrorCondition::InternalServerError)?;
        self.connection.advance(ConnectionState::Handshaking);
        debug!(conn_id = self.connection.id(), stream_id = %stream_id, "Stream opened");
        self.stream_id = Some(stream_id);
        Ok(header)
    }

    fn send(&self, text: &str) -> Result<(), StreamErrorCondition> {
        self.connection
            .write_raw(text)
            .map_err(|_| StreamErrorCondition::InternalServerError)
    }

    fn parse_packet(&self, text: &str) -> Result<Packet, StreamErrorCondition> {
        Packet::parse(text, self.connection.id()).map_err(|e| {
            debug!(conn_id = self.connection.id(), error = %e, "Unreadable stanza");
            StreamErrorCondition::NotWellFormed
        })
    }

    fn route(&self, packet: Packet) -> Result<(), StreamErrorCondition> {
        self.connection.advance(ConnectionState::Established);
        match self.router.route(packet) {
            Ok(()) => Ok(()),
            Err(RouteError::Busy) => {
                warn!(conn_id = self.connection.id(), "Router queue full, packet dropped");
                Ok(())
            }
            Err(RouteError::Closed) => Err(StreamErrorCondition::SystemShutdown),
        }
    }
}

pub struct ClientStanzaHandler {
    session: StreamSession,
}

impl ClientStanzaHandler {
    pub fn new(connection: Arc<Connection>, router: Arc<dyn PacketRouter>, domain: &str) -> Self {
        Self {
            session: StreamSession::new(connection, router, domain, HostRule::DomainOrAbsent),
        }
    }
}

impl StanzaHandler for ClientStanzaHandler {
    fn process(&mut self, stanza: &str) -> Result<(), StreamErrorCondition> {
        match self.session.preprocess(stanza)? {
            Step::Opened(_) => self.session.send(STREAM_FEATURES),
            Step::Element(text) => {
                let packet = self.session.parse_packet(text)?;
                if packet.kind == PacketKind::Other {
                    return Err(StreamErrorCondition::UnsupportedStanzaType);
                }
                self.session.route(packet)
            }
            Step::Handled => Ok(()),
        }
    }

    fn stream_id(&self) -> Option<&str> {
        self.session.stream_id.as_deref()
    }
}

/// Server-to-server streams. Every routed stanza must be fully addressed.
pub struct ServerStanzaHandler {
    session: StreamSession,
}

impl ServerStanzaHandler {
    pub fn new(connection: Arc<Connection>, router: Arc<dyn PacketRouter>, domain: &str) -> Self {
        Self {
            session: StreamSession::new(connection, router, domain, HostRule::Domain),
        }
    }
}

impl StanzaHandler for ServerStanzaHandler {
    fn process(&mut self, stanza: &str) -> Result<(), StreamErrorCondition> {
        match self.session.preprocess(stanza)? {
            Step::Opened(_) | Step::Handled => Ok(()),
            Step::Element(text) => {
                let packet = self.session.parse_packet(text)?;
                if packet.kind == PacketKind::Other {
                    return Err(StreamErrorCondition::UnsupportedStanzaType);
                }
                if packet.from.is_none() || packet.to.is_none() {
                    return Err(StreamErrorCondition::ImproperAddressing);
                }
                self.session.route(packet)
            }
        }
    }

    fn stream_id(&self) -> Option<&str> {
        self.session.stream_id.as_deref()
    }
}

/// External component streams (XEP-0114). Nothing is routed before the
/// handshake.
pub struct ComponentStanzaHandler {
    session: StreamSession,
    authenticated: bool,
}

impl ComponentStanzaHandler {
    pub fn new(connection: Arc<Connection>, router: Arc<dyn PacketRouter>, domain: &str) -> Self {
        Self {
            session: StreamSession::new(connection, router, domain, HostRule::Subdomain),
            authenticated: false,
        }
    }
}

impl StanzaHandler for ComponentStanzaHandler {
    fn process(&mut self, stanza: &str) -> Result<(), StreamErrorCondition> {
        match self.session.preprocess(stanza)? {
            Step::Opened(_) => {
                self.authenticated = false;
                Ok(())
            }
            Step::Element(text) => {
                let packet = self.session.parse_packet(text)?;
                if packet.name == "handshake" {
                    self.authenticated = true;
                    self.session.connection.advance(ConnectionState::Established);
                    return self.session.send("<handshake/>");
                }
                if !self.authenticated {
                    return Err(StreamErrorCondition::NotAuthorized);
                }
                if packet.kind == PacketKind::Other {
                    return Err(StreamErrorCondition::UnsupportedStanzaType);
                }
                if packet.from.is_none() {
                    return Err(StreamErrorCondition::ImproperAddressing);
                }
                self.session.route(packet)
            }
            Step::Handled => Ok(()),
        }
    }

    fn stream_id(&self) -> Option<&str> {
        self.session.stream_id.as_deref()
    }
}

/// Connection manager streams. Client traffic arrives wrapped in `<route>`.
pub struct MultiplexerStanzaHandler {
    session: StreamSession,
    registry: Arc<MultiplexerRegistry>,
}

impl MultiplexerStanzaHandler {
    pub fn new(
        connection: Arc<Connection>,
        router: Arc<dyn PacketRouter>,
        domain: &str,
        registry: Arc<MultiplexerRegistry>,
    ) -> Self {
        Self {
            session: StreamSession::new(connection, router, domain, HostRule::DomainOrAbsent),
            registry,
        }
    }
}

impl StanzaHandler for MultiplexerStanzaHandler {
    fn process(&mut self, stanza: &str) -> Result<(), StreamErrorCondition> {
        match self.session.preprocess(stanza)? {
            Step::Opened(header) => {
                let connection = &self.session.connection;
                let name = header
                    .from
                    .unwrap_or_else(|| connection.peer_addr().ip().to_string());
                self.registry.register(&name, connection);
                self.session.send(STREAM_FEATURES)
            }
            Step::Element(text) => {
                let packet = self.session.parse_packet(text)?;
                if packet.name == "route" {
                    let inner = unwrap_route(text).map_err(|_| StreamErrorCondition::BadFormat)?;
                    let routed = self.session.parse_packet(inner)?;
                    if routed.kind == PacketKind::Other {
                        return Err(StreamErrorCondition::UnsupportedStanzaType);
                    }
                    return self.session.route(routed);
                }
                if packet.kind == PacketKind::Other {
                    return Err(StreamErrorCondition::UnsupportedStanzaType);
                }
                self.session.route(packet)
            }
            Step::Handled => Ok(()),
        }
    }

    fn stream_id(&self) -> Option<&str> {
        self.session.stream_id.as_deref()
    }
}

impl Drop for MultiplexerStanzaHandler {
    fn drop(&mut self) {
        self.registry.unregister(self.session.connection.id());
    }
}
