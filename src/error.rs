//! Error types for the connection layer.
//!
//! Parse and codec failures are always local to one connection: the
//! connection task turns them into a stream error and a closed socket, and
//! never lets them reach the accept loop.

use std::io;

use thiserror::Error;

use crate::xmpp_server::connection::StreamErrorCondition;

/// Fatal stanza framing failure. "Need more bytes" is not an error and never
/// shows up here.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Unbalanced or invalid tag structure.
    #[error("malformed markup at byte {offset}: {reason}")]
    Malformed { offset: usize, reason: &'static str },

    /// A byte that XML 1.0 does not allow anywhere in a document.
    #[error("disallowed character 0x{byte:02x} at byte {offset}")]
    DisallowedCharacter { offset: usize, byte: u8 },

    /// A completed stanza was not valid UTF-8.
    #[error("stanza is not valid UTF-8")]
    InvalidUtf8,

    /// The peer kept sending without ever completing a stanza.
    #[error("pending stanza data exceeded {limit} bytes ({buffered} buffered)")]
    BufferOverflow { limit: usize, buffered: usize },

    /// The parser already failed or was closed; its buffers are gone.
    #[error("parser is closed")]
    Closed,
}

impl ParseError {
    /// RFC 6120 stream error condition sent to the peer before closing.
    pub fn stream_condition(&self) -> StreamErrorCondition {
        match self {
            ParseError::BufferOverflow { .. } => StreamErrorCondition::PolicyViolation,
            ParseError::InvalidUtf8 => StreamErrorCondition::UnsupportedEncoding,
            _ => StreamErrorCondition::NotWellFormed,
        }
    }

    /// Short label used in the single log entry written per failure.
    pub fn kind(&self) -> &'static str {
        match self {
            ParseError::BufferOverflow { .. } => "buffer_overflow",
            ParseError::Closed => "closed",
            _ => "malformed",
        }
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A framed stanza that could not be read as a packet.
#[derive(Debug, Error)]
pub enum PacketError {
    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("invalid attribute: {0}")]
    Attribute(#[from] quick_xml::events::attributes::AttrError),

    #[error("no element found")]
    NoElement,
}

/// Failure while wiring a freshly accepted connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to create stanza handler: {0}")]
    HandlerConstruction(String),

    #[error("failed to create packet deliverer: {0}")]
    DelivererConstruction(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("connection {0} is closed")]
    ConnectionClosed(u64),

    #[error("no live connection for multiplexer '{0}'")]
    NoRoute(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("router queue is full")]
    Busy,

    #[error("router is shut down")]
    Closed,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] io::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("server is already running")]
    AlreadyRunning,

    #[error("failed to bind {kind} listener on {addr}: {source}")]
    Bind {
        kind: &'static str,
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}
