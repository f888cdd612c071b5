//! `tokio_util` codec around [`StanzaParser`].
//!
//! One codec (and so one parser) is created per accepted connection and moved
//! into that connection's `Framed` transport. The parser lives exactly as long
//! as the transport.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use tokio::time::Instant;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use super::framing::StanzaParser;
use crate::error::CodecError;

/// Minimum fresh bytes before a decode pass is attempted while the parser
/// holds nothing. The shortest stanza (`<a/>`) is four bytes. Once the parser
/// has a partial unit buffered, any byte may complete it.
pub const MIN_DECODE_BYTES: usize = 4;

/// Server-wide traffic counters, shared by every codec of one server.
#[derive(Debug, Default)]
pub struct TrafficStats {
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    stanzas_decoded: AtomicU64,
}

impl TrafficStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub fn stanzas_decoded(&self) -> u64 {
        self.stanzas_decoded.load(Ordering::Relaxed)
    }
}

/// Last time bytes arrived on a connection. Whitespace keepalives count as
/// activity even though they never produce a stanza.
#[derive(Debug)]
pub struct ActivityClock {
    origin: Instant,
    last_ms: AtomicU64,
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }
}

impl ActivityClock {
    pub fn touch(&self) {
        let elapsed = self.origin.elapsed().as_millis() as u64;
        self.last_ms.store(elapsed, Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> Instant {
        self.origin + Duration::from_millis(self.last_ms.load(Ordering::Relaxed))
    }
}

pub struct XmppCodec {
    parser: StanzaParser,
    stats: Arc<TrafficStats>,
    activity: Arc<ActivityClock>,
    /// Bytes left in the read buffer after the previous decode call; anything
    /// beyond this on the next call arrived from the socket in between.
    pending: usize,
}

impl XmppCodec {
    pub fn new(max_buffer_size: usize, stats: Arc<TrafficStats>) -> Self {
        Self {
            parser: StanzaParser::new(max_buffer_size),
            stats,
            activity: Arc::new(ActivityClock::default()),
            pending: 0,
        }
    }

    pub fn parser(&self) -> &StanzaParser {
        &self.parser
    }

    /// Handle on the read-activity clock, for idle timeout enforcement.
    pub fn activity(&self) -> Arc<ActivityClock> {
        self.activity.clone()
    }

    /// Release the parser's buffers; later decodes fail.
    pub fn close_parser(&mut self) {
        self.parser.close();
    }

    fn next_decoded(&mut self) -> Option<String> {
        let stanza = self.parser.next_stanza()?;
        self.stats.stanzas_decoded.fetch_add(1, Ordering::Relaxed);
        trace!(stanza = %stanza, "Decoded");
        Some(stanza)
    }

    fn decode_pass(&mut self, src: &mut BytesMut) -> Result<Option<String>, CodecError> {
        if let Some(stanza) = self.next_decoded() {
            return Ok(Some(stanza));
        }
        if src.is_empty() || (src.len() < MIN_DECODE_BYTES && self.parser.buffered_len() == 0) {
            return Ok(None);
        }
        let chunk = src.split();
        self.parser.feed(&chunk)?;
        Ok(self.next_decoded())
    }
}

impl Decoder for XmppCodec {
    type Item = String;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, CodecError> {
        if src.len() > self.pending {
            let fresh = (src.len() - self.pending) as u64;
            self.stats.bytes_read.fetch_add(fresh, Ordering::Relaxed);
            self.activity.touch();
        }
        let result = self.decode_pass(src);
        self.pending = src.len();
        result
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<String>, CodecError> {
        if let Some(stanza) = self.decode(src)? {
            return Ok(Some(stanza));
        }
        // Fewer than MIN_DECODE_BYTES left over: feed them anyway, an
        // incomplete tail is dropped with the connection.
        if !src.is_empty() && !self.parser.is_closed() {
            let chunk = src.split();
            self.pending = 0;
            self.parser.feed(&chunk)?;
            return Ok(self.next_decoded());
        }
        src.clear();
        self.pending = 0;
        Ok(None)
    }
}

impl Encoder<&str> for XmppCodec {
    type Error = CodecError;

    fn encode(&mut self, item: &str, dst: &mut BytesMut) -> Result<(), CodecError> {
        dst.reserve(item.len());
        dst.put_slice(item.as_bytes());
        self.stats
            .bytes_written
            .fetch_add(item.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}

impl Encoder<String> for XmppCodec {
    type Error = CodecError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), CodecError> {
        <Self as Encoder<&str>>::encode(self, item.as_str(), dst)
    }
}
