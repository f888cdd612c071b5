//! XMPP XML framing: incremental stanza boundary detection.
//!
//! A TCP stream carries one long-lived `<stream:stream>` document whose
//! children are the stanzas. Bytes arrive in arbitrary fragments, so the
//! parser keeps a byte buffer per connection and scans it with a small state
//! machine (tags, quoted attribute values, comments, CDATA, processing
//! instructions). It tracks element nesting and emits a stanza whenever a
//! top-level element closes. The stream header and footer are emitted as
//! pseudo-stanzas of their own since the outer element never closes per
//! message.
//!
//! Scanning is byte-oriented: all markup delimiters are ASCII, so a fragment
//! boundary inside a multi-byte UTF-8 sequence is harmless. UTF-8 validity is
//! checked once per completed stanza.

use std::collections::VecDeque;

use tracing::{debug, trace};

use crate::error::ParseError;

/// Default cap on bytes buffered for a stanza that has not completed yet.
///
/// Typical stanzas are a few KB; the largest legitimate ones (vCard avatars,
/// MAM result pages) rarely exceed 100 KB.
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 1_024 * 1_024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    /// Character data, or inter-stanza whitespace at the top level.
    Text,
    /// Saw `<`, deciding which kind of markup follows.
    MarkupOpen,
    StartTagName,
    /// Attributes area of a start tag.
    StartTagBody,
    /// Inside a quoted attribute value; holds the quote byte.
    AttributeValue(u8),
    /// Saw `/` inside a start tag, `>` must follow.
    EmptyTagEnd,
    EndTagName,
    /// Whitespace between an end tag name and `>`.
    EndTagTrailer,
    ProcessingInstruction,
    Comment,
    CData,
}

/// Per-connection incremental stanza parser.
///
/// Exactly one instance exists per live connection. It is not shared and
/// needs no locking; the connection task owns it.
#[derive(Debug)]
pub struct StanzaParser {
    buffer: Vec<u8>,
    /// Next byte to scan.
    pos: usize,
    state: ScanState,
    /// Offset of the `<` opening the markup currently being scanned.
    markup_start: usize,
    name_start: usize,
    name_end: usize,
    /// Names of the elements open inside the current stanza.
    open_elements: Vec<Vec<u8>>,
    /// Offset of the `<` of the top-level element being collected.
    stanza_start: usize,
    /// Offset of an XML declaration seen at the top level, kept so that it
    /// travels together with the stream header that follows it.
    prolog_start: Option<usize>,
    stream_open: bool,
    completed: VecDeque<String>,
    max_buffer_size: usize,
    closed: bool,
}

impl Default for StanzaParser {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BUFFER_SIZE)
    }
}

impl StanzaParser {
    pub fn new(max_buffer_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            pos: 0,
            state: ScanState::Text,
            markup_start: 0,
            name_start: 0,
            name_end: 0,
            open_elements: Vec::new(),
            stanza_start: 0,
            prolog_start: None,
            stream_open: false,
            completed: VecDeque::new(),
            max_buffer_size,
            closed: false,
        }
    }

    /// Append raw bytes and extract every stanza they complete.
    ///
    /// Incomplete input stays buffered. Any error is fatal: the parser
    /// releases its buffers and refuses further input.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<(), ParseError> {
        if self.closed {
            return Err(ParseError::Closed);
        }
        self.buffer.extend_from_slice(bytes);

        let result = self.scan().and_then(|()| {
            self.compact();
            self.check_limit()
        });
        if let Err(ref e) = result {
            debug!(error = %e, "Stanza parser failed, releasing buffers");
            self.close();
        }
        result
    }

    pub fn has_completed_stanzas(&self) -> bool {
        !self.completed.is_empty()
    }

    /// Take every completed stanza, in arrival order.
    pub fn drain_stanzas(&mut self) -> Vec<String> {
        self.completed.drain(..).collect()
    }

    pub fn next_stanza(&mut self) -> Option<String> {
        self.completed.pop_front()
    }

    /// Bytes held for stanzas that have not completed yet.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether a stream header has been seen and not yet closed.
    pub fn is_stream_open(&self) -> bool {
        self.stream_open
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Release all buffered data. Further `feed` calls fail with
    /// [`ParseError::Closed`].
    pub fn close(&mut self) {
        self.buffer = Vec::new();
        self.open_elements = Vec::new();
        self.completed = VecDeque::new();
        self.prolog_start = None;
        self.stream_open = false;
        self.pos = 0;
        self.state = ScanState::Text;
        self.closed = true;
    }

    fn depth(&self) -> usize {
        self.open_elements.len()
    }

    fn malformed(&self, reason: &'static str) -> ParseError {
        ParseError::Malformed {
            offset: self.pos,
            reason,
        }
    }

    fn scan(&mut self) -> Result<(), ParseError> {
        while self.pos < self.buffer.len() {
            let b = self.buffer[self.pos];
            if is_disallowed(b) {
                return Err(ParseError::DisallowedCharacter {
                    offset: self.pos,
                    byte: b,
                });
            }

            match self.state {
                ScanState::Text => {
                    if b == b'<' {
                        self.markup_start = self.pos;
                        self.state = ScanState::MarkupOpen;
                    } else if self.depth() == 0 && !is_xml_whitespace(b) {
                        return Err(self.malformed("text outside of a stanza"));
                    }
                    self.pos += 1;
                }
                ScanState::MarkupOpen => match b {
                    b'/' => {
                        self.pos += 1;
                        self.name_start = self.pos;
                        self.state = ScanState::EndTagName;
                    }
                    b'?' => {
                        if self.depth() == 0 && self.prolog_start.is_none() {
                            self.prolog_start = Some(self.markup_start);
                        }
                        self.pos += 1;
                        self.state = ScanState::ProcessingInstruction;
                    }
                    b'!' => {
                        let rest = &self.buffer[self.markup_start..];
                        if rest.starts_with(b"<!--") {
                            self.pos = self.markup_start + 4;
                            self.state = ScanState::Comment;
                        } else if rest.starts_with(b"<![CDATA[") {
                            if self.depth() == 0 {
                                return Err(self.malformed("CDATA outside of a stanza"));
                            }
                            self.pos = self.markup_start + 9;
                            self.state = ScanState::CData;
                        } else if b"<!--".starts_with(rest) || b"<![CDATA[".starts_with(rest) {
                            // Declaration prefix split across reads
                            return Ok(());
                        } else {
                            return Err(self.malformed("unsupported markup declaration"));
                        }
                    }
                    b if is_name_start(b) => {
                        self.name_start = self.pos;
                        self.pos += 1;
                        self.state = ScanState::StartTagName;
                    }
                    _ => return Err(self.malformed("invalid character after '<'")),
                },
                ScanState::StartTagName => {
                    if is_name_char(b) {
                        self.pos += 1;
                    } else if is_xml_whitespace(b) || b == b'>' || b == b'/' {
                        self.name_end = self.pos;
                        self.state = ScanState::StartTagBody;
                    } else {
                        return Err(self.malformed("invalid character in element name"));
                    }
                }
                ScanState::StartTagBody => match b {
                    b'"' | b'\'' => {
                        self.pos += 1;
                        self.state = ScanState::AttributeValue(b);
                    }
                    b'>' => {
                        self.pos += 1;
                        self.state = ScanState::Text;
                        self.start_tag_complete(false)?;
                    }
                    b'/' => {
                        self.pos += 1;
                        self.state = ScanState::EmptyTagEnd;
                    }
                    b'<' => return Err(self.malformed("'<' inside a tag")),
                    _ => self.pos += 1,
                },
                ScanState::AttributeValue(quote) => {
                    if b == quote {
                        self.state = ScanState::StartTagBody;
                    } else if b == b'<' {
                        return Err(self.malformed("'<' inside an attribute value"));
                    }
                    self.pos += 1;
                }
                ScanState::EmptyTagEnd => {
                    if b != b'>' {
                        return Err(self.malformed("expected '>' after '/'"));
                    }
                    self.pos += 1;
                    self.state = ScanState::Text;
                    self.start_tag_complete(true)?;
                }
                ScanState::EndTagName => {
                    let first = self.pos == self.name_start;
                    if (first && is_name_start(b)) || (!first && is_name_char(b)) {
                        self.pos += 1;
                    } else if !first && is_xml_whitespace(b) {
                        self.name_end = self.pos;
                        self.pos += 1;
                        self.state = ScanState::EndTagTrailer;
                    } else if !first && b == b'>' {
                        self.name_end = self.pos;
                        self.pos += 1;
                        self.state = ScanState::Text;
                        self.end_tag_complete()?;
                    } else {
                        return Err(self.malformed("invalid closing tag"));
                    }
                }
                ScanState::EndTagTrailer => {
                    if b == b'>' {
                        self.pos += 1;
                        self.state = ScanState::Text;
                        self.end_tag_complete()?;
                    } else if is_xml_whitespace(b) {
                        self.pos += 1;
                    } else {
                        return Err(self.malformed("invalid closing tag"));
                    }
                }
                ScanState::ProcessingInstruction => {
                    if b == b'>'
                        && self.pos >= self.markup_start + 3
                        && self.buffer[self.pos - 1] == b'?'
                    {
                        self.state = ScanState::Text;
                    }
                    self.pos += 1;
                }
                ScanState::Comment => {
                    if b == b'>'
                        && self.pos >= self.markup_start + 6
                        && &self.buffer[self.pos - 2..self.pos] == b"--"
                    {
                        self.state = ScanState::Text;
                    }
                    self.pos += 1;
                }
                ScanState::CData => {
                    if b == b'>'
                        && self.pos >= self.markup_start + 11
                        && &self.buffer[self.pos - 2..self.pos] == b"]]"
                    {
                        self.state = ScanState::Text;
                    }
                    self.pos += 1;
                }
            }
        }
        Ok(())
    }

    /// Called with `pos` just past the `>` of a start tag.
    fn start_tag_complete(&mut self, empty: bool) -> Result<(), ParseError> {
        if self.depth() == 0 {
            let name = &self.buffer[self.name_start..self.name_end];
            if is_stream_element(name) {
                let from = self.prolog_start.take().unwrap_or(self.markup_start);
                self.emit(from, self.pos)?;
                self.stream_open = !empty;
                trace!("Stream header framed");
                return Ok(());
            }
            self.prolog_start = None;
            if empty {
                return self.emit(self.markup_start, self.pos);
            }
            self.stanza_start = self.markup_start;
        }
        if !empty {
            let name = self.buffer[self.name_start..self.name_end].to_vec();
            self.open_elements.push(name);
        }
        Ok(())
    }

    /// Called with `pos` just past the `>` of an end tag.
    fn end_tag_complete(&mut self) -> Result<(), ParseError> {
        let name = &self.buffer[self.name_start..self.name_end];
        if self.open_elements.is_empty() {
            if !is_stream_element(name) {
                return Err(self.malformed("closing tag without matching start tag"));
            }
            self.stream_open = false;
            self.prolog_start = None;
            trace!("Stream footer framed");
            return self.emit(self.markup_start, self.pos);
        }
        if self.open_elements.last().map(Vec::as_slice) != Some(name) {
            return Err(self.malformed("mismatched closing tag"));
        }
        self.open_elements.pop();
        if self.open_elements.is_empty() {
            self.emit(self.stanza_start, self.pos)
        } else {
            Ok(())
        }
    }

    fn emit(&mut self, from: usize, to: usize) -> Result<(), ParseError> {
        let stanza = std::str::from_utf8(&self.buffer[from..to])
            .map_err(|_| ParseError::InvalidUtf8)?
            .to_owned();
        self.completed.push_back(stanza);
        Ok(())
    }

    /// Drop bytes no longer needed and rebase the offsets into the buffer.
    fn compact(&mut self) {
        let mut keep_from = if self.depth() > 0 {
            self.stanza_start
        } else if self.state != ScanState::Text {
            self.markup_start
        } else {
            self.pos
        };
        if let Some(prolog) = self.prolog_start {
            keep_from = keep_from.min(prolog);
        }
        if keep_from == 0 {
            return;
        }

        self.buffer.drain(..keep_from);
        self.pos -= keep_from;
        self.markup_start = self.markup_start.saturating_sub(keep_from);
        self.name_start = self.name_start.saturating_sub(keep_from);
        self.name_end = self.name_end.saturating_sub(keep_from);
        self.stanza_start = self.stanza_start.saturating_sub(keep_from);
        self.prolog_start = self.prolog_start.map(|p| p - keep_from);
    }

    fn check_limit(&self) -> Result<(), ParseError> {
        if self.buffer.len() > self.max_buffer_size {
            return Err(ParseError::BufferOverflow {
                limit: self.max_buffer_size,
                buffered: self.buffer.len(),
            });
        }
        Ok(())
    }
}

/// Whether a framed unit opens a stream (optionally preceded by an XML
/// declaration). Matches on the local name, as the parser does, so any
/// prefix bound to the streams namespace is recognized.
pub fn is_stream_open_tag(stanza: &str) -> bool {
    let mut s = stanza.trim_start();
    if s.starts_with("<?") {
        s = match s.find("?>") {
            Some(end) => s[end + 2..].trim_start(),
            None => return false,
        };
    }
    s.strip_prefix('<')
        .map(tag_name)
        .is_some_and(|name| is_stream_element(name.as_bytes()))
}

/// Whether a framed unit is the stream footer.
pub fn is_stream_close_tag(stanza: &str) -> bool {
    stanza
        .trim()
        .strip_prefix("</")
        .and_then(|rest| rest.strip_suffix('>'))
        .map(str::trim_end)
        .is_some_and(|name| name == tag_name(name) && is_stream_element(name.as_bytes()))
}

/// Qualified name at the start of a tag body.
fn tag_name(s: &str) -> &str {
    let end = s
        .find(|c: char| c.is_ascii_whitespace() || c == '>' || c == '/')
        .unwrap_or(s.len());
    &s[..end]
}

fn local_name(name: &[u8]) -> &[u8] {
    match name.iter().rposition(|&b| b == b':') {
        Some(i) => &name[i + 1..],
        None => name,
    }
}

fn is_stream_element(name: &[u8]) -> bool {
    local_name(name) == b"stream"
}

fn is_xml_whitespace(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\n' | b'\r')
}

/// Control characters XML 1.0 forbids everywhere.
fn is_disallowed(b: u8) -> bool {
    b < 0x20 && !is_xml_whitespace(b)
}

fn is_name_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_' || b == b':' || b >= 0x80
}

fn is_name_char(b: u8) -> bool {
    is_name_start(b) || b.is_ascii_digit() || b == b'-' || b == b'.'
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn parse_all(input: &[u8]) -> Vec<String> {
        let mut parser = StanzaParser::default();
        parser.feed(input).unwrap();
        parser.drain_stanzas()
    }

    fn parse_chunked(input: &[u8], chunk_sizes: &[usize]) -> Vec<String> {
        let mut parser = StanzaParser::default();
        let mut out = Vec::new();
        let mut offset = 0;
        let mut sizes = chunk_sizes.iter().cycle();
        while offset < input.len() {
            let size = sizes.next().copied().unwrap_or(1).max(1);
            let end = (offset + size).min(input.len());
            parser.feed(&input[offset..end]).unwrap();
            out.extend(parser.drain_stanzas());
            offset = end;
        }
        out
    }

    const SESSION: &str = "<?xml version='1.0'?><stream:stream to='example.com' xmlns='jabber:client' \
        xmlns:stream='http://etherx.jabber.org/streams' version='1.0'>\
        <presence/>\n\
        <message to='bob@example.com' type='chat'><body>héllo wörld ✓ 𝄞</body></message> \
        <iq type='get' id='r1'><query xmlns='jabber:iq:roster'/></iq>\
        <message><body><![CDATA[<not-a-tag> & </still-not>]]></body><!-- note > --></message>\
        <r xmlns='urn:xmpp:sm:3'/>\
        <message id='q\"uote' note=\"a > b / c\"><body>x</body></message>\
        </stream:stream>";

    #[test]
    fn test_stream_opening() {
        let buf = b"<?xml version='1.0'?><stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' version='1.0'>";
        let mut parser = StanzaParser::default();
        parser.feed(buf).unwrap();
        let stanzas = parser.drain_stanzas();
        assert_eq!(stanzas.len(), 1);
        assert!(stanzas[0].starts_with("<?xml"));
        assert!(stanzas[0].contains("<stream:stream"));
        assert!(parser.is_stream_open());
        assert_eq!(parser.buffered_len(), 0);
    }

    #[test]
    fn test_stream_header_alone_is_emitted() {
        let stanzas = parse_all(b"<stream:stream to='example.com' xmlns='jabber:client'>");
        assert_eq!(stanzas, vec!["<stream:stream to='example.com' xmlns='jabber:client'>"]);
    }

    #[test]
    fn test_stream_features() {
        let buf = b"<stream:features><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>PLAIN</mechanism><mechanism>SCRAM-SHA-1</mechanism></mechanisms><starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/></stream:features>";
        let stanzas = parse_all(buf);
        assert_eq!(stanzas.len(), 1);
        assert_eq!(stanzas[0].as_bytes(), buf);
    }

    #[test]
    fn test_simple_stanza() {
        assert_eq!(parse_all(b"<presence/>"), vec!["<presence/>"]);
    }

    #[test]
    fn test_nested_stanza() {
        let buf = "<iq type='result'><query xmlns='jabber:iq:roster'><item jid='user@example.com'/></query></iq>";
        assert_eq!(parse_all(buf.as_bytes()), vec![buf]);
    }

    #[test]
    fn test_multiple_stanzas_in_one_feed() {
        let stanzas = parse_all(
            b"<presence from='user@example.com'/><message to='other@example.com'><body>Hello</body></message>",
        );
        assert_eq!(
            stanzas,
            vec![
                "<presence from='user@example.com'/>",
                "<message to='other@example.com'><body>Hello</body></message>",
            ]
        );
    }

    #[test]
    fn test_incomplete_stanza_is_retained() {
        let mut parser = StanzaParser::default();
        parser
            .feed(b"<iq type='get'><query xmlns='jabber:iq:roster'>")
            .unwrap();
        assert!(!parser.has_completed_stanzas());
        assert!(parser.buffered_len() > 0);

        parser.feed(b"</query></iq>").unwrap();
        assert_eq!(
            parser.drain_stanzas(),
            vec!["<iq type='get'><query xmlns='jabber:iq:roster'></query></iq>"]
        );
        assert_eq!(parser.buffered_len(), 0);
    }

    #[test]
    fn test_stream_closing() {
        let mut parser = StanzaParser::default();
        parser.feed(b"<stream:stream>").unwrap();
        assert!(parser.is_stream_open());
        parser.feed(b"  </stream:stream>").unwrap();
        assert_eq!(
            parser.drain_stanzas(),
            vec!["<stream:stream>", "</stream:stream>"]
        );
        assert!(!parser.is_stream_open());
    }

    #[test]
    fn test_balanced_nesting_three_splits() {
        let mut parser = StanzaParser::default();
        parser.feed(b"<message><bo").unwrap();
        parser.feed(b"dy>hi</body></mes").unwrap();
        assert!(!parser.has_completed_stanzas());
        parser.feed(b"sage>").unwrap();
        assert_eq!(
            parser.drain_stanzas(),
            vec!["<message><body>hi</body></message>"]
        );
    }

    #[test]
    fn test_sm_stanzas() {
        let stanzas = parse_all(b"<r xmlns='urn:xmpp:sm:3'/><a xmlns='urn:xmpp:sm:3' h='5'/>");
        assert_eq!(
            stanzas,
            vec!["<r xmlns='urn:xmpp:sm:3'/>", "<a xmlns='urn:xmpp:sm:3' h='5'/>"]
        );
    }

    #[test]
    fn test_whitespace_keepalives_between_stanzas() {
        let mut parser = StanzaParser::default();
        parser.feed(b"<stream:stream>").unwrap();
        parser.feed(b" \n\t ").unwrap();
        parser.feed(b"\r\n<presence/> ").unwrap();
        assert_eq!(parser.drain_stanzas(), vec!["<stream:stream>", "<presence/>"]);
        assert_eq!(parser.buffered_len(), 0);
    }

    #[test]
    fn test_empty_and_whitespace_buffers() {
        let mut parser = StanzaParser::default();
        parser.feed(b"").unwrap();
        parser.feed(b"   \n  ").unwrap();
        assert!(!parser.has_completed_stanzas());
    }

    #[test]
    fn test_markup_characters_inside_attributes_and_cdata() {
        let buf = "<message note='a > b' alt=\"x/y\"><body><![CDATA[</message><x>]]></body></message>";
        assert_eq!(parse_all(buf.as_bytes()), vec![buf]);
    }

    #[test]
    fn test_cdata_split_inside_declaration() {
        let mut parser = StanzaParser::default();
        parser.feed(b"<message><body><![CD").unwrap();
        parser.feed(b"ATA[</body>]]").unwrap();
        parser.feed(b"></body></message>").unwrap();
        assert_eq!(
            parser.drain_stanzas(),
            vec!["<message><body><![CDATA[</body>]]></body></message>"]
        );
    }

    #[test]
    fn test_comment_between_stanzas_is_skipped() {
        let stanzas = parse_all(b"<!-- hello <world> --><presence/>");
        assert_eq!(stanzas, vec!["<presence/>"]);
    }

    #[test]
    fn test_stanza_with_xml_entities() {
        let buf = "<message><body>&lt;b&gt;bold&lt;/b&gt; &amp; more</body></message>";
        assert_eq!(parse_all(buf.as_bytes()), vec![buf]);
    }

    #[test]
    fn test_end_tag_with_trailing_whitespace() {
        let buf = "<message><body>x</body  ></message\n>";
        assert_eq!(parse_all(buf.as_bytes()), vec![buf]);
    }

    #[test]
    fn test_split_inside_multibyte_character() {
        let stanza = "<message><body>𝄞</body></message>";
        let bytes = stanza.as_bytes();
        let clef = stanza.find('𝄞').unwrap();
        let mut parser = StanzaParser::default();
        parser.feed(&bytes[..clef + 2]).unwrap();
        parser.feed(&bytes[clef + 2..]).unwrap();
        assert_eq!(parser.drain_stanzas(), vec![stanza]);
    }

    #[test]
    fn test_byte_by_byte_matches_single_feed() {
        let whole = parse_all(SESSION.as_bytes());
        assert_eq!(whole.len(), 8);
        assert_eq!(parse_chunked(SESSION.as_bytes(), &[1]), whole);
    }

    #[test]
    fn test_mismatched_closing_tag_is_fatal() {
        let mut parser = StanzaParser::default();
        let err = parser.feed(b"<message><body>hi</message>").unwrap_err();
        assert!(matches!(err, ParseError::Malformed { .. }));
        assert!(!parser.has_completed_stanzas());
    }

    #[test]
    fn test_stray_closing_tag_is_fatal() {
        let mut parser = StanzaParser::default();
        assert!(matches!(
            parser.feed(b"</message>"),
            Err(ParseError::Malformed { .. })
        ));
    }

    #[test]
    fn test_text_at_stream_level_is_fatal() {
        let mut parser = StanzaParser::default();
        parser.feed(b"<stream:stream>").unwrap();
        assert!(matches!(
            parser.feed(b"hello"),
            Err(ParseError::Malformed { .. })
        ));
    }

    #[test]
    fn test_lt_inside_attribute_value_is_fatal() {
        let mut parser = StanzaParser::default();
        assert!(matches!(
            parser.feed(b"<message alt='</fake>'/>"),
            Err(ParseError::Malformed { .. })
        ));
    }

    #[test]
    fn test_doctype_is_rejected() {
        let mut parser = StanzaParser::default();
        assert!(matches!(
            parser.feed(b"<!DOCTYPE foo>"),
            Err(ParseError::Malformed { .. })
        ));
    }

    #[test]
    fn test_disallowed_control_character() {
        let mut parser = StanzaParser::default();
        let err = parser.feed(b"<message><body>a\x01b</body></message>").unwrap_err();
        assert_eq!(
            err,
            ParseError::DisallowedCharacter {
                offset: 16,
                byte: 0x01
            }
        );
    }

    #[test]
    fn test_invalid_utf8_stanza() {
        let mut parser = StanzaParser::default();
        assert_eq!(
            parser.feed(b"<message><body>\xff</body></message>"),
            Err(ParseError::InvalidUtf8)
        );
    }

    #[test]
    fn test_buffer_overflow() {
        let mut parser = StanzaParser::new(64);
        parser.feed(b"<message><body>").unwrap();
        let err = parser.feed(&[b'a'; 100]).unwrap_err();
        assert!(matches!(err, ParseError::BufferOverflow { limit: 64, .. }));
        assert_eq!(err.kind(), "buffer_overflow");
    }

    #[test]
    fn test_completed_stanzas_do_not_count_against_limit() {
        let mut parser = StanzaParser::new(64);
        let stanza = format!("<message><body>{}</body></message>", "a".repeat(40));
        for _ in 0..10 {
            parser.feed(stanza.as_bytes()).unwrap();
        }
        assert_eq!(parser.drain_stanzas().len(), 10);
        assert_eq!(parser.buffered_len(), 0);
    }

    #[test]
    fn test_failure_releases_buffers() {
        let mut parser = StanzaParser::default();
        parser.feed(b"<presence/><message><body>pending").unwrap();
        assert!(parser.buffered_len() > 0);

        assert!(parser.feed(b"</message>").is_err());
        assert!(parser.is_closed());
        assert_eq!(parser.buffered_len(), 0);
        assert!(!parser.has_completed_stanzas());
        assert_eq!(parser.feed(b"<presence/>"), Err(ParseError::Closed));
    }

    #[test]
    fn test_explicit_close() {
        let mut parser = StanzaParser::default();
        parser.feed(b"<message>").unwrap();
        parser.close();
        assert_eq!(parser.buffered_len(), 0);
        assert_eq!(parser.feed(b"</message>"), Err(ParseError::Closed));
    }

    #[test]
    fn test_stream_restart_emits_new_header() {
        let stanzas = parse_all(b"<stream:stream><starttls/><stream:stream>");
        assert_eq!(
            stanzas,
            vec!["<stream:stream>", "<starttls/>", "<stream:stream>"]
        );
    }

    #[test]
    fn test_stream_open_and_close_helpers() {
        assert!(is_stream_open_tag("<stream:stream to='a'>"));
        assert!(is_stream_open_tag("<?xml version='1.0'?><stream:stream>"));
        assert!(!is_stream_open_tag("<?xml version='1.0'?>"));
        assert!(!is_stream_open_tag("<message/>"));
        assert!(is_stream_close_tag("</stream:stream>"));
        assert!(is_stream_close_tag("</stream:stream\n>"));
        assert!(!is_stream_close_tag("<stream:stream>"));
        assert!(!is_stream_close_tag("</stream:streams>"));
        assert!(!is_stream_open_tag("<stream:streamer>"));
    }

    #[test]
    fn test_helpers_agree_with_parser_on_other_prefixes() {
        let header = "<s:stream xmlns:s='http://etherx.jabber.org/streams' xmlns='jabber:client'>";
        let input = format!("<?xml version='1.0'?>{header}<presence/></s:stream>");
        let stanzas = parse_all(input.as_bytes());
        assert_eq!(stanzas.len(), 3);
        assert!(is_stream_open_tag(&stanzas[0]));
        assert!(!is_stream_open_tag(&stanzas[1]));
        assert!(!is_stream_close_tag(&stanzas[1]));
        assert!(is_stream_close_tag(&stanzas[2]));
    }

    proptest! {
        #[test]
        fn prop_fragmentation_invariance(chunks in proptest::collection::vec(1usize..48, 1..32)) {
            let whole = parse_all(SESSION.as_bytes());
            let chunked = parse_chunked(SESSION.as_bytes(), &chunks);
            prop_assert_eq!(chunked, whole);
        }

        #[test]
        fn prop_split_anywhere_in_two(split in 0usize..SESSION.len()) {
            let bytes = SESSION.as_bytes();
            let mut parser = StanzaParser::default();
            parser.feed(&bytes[..split]).unwrap();
            parser.feed(&bytes[split..]).unwrap();
            prop_assert_eq!(parser.drain_stanzas(), parse_all(bytes));
        }
    }
}
