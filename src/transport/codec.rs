use crate::{Error, Result};
use bytes::{Buf, BytesMut};
use rsip::SipMessage;
use tokio_util::codec::{Decoder, Encoder};

pub const KEEPALIVE_REQUEST: &[u8] = b"\r\n\r\n";
pub const KEEPALIVE_RESPONSE: &[u8] = b"\r\n";

/// Hard cap for a single message on a stream connection.
pub const MAX_STREAM_MESSAGE_SIZE: usize = 65535;
/// Hard cap for a UDP datagram, sized to a generous MTU.
pub const DEFAULT_MAX_UDP_MESSAGE_SIZE: usize = 10_000;

/// Where the framer is inside the current message.
///
/// `Start` skips CRLF padding between messages, `TopLine` accumulates the
/// request/status line, `Headers` accumulates header lines until the blank
/// line, `Content` reads exactly Content-Length bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    Start,
    TopLine,
    Headers,
    Content,
}

#[derive(Debug, Clone)]
pub enum SipFrame {
    Message(SipMessage),
    KeepaliveRequest,
}

/// Streaming SIP framer for connection-oriented transports.
///
/// Fed arbitrary byte slices (down to one byte at a time), it yields complete
/// messages in arrival order. Content-Length is mandatory on streams
/// (RFC 3261 section 18.3); a blank line with no Content-Length observed is a
/// [`Error::MalformedHeader`] and the caller is expected to drop the
/// connection.
pub struct SipCodec {
    state: ParserState,
    raw: Vec<u8>,
    line_start: usize,
    content_length: Option<usize>,
    body_remaining: usize,
    max_size: usize,
}

impl SipCodec {
    pub fn new() -> Self {
        Self::with_max_size(MAX_STREAM_MESSAGE_SIZE)
    }

    pub fn with_max_size(max_size: usize) -> Self {
        SipCodec {
            state: ParserState::Start,
            raw: Vec::new(),
            line_start: 0,
            content_length: None,
            body_remaining: 0,
            max_size,
        }
    }

    pub fn state(&self) -> ParserState {
        self.state
    }

    fn reset(&mut self) {
        self.state = ParserState::Start;
        self.raw.clear();
        self.line_start = 0;
        self.content_length = None;
        self.body_remaining = 0;
    }

    fn emit(&mut self) -> Result<SipFrame> {
        let msg = SipMessage::try_from(self.raw.as_slice())?;
        self.reset();
        Ok(SipFrame::Message(msg))
    }

    /// Completed header line at `raw[line_start..]` (CRLF excluded); records
    /// Content-Length if this is one, in long or compact form.
    fn scan_header_line(&mut self, end: usize) -> Result<()> {
        let line = &self.raw[self.line_start..end];
        if let Some(colon) = line.iter().position(|&b| b == b':') {
            let name = trim_bytes(&line[..colon]);
            if name.eq_ignore_ascii_case(b"content-length") || name.eq_ignore_ascii_case(b"l") {
                let value = trim_bytes(&line[colon + 1..]);
                let value = std::str::from_utf8(value)
                    .map_err(|_| Error::MalformedHeader("Content-Length not ascii".into()))?;
                let length = value.parse::<usize>().map_err(|_| {
                    Error::MalformedHeader(format!("invalid Content-Length: {}", value))
                })?;
                self.content_length = Some(length);
            }
        }
        Ok(())
    }
}

impl Default for SipCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn trim_bytes(mut bytes: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = bytes {
        bytes = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = bytes {
        bytes = rest;
    }
    bytes
}

impl Decoder for SipCodec {
    type Item = SipFrame;
    type Error = crate::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<SipFrame>> {
        while !src.is_empty() {
            match self.state {
                ParserState::Start => {
                    if src.len() >= 4 && &src[..4] == KEEPALIVE_REQUEST {
                        src.advance(4);
                        return Ok(Some(SipFrame::KeepaliveRequest));
                    }
                    match src[0] {
                        b'\r' | b'\n' => {
                            src.advance(1);
                        }
                        _ => {
                            self.state = ParserState::TopLine;
                        }
                    }
                }
                ParserState::TopLine => {
                    self.raw.push(src[0]);
                    src.advance(1);
                    if self.raw.len() > self.max_size {
                        let n = self.raw.len();
                        self.reset();
                        return Err(Error::MessageTooLarge(n));
                    }
                    if self.raw.ends_with(b"\r\n") {
                        let line = &self.raw[..self.raw.len() - 2];
                        if !line.starts_with(b"SIP/2.0") && !line.ends_with(b"SIP/2.0") {
                            let line = String::from_utf8_lossy(line).into_owned();
                            self.reset();
                            return Err(Error::MalformedStartLine(line));
                        }
                        self.line_start = self.raw.len();
                        self.state = ParserState::Headers;
                    }
                }
                ParserState::Headers => {
                    self.raw.push(src[0]);
                    src.advance(1);
                    if self.raw.len() > self.max_size {
                        let n = self.raw.len();
                        self.reset();
                        return Err(Error::MessageTooLarge(n));
                    }
                    if self.raw.ends_with(b"\r\n") {
                        let line_end = self.raw.len() - 2;
                        if line_end == self.line_start {
                            // blank line, end of headers
                            match self.content_length {
                                None => {
                                    self.reset();
                                    return Err(Error::MalformedHeader(
                                        "Content-Length required on stream transports".into(),
                                    ));
                                }
                                Some(0) => return self.emit().map(Some),
                                Some(n) => {
                                    if self.raw.len() + n > self.max_size {
                                        self.reset();
                                        return Err(Error::MessageTooLarge(n));
                                    }
                                    self.body_remaining = n;
                                    self.state = ParserState::Content;
                                }
                            }
                        } else {
                            self.scan_header_line(line_end)?;
                            self.line_start = self.raw.len();
                        }
                    }
                }
                ParserState::Content => {
                    let take = self.body_remaining.min(src.len());
                    self.raw.extend_from_slice(&src[..take]);
                    src.advance(take);
                    self.body_remaining -= take;
                    if self.body_remaining == 0 {
                        return self.emit().map(Some);
                    }
                }
            }
        }
        Ok(None)
    }
}

impl Encoder<SipMessage> for SipCodec {
    type Error = crate::Error;

    fn encode(&mut self, item: SipMessage, dst: &mut BytesMut) -> Result<()> {
        dst.extend_from_slice(item.to_string().as_bytes());
        Ok(())
    }
}

/// Whole-message parse for datagram transports: one datagram is one message.
pub fn decode_datagram(buf: &[u8], max_size: usize) -> Result<SipMessage> {
    if buf.len() > max_size {
        return Err(Error::MessageTooLarge(buf.len()));
    }
    let text = std::str::from_utf8(buf)
        .map_err(|e| Error::SipMessageError(format!("not utf-8: {}", e)))?;
    SipMessage::try_from(text).map_err(Into::into)
}
