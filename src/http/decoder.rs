//! HTTP/1.x response decoder.
//!
//! Sans-IO: bytes go in through [`ResponseDecoder::feed`], end of stream
//! through [`ResponseDecoder::finish`], and [`ResponseDecoder::decode`]
//! hands back one [`DecodeEvent`] at a time. How the bytes were split
//! across socket reads never changes the result.
//!
//! ```text
//! StatusLine -> Headers -> FixedBody | ChunkSize <-> ChunkData | UntilClose -> Complete
//!     ^            |
//!     +- Interim <-+   (100 Continue)
//! ```

use super::response::ResponseHead;
use crate::base::neterror::NetError;
use bytes::{Buf, Bytes, BytesMut};

/// Upper bound on status line plus headers.
pub const MAX_HEADER_BYTES: usize = 256 * 1024;

/// Output of [`ResponseDecoder::decode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeEvent {
    /// An interim (1xx) status line was skipped; its headers are dropped.
    Interim(u16),
    /// Final status line and headers.
    Head(ResponseHead),
    /// Decoded body bytes, framing removed.
    Data(Bytes),
    /// The body is complete.
    Complete,
}

/// How the body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    None,
    ContentLength(u64),
    Chunked,
    UntilClose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    StatusLine,
    /// Headers of a `100 Continue`, discarded.
    Interim,
    Headers,
    FixedBody { remaining: u64 },
    ChunkSize,
    ChunkData { remaining: u64 },
    ChunkEnd,
    Trailers,
    UntilClose,
    /// Head delivered, `Complete` still owed.
    Finishing,
    Complete,
}

#[derive(Debug)]
pub struct ResponseDecoder {
    phase: Phase,
    buf: BytesMut,
    head: Option<ResponseHead>,
    head_request: bool,
    framing: Option<Framing>,
    header_bytes: usize,
    received_any: bool,
    eof: bool,
}

impl Default for ResponseDecoder {
    fn default() -> Self {
        Self::new(false)
    }
}

impl ResponseDecoder {
    /// `head_request`: the request was HEAD, so no body follows.
    pub fn new(head_request: bool) -> Self {
        Self {
            phase: Phase::StatusLine,
            buf: BytesMut::new(),
            head: None,
            head_request,
            framing: None,
            header_bytes: 0,
            received_any: false,
            eof: false,
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        if !data.is_empty() {
            self.received_any = true;
            self.buf.extend_from_slice(data);
        }
    }

    /// The peer closed the connection.
    pub fn finish(&mut self) {
        self.eof = true;
    }

    /// Framing of the final response, once its head is decoded.
    pub fn framing(&self) -> Option<Framing> {
        self.framing
    }

    /// Next event, or `None` when more input is needed.
    pub fn decode(&mut self) -> Result<Option<DecodeEvent>, NetError> {
        loop {
            match self.phase {
                Phase::StatusLine => {
                    let Some(line) = self.take_head_line()? else {
                        return self.need_more_in_head();
                    };
                    if line.is_empty() {
                        // Tolerate blank lines before the status line.
                        continue;
                    }
                    let head = parse_status_line(&line)?;
                    if is_interim(head.status) {
                        tracing::debug!(status = head.status, "skipping interim response");
                        self.phase = Phase::Interim;
                        return Ok(Some(DecodeEvent::Interim(head.status)));
                    }
                    self.head = Some(head);
                    self.phase = Phase::Headers;
                }
                Phase::Interim => {
                    // Some servers send the real status line right after
                    // `100 Continue` without a blank line in between.
                    if starts_status_line(&self.buf) {
                        self.phase = Phase::StatusLine;
                        continue;
                    }
                    let Some(line) = self.take_head_line()? else {
                        return self.need_more_in_head();
                    };
                    if line.is_empty() {
                        self.phase = Phase::StatusLine;
                    }
                }
                Phase::Headers => {
                    let Some(line) = self.take_head_line()? else {
                        return self.need_more_in_head();
                    };
                    if line.is_empty() {
                        return self.end_of_head().map(Some);
                    }
                    self.add_header_line(&line);
                }
                Phase::FixedBody { remaining } => {
                    if remaining == 0 {
                        self.phase = Phase::Complete;
                        return Ok(Some(DecodeEvent::Complete));
                    }
                    if self.buf.is_empty() {
                        if self.eof {
                            tracing::debug!(remaining, "connection closed before Content-Length");
                            return Err(NetError::ContentLengthMismatch);
                        }
                        return Ok(None);
                    }
                    let n = remaining.min(self.buf.len() as u64) as usize;
                    self.phase = Phase::FixedBody {
                        remaining: remaining - n as u64,
                    };
                    return Ok(Some(DecodeEvent::Data(self.buf.split_to(n).freeze())));
                }
                Phase::ChunkSize => {
                    let Some(line) = take_line(&mut self.buf, self.eof) else {
                        return self.need_more_in_chunks();
                    };
                    let size = parse_chunk_size(&line)?;
                    tracing::trace!(size, "chunk");
                    self.phase = if size == 0 {
                        Phase::Trailers
                    } else {
                        Phase::ChunkData { remaining: size }
                    };
                }
                Phase::ChunkData { remaining } => {
                    if self.buf.is_empty() {
                        return self.need_more_in_chunks();
                    }
                    let n = remaining.min(self.buf.len() as u64) as usize;
                    let left = remaining - n as u64;
                    self.phase = if left == 0 {
                        Phase::ChunkEnd
                    } else {
                        Phase::ChunkData { remaining: left }
                    };
                    return Ok(Some(DecodeEvent::Data(self.buf.split_to(n).freeze())));
                }
                Phase::ChunkEnd => match self.buf.first() {
                    None => return self.need_more_in_chunks(),
                    Some(b'\n') => {
                        self.buf.advance(1);
                        self.phase = Phase::ChunkSize;
                    }
                    Some(b'\r') => match self.buf.get(1) {
                        None => return self.need_more_in_chunks(),
                        Some(b'\n') => {
                            self.buf.advance(2);
                            self.phase = Phase::ChunkSize;
                        }
                        Some(_) => return Err(NetError::InvalidChunkedEncoding),
                    },
                    Some(_) => return Err(NetError::InvalidChunkedEncoding),
                },
                Phase::Trailers => match take_line(&mut self.buf, self.eof) {
                    Some(line) if line.is_empty() => {
                        self.phase = Phase::Complete;
                        return Ok(Some(DecodeEvent::Complete));
                    }
                    Some(_) => {}
                    None if self.eof => {
                        // Missing final CRLF after the last chunk.
                        self.phase = Phase::Complete;
                        return Ok(Some(DecodeEvent::Complete));
                    }
                    None => return Ok(None),
                },
                Phase::UntilClose => {
                    if !self.buf.is_empty() {
                        return Ok(Some(DecodeEvent::Data(self.buf.split().freeze())));
                    }
                    if self.eof {
                        self.phase = Phase::Complete;
                        return Ok(Some(DecodeEvent::Complete));
                    }
                    return Ok(None);
                }
                Phase::Finishing => {
                    self.phase = Phase::Complete;
                    return Ok(Some(DecodeEvent::Complete));
                }
                Phase::Complete => return Ok(None),
            }
        }
    }

    fn take_head_line(&mut self) -> Result<Option<String>, NetError> {
        let Some(line) = take_line(&mut self.buf, self.eof) else {
            return Ok(None);
        };
        self.header_bytes += line.len() + 2;
        if self.header_bytes > MAX_HEADER_BYTES {
            return Err(NetError::ResponseHeadersTooBig);
        }
        Ok(Some(String::from_utf8_lossy(&line).into_owned()))
    }

    fn need_more_in_head(&self) -> Result<Option<DecodeEvent>, NetError> {
        if self.header_bytes + self.buf.len() > MAX_HEADER_BYTES {
            return Err(NetError::ResponseHeadersTooBig);
        }
        if self.eof {
            if !self.received_any {
                return Err(NetError::EmptyResponse);
            }
            tracing::debug!("connection closed inside response head");
            return Err(NetError::InvalidHttpResponse);
        }
        Ok(None)
    }

    fn need_more_in_chunks(&self) -> Result<Option<DecodeEvent>, NetError> {
        if self.eof {
            return Err(NetError::IncompleteChunkedEncoding);
        }
        Ok(None)
    }

    fn add_header_line(&mut self, line: &str) {
        let Some(head) = self.head.as_mut() else {
            return;
        };
        // obs-fold continuation
        if line.starts_with([' ', '\t']) {
            if let Some((_, value)) = head.headers.last_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
            return;
        }
        match line.split_once(':') {
            Some((name, value)) if !name.trim().is_empty() => {
                head.headers
                    .push((name.trim().to_string(), value.trim().to_string()));
            }
            _ => tracing::debug!(line, "ignoring malformed header line"),
        }
    }

    fn end_of_head(&mut self) -> Result<DecodeEvent, NetError> {
        let head = self.head.take().ok_or(NetError::InvalidHttpResponse)?;
        let framing = select_framing(&head, self.head_request)?;
        tracing::debug!(status = head.status, ?framing, "response head");
        self.framing = Some(framing);
        self.phase = match framing {
            Framing::None => Phase::Finishing,
            Framing::ContentLength(n) => Phase::FixedBody { remaining: n },
            Framing::Chunked => Phase::ChunkSize,
            Framing::UntilClose => Phase::UntilClose,
        };
        Ok(DecodeEvent::Head(head))
    }
}

fn is_interim(status: u16) -> bool {
    (100..200).contains(&status) && status != 101
}

fn starts_status_line(buf: &[u8]) -> bool {
    buf.starts_with(b"HTTP/") || buf.starts_with(b"ICY ")
}

/// Split off one line, dropping its `\n`, `\r\n` or bare `\r`. A `\r`
/// at the very end is ambiguous until more data or EOF.
fn take_line(buf: &mut BytesMut, eof: bool) -> Option<BytesMut> {
    let pos = buf.iter().position(|&b| b == b'\n' || b == b'\r')?;
    let term = match (buf[pos], buf.get(pos + 1)) {
        (b'\n', _) => 1,
        (_, Some(b'\n')) => 2,
        (_, Some(_)) => 1,
        (_, None) if eof => 1,
        (_, None) => return None,
    };
    let line = buf.split_to(pos);
    buf.advance(term);
    Some(line)
}

/// `HTTP/<ver> <code> <reason>` or `ICY <code> <reason>`.
fn parse_status_line(line: &str) -> Result<ResponseHead, NetError> {
    let invalid = || {
        tracing::debug!(line, "malformed status line");
        NetError::InvalidHttpResponse
    };
    if !line.starts_with("HTTP/") && !line.starts_with("ICY ") {
        return Err(invalid());
    }
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().ok_or_else(invalid)?;
    let code = parts.next().ok_or_else(invalid)?;
    if code.len() != 3 {
        return Err(invalid());
    }
    let status: u16 = code.parse().map_err(|_| invalid())?;
    let reason = parts.next().unwrap_or("").trim();
    Ok(ResponseHead::new(
        version.to_string(),
        status,
        reason.to_string(),
    ))
}

/// Hex size, optional `;extension`.
fn parse_chunk_size(line: &[u8]) -> Result<u64, NetError> {
    let text = std::str::from_utf8(line).map_err(|_| NetError::InvalidChunkedEncoding)?;
    let size = text.split(';').next().unwrap_or("").trim();
    if size.is_empty() || size.len() > 16 || !size.bytes().all(|b| b.is_ascii_hexdigit()) {
        tracing::debug!(line = text, "malformed chunk size");
        return Err(NetError::InvalidChunkedEncoding);
    }
    u64::from_str_radix(size, 16).map_err(|_| {
        tracing::debug!(line = text, "malformed chunk size");
        NetError::InvalidChunkedEncoding
    })
}

fn select_framing(head: &ResponseHead, head_request: bool) -> Result<Framing, NetError> {
    if head_request || head.bodyless_status() {
        return Ok(Framing::None);
    }

    let mut lengths = head.header_all("Content-Length").map(str::trim);
    let content_length = match lengths.next() {
        None => None,
        Some(first) => {
            if lengths.any(|other| other != first) {
                return Err(NetError::ResponseHeadersMultipleContentLength);
            }
            if first.is_empty() || !first.bytes().all(|b| b.is_ascii_digit()) {
                tracing::debug!(value = first, "malformed Content-Length");
                return Err(NetError::InvalidHttpResponse);
            }
            Some(first.parse::<u64>().map_err(|_| NetError::InvalidHttpResponse)?)
        }
    };

    let codings: Vec<&str> = head
        .header_all("Transfer-Encoding")
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .collect();
    if !codings.is_empty() {
        let chunked = codings
            .last()
            .is_some_and(|c| c.eq_ignore_ascii_case("chunked"));
        if content_length.is_some() {
            tracing::debug!("both Transfer-Encoding and Content-Length present");
            return Err(NetError::ConflictingFraming);
        }
        return Ok(if chunked {
            Framing::Chunked
        } else {
            Framing::UntilClose
        });
    }

    Ok(match content_length {
        Some(0) => Framing::None,
        Some(n) => Framing::ContentLength(n),
        None => Framing::UntilClose,
    })
}
