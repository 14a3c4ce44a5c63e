//! Inbound buffer and queued read requests.
//!
//! One-shot requests (`readn`, `readline`) are served first, in order.
//! When none is queued and streaming is on, whatever is buffered goes out
//! as one chunk.

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;

/// Initial inbound buffer size; doubled whenever a read finds it full.
pub(crate) const INITIAL_BUFFER_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadRequest {
    /// Exactly this many bytes.
    Exact(usize),
    /// One line, delivered without its terminator.
    Line,
}

#[derive(Debug)]
pub(crate) struct ReadQueue {
    buffer: BytesMut,
    requests: VecDeque<ReadRequest>,
    streaming: bool,
}

impl Default for ReadQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadQueue {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            requests: VecDeque::new(),
            streaming: false,
        }
    }

    pub fn push(&mut self, request: ReadRequest) {
        self.requests.push_back(request);
    }

    pub fn set_streaming(&mut self, on: bool) {
        self.streaming = on;
    }

    /// Someone is waiting for bytes.
    pub fn wants_data(&self) -> bool {
        self.streaming || !self.requests.is_empty()
    }

    /// Make room for the next socket read, doubling when full.
    pub fn prepare_read(&mut self) {
        if self.buffer.len() == self.buffer.capacity() {
            let grow = self.buffer.capacity().max(INITIAL_BUFFER_SIZE);
            self.buffer.reserve(grow);
        }
    }

    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Take the next deliverable chunk, if the buffer can satisfy a request.
    ///
    /// At end of stream a trailing `\r` counts as a line terminator.
    pub fn next_ready(&mut self, eof: bool) -> Option<Bytes> {
        match self.requests.front().copied() {
            Some(ReadRequest::Exact(n)) => {
                if self.buffer.len() < n {
                    return None;
                }
                self.requests.pop_front();
                Some(self.buffer.split_to(n).freeze())
            }
            Some(ReadRequest::Line) => {
                let (end, term) = find_line_end(&self.buffer, eof)?;
                self.requests.pop_front();
                let line = self.buffer.split_to(end).freeze();
                let _ = self.buffer.split_to(term);
                Some(line)
            }
            None if self.streaming && !self.buffer.is_empty() => {
                Some(self.buffer.split().freeze())
            }
            None => None,
        }
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.requests.clear();
        self.streaming = false;
    }
}

/// Position and length of the first line terminator: `\n`, `\r\n`, `\r`
/// or `\0`. A `\r` at the very end is ambiguous until more data or EOF.
fn find_line_end(buf: &[u8], eof: bool) -> Option<(usize, usize)> {
    let pos = buf.iter().position(|&b| matches!(b, b'\n' | b'\r' | b'\0'))?;
    if buf[pos] != b'\r' {
        return Some((pos, 1));
    }
    match buf.get(pos + 1) {
        Some(b'\n') => Some((pos, 2)),
        Some(_) => Some((pos, 1)),
        None if eof => Some((pos, 1)),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue_with(data: &[u8]) -> ReadQueue {
        let mut q = ReadQueue::new();
        q.buffer_mut().extend_from_slice(data);
        q
    }

    #[test]
    fn test_line_terminators() {
        let mut q = queue_with(b"one\ntwo\r\nthree\rfour\0five");
        for _ in 0..5 {
            q.push(ReadRequest::Line);
        }
        assert_eq!(q.next_ready(false).unwrap(), "one");
        assert_eq!(q.next_ready(false).unwrap(), "two");
        assert_eq!(q.next_ready(false).unwrap(), "three");
        assert_eq!(q.next_ready(false).unwrap(), "four");
        // No terminator yet
        assert!(q.next_ready(false).is_none());
        assert_eq!(q.buffer_mut().len(), 4);
    }

    #[test]
    fn test_trailing_cr_waits_for_more() {
        let mut q = queue_with(b"HTTP/1.1 200 OK\r");
        q.push(ReadRequest::Line);
        assert!(q.next_ready(false).is_none());

        q.buffer_mut().extend_from_slice(b"\n");
        assert_eq!(q.next_ready(false).unwrap(), "HTTP/1.1 200 OK");
        assert_eq!(q.buffer_mut().len(), 0);
    }

    #[test]
    fn test_trailing_cr_at_eof() {
        let mut q = queue_with(b"last\r");
        q.push(ReadRequest::Line);
        assert_eq!(q.next_ready(true).unwrap(), "last");
    }

    #[test]
    fn test_exact_waits_for_enough_bytes() {
        let mut q = queue_with(b"abc");
        q.push(ReadRequest::Exact(5));
        assert!(q.next_ready(false).is_none());
        q.buffer_mut().extend_from_slice(b"defg");
        assert_eq!(q.next_ready(false).unwrap(), "abcde");
        assert_eq!(q.buffer_mut().len(), 2);
        assert!(!q.wants_data());
    }

    #[test]
    fn test_one_shot_requests_before_streaming() {
        let mut q = queue_with(b"head\nbody bytes");
        q.set_streaming(true);
        q.push(ReadRequest::Line);
        assert_eq!(q.next_ready(false).unwrap(), "head");
        assert_eq!(q.next_ready(false).unwrap(), "body bytes");
        assert!(q.next_ready(false).is_none());
        assert!(q.wants_data());
    }

    #[test]
    fn test_buffer_doubles_when_full() {
        let mut q = ReadQueue::new();
        assert_eq!(q.buffer_mut().capacity(), INITIAL_BUFFER_SIZE);
        q.buffer_mut().extend_from_slice(&[0u8; INITIAL_BUFFER_SIZE]);
        q.prepare_read();
        assert!(q.buffer_mut().capacity() >= 2 * INITIAL_BUFFER_SIZE);
    }
}
