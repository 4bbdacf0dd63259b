//! Incremental HTTP/1.1 request parser.
//!
//! Bytes arrive in arbitrarily small chunks into a fixed-capacity
//! `ReadBuffer`. The parser pulls one CRLF-terminated line at a time out of
//! the unconsumed region and drives the `RequestLine -> Header -> Body`
//! state machine:
//!
//! ```text
//! GET /index.html HTTP/1.1\r\n     RequestLine
//! Host: localhost\r\n              Header
//! Connection: keep-alive\r\n       Header
//! \r\n                             Header (end) -> Complete, or Body
//! <Content-Length bytes>           Body
//! ```
//!
//! Whenever a line or the body is not fully buffered yet, `parse` returns
//! `ParseResult::Incomplete` and picks up where it stopped after the next read.

use crate::http::request::{CheckState, Method, Request};
use tracing::trace;

/// Capacity of a connection's read buffer.
pub const READ_BUFFER_SIZE: usize = 2048;

/// Outcome of scanning for one line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStatus {
    /// A complete line was found.
    Ok,
    /// A line terminator is malformed (bare `\r` or `\n`).
    Bad,
    /// The line is not complete yet.
    Open,
}

/// Fixed-capacity read buffer with a scan cursor.
///
/// `checked_idx <= read_idx <= capacity` holds at all times.
pub struct ReadBuffer {
    buf: Box<[u8]>,
    /// Bytes filled by reads.
    read_idx: usize,
    /// Bytes scanned by `parse_line`.
    checked_idx: usize,
    /// Start of the line currently being assembled.
    start_line: usize,
    /// End of the last complete line, excluding its terminator.
    line_end: usize,
}

impl ReadBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            read_idx: 0,
            checked_idx: 0,
            start_line: 0,
            line_end: 0,
        }
    }

    pub fn read_index(&self) -> usize {
        self.read_idx
    }

    pub fn checked_index(&self) -> usize {
        self.checked_idx
    }

    pub fn is_full(&self) -> bool {
        self.read_idx >= self.buf.len()
    }

    /// Unfilled tail of the buffer, the target of the next `recv`.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.read_idx..]
    }

    /// Record `n` bytes written into `spare_mut`.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(self.read_idx + n <= self.buf.len(), "advance past capacity");
        self.read_idx = (self.read_idx + n).min(self.buf.len());
    }

    /// Copy as much of `data` as fits. Returns the number of bytes taken.
    #[cfg(test)]
    pub fn extend(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.buf.len() - self.read_idx);
        self.buf[self.read_idx..self.read_idx + n].copy_from_slice(&data[..n]);
        self.read_idx += n;
        n
    }

    /// Scan forward for the end of the current line.
    ///
    /// Never looks at bytes at or past `read_idx`. A `\r` that is the last
    /// buffered byte leaves the cursor on it so the following read can
    /// complete the terminator.
    pub fn parse_line(&mut self) -> LineStatus {
        while self.checked_idx < self.read_idx {
            match self.buf[self.checked_idx] {
                b'\r' => {
                    if self.checked_idx + 1 == self.read_idx {
                        return LineStatus::Open;
                    }
                    if self.buf[self.checked_idx + 1] == b'\n' {
                        self.line_end = self.checked_idx;
                        self.checked_idx += 2;
                        return LineStatus::Ok;
                    }
                    return LineStatus::Bad;
                }
                b'\n' => {
                    if self.checked_idx > self.start_line
                        && self.buf[self.checked_idx - 1] == b'\r'
                    {
                        self.line_end = self.checked_idx - 1;
                        self.checked_idx += 1;
                        return LineStatus::Ok;
                    }
                    return LineStatus::Bad;
                }
                _ => self.checked_idx += 1,
            }
        }
        LineStatus::Open
    }

    /// Consume the line found by the last successful `parse_line`.
    pub fn take_line(&mut self) -> &[u8] {
        let start = self.start_line;
        self.start_line = self.checked_idx;
        &self.buf[start..self.line_end]
    }

    pub fn reset(&mut self) {
        self.read_idx = 0;
        self.checked_idx = 0;
        self.start_line = 0;
        self.line_end = 0;
    }
}

/// Result of feeding the buffered bytes through the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseResult {
    /// More bytes are needed.
    Incomplete,
    /// A full request (and its body, if any) is buffered.
    Complete,
    /// The request is malformed and must be answered with 400.
    Malformed,
}

enum HeaderLine {
    End,
    Field,
    Invalid,
}

/// Per-connection request parser.
pub struct RequestParser {
    buffer: ReadBuffer,
    state: CheckState,
    request: Request,
    /// Offset where the body begins, valid in `CheckState::Body`.
    body_start: usize,
}

impl RequestParser {
    pub fn new() -> Self {
        Self::with_capacity(READ_BUFFER_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: ReadBuffer::new(capacity),
            state: CheckState::RequestLine,
            request: Request::default(),
            body_start: 0,
        }
    }

    pub fn buffer(&self) -> &ReadBuffer {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut ReadBuffer {
        &mut self.buffer
    }

    #[cfg(test)]
    pub fn state(&self) -> CheckState {
        self.state
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Parse as far as the buffered bytes allow.
    pub fn parse(&mut self) -> ParseResult {
        let Self {
            buffer,
            state,
            request,
            body_start,
        } = self;

        loop {
            if *state == CheckState::Body {
                // A length past usize::MAX can never be buffered
                let body_end = body_start.checked_add(request.content_length);
                return if body_end.is_some_and(|end| buffer.read_index() >= end) {
                    ParseResult::Complete
                } else {
                    ParseResult::Incomplete
                };
            }

            match buffer.parse_line() {
                LineStatus::Ok => {}
                LineStatus::Open => return ParseResult::Incomplete,
                LineStatus::Bad => return ParseResult::Malformed,
            }

            let line = buffer.take_line();
            trace!(line = %String::from_utf8_lossy(line), "Got request line");

            if *state == CheckState::RequestLine {
                if parse_request_line(line, request).is_none() {
                    return ParseResult::Malformed;
                }
                *state = CheckState::Header;
                continue;
            }

            match parse_header(line, request) {
                HeaderLine::Field => {}
                HeaderLine::Invalid => return ParseResult::Malformed,
                HeaderLine::End if request.content_length > 0 => {
                    *body_start = buffer.checked_index();
                    *state = CheckState::Body;
                }
                HeaderLine::End => return ParseResult::Complete,
            }
        }
    }

    /// Return to the initial state for the next request.
    pub fn reset(&mut self) {
        self.buffer.reset();
        self.state = CheckState::RequestLine;
        self.request.reset();
        self.body_start = 0;
    }
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

fn is_blank(b: u8) -> bool {
    b == b' ' || b == b'\t'
}

/// Split at the first space or tab, skipping the run of blanks after it.
fn split_token(text: &[u8]) -> Option<(&[u8], &[u8])> {
    let pos = text.iter().position(|&b| is_blank(b))?;
    let rest = &text[pos + 1..];
    let skip = rest.iter().take_while(|&&b| is_blank(b)).count();
    Some((&text[..pos], &rest[skip..]))
}

/// Parse `METHOD SP target SP HTTP/1.1`.
fn parse_request_line(line: &[u8], request: &mut Request) -> Option<()> {
    let (method, rest) = split_token(line)?;
    if !method.eq_ignore_ascii_case(b"GET") {
        return None;
    }

    let (target, version) = split_token(rest)?;
    if !version.eq_ignore_ascii_case(b"HTTP/1.1") {
        return None;
    }

    // http://host[:port]/path -> /path
    let target = match target.get(..7) {
        Some(scheme) if scheme.eq_ignore_ascii_case(b"http://") => {
            let authority = &target[7..];
            let slash = authority.iter().position(|&b| b == b'/')?;
            &authority[slash..]
        }
        _ => target,
    };
    if target.first() != Some(&b'/') {
        return None;
    }

    request.method = Method::Get;
    request.url = std::str::from_utf8(target).ok()?.to_string();
    request.version = String::from_utf8_lossy(version).into_owned();
    Some(())
}

/// Case-insensitive `Name:` match, returning the value with leading blanks
/// removed.
fn header_value<'a>(line: &'a [u8], name: &[u8]) -> Option<&'a [u8]> {
    let prefix = line.get(..name.len())?;
    if !prefix.eq_ignore_ascii_case(name) {
        return None;
    }
    let value = &line[name.len()..];
    let skip = value.iter().take_while(|&&b| is_blank(b)).count();
    Some(&value[skip..])
}

fn parse_header(line: &[u8], request: &mut Request) -> HeaderLine {
    if line.is_empty() {
        return HeaderLine::End;
    }

    if let Some(value) = header_value(line, b"Connection:") {
        if value.eq_ignore_ascii_case(b"keep-alive") {
            request.linger = true;
        }
    } else if let Some(value) = header_value(line, b"Content-Length:") {
        let length = std::str::from_utf8(value)
            .ok()
            .and_then(|v| v.trim_end().parse::<usize>().ok());
        match length {
            Some(n) => request.content_length = n,
            None => return HeaderLine::Invalid,
        }
    } else if let Some(value) = header_value(line, b"Host:") {
        request.host = Some(String::from_utf8_lossy(value).into_owned());
    } else {
        trace!(header = %String::from_utf8_lossy(line), "Ignoring unknown header");
    }

    HeaderLine::Field
}
