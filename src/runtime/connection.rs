//! Per-connection state and the registry that owns it.
//!
//! A `Connection` holds the socket, the request parser with its read buffer,
//! the response head and the mapped file being served. It is wrapped in a
//! `Slot` shared between the dispatch thread and at most one worker at a
//! time; the one-shot arming discipline makes the slot's mutex uncontended.
//!
//! The dispatcher's `ConnectionRegistry` holds the only long-lived reference
//! to each slot. Evicting a connection removes it from the registry and
//! marks it closed; the descriptor itself is closed when the last reference
//! is dropped, so a worker that still holds the slot never sees its
//! descriptor reused.

use crate::http::response::WRITE_BUFFER_SIZE;
use crate::http::{
    DocRoot, MappedFile, ParseResult, RequestParser, ResolveError, ResponseBuffer, Status,
};
use crate::runtime::poller::Registration;
use mio::net::TcpStream;
use slab::{Slab, VacantEntry};
use std::io::{self, IoSlice, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace, warn};

/// What the connection needs after `process`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processed {
    /// The request is incomplete; wait for more input.
    NeedMore,
    /// A response is ready; wait for the socket to become writable.
    Respond,
    /// No response could be produced; the connection should go away.
    Close,
}

/// Outcome of one `write` attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The socket filled up before the response was sent.
    Pending,
    /// Response sent and the connection was reset for the next request.
    KeepAlive,
    /// Response sent and the client did not ask for keep-alive.
    Close,
}

/// A single client connection.
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    parser: RequestParser,
    response: ResponseBuffer,
    file: Option<MappedFile>,
    /// Bytes of the current response (head, then file) already written.
    bytes_sent: usize,
    linger: bool,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            parser: RequestParser::new(),
            response: ResponseBuffer::new(WRITE_BUFFER_SIZE),
            file: None,
            bytes_sent: 0,
            linger: false,
        }
    }

    /// Read everything currently available into the read buffer.
    ///
    /// Fails if the peer closed the connection or the buffer was already
    /// full, since a request that does not fit can never complete.
    pub fn read(&mut self) -> io::Result<usize> {
        if self.parser.buffer().is_full() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "request exceeds read buffer",
            ));
        }

        let mut total = 0;
        loop {
            let spare = self.parser.buffer_mut().spare_mut();
            if spare.is_empty() {
                break;
            }
            match self.stream.read(spare) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::ConnectionReset,
                        "peer closed connection",
                    ));
                }
                Ok(n) => {
                    self.parser.buffer_mut().advance(n);
                    total += n;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    /// Parse buffered input and, once a request is complete, prepare the
    /// response for it.
    pub fn process(&mut self, root: &DocRoot) -> Processed {
        let status = match self.parser.parse() {
            ParseResult::Incomplete => return Processed::NeedMore,
            ParseResult::Malformed => Status::BadRequest,
            ParseResult::Complete => {
                let request = self.parser.request();
                debug!(
                    peer = %self.peer,
                    method = ?request.method,
                    url = %request.url,
                    version = %request.version,
                    host = request.host.as_deref().unwrap_or("-"),
                    "Request"
                );
                self.open_target(root)
            }
        };
        self.linger = self.parser.request().linger;
        self.prepare_response(status)
    }

    fn open_target(&mut self, root: &DocRoot) -> Status {
        let url = &self.parser.request().url;
        match root.resolve(url) {
            Ok(file) => {
                self.file = Some(file);
                Status::Ok
            }
            Err(ResolveError::NotFound(_)) => Status::NotFound,
            Err(ResolveError::Forbidden(_)) => Status::Forbidden,
            Err(e @ ResolveError::Io { .. }) => {
                warn!(peer = %self.peer, error = %e, "Failed to open target");
                Status::InternalError
            }
            Err(e) => {
                debug!(peer = %self.peer, error = %e, "Rejected target");
                Status::BadRequest
            }
        }
    }

    fn prepare_response(&mut self, status: Status) -> Processed {
        let body_len = self.file.as_ref().map_or(0, MappedFile::len);
        self.bytes_sent = 0;

        match self.response.build(status, body_len, self.linger) {
            Ok(()) => {
                trace!(peer = %self.peer, code = status.code(), body_len, "Response ready");
                Processed::Respond
            }
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "Failed to build response");
                self.unmap();
                match self.response.build(Status::InternalError, 0, self.linger) {
                    Ok(()) => Processed::Respond,
                    Err(_) => Processed::Close,
                }
            }
        }
    }

    /// Send as much of the pending response as the socket accepts.
    ///
    /// The head and the mapped file go out in one scatter write. Completing
    /// the response releases the mapping; with keep-alive the connection is
    /// then reset for the next request.
    pub fn write(&mut self) -> io::Result<WriteOutcome> {
        let head_len = self.response.len();
        let body_len = self.file.as_ref().map_or(0, MappedFile::len);
        let total = head_len + body_len;

        if total == 0 {
            self.reset();
            return Ok(WriteOutcome::KeepAlive);
        }

        loop {
            let head = self.response.as_bytes();
            let body = self.file.as_ref().map_or(&[][..], MappedFile::as_bytes);
            let sent = self.bytes_sent;
            let slices = [
                IoSlice::new(&head[sent.min(head_len)..]),
                IoSlice::new(&body[sent.saturating_sub(head_len)..]),
            ];

            match self.stream.write_vectored(&slices) {
                Ok(0) => {
                    self.unmap();
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => {
                    self.bytes_sent += n;
                    if self.bytes_sent < total {
                        continue;
                    }
                    self.unmap();
                    if self.linger {
                        self.reset();
                        return Ok(WriteOutcome::KeepAlive);
                    }
                    return Ok(WriteOutcome::Close);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(WriteOutcome::Pending);
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.unmap();
                    return Err(e);
                }
            }
        }
    }

    /// Prepare for the next request on the same socket.
    pub fn reset(&mut self) {
        self.unmap();
        self.parser.reset();
        self.response.clear();
        self.bytes_sent = 0;
        self.linger = false;
    }

    /// Release the mapped file, if any.
    pub fn unmap(&mut self) {
        self.file = None;
    }

    /// Shut the socket down in both directions.
    ///
    /// The descriptor stays open until the connection is dropped; the peer
    /// and the poller both observe the shutdown.
    pub fn close(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    #[cfg(test)]
    pub fn state(&self) -> crate::http::CheckState {
        self.parser.state()
    }

    /// Bytes buffered and not yet consumed by a completed request.
    #[cfg(test)]
    pub fn buffered(&self) -> usize {
        self.parser.buffer().read_index()
    }

    #[cfg(test)]
    pub fn has_file(&self) -> bool {
        self.file.is_some()
    }

    #[cfg(test)]
    fn response_head(&self) -> &[u8] {
        self.response.as_bytes()
    }
}

/// A registered connection shared between the dispatcher and workers.
pub struct Slot {
    id: usize,
    fd: RawFd,
    registration: Registration,
    closed: AtomicBool,
    conn: Mutex<Connection>,
}

impl Slot {
    pub fn new(id: usize, fd: RawFd, registration: Registration, conn: Connection) -> Self {
        Self {
            id,
            fd,
            registration,
            closed: AtomicBool::new(false),
            conn: Mutex::new(conn),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn registration(&self) -> &Registration {
        &self.registration
    }

    /// Lock the connection. `None` if a task panicked while holding it.
    pub fn lock(&self) -> Option<MutexGuard<'_, Connection>> {
        self.conn.lock().ok()
    }

    /// Lock the connection even if a task panicked while holding it.
    pub fn lock_poisoned(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark the slot evicted. Returns `false` if it already was.
    pub fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Registry of live connections, keyed by poll token.
///
/// Slab allocation gives O(1) insert, lookup and remove. Only the dispatch
/// thread touches the registry.
#[derive(Default)]
pub struct ConnectionRegistry {
    slots: Slab<Arc<Slot>>,
}

impl ConnectionRegistry {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Slab::with_capacity(capacity),
        }
    }

    /// Reserve an id; the slot is added by inserting into the entry.
    pub fn vacant_entry(&mut self) -> VacantEntry<'_, Arc<Slot>> {
        self.slots.vacant_entry()
    }

    pub fn get(&self, id: usize) -> Option<&Arc<Slot>> {
        self.slots.get(id)
    }

    pub fn remove(&mut self, id: usize) -> Option<Arc<Slot>> {
        self.slots.try_remove(id)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Remove every slot.
    pub fn drain(&mut self) -> impl Iterator<Item = Arc<Slot>> + '_ {
        self.slots.drain()
    }
}
