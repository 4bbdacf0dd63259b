//! Readiness dispatch loop.
//!
//! One thread owns the poller, the listener, the connection registry and the
//! idle timers. It accepts connections, performs all socket reads and
//! writes, and hands parsing and response preparation to the worker pool.
//!
//! Every connection is registered one-shot: once the loop claims an event
//! for it, nothing more is delivered until whoever handled that event
//! re-arms it. A connection is therefore only ever touched by one thread
//! at a time.

use crate::config::Config;
use crate::http::DocRoot;
use crate::runtime::connection::{Connection, ConnectionRegistry, Slot, WriteOutcome};
use crate::runtime::poller::{Arm, Poller, Ready, RegistrationError};
use crate::runtime::pool::{PoolError, ShutdownMode, WorkerPool};
use crate::runtime::signal::{SignalChannel, Signals};
use crate::runtime::task::{Context, Task};
use crate::runtime::timer::TimerList;
use mio::net::{TcpListener, TcpStream};
use mio::Token;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

const LISTENER: Token = Token(usize::MAX);
const TICK: Token = Token(usize::MAX - 1);
const TERMINATE: Token = Token(usize::MAX - 2);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid listen address '{host}': {source}")]
    Address {
        host: String,
        source: std::net::AddrParseError,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Registration(#[from] RegistrationError),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

pub struct EventLoop {
    poller: Poller,
    listener: TcpListener,
    signals: SignalChannel,
    connections: ConnectionRegistry,
    timers: TimerList,
    pool: WorkerPool<Task>,
    ctx: Arc<Context>,
    ready: Vec<Ready>,
    max_connections: usize,
    idle_timeout: Duration,
}

impl EventLoop {
    /// Bind the listener, start the workers and install signal relays.
    pub fn bind(config: &Config) -> Result<Self, ServerError> {
        let ip: IpAddr = config.host.parse().map_err(|source| ServerError::Address {
            host: config.host.clone(),
            source,
        })?;
        let addr = SocketAddr::new(ip, config.port);

        let listener = TcpListener::from_std(create_listener(addr, config.backlog)?);
        let poller = Poller::new(config.max_events)?;
        let registrar = poller.registrar()?;
        registrar.register(listener.as_raw_fd(), LISTENER, Arm::Read, false)?;

        let signals = SignalChannel::install()?;
        registrar.register(signals.tick_fd(), TICK, Arm::Read, false)?;
        registrar.register(signals.terminate_fd(), TERMINATE, Arm::Read, false)?;

        let pool = WorkerPool::new(config.workers, config.max_requests)?;
        let ctx = Arc::new(Context::new(registrar, DocRoot::new(&config.doc_root)));

        Ok(Self {
            poller,
            listener,
            signals,
            connections: ConnectionRegistry::with_capacity(config.max_connections.min(4096)),
            timers: TimerList::new(),
            pool,
            ctx,
            ready: Vec::with_capacity(config.max_events),
            max_connections: config.max_connections,
            idle_timeout: config.idle_timeout(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until `SIGINT` or `SIGTERM`, then drain the worker pool.
    pub fn run(mut self) -> Result<(), ServerError> {
        info!(
            addr = %self.local_addr()?,
            workers = self.pool.threads(),
            root = %self.ctx.doc_root().path().display(),
            "Server listening"
        );

        loop {
            let signals = self.poll_once(None)?;

            if signals.tick {
                let expired = self.expire_idle(Instant::now());
                if expired > 0 {
                    debug!(
                        expired,
                        users = self.ctx.users(),
                        timers = self.timers.len(),
                        "Evicted idle connections"
                    );
                }
            }
            if signals.terminate {
                info!("Shutdown requested");
                break;
            }
        }

        self.shutdown()
    }

    /// Wait for readiness once and handle every delivered event.
    ///
    /// Signals are only reported here; acting on them is up to the caller,
    /// after the I/O pass.
    pub fn poll_once(&mut self, timeout: Option<Duration>) -> io::Result<Signals> {
        let mut ready = std::mem::take(&mut self.ready);
        let result = self.poller.wait(timeout, &mut ready);
        let mut signals = Signals::default();

        if result.is_ok() {
            for event in &ready {
                match event.token {
                    LISTENER => self.accept(),
                    TICK => signals.tick |= self.signals.drain_tick(),
                    TERMINATE => signals.terminate |= self.signals.drain_terminate(),
                    Token(id) => self.handle_connection_event(id, event),
                }
            }
        }

        self.ready = ready;
        result.map(|()| signals)
    }

    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if self.ctx.users() >= self.max_connections {
                        warn!(peer = %peer, "Connection limit reached");
                        continue;
                    }
                    if let Err(e) = self.open_connection(stream, peer) {
                        warn!(peer = %peer, error = %e, "Failed to register connection");
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("Accept error: {}", e);
                    break;
                }
            }
        }
    }

    fn open_connection(
        &mut self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<(), RegistrationError> {
        let fd = stream.as_raw_fd();
        let entry = self.connections.vacant_entry();
        let id = entry.key();
        let registration = self.ctx.registrar().register(fd, Token(id), Arm::Read, true)?;
        entry.insert(Arc::new(Slot::new(
            id,
            fd,
            registration,
            Connection::new(stream, peer),
        )));

        self.timers.add(id, self.idle_timeout);
        let users = self.ctx.add_user();
        debug!(conn_id = id, peer = %peer, users, "Accepted connection");
        Ok(())
    }

    fn handle_connection_event(&mut self, id: usize, event: &Ready) {
        let Some(slot) = self.connections.get(id).map(Arc::clone) else {
            return;
        };

        if event.closed {
            debug!(conn_id = id, "Peer hung up");
            self.close_connection(id);
            return;
        }

        match slot.registration().claim(event.readable, event.writable) {
            Some(Arm::Read) => self.handle_readable(&slot),
            Some(Arm::Write) => self.handle_writable(&slot),
            None => trace!(conn_id = id, "Ignoring event for disarmed connection"),
        }
    }

    fn handle_readable(&mut self, slot: &Arc<Slot>) {
        let id = slot.id();
        let result = match slot.lock() {
            Some(mut conn) => conn.read(),
            None => Err(io::Error::other("connection state poisoned")),
        };

        let n = match result {
            Ok(n) => n,
            Err(e) => {
                debug!(conn_id = id, error = %e, "Read failed");
                self.close_connection(id);
                return;
            }
        };
        trace!(conn_id = id, bytes = n, "Read request data");
        self.timers.adjust(id, self.idle_timeout);

        let task = Task::Process {
            slot: Arc::clone(slot),
            ctx: Arc::clone(&self.ctx),
        };
        match self.pool.submit(task) {
            Ok(()) => {}
            Err(PoolError::QueueFull { capacity }) => {
                // Buffered bytes are kept; the next readable event retries
                warn!(conn_id = id, capacity, "Task queue full");
                self.ctx.rearm(slot, Arm::Read);
            }
            Err(e) => {
                warn!(conn_id = id, error = %e, "Failed to submit task");
                self.close_connection(id);
            }
        }
    }

    fn handle_writable(&mut self, slot: &Arc<Slot>) {
        let id = slot.id();
        let result = match slot.lock() {
            Some(mut conn) => conn.write(),
            None => Err(io::Error::other("connection state poisoned")),
        };

        match result {
            Ok(WriteOutcome::Pending) => self.ctx.rearm(slot, Arm::Write),
            Ok(WriteOutcome::KeepAlive) => self.ctx.rearm(slot, Arm::Read),
            Ok(WriteOutcome::Close) => self.close_connection(id),
            Err(e) => {
                debug!(conn_id = id, error = %e, "Write failed");
                self.close_connection(id);
            }
        }
    }

    fn close_connection(&mut self, id: usize) {
        self.timers.remove(id);
        if let Some(slot) = self.connections.remove(id) {
            self.ctx.evict(&slot);
        }
    }

    /// Evict every connection whose idle timer expired at or before `now`.
    pub fn expire_idle(&mut self, now: Instant) -> usize {
        let Self {
            timers,
            connections,
            ctx,
            ..
        } = self;

        if timers.is_empty() {
            return 0;
        }
        timers.tick(now, |id| {
            if let Some(slot) = connections.remove(id) {
                debug!(conn_id = id, "Idle timeout");
                ctx.evict(&slot);
            }
        })
    }

    fn shutdown(mut self) -> Result<(), ServerError> {
        self.pool.shutdown(ShutdownMode::Graceful)?;
        if !self.connections.is_empty() {
            info!(open = self.connections.len(), "Closing open connections");
        }
        for slot in self.connections.drain() {
            self.ctx.evict(&slot);
        }
        info!("Server stopped");
        Ok(())
    }
}

/// Create a non-blocking listener with `SO_REUSEADDR`.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

/// Bind, start the idle ticker and serve until asked to stop.
pub fn run(config: &Config) -> Result<(), ServerError> {
    let event_loop = EventLoop::bind(config)?;
    crate::runtime::signal::start_ticker(config.timeslot)?;
    event_loop.run()
}
