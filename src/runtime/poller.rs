//! Readiness polling with one-shot registration.
//!
//! mio registers every source edge-triggered. One-shot delivery is layered on
//! top: each connection's `Registration` records what it is armed for, and
//! the dispatcher must `claim` an event before acting on it. A claim disarms
//! the registration, so further events for that descriptor are ignored until
//! the thread that owns the connection calls `rearm`. Re-registering makes
//! the kernel re-evaluate readiness, so data that arrived while disarmed is
//! reported again after the rearm.

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use thiserror::Error;

const DISARMED: u8 = 0;
const ARMED_READ: u8 = 1;
const ARMED_WRITE: u8 = 2;

/// Direction a registration is armed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arm {
    Read,
    Write,
}

impl Arm {
    fn interest(self) -> Interest {
        match self {
            Arm::Read => Interest::READABLE,
            Arm::Write => Interest::WRITABLE,
        }
    }

    fn state(self) -> u8 {
        match self {
            Arm::Read => ARMED_READ,
            Arm::Write => ARMED_WRITE,
        }
    }
}

#[derive(Debug, Error)]
#[error("failed to register descriptor {fd}: {source}")]
pub struct RegistrationError {
    pub fd: RawFd,
    #[source]
    pub source: io::Error,
}

/// Per-descriptor arming state.
#[derive(Debug)]
pub struct Registration {
    one_shot: bool,
    state: AtomicU8,
}

impl Registration {
    fn new(arm: Arm, one_shot: bool) -> Self {
        Self {
            one_shot,
            state: AtomicU8::new(arm.state()),
        }
    }

    /// Take ownership of a delivered event.
    ///
    /// Succeeds only if the registration is armed for a direction the event
    /// reports, and disarms it. Persistent registrations always succeed.
    pub fn claim(&self, readable: bool, writable: bool) -> Option<Arm> {
        let state = self.state.load(Ordering::Acquire);
        let arm = match state {
            ARMED_READ if readable => Arm::Read,
            ARMED_WRITE if writable => Arm::Write,
            _ => return None,
        };
        if !self.one_shot {
            return Some(arm);
        }
        self.state
            .compare_exchange(state, DISARMED, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| arm)
    }

    #[cfg(test)]
    pub fn is_armed(&self) -> bool {
        self.state.load(Ordering::Acquire) != DISARMED
    }
}

/// Thread-safe handle for adding, re-arming and removing descriptors.
pub struct Registrar {
    registry: Registry,
}

impl Registrar {
    /// Add `fd` to the readiness set, switching it to non-blocking mode.
    pub fn register(
        &self,
        fd: RawFd,
        token: Token,
        arm: Arm,
        one_shot: bool,
    ) -> Result<Registration, RegistrationError> {
        set_nonblocking(fd).map_err(|source| RegistrationError { fd, source })?;
        self.registry
            .register(&mut SourceFd(&fd), token, arm.interest())
            .map_err(|source| RegistrationError { fd, source })?;
        Ok(Registration::new(arm, one_shot))
    }

    /// Re-establish interest after a claimed event.
    pub fn rearm(
        &self,
        fd: RawFd,
        token: Token,
        registration: &Registration,
        arm: Arm,
    ) -> io::Result<()> {
        registration.state.store(arm.state(), Ordering::Release);
        self.registry
            .reregister(&mut SourceFd(&fd), token, arm.interest())
    }

    /// Remove `fd` from the readiness set. Closing the descriptor is up to
    /// its owner.
    pub fn deregister(&self, fd: RawFd, registration: &Registration) -> io::Result<()> {
        registration.state.store(DISARMED, Ordering::Release);
        self.registry.deregister(&mut SourceFd(&fd))
    }
}

/// One readiness notification.
#[derive(Debug, Clone, Copy)]
pub struct Ready {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    /// Error, hangup or peer shutdown.
    pub closed: bool,
}

/// Owner of the readiness context; only the dispatch thread waits on it.
pub struct Poller {
    poll: Poll,
    events: Events,
}

impl Poller {
    pub fn new(max_events: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(max_events),
        })
    }

    pub fn registrar(&self) -> io::Result<Registrar> {
        Ok(Registrar {
            registry: self.poll.registry().try_clone()?,
        })
    }

    /// Block until something is ready or `timeout` elapses.
    ///
    /// An interrupted wait leaves `ready` empty and returns `Ok`.
    pub fn wait(&mut self, timeout: Option<Duration>, ready: &mut Vec<Ready>) -> io::Result<()> {
        ready.clear();
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        ready.extend(self.events.iter().map(|event| Ready {
            token: event.token(),
            readable: event.is_readable(),
            writable: event.is_writable(),
            closed: event.is_error() || event.is_read_closed() || event.is_write_closed(),
        }));
        Ok(())
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor we were handed; failure is reported via errno.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if flags & libc::O_NONBLOCK != 0 {
        return Ok(());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    const TOKEN: Token = Token(7);
    const WAIT: Option<Duration> = Some(Duration::from_millis(200));

    fn drain(stream: &mut UnixStream) {
        let mut buf = [0u8; 64];
        while let Ok(n) = stream.read(&mut buf) {
            if n == 0 {
                break;
            }
        }
    }

    #[test]
    fn test_claim_disarms_one_shot() {
        let registration = Registration::new(Arm::Read, true);
        assert_eq!(registration.claim(true, false), Some(Arm::Read));
        assert!(!registration.is_armed());
        assert_eq!(registration.claim(true, false), None);
    }

    #[test]
    fn test_claim_ignores_other_direction() {
        let registration = Registration::new(Arm::Write, true);
        assert_eq!(registration.claim(true, false), None);
        assert!(registration.is_armed());
        assert_eq!(registration.claim(false, true), Some(Arm::Write));
    }

    #[test]
    fn test_persistent_registration_stays_armed() {
        let registration = Registration::new(Arm::Read, false);
        assert_eq!(registration.claim(true, false), Some(Arm::Read));
        assert_eq!(registration.claim(true, false), Some(Arm::Read));
    }

    #[test]
    fn test_register_sets_nonblocking() {
        let (mut local, _peer) = UnixStream::pair().unwrap();
        let poller = Poller::new(16).unwrap();
        let registrar = poller.registrar().unwrap();
        registrar
            .register(local.as_raw_fd(), TOKEN, Arm::Read, true)
            .unwrap();

        let mut buf = [0u8; 8];
        let err = local.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_rearm_redelivers_pending_data() {
        let (mut local, mut peer) = UnixStream::pair().unwrap();
        let mut poller = Poller::new(16).unwrap();
        let registrar = poller.registrar().unwrap();
        let fd = local.as_raw_fd();
        let registration = registrar.register(fd, TOKEN, Arm::Read, true).unwrap();
        let mut ready = Vec::new();

        peer.write_all(b"first").unwrap();
        poller.wait(WAIT, &mut ready).unwrap();
        assert!(ready.iter().any(|r| r.token == TOKEN && r.readable));
        assert_eq!(registration.claim(true, false), Some(Arm::Read));

        // Data arriving while disarmed is not claimable
        peer.write_all(b"second").unwrap();
        poller.wait(WAIT, &mut ready).unwrap();
        assert_eq!(registration.claim(true, false), None);

        registrar.rearm(fd, TOKEN, &registration, Arm::Read).unwrap();
        poller.wait(WAIT, &mut ready).unwrap();
        assert!(ready.iter().any(|r| r.token == TOKEN && r.readable));
        assert_eq!(registration.claim(true, false), Some(Arm::Read));

        drain(&mut local);
        registrar.deregister(fd, &registration).unwrap();
        assert!(!registration.is_armed());
    }

    #[test]
    fn test_peer_close_reported() {
        let (local, peer) = UnixStream::pair().unwrap();
        let mut poller = Poller::new(16).unwrap();
        let registrar = poller.registrar().unwrap();
        registrar
            .register(local.as_raw_fd(), TOKEN, Arm::Read, true)
            .unwrap();

        drop(peer);
        let mut ready = Vec::new();
        poller.wait(WAIT, &mut ready).unwrap();
        assert!(ready.iter().any(|r| r.token == TOKEN && r.closed));
    }
}
