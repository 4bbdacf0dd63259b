//! Signal relay for the dispatch loop.
//!
//! Signal handlers only write a byte into a private socket pair; the read
//! ends are registered with the poller like any other descriptor, and the
//! dispatcher decides what to do after it has finished the current I/O pass.
//!
//! - `SIGALRM`, raised every timeslot by `start_ticker`, drives idle expiry.
//! - `SIGINT` / `SIGTERM` request a graceful shutdown.
//!
//! `SIGPIPE` needs no handling here: the Rust runtime ignores it before
//! `main`, so writes to a closed peer fail with `EPIPE` instead.

use signal_hook::consts::{SIGALRM, SIGINT, SIGTERM};
use signal_hook::low_level::pipe;
use signal_hook::SigId;
use std::io::{self, Read};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;

/// Signal classes observed during one loop iteration.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Signals {
    pub tick: bool,
    pub terminate: bool,
}

/// Read ends of the signal relay channels.
pub struct SignalChannel {
    tick: UnixStream,
    terminate: UnixStream,
    ids: Vec<SigId>,
}

impl SignalChannel {
    /// Install the relaying handlers.
    pub fn install() -> io::Result<Self> {
        let (tick, tick_tx) = UnixStream::pair()?;
        let (terminate, terminate_tx) = UnixStream::pair()?;
        for stream in [&tick, &tick_tx, &terminate, &terminate_tx] {
            stream.set_nonblocking(true)?;
        }

        let ids = vec![
            pipe::register(SIGALRM, tick_tx)?,
            pipe::register(SIGINT, terminate_tx.try_clone()?)?,
            pipe::register(SIGTERM, terminate_tx)?,
        ];

        Ok(Self {
            tick,
            terminate,
            ids,
        })
    }

    pub fn tick_fd(&self) -> RawFd {
        self.tick.as_raw_fd()
    }

    pub fn terminate_fd(&self) -> RawFd {
        self.terminate.as_raw_fd()
    }

    /// Empty the tick channel. Returns whether a tick was pending.
    pub fn drain_tick(&mut self) -> bool {
        drain(&mut self.tick)
    }

    /// Empty the terminate channel. Returns whether a request was pending.
    pub fn drain_terminate(&mut self) -> bool {
        drain(&mut self.terminate)
    }
}

impl Drop for SignalChannel {
    fn drop(&mut self) {
        for id in self.ids.drain(..) {
            signal_hook::low_level::unregister(id);
        }
    }
}

// Edge-triggered registration: read until the channel is empty.
fn drain(stream: &mut UnixStream) -> bool {
    let mut buf = [0u8; 64];
    let mut fired = false;
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(_) => fired = true,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    fired
}

/// Raise `SIGALRM` every `interval`.
pub fn start_ticker(interval: Duration) -> io::Result<()> {
    let period = libc::timeval {
        tv_sec: interval.as_secs() as libc::time_t,
        tv_usec: interval.subsec_micros() as libc::suseconds_t,
    };
    let timer = libc::itimerval {
        it_interval: period,
        it_value: period,
    };
    // SAFETY: `timer` is a valid itimerval and the old value is not requested.
    if unsafe { libc::setitimer(libc::ITIMER_REAL, &timer, std::ptr::null_mut()) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_is_relayed() {
        let mut channel = SignalChannel::install().unwrap();
        assert!(!channel.drain_tick());

        signal_hook::low_level::raise(SIGALRM).unwrap();
        assert!(channel.drain_tick());
        // Drained
        assert!(!channel.drain_tick());
        assert!(!channel.drain_terminate());
    }
}
