//! Server runtime: readiness dispatch, worker pool and idle timers.
//!
//! - `poller`: edge-triggered polling with one-shot re-arming
//! - `connection`: per-connection state and the slot registry
//! - `pool`: fixed worker threads over a bounded task queue
//! - `timer`: idle timers sorted by expiry
//! - `signal`: relays `SIGALRM`/`SIGINT`/`SIGTERM` into the poller
//! - `event_loop`: the dispatch thread tying it all together

mod connection;
mod event_loop;
mod poller;
mod pool;
mod signal;
mod sync;
mod task;
mod timer;

pub use event_loop::run;
