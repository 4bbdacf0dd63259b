//! Work handed from the dispatch thread to the worker pool.

use crate::http::DocRoot;
use crate::runtime::connection::{Processed, Slot};
use crate::runtime::poller::{Arm, Registrar};
use crate::runtime::pool::Job;
use mio::Token;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// State shared by the dispatcher and every worker.
pub struct Context {
    registrar: Registrar,
    doc_root: DocRoot,
    /// Live connections.
    users: AtomicUsize,
}

impl Context {
    pub fn new(registrar: Registrar, doc_root: DocRoot) -> Self {
        Self {
            registrar,
            doc_root,
            users: AtomicUsize::new(0),
        }
    }

    pub fn registrar(&self) -> &Registrar {
        &self.registrar
    }

    pub fn doc_root(&self) -> &DocRoot {
        &self.doc_root
    }

    pub fn users(&self) -> usize {
        self.users.load(Ordering::Acquire)
    }

    pub(crate) fn add_user(&self) -> usize {
        self.users.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn remove_user(&self) {
        self.users.fetch_sub(1, Ordering::AcqRel);
    }

    /// Re-arm `slot` for `arm` unless it has been evicted.
    ///
    /// A slot that cannot be re-armed would never see another event, so it
    /// is evicted instead. The dispatcher drops it from the registry when
    /// its idle timer fires.
    pub fn rearm(&self, slot: &Slot, arm: Arm) {
        if slot.is_closed() {
            return;
        }
        if let Err(e) = self
            .registrar
            .rearm(slot.fd(), Token(slot.id()), slot.registration(), arm)
        {
            warn!(conn_id = slot.id(), error = %e, "Failed to re-arm connection, closing");
            self.evict(slot);
        }
    }

    /// Take `slot` out of the readiness set and drop it from the user count.
    ///
    /// Safe to call more than once; only the first call has any effect.
    pub fn evict(&self, slot: &Slot) {
        if !slot.mark_closed() {
            return;
        }
        if let Err(e) = self.registrar.deregister(slot.fd(), slot.registration()) {
            debug!(conn_id = slot.id(), error = %e, "Failed to deregister connection");
        }
        self.remove_user();
        debug!(conn_id = slot.id(), "Connection closed");
    }
}

pub enum Task {
    /// Parse buffered input and prepare a response.
    Process { slot: Arc<Slot>, ctx: Arc<Context> },
}

impl Job for Task {
    fn execute(self) {
        match self {
            Task::Process { slot, ctx } => process_connection(&slot, &ctx),
        }
    }
}

fn process_connection(slot: &Slot, ctx: &Context) {
    if slot.is_closed() {
        return;
    }

    // Re-arming happens under the connection lock so the next event's
    // handler cannot observe state older than the interest it woke on.
    let Some(mut conn) = slot.lock() else {
        warn!(conn_id = slot.id(), "Connection state poisoned, closing");
        let mut conn = slot.lock_poisoned();
        conn.close();
        ctx.rearm(slot, Arm::Read);
        return;
    };

    let arm = match conn.process(ctx.doc_root()) {
        Processed::NeedMore => Arm::Read,
        Processed::Respond => Arm::Write,
        Processed::Close => {
            // The shutdown surfaces as a hangup on the next poll
            conn.close();
            Arm::Read
        }
    };
    ctx.rearm(slot, arm);
    drop(conn);
}
