//! Completion-driven engine.
//!
//! Every registration owns one standing operation (read, or accept for
//! listeners) that is re-posted each time it completes, and at most one
//! write operation posted on request. Operations are keyed by a slab index;
//! the slab entry remembers the token the operation was posted for, so a
//! completion arriving after its slot was vacated or reused is recognised
//! and dropped.

use super::{Event, EventCounters, Registration, SocketEngine, deliver, inspect, is_busy, not_found};
use crate::completion::{Completion, CompletionPort, OpKind, Outcome};
use crate::error::EngineError;
use crate::handler::{HandlerRef, HandlerState};
use crate::poller::platform::sys_socket_error;
use crate::poller::{Interest, RawSocket};
use crate::table::{FdTable, Occupant, Token};
use crate::utils::Slab;

use std::io;
use std::mem;
use std::time::Duration;

use tracing::{debug, error, trace, warn};

/// Bookkeeping for one posted operation.
#[derive(Clone, Copy, Debug)]
struct PendingOperation {
    kind: OpKind,
    token: Token,
    socket: RawSocket,
}

/// [`SocketEngine`] backed by a [`CompletionPort`].
pub struct CompletionBackend<P: CompletionPort> {
    port: P,
    table: FdTable,

    /// Operations the port still owes a completion for.
    ops: Slab<PendingOperation>,

    /// Reusable buffer for completions returned by the port.
    completions: Vec<Completion>,

    /// Completions held back because their handler was already served in
    /// the dispatch that reaped them.
    deferred: Vec<Completion>,

    served: Vec<bool>,

    /// Set while callbacks of a dispatch are running.
    dispatching: bool,

    counters: EventCounters,
}

#[cfg(target_os = "linux")]
impl CompletionBackend<crate::completion::UringPort> {
    /// Creates a backend on a fresh `io_uring` instance that reaps at most
    /// `events_per_poll` completions per dispatch.
    pub fn new(capacity: usize, events_per_poll: usize) -> Result<Self, EngineError> {
        let entries = capacity.saturating_mul(2).clamp(64, 4096) as u32;
        let port = crate::completion::UringPort::new(entries, events_per_poll)?;

        let mut backend = Self::with_port(port, capacity);
        backend.completions.reserve(events_per_poll);
        Ok(backend)
    }
}

impl<P: CompletionPort> CompletionBackend<P> {
    /// Creates a backend on an explicit completion port.
    pub fn with_port(port: P, capacity: usize) -> Self {
        debug!(primitive = port.name(), capacity, "completion engine created");

        Self {
            port,
            table: FdTable::new(capacity),
            ops: Slab::new(capacity),
            completions: Vec::new(),
            deferred: Vec::new(),
            served: vec![false; capacity],
            dispatching: false,
            counters: EventCounters::default(),
        }
    }

    /// Number of operations the port still owes a completion for.
    pub fn pending_operations(&self) -> usize {
        self.ops.len()
    }

    fn post_op(&mut self, token: Token, socket: RawSocket, kind: OpKind) -> io::Result<u64> {
        let key = self.ops.insert(PendingOperation {
            kind,
            token,
            socket,
        });

        if let Err(e) = self.port.post(key as u64, socket, kind) {
            self.ops.remove(key);
            return Err(e);
        }

        trace!(%token, ?kind, key, "operation posted");
        Ok(key as u64)
    }

    fn cancel_op(&mut self, key: u64) {
        if let Err(e) = self.port.cancel(key) {
            trace!(key, error = %e, "cancel refused");
        }
    }

    /// Marks a registration errored and withdraws its operations. Their
    /// completions are discarded when they arrive.
    fn retire(&mut self, token: Token) {
        let Some(occ) = self.table.get_mut(token) else {
            return;
        };

        occ.errored = true;
        occ.interest = Interest::default();
        let ops = [occ.standing_op.take(), occ.write_op.take()];

        for key in ops.into_iter().flatten() {
            self.cancel_op(key);
        }
    }

    /// Posts the standing read/accept operation again.
    fn rearm_standing(&mut self, token: Token, socket: RawSocket, kind: OpKind) -> io::Result<()> {
        let key = self.post_op(token, socket, kind)?;
        if let Some(occ) = self.table.get_mut(token) {
            occ.standing_op = Some(key);
        }
        Ok(())
    }

    /// Decides which callback, if any, a completion turns into.
    fn resolve(&mut self, completion: Completion) -> Option<(Token, HandlerRef, Event)> {
        let key = completion.user_data;
        let index = key as usize;

        let Some(&op) = self.ops.get(index) else {
            trace!(key, "completion for unknown operation");
            return None;
        };

        let Some(occ) = self.table.get(op.token) else {
            self.ops.remove(index);
            self.counters.stale += 1;
            trace!(token = %op.token, key, "dropping stale completion");
            return None;
        };

        if occ.standing_op != Some(key) && occ.write_op != Some(key) {
            self.ops.remove(index);
            trace!(token = %op.token, key, "dropping withdrawn operation");
            return None;
        }

        let busy = occ.handler.upgrade().is_some_and(|h| is_busy(&h));

        if busy || self.served[op.token.slot()] {
            self.deferred.push(completion);
            return None;
        }

        self.ops.remove(index);

        let token = op.token;
        let occ = self.table.get_mut(token)?;
        let handler = occ.handler.upgrade();

        if op.kind == OpKind::Write {
            occ.write_op = None;
        } else {
            occ.standing_op = None;
        }

        let Some(handler) = handler else {
            warn!(%token, "handler dropped while still registered");
            return None;
        };

        let event = match completion.outcome {
            Outcome::Cancelled if op.kind == OpKind::Write => {
                match self.post_op(token, op.socket, OpKind::Write) {
                    Ok(key) => {
                        if let Some(occ) = self.table.get_mut(token) {
                            occ.write_op = Some(key);
                        }
                        return None;
                    }
                    Err(e) => Event::Error(e),
                }
            }
            Outcome::Cancelled => match self.rearm_standing(token, op.socket, op.kind) {
                Ok(()) => return None,
                Err(e) => Event::Error(e),
            },
            Outcome::Ready => match op.kind {
                OpKind::Write => {
                    if let Some(occ) = self.table.get_mut(token) {
                        occ.interest.write = false;
                    }
                    Event::Write
                }
                kind => match self.rearm_standing(token, op.socket, kind) {
                    Ok(()) if kind == OpKind::Accept => Event::Accept,
                    Ok(()) => Event::Read,
                    Err(e) => {
                        warn!(%token, error = %e, "failed to re-post standing operation");
                        Event::Error(e)
                    }
                },
            },
            Outcome::SocketError => Event::Error(sys_socket_error(op.socket)),
            Outcome::Failed(e) => Event::Error(e),
        };

        if let Event::Error(_) = event {
            self.retire(token);
        }

        self.served[token.slot()] = true;

        Some((token, handler, event))
    }

    /// Unbinds every handler and withdraws every outstanding operation.
    fn release_all(&mut self) {
        for token in self.table.tokens() {
            if self.table.free(token, true).is_ok() {
                debug!(%token, "handler released at shutdown");
            }
        }

        for (key, _) in self.ops.drain() {
            self.cancel_op(key as u64);
        }

        let mut sink = Vec::new();
        if let Err(e) = self.port.wait(&mut sink, Some(Duration::ZERO)) {
            trace!(error = %e, "flushing cancellations failed");
        }
    }
}

impl<P: CompletionPort> SocketEngine for CompletionBackend<P> {
    fn add_fd(&mut self, handler: HandlerRef) -> Result<Token, EngineError> {
        let Registration {
            socket,
            listener,
            state,
        } = inspect(&self.table, &handler)?;

        let token = self
            .table
            .allocate(Occupant::new(&handler, socket, listener))?;

        let kind = if listener { OpKind::Accept } else { OpKind::Read };

        let standing = match self.post_op(token, socket, kind) {
            Ok(key) => key,
            Err(e) => {
                let _ = self.table.free(token, true);
                error!(%token, error = %e, "port refused standing operation");
                return Err(EngineError::BackendFailure(e));
            }
        };

        let write = if state == HandlerState::Connecting {
            match self.post_op(token, socket, OpKind::Write) {
                Ok(key) => Some(key),
                Err(e) => {
                    self.cancel_op(standing);
                    let _ = self.table.free(token, true);
                    error!(%token, error = %e, "port refused connect notification");
                    return Err(EngineError::BackendFailure(e));
                }
            }
        } else {
            None
        };

        if let Some(occ) = self.table.get_mut(token) {
            occ.standing_op = Some(standing);
            occ.write_op = write;
            occ.interest.write = write.is_some();
        }

        debug!(%token, listener, ?state, "handler added");
        Ok(token)
    }

    fn del_fd(&mut self, token: Token, force: bool) -> Result<(), EngineError> {
        let occ = self.table.free(token, force)?;

        for key in [occ.standing_op, occ.write_op].into_iter().flatten() {
            self.cancel_op(key);
        }

        debug!(%token, force, "handler removed");
        Ok(())
    }

    fn want_write(&mut self, token: Token) -> Result<(), EngineError> {
        let occ = self.table.get(token).ok_or_else(|| not_found(token))?;

        if occ.write_op.is_some() || occ.errored {
            return Ok(());
        }

        let socket = occ.socket;
        let key = self.post_op(token, socket, OpKind::Write)?;

        if let Some(occ) = self.table.get_mut(token) {
            occ.write_op = Some(key);
            occ.interest.write = true;
        }

        Ok(())
    }

    fn dispatch_events(&mut self, timeout: Option<Duration>) -> Result<usize, EngineError> {
        if self.dispatching {
            warn!("nested dispatch refused");
            return Err(EngineError::NestedDispatch);
        }

        if self.table.is_empty() && self.deferred.is_empty() && timeout.is_none() {
            trace!("nothing registered, not blocking");
            return Ok(0);
        }

        let mut batch = mem::take(&mut self.deferred);
        let wait_for = if batch.is_empty() {
            timeout
        } else {
            Some(Duration::ZERO)
        };

        let mut reaped = mem::take(&mut self.completions);

        if let Err(e) = self.port.wait(&mut reaped, wait_for) {
            batch.append(&mut reaped);
            self.deferred = batch;
            self.completions = reaped;
            error!(primitive = self.port.name(), error = %e, "wait failed");
            return Err(EngineError::BackendFailure(e));
        }

        batch.append(&mut reaped);
        self.completions = reaped;

        self.served.fill(false);
        self.dispatching = true;
        let mut delivered = 0;

        for completion in batch {
            let Some((token, handler, event)) = self.resolve(completion) else {
                continue;
            };

            let kind = event.kind();
            if deliver(self, &handler, token, event) {
                self.counters.record(kind);
                delivered += 1;
            }
        }

        self.dispatching = false;
        Ok(delivered)
    }

    fn get_ref(&self, slot: usize) -> Option<HandlerRef> {
        self.table.lookup(slot)
    }

    fn has_fd(&self, slot: usize) -> bool {
        self.table.contains(slot)
    }

    fn interest(&self, token: Token) -> Option<Interest> {
        self.table.get(token).map(|occ| occ.interest)
    }

    fn max_fds(&self) -> usize {
        self.table.capacity()
    }

    fn remaining_fds(&self) -> usize {
        self.table.remaining()
    }

    fn name(&self) -> &'static str {
        self.port.name()
    }

    fn counters(&self) -> EventCounters {
        self.counters
    }
}

impl<P: CompletionPort> Drop for CompletionBackend<P> {
    fn drop(&mut self) {
        self.release_all();
    }
}
