//! Readiness-driven engine.
//!
//! Every registration is a socket in the poller with an interest mask. The
//! poller reports conditions; this backend turns each report into at most
//! one callback:
//!
//! - error condition → `on_error`, after which the socket leaves the poller
//!   (the slot stays bound until `del_fd`);
//! - writable with write interest armed → `on_write_ready`, disarming write
//!   interest first so an always-writable socket cannot spin;
//! - readable → `on_accept_ready` for listeners, `on_read_ready` otherwise.
//!
//! Conditions not delivered in one dispatch are level-triggered and are
//! reported again by the next poll.

use super::{Event, EventCounters, Registration, SocketEngine, deliver, inspect, is_busy, not_found};
use crate::error::EngineError;
use crate::handler::{HandlerRef, HandlerState};
use crate::poller::platform::{is_gone, sys_socket_error};
use crate::poller::{Interest, Poller, Readiness};
use crate::table::{FdTable, Occupant, Token};

use std::mem;
use std::time::Duration;

use tracing::{debug, error, trace, warn};

/// [`SocketEngine`] backed by a readiness [`Poller`].
pub struct ReadinessBackend<P: Poller> {
    poller: P,
    table: FdTable,

    /// Reusable buffer for poll results.
    events: Vec<Readiness>,

    /// Slots that already received a callback in the current dispatch.
    served: Vec<bool>,

    /// Set while callbacks of a dispatch are running.
    dispatching: bool,

    counters: EventCounters,
}

#[cfg(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "freebsd",
    windows
))]
impl ReadinessBackend<crate::poller::DefaultPoller> {
    /// Creates a backend on the platform's native poller.
    pub fn new(capacity: usize, events_per_poll: usize) -> Result<Self, EngineError> {
        let poller = crate::poller::DefaultPoller::new(events_per_poll)?;
        Ok(Self::with_poller(poller, capacity))
    }
}

impl<P: Poller> ReadinessBackend<P> {
    /// Creates a backend on an explicit poller.
    pub fn with_poller(poller: P, capacity: usize) -> Self {
        debug!(primitive = poller.name(), capacity, "readiness engine created");

        Self {
            poller,
            table: FdTable::new(capacity),
            events: Vec::new(),
            served: vec![false; capacity],
            dispatching: false,
            counters: EventCounters::default(),
        }
    }

    /// Decides which callback, if any, a readiness report turns into.
    fn resolve(&mut self, ready: Readiness) -> Option<(Token, HandlerRef, Event)> {
        let token = Token::from_raw(ready.token);

        let Some(occ) = self.table.get_mut(token) else {
            self.counters.stale += 1;
            trace!(%token, "dropping stale readiness");
            return None;
        };

        if occ.errored || self.served[token.slot()] {
            return None;
        }

        let Some(handler) = occ.handler.upgrade() else {
            warn!(%token, "handler dropped while still registered");
            return None;
        };

        // Level-triggered: left untouched, the condition is reported again.
        if is_busy(&handler) {
            debug!(%token, "handler busy, readiness left for the next poll");
            return None;
        }

        let socket = occ.socket;

        let event = if ready.error {
            Event::Error(sys_socket_error(socket))
        } else if ready.writable && occ.interest.write {
            occ.interest.write = false;
            match self.poller.reregister(socket, token.to_raw(), occ.interest) {
                Ok(()) => Event::Write,
                Err(e) => Event::Error(e),
            }
        } else if ready.readable && occ.interest.wants_readable() {
            if occ.listener {
                Event::Accept
            } else {
                Event::Read
            }
        } else {
            return None;
        };

        if let Event::Error(_) = event {
            occ.errored = true;
            occ.interest = Interest::default();
            if let Err(e) = self.poller.deregister(socket) {
                trace!(%token, error = %e, "deregister after error");
            }
        }

        self.served[token.slot()] = true;

        Some((token, handler, event))
    }

    /// Unbinds every handler still registered, in ascending slot order.
    fn release_all(&mut self) {
        for token in self.table.tokens() {
            if let Ok(occ) = self.table.free(token, true) {
                if !occ.errored {
                    let _ = self.poller.deregister(occ.socket);
                }
                debug!(%token, "handler released at shutdown");
            }
        }
    }
}

impl<P: Poller> SocketEngine for ReadinessBackend<P> {
    fn add_fd(&mut self, handler: HandlerRef) -> Result<Token, EngineError> {
        let Registration {
            socket,
            listener,
            state,
        } = inspect(&self.table, &handler)?;

        let mut occupant = Occupant::new(&handler, socket, listener);
        occupant.interest.write = state == HandlerState::Connecting;
        let interest = occupant.interest;

        let token = self.table.allocate(occupant)?;

        if let Err(e) = self.poller.register(socket, token.to_raw(), interest) {
            let _ = self.table.free(token, true);
            error!(%token, error = %e, "poller refused registration");
            return Err(EngineError::BackendFailure(e));
        }

        debug!(%token, listener, ?state, "handler added");
        Ok(token)
    }

    fn del_fd(&mut self, token: Token, force: bool) -> Result<(), EngineError> {
        let occ = self.table.get(token).ok_or_else(|| not_found(token))?;

        if !occ.errored {
            if let Err(e) = self.poller.deregister(occ.socket) {
                if !is_gone(&e) {
                    error!(%token, error = %e, "poller refused removal");
                    return Err(EngineError::BackendFailure(e));
                }
                trace!(%token, "socket already gone from poller");
            }
        }

        self.table.free(token, force)?;

        debug!(%token, force, "handler removed");
        Ok(())
    }

    fn want_write(&mut self, token: Token) -> Result<(), EngineError> {
        let occ = self.table.get_mut(token).ok_or_else(|| not_found(token))?;

        if occ.interest.write || occ.errored {
            return Ok(());
        }

        occ.interest.write = true;

        if let Err(e) = self.poller.reregister(occ.socket, token.to_raw(), occ.interest) {
            occ.interest.write = false;
            return Err(EngineError::BackendFailure(e));
        }

        trace!(%token, "write interest armed");
        Ok(())
    }

    fn dispatch_events(&mut self, timeout: Option<Duration>) -> Result<usize, EngineError> {
        if self.dispatching {
            warn!("nested dispatch refused");
            return Err(EngineError::NestedDispatch);
        }

        if self.table.is_empty() && timeout.is_none() {
            trace!("nothing registered, not blocking");
            return Ok(0);
        }

        let mut events = mem::take(&mut self.events);

        if let Err(e) = self.poller.poll(&mut events, timeout) {
            self.events = events;
            error!(primitive = self.poller.name(), error = %e, "poll failed");
            return Err(EngineError::BackendFailure(e));
        }

        self.served.fill(false);
        self.dispatching = true;
        let mut delivered = 0;

        for ready in events.drain(..) {
            let Some((token, handler, event)) = self.resolve(ready) else {
                continue;
            };

            let kind = event.kind();
            if deliver(self, &handler, token, event) {
                self.counters.record(kind);
                delivered += 1;
            }
        }

        self.dispatching = false;
        self.events = events;
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
        self.poller.name()
    }

    fn counters(&self) -> EventCounters {
        self.counters
    }
}

impl<P: Poller> Drop for ReadinessBackend<P> {
    fn drop(&mut self) {
        self.release_all();
    }
}
