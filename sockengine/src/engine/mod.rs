//! The abstract multiplexer and its two backends.
//!
//! [`SocketEngine`] is the only contract the rest of the daemon depends on.
//! Two interchangeable implementations translate it onto the OS:
//!
//! - [`ReadinessBackend`] polls a readiness primitive and keeps an interest
//!   mask per socket; write interest is disarmed after it fires.
//! - [`CompletionBackend`] posts one-shot operations; read/accept operations
//!   are re-posted after every completion so they behave as standing
//!   interest, write operations are posted only on request.
//!
//! Both deliver "read/accept interest stands until removed, write interest is
//! one-shot and explicitly re-armed", at most one callback per handler per
//! dispatch, and validate every event against the slot generation it was
//! captured with.

mod builder;
mod completion;
mod readiness;

pub use builder::{BackendKind, EngineBuilder};
pub use completion::CompletionBackend;
pub use readiness::ReadinessBackend;

use crate::error::EngineError;
use crate::handler::{HandlerRef, HandlerState};
use crate::poller::{Interest, RawSocket};
use crate::table::{FdTable, Token};

use std::io;
use std::rc::Rc;
use std::time::Duration;

use tracing::{trace, warn};

/// Socket event multiplexer.
///
/// The engine is single-threaded: every method, and every callback it
/// fires, runs on the thread that owns it. Handler references are `Rc`, so
/// neither the engine nor its handlers can cross threads.
pub trait SocketEngine {
    /// Registers a handler and arms its default interest (read, plus accept
    /// for listeners, plus one write notification for connecting sockets).
    ///
    /// Fails with `NoCapacity` when the table is full and `AlreadyBound` when
    /// the handler or its socket is already registered; a failed call leaves
    /// nothing registered.
    fn add_fd(&mut self, handler: HandlerRef) -> Result<Token, EngineError>;

    /// Unregisters a handler and frees its slot.
    ///
    /// Without `force`, fails with `OperationInFlight` while a requested
    /// write operation is still pending, and the handler stays registered.
    /// With `force` the slot is retired immediately; late events for it are
    /// discarded.
    fn del_fd(&mut self, token: Token, force: bool) -> Result<(), EngineError>;

    /// Requests one write notification. Idempotent until it fires.
    fn want_write(&mut self, token: Token) -> Result<(), EngineError>;

    /// Waits up to `timeout` (`None`: indefinitely) for events and delivers
    /// them. Returns the number of handlers that received a callback.
    ///
    /// With nothing registered and no timeout, returns `Ok(0)` immediately.
    /// Called from inside a callback, fails with `NestedDispatch` without
    /// waiting or consuming any event.
    fn dispatch_events(&mut self, timeout: Option<Duration>) -> Result<usize, EngineError>;

    /// Handler bound to `slot`, if any.
    fn get_ref(&self, slot: usize) -> Option<HandlerRef>;

    /// Returns true if `slot` is occupied.
    fn has_fd(&self, slot: usize) -> bool;

    /// Current interest mask of a registration.
    fn interest(&self, token: Token) -> Option<Interest>;

    /// Fixed capacity of the descriptor table.
    fn max_fds(&self) -> usize;

    /// Number of free slots.
    fn remaining_fds(&self) -> usize;

    /// Name of the OS primitive behind this engine.
    fn name(&self) -> &'static str;

    /// Cumulative event counters.
    fn counters(&self) -> EventCounters;
}

/// Cumulative number of callbacks delivered per kind, plus events discarded
/// because their slot had been vacated or reused.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EventCounters {
    /// All delivered callbacks.
    pub total: u64,
    /// `on_read_ready` callbacks.
    pub read: u64,
    /// `on_write_ready` callbacks.
    pub write: u64,
    /// `on_accept_ready` callbacks.
    pub accept: u64,
    /// `on_error` callbacks.
    pub error: u64,
    /// Events dropped for a stale (slot, generation).
    pub stale: u64,
}

impl EventCounters {
    fn record(&mut self, kind: EventKind) {
        self.total += 1;
        match kind {
            EventKind::Read => self.read += 1,
            EventKind::Write => self.write += 1,
            EventKind::Accept => self.accept += 1,
            EventKind::Error => self.error += 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EventKind {
    Read,
    Write,
    Accept,
    Error,
}

/// One callback about to be delivered.
enum Event {
    Read,
    Write,
    Accept,
    Error(io::Error),
}

impl Event {
    fn kind(&self) -> EventKind {
        match self {
            Event::Read => EventKind::Read,
            Event::Write => EventKind::Write,
            Event::Accept => EventKind::Accept,
            Event::Error(_) => EventKind::Error,
        }
    }
}

/// Returns true if `handler` cannot be lent to a callback right now.
///
/// Backends check this before committing any state for an event, so an
/// event for a busy handler is postponed rather than consumed.
fn is_busy(handler: &HandlerRef) -> bool {
    handler.try_borrow_mut().is_err()
}

/// Invokes exactly one callback on `handler`.
///
/// Returns false if the handler is already borrowed, in which case nothing
/// is invoked.
fn deliver(
    engine: &mut dyn SocketEngine,
    handler: &HandlerRef,
    token: Token,
    event: Event,
) -> bool {
    let Ok(mut h) = handler.try_borrow_mut() else {
        warn!(%token, "handler busy, event skipped");
        return false;
    };

    trace!(%token, kind = ?event.kind(), "delivering");

    match event {
        Event::Read => h.on_read_ready(engine),
        Event::Write => h.on_write_ready(engine),
        Event::Accept => h.on_accept_ready(engine),
        Event::Error(reason) => h.on_error(engine, reason),
    }

    true
}

/// Attributes of a handler read at registration.
struct Registration {
    socket: RawSocket,
    listener: bool,
    state: HandlerState,
}

/// Reads the registration attributes and refuses handlers the table already
/// holds, without modifying anything.
fn inspect(table: &FdTable, handler: &HandlerRef) -> Result<Registration, EngineError> {
    let weak = Rc::downgrade(handler);
    if let Some(slot) = table.slot_of(&weak) {
        return Err(EngineError::AlreadyBound { slot });
    }

    let h = handler.try_borrow().map_err(|_| EngineError::HandlerBusy)?;

    let registration = Registration {
        socket: h.socket(),
        listener: h.is_listener(),
        state: h.state(),
    };

    table.check_insert(registration.socket)?;

    Ok(registration)
}

fn not_found(token: Token) -> EngineError {
    EngineError::NotFound {
        slot: token.slot(),
        generation: token.generation(),
    }
}
