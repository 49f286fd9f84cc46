//! Error types for the socket engine.
//!
//! Registration errors (`NoCapacity`, `AlreadyBound`, `NotFound`,
//! `OperationInFlight`) and `NestedDispatch` are recoverable and leave the
//! engine untouched.
//! `BackendFailure` means the OS notification primitive itself failed; the
//! caller's main loop should treat it as fatal and restart or terminate.
//!
//! Per-connection failures are never reported through this type. They reach
//! the owning handler exactly once via
//! [`EventHandler::on_error`](crate::EventHandler::on_error).

use std::io;

use thiserror::Error;

/// Errors returned by [`SocketEngine`](crate::SocketEngine) operations.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Every slot of the descriptor table is occupied.
    #[error("descriptor table is full ({capacity} slots)")]
    NoCapacity {
        /// Fixed capacity of the table
        capacity: usize,
    },

    /// The handler's socket is already registered with this engine.
    #[error("socket is already bound to slot {slot}")]
    AlreadyBound {
        /// Slot currently holding the socket
        slot: usize,
    },

    /// The handler is mutably borrowed, typically because it is registering
    /// itself from inside one of its own callbacks.
    #[error("handler is borrowed and cannot be inspected")]
    HandlerBusy,

    /// The token does not name a live registration.
    #[error("no handler registered for slot {slot} (generation {generation})")]
    NotFound {
        /// Slot named by the token
        slot: usize,
        /// Generation named by the token
        generation: u32,
    },

    /// A caller-requested operation is still pending on the slot.
    #[error("slot {slot} still has an operation in flight")]
    OperationInFlight {
        /// Slot that refused removal
        slot: usize,
    },

    /// `dispatch_events` was called from inside a callback of a dispatch
    /// that is still running.
    #[error("dispatch_events called while a dispatch is in progress")]
    NestedDispatch,

    /// The OS notification primitive failed.
    #[error("notification backend failed: {0}")]
    BackendFailure(#[from] io::Error),
}

impl EngineError {
    /// Returns true if this error means the engine itself is unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::BackendFailure(_))
    }
}
