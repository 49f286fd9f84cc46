//! Handler capability contract.
//!
//! Every pollable endpoint (listener, client link, peer-server link)
//! implements [`EventHandler`]. The caller owns handlers through
//! [`HandlerRef`]; the engine only keeps a weak reference, so dropping the
//! last strong reference while still registered makes the slot dead until
//! [`SocketEngine::del_fd`](crate::SocketEngine::del_fd) retires it.
//!
//! Callbacks run synchronously on the dispatching thread and receive the
//! engine itself, so a handler may register new handlers (typically from
//! `on_accept_ready`), re-arm write interest, or remove itself. While a
//! callback runs, the handler is mutably borrowed: it must not look itself
//! up through [`SocketEngine::get_ref`](crate::SocketEngine::get_ref) and
//! borrow the result.
//!
//! Callbacks must never block; they share the engine's only thread with every
//! other connection.

use crate::SocketEngine;
use crate::poller::RawSocket;

use std::cell::RefCell;
use std::io;
use std::rc::Rc;

/// Shared, caller-owned handle to a handler.
pub type HandlerRef = Rc<RefCell<dyn EventHandler>>;

/// Lifecycle state of a handler's connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HandlerState {
    /// Outbound connect in progress; registration arms one write
    /// notification, which fires when the connect completes.
    Connecting,

    /// Established link or listening socket.
    #[default]
    Connected,

    /// The caller is tearing the link down (flushing a final message).
    ///
    /// Only the caller acts on this state. The engine registers a closing
    /// handler exactly like a connected one, and the caller arms writes for
    /// the final flush with `want_write`.
    Closing,
}

/// Capability implemented by every endpoint registered with an engine.
pub trait EventHandler {
    /// The OS socket this handler wraps.
    ///
    /// Must stay the same for as long as the handler is registered.
    fn socket(&self) -> RawSocket;

    /// Returns true for listening sockets, which receive
    /// [`on_accept_ready`](Self::on_accept_ready) instead of
    /// [`on_read_ready`](Self::on_read_ready).
    fn is_listener(&self) -> bool {
        false
    }

    /// Current lifecycle state, read once at registration.
    fn state(&self) -> HandlerState {
        HandlerState::Connected
    }

    /// Data (or end of stream) can be read without blocking.
    fn on_read_ready(&mut self, engine: &mut dyn SocketEngine);

    /// One write notification requested through
    /// [`SocketEngine::want_write`](crate::SocketEngine::want_write).
    ///
    /// Write interest is already disarmed when this runs; call `want_write`
    /// again if output remains.
    fn on_write_ready(&mut self, engine: &mut dyn SocketEngine);

    /// At least one connection is pending on a listener.
    ///
    /// Only one notification is delivered per dispatch; accept in a loop
    /// until the socket would block.
    fn on_accept_ready(&mut self, engine: &mut dyn SocketEngine) {
        let _ = engine;
    }

    /// The connection failed. Delivered at most once per registration.
    ///
    /// The engine stops delivering events to this handler but does not
    /// remove it; call [`SocketEngine::del_fd`](crate::SocketEngine::del_fd)
    /// once teardown is complete.
    fn on_error(&mut self, engine: &mut dyn SocketEngine, reason: io::Error);
}
