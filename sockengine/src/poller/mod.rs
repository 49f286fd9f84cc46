//! Platform-specific readiness poller abstraction.
//!
//! This module provides a unified interface over platform-specific
//! readiness mechanisms (epoll on Linux, kqueue on macOS/FreeBSD, WSAPoll
//! on Windows).
//!
//! The poller is used by the [`ReadinessBackend`](crate::ReadinessBackend)
//! to:
//! - register sockets with an interest mask,
//! - update that mask when write interest is armed or disarmed,
//! - wait for readiness and report it per registration token.
//!
//! The concrete implementation is selected at compile time depending on the
//! target operating system and exposed as [`DefaultPoller`]. Any other
//! [`Poller`] can be plugged into the backend, which is how tests inject
//! simulated readiness.

use std::io;
use std::time::Duration;

#[cfg(target_os = "linux")]
mod epoll;

#[cfg(any(target_os = "macos", target_os = "freebsd"))]
mod kqueue;

#[cfg(windows)]
mod wsapoll;

#[cfg(unix)]
pub(crate) mod unix;

#[cfg(windows)]
pub(crate) mod windows;

#[cfg(unix)]
pub(crate) use unix as platform;

#[cfg(windows)]
pub(crate) use windows as platform;

pub use platform::RawSocket;

#[cfg(target_os = "linux")]
pub use epoll::EpollPoller;

#[cfg(any(target_os = "macos", target_os = "freebsd"))]
pub use kqueue::KqueuePoller;

#[cfg(windows)]
pub use wsapoll::WsaPoller;

/// The readiness poller native to the build target.
#[cfg(target_os = "linux")]
pub type DefaultPoller = EpollPoller;

/// The readiness poller native to the build target.
#[cfg(any(target_os = "macos", target_os = "freebsd"))]
pub type DefaultPoller = KqueuePoller;

/// The readiness poller native to the build target.
#[cfg(windows)]
pub type DefaultPoller = WsaPoller;

/// Set of event kinds a registration currently wants.
///
/// `accept` is meaningful for listening sockets only; at the OS level it is
/// the same condition as `read`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Interest {
    /// Wants to know when data can be read.
    pub read: bool,

    /// Wants one notification when data can be written.
    pub write: bool,

    /// Wants to know when a connection can be accepted.
    pub accept: bool,
}

impl Interest {
    /// Default interest armed by registration.
    pub(crate) fn standing(listener: bool) -> Self {
        Self {
            read: true,
            write: false,
            accept: listener,
        }
    }

    /// Returns true if the OS should report readability.
    pub(crate) fn wants_readable(&self) -> bool {
        self.read || self.accept
    }
}

/// Readiness reported by a poller for one registration.
///
/// Pollers merge multiple OS records for the same token into one
/// `Readiness`, so a token appears at most once per poll.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Readiness {
    /// Token the socket was registered with.
    pub token: u64,

    /// The socket is readable, at end of stream, or has a pending connection.
    pub readable: bool,

    /// The socket is writable.
    pub writable: bool,

    /// The OS flagged an error condition on the socket.
    pub error: bool,
}

/// An OS readiness primitive.
///
/// Registrations are keyed by socket and carry an opaque `u64` token which
/// is reported back verbatim in [`Readiness::token`].
pub trait Poller {
    /// Name of the underlying primitive.
    fn name(&self) -> &'static str;

    /// Adds a socket with the given interest.
    fn register(&mut self, socket: RawSocket, token: u64, interest: Interest) -> io::Result<()>;

    /// Replaces the interest (and token) of a registered socket.
    fn reregister(&mut self, socket: RawSocket, token: u64, interest: Interest) -> io::Result<()>;

    /// Removes a socket.
    fn deregister(&mut self, socket: RawSocket) -> io::Result<()>;

    /// Waits for readiness.
    ///
    /// Blocks until at least one registration is ready or `timeout` elapses
    /// (`None` blocks indefinitely). `events` is cleared first. An
    /// interrupted wait returns `Ok` with no events.
    fn poll(&mut self, events: &mut Vec<Readiness>, timeout: Option<Duration>) -> io::Result<()>;
}

/// Converts a timeout into whole milliseconds, rounding up so a short
/// non-zero timeout never degrades into a busy poll.
pub(crate) fn timeout_millis(timeout: Option<Duration>) -> i32 {
    match timeout {
        Some(t) => t.as_nanos().div_ceil(1_000_000).min(i32::MAX as u128) as i32,
        None => -1,
    }
}
