//! Completion-notification primitives.
//!
//! A [`CompletionPort`] accepts posted operations and later reports each of
//! them exactly once as a [`Completion`]. Operations are zero-byte: a read
//! completes when the socket has data (or end of stream), a write when it can
//! take more output, an accept when a connection is pending. The handler
//! performs the actual transfer itself, so no byte buffer is ever lent to the
//! kernel and a late completion can never touch freed memory.
//!
//! The only platform port shipped is [`UringPort`] (Linux `io_uring`). Other
//! ports can be plugged into
//! [`CompletionBackend::with_port`](crate::CompletionBackend::with_port).

use crate::poller::RawSocket;

use std::io;
use std::time::Duration;

#[cfg(target_os = "linux")]
mod uring;

#[cfg(target_os = "linux")]
pub use uring::UringPort;

/// Kind of a posted operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpKind {
    /// Completes when the socket is readable.
    Read,
    /// Completes when the socket is writable.
    Write,
    /// Completes when a listener has a pending connection.
    Accept,
}

/// How a posted operation finished.
#[derive(Debug)]
pub enum Outcome {
    /// The awaited condition holds.
    Ready,

    /// The OS flagged an error condition on the socket; the reason is read
    /// from the socket itself.
    SocketError,

    /// The operation itself failed.
    Failed(io::Error),

    /// The operation was cancelled before it completed.
    Cancelled,
}

/// One finished operation.
#[derive(Debug)]
pub struct Completion {
    /// Value the operation was posted with.
    pub user_data: u64,

    /// Result of the operation.
    pub outcome: Outcome,
}

/// An OS completion primitive.
pub trait CompletionPort {
    /// Name of the underlying primitive.
    fn name(&self) -> &'static str;

    /// Posts one operation. It completes exactly once, carrying `user_data`.
    fn post(&mut self, user_data: u64, socket: RawSocket, kind: OpKind) -> io::Result<()>;

    /// Requests early completion of a posted operation.
    ///
    /// Best effort: the operation still completes exactly once, either with
    /// [`Outcome::Cancelled`] or with whatever result it reached first.
    fn cancel(&mut self, user_data: u64) -> io::Result<()>;

    /// Waits for completions.
    ///
    /// Blocks until at least one operation completes or `timeout` elapses
    /// (`None` blocks indefinitely). Finished operations are appended to
    /// `completions`. An interrupted wait returns `Ok` with nothing appended.
    fn wait(&mut self, completions: &mut Vec<Completion>, timeout: Option<Duration>)
    -> io::Result<()>;
}
