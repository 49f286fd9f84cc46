//! # sockengine
//!
//! **sockengine** is the socket event multiplexer of a single-threaded IRC
//! daemon. One thread owns every connection; the engine waits on the OS for
//! socket events and calls back into the handler that owns each socket.
//!
//! The daemon only ever sees the [`SocketEngine`] contract. Two backends
//! implement it on top of very different OS models:
//!
//! - [`ReadinessBackend`]: the OS reports that a socket *can* be read or
//!   written (`epoll` on Linux, `kqueue` on macOS/FreeBSD, `WSAPoll` on
//!   Windows);
//! - [`CompletionBackend`]: the engine posts operations and the OS reports
//!   when they *have* finished (`io_uring` on Linux).
//!
//! Both give the same guarantees: read and accept interest stand until the
//! handler is removed, write interest is one-shot, a handler receives at most
//! one callback per dispatch, and an event for a slot that was vacated or
//! reused is never delivered to the new occupant.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use sockengine::{EngineBuilder, BackendKind};
//! use std::time::Duration;
//!
//! let mut engine = EngineBuilder::new()
//!     .capacity(1024)
//!     .backend(BackendKind::Readiness)
//!     .build()?;
//!
//! let token = engine.add_fd(listener.clone())?;
//!
//! loop {
//!     engine.dispatch_events(Some(Duration::from_secs(1)))?;
//! }
//! ```
//!
//! ## Modules
//!
//! - [`poller`]: readiness primitives and the [`Poller`](poller::Poller) seam
//! - [`completion`]: completion primitives and the
//!   [`CompletionPort`](completion::CompletionPort) seam

mod engine;
mod error;
mod handler;
mod table;
mod utils;

pub mod completion;
pub mod poller;

pub use engine::{
    BackendKind, CompletionBackend, EngineBuilder, EventCounters, ReadinessBackend, SocketEngine,
};
pub use error::EngineError;
pub use handler::{EventHandler, HandlerRef, HandlerState};
pub use poller::{Interest, RawSocket};
pub use table::Token;
