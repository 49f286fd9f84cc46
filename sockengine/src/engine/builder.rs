use super::SocketEngine;
use crate::error::EngineError;

use std::fmt;
use std::str::FromStr;

/// Notification model the engine is built on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BackendKind {
    /// Readiness polling (`epoll`, `kqueue`, `WSAPoll`).
    #[default]
    Readiness,

    /// Posted operations completed by the OS (`io_uring`).
    Completion,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "readiness" => Ok(Self::Readiness),
            "completion" => Ok(Self::Completion),
            other => Err(format!(
                "unknown backend `{other}` (expected `readiness` or `completion`)"
            )),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Readiness => f.write_str("readiness"),
            Self::Completion => f.write_str("completion"),
        }
    }
}

/// Builder for configuring and creating a socket engine.
///
/// # Examples
///
/// ```rust,ignore
/// let mut engine = EngineBuilder::new()
///     .capacity(4096)
///     .backend(BackendKind::Readiness)
///     .build()?;
/// ```
pub struct EngineBuilder {
    /// Number of slots in the descriptor table.
    capacity: usize,

    backend: BackendKind,

    /// Maximum number of OS events reaped per dispatch. Events beyond it
    /// stay queued in the OS for the next dispatch (`WSAPoll` has no such
    /// limit and reports every ready socket).
    events_per_poll: usize,
}

impl EngineBuilder {
    /// Creates a new `EngineBuilder` with default configuration.
    ///
    /// By default the table holds 1024 handlers, the readiness backend is
    /// selected and up to 64 events are reaped per dispatch.
    pub fn new() -> Self {
        Self {
            capacity: 1024,
            backend: BackendKind::Readiness,
            events_per_poll: 64,
        }
    }

    /// Sets the fixed capacity of the descriptor table.
    ///
    /// # Panics
    ///
    /// Panics if `n == 0` or `n` does not fit in a `u32`.
    pub fn capacity(mut self, n: usize) -> Self {
        assert!(n > 0, "capacity must be > 0");
        assert!(n <= u32::MAX as usize, "capacity must fit in a u32");

        self.capacity = n;
        self
    }

    /// Selects the notification model.
    pub fn backend(mut self, kind: BackendKind) -> Self {
        self.backend = kind;
        self
    }

    /// Sets how many OS events one dispatch may reap.
    ///
    /// # Panics
    ///
    /// Panics if `n == 0`.
    pub fn events_per_poll(mut self, n: usize) -> Self {
        assert!(n > 0, "events_per_poll must be > 0");

        self.events_per_poll = n;
        self
    }

    /// Builds the engine with the configured options.
    ///
    /// Fails with `BackendFailure` if the OS primitive cannot be created or
    /// the selected model is not available on this platform.
    pub fn build(self) -> Result<Box<dyn SocketEngine>, EngineError> {
        match self.backend {
            BackendKind::Readiness => self.build_readiness(),
            BackendKind::Completion => self.build_completion(),
        }
    }

    #[cfg(any(
        target_os = "linux",
        target_os = "macos",
        target_os = "freebsd",
        windows
    ))]
    fn build_readiness(self) -> Result<Box<dyn SocketEngine>, EngineError> {
        let engine = super::ReadinessBackend::new(self.capacity, self.events_per_poll)?;
        Ok(Box::new(engine))
    }

    #[cfg(not(any(
        target_os = "linux",
        target_os = "macos",
        target_os = "freebsd",
        windows
    )))]
    fn build_readiness(self) -> Result<Box<dyn SocketEngine>, EngineError> {
        Err(unsupported(BackendKind::Readiness))
    }

    #[cfg(target_os = "linux")]
    fn build_completion(self) -> Result<Box<dyn SocketEngine>, EngineError> {
        let engine = super::CompletionBackend::new(self.capacity, self.events_per_poll)?;
        Ok(Box::new(engine))
    }

    #[cfg(not(target_os = "linux"))]
    fn build_completion(self) -> Result<Box<dyn SocketEngine>, EngineError> {
        Err(unsupported(BackendKind::Completion))
    }
}

impl Default for EngineBuilder {
    /// Creates a default `EngineBuilder`.
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(not(target_os = "linux"))]
fn unsupported(kind: BackendKind) -> EngineError {
    use std::io;

    EngineError::BackendFailure(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("{kind} backend is not available on this platform"),
    ))
}
