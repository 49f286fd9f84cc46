//! Line echo daemon driven by a single socket engine.
//!
//! # Usage
//!
//! ```bash
//! # Readiness backend on the default port
//! cargo run --example line_server
//!
//! # io_uring backend with a small table and verbose engine logs
//! RUST_LOG=sockengine=trace cargo run --example line_server -- \
//!     --backend completion --capacity 16
//! ```
//!
//! Every line a client sends comes back prefixed with `> `. Output that the
//! socket cannot take immediately is buffered and flushed on the next write
//! notification.

use clap::Parser;
use sockengine::{
    BackendKind, EngineBuilder, EngineError, EventHandler, HandlerRef, RawSocket, SocketEngine,
    Token,
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::rc::Rc;
use std::time::Duration;

/// Line echo server
#[derive(Parser, Debug)]
#[command(name = "line_server")]
#[command(about = "Echoes newline-terminated lines back to every client")]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = "127.0.0.1:6667")]
    bind: SocketAddr,

    /// Descriptor table capacity
    #[arg(short, long, default_value = "1024")]
    capacity: usize,

    /// Notification model (readiness, completion)
    #[arg(long, default_value = "readiness")]
    backend: BackendKind,

    /// Dispatch timeout in milliseconds
    #[arg(long, default_value = "1000")]
    tick_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[cfg(unix)]
fn raw_socket<T: std::os::fd::AsRawFd>(socket: &T) -> RawSocket {
    socket.as_raw_fd()
}

#[cfg(windows)]
fn raw_socket<T: std::os::windows::io::AsRawSocket>(socket: &T) -> RawSocket {
    socket.as_raw_socket()
}

type Clients = Rc<RefCell<Vec<Rc<RefCell<Client>>>>>;

struct Listener {
    listener: TcpListener,
    clients: Clients,
}

impl Listener {
    fn admit(&self, engine: &mut dyn SocketEngine, stream: TcpStream, peer: SocketAddr) {
        if engine.remaining_fds() == 0 {
            tracing::warn!(%peer, "table full, refusing connection");
            return;
        }

        if let Err(e) = stream.set_nonblocking(true) {
            tracing::warn!(%peer, error = %e, "cannot make socket non-blocking");
            return;
        }

        let client = Rc::new(RefCell::new(Client {
            stream,
            peer,
            token: None,
            input: Vec::new(),
            output: Vec::new(),
            closed: false,
        }));

        let handler: HandlerRef = client.clone();
        match engine.add_fd(handler) {
            Ok(token) => {
                client.borrow_mut().token = Some(token);
                self.clients.borrow_mut().push(client);
                tracing::info!(%peer, %token, "client connected");
            }
            Err(e) => tracing::warn!(%peer, error = %e, "cannot register client"),
        }
    }
}

impl EventHandler for Listener {
    fn socket(&self) -> RawSocket {
        raw_socket(&self.listener)
    }

    fn is_listener(&self) -> bool {
        true
    }

    fn on_read_ready(&mut self, _: &mut dyn SocketEngine) {}

    fn on_write_ready(&mut self, _: &mut dyn SocketEngine) {}

    fn on_accept_ready(&mut self, engine: &mut dyn SocketEngine) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.admit(engine, stream, peer),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn on_error(&mut self, _: &mut dyn SocketEngine, reason: io::Error) {
        tracing::error!(error = %reason, "listener failed");
    }
}

struct Client {
    stream: TcpStream,
    peer: SocketAddr,
    token: Option<Token>,
    input: Vec<u8>,
    output: Vec<u8>,
    closed: bool,
}

impl Client {
    /// Writes as much buffered output as the socket takes and asks for a
    /// write notification if some remains.
    fn flush(&mut self, engine: &mut dyn SocketEngine) {
        while !self.output.is_empty() {
            match self.stream.write(&self.output) {
                Ok(0) => return self.close(engine),
                Ok(n) => {
                    self.output.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::debug!(peer = %self.peer, error = %e, "write failed");
                    return self.close(engine);
                }
            }
        }

        if !self.output.is_empty() {
            if let Some(token) = self.token {
                if let Err(e) = engine.want_write(token) {
                    tracing::warn!(peer = %self.peer, error = %e, "cannot arm write");
                }
            }
        }
    }

    fn close(&mut self, engine: &mut dyn SocketEngine) {
        if self.closed {
            return;
        }
        self.closed = true;

        let Some(token) = self.token.take() else {
            return;
        };

        let removed = match engine.del_fd(token, false) {
            Err(EngineError::OperationInFlight { .. }) => engine.del_fd(token, true),
            other => other,
        };

        if let Err(e) = removed {
            tracing::warn!(peer = %self.peer, error = %e, "cannot unregister client");
        }

        tracing::info!(peer = %self.peer, %token, "client disconnected");
    }
}

impl EventHandler for Client {
    fn socket(&self) -> RawSocket {
        raw_socket(&self.stream)
    }

    fn on_read_ready(&mut self, engine: &mut dyn SocketEngine) {
        let mut buf = [0u8; 4096];

        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return self.close(engine),
                Ok(n) => self.input.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::debug!(peer = %self.peer, error = %e, "read failed");
                    return self.close(engine);
                }
            }
        }

        while let Some(end) = self.input.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.input.drain(..=end).collect();
            self.output.extend_from_slice(b"> ");
            self.output.extend_from_slice(&line);
        }

        self.flush(engine);
    }

    fn on_write_ready(&mut self, engine: &mut dyn SocketEngine) {
        self.flush(engine);
    }

    fn on_error(&mut self, engine: &mut dyn SocketEngine, reason: io::Error) {
        tracing::debug!(peer = %self.peer, error = %reason, "connection error");
        self.close(engine);
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let mut engine = EngineBuilder::new()
        .capacity(args.capacity)
        .backend(args.backend)
        .build()?;

    let listener = TcpListener::bind(args.bind)?;
    listener.set_nonblocking(true)?;

    tracing::info!(
        addr = %listener.local_addr()?,
        engine = engine.name(),
        capacity = engine.max_fds(),
        "line server listening"
    );

    let clients: Clients = Rc::default();
    let acceptor: HandlerRef = Rc::new(RefCell::new(Listener {
        listener,
        clients: clients.clone(),
    }));
    engine.add_fd(acceptor.clone())?;

    let tick = Some(Duration::from_millis(args.tick_ms));

    loop {
        if let Err(e) = engine.dispatch_events(tick) {
            if e.is_fatal() {
                tracing::error!(error = %e, "engine failed, shutting down");
                return Err(e.into());
            }
            tracing::warn!(error = %e, "dispatch failed");
        }

        clients.borrow_mut().retain(|c| !c.borrow().closed);
    }
}
