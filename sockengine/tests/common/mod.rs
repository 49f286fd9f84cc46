//! Shared fixtures for engine tests.
//!
//! [`ScriptedPoller`] and [`ScriptedPort`] stand in for the OS: the test
//! decides exactly which events the next dispatch sees. [`Recorder`] logs
//! every callback it receives and can run a hook from inside the callback.

#![allow(dead_code)]

use sockengine::completion::{Completion, CompletionPort, OpKind, Outcome};
use sockengine::poller::{Poller, Readiness};
use sockengine::{EventHandler, HandlerRef, HandlerState, Interest, RawSocket, SocketEngine};

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::rc::Rc;
use std::time::Duration;

/// Callback observed by a [`Recorder`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Read,
    Write,
    Accept,
    Error(io::ErrorKind),
}

pub type Log = Rc<RefCell<Vec<(RawSocket, Call)>>>;

pub type Hook = Box<dyn FnMut(&mut dyn SocketEngine, &Call)>;

pub fn log() -> Log {
    Rc::new(RefCell::new(Vec::new()))
}

/// Calls recorded for one socket, in delivery order.
pub fn calls_for(log: &Log, socket: RawSocket) -> Vec<Call> {
    log.borrow()
        .iter()
        .filter(|(s, _)| *s == socket)
        .map(|(_, c)| c.clone())
        .collect()
}

/// Handler that records every callback into a shared log.
pub struct Recorder {
    socket: RawSocket,
    listener: bool,
    state: HandlerState,
    log: Log,
    hook: Option<Hook>,
}

impl Recorder {
    pub fn new(socket: RawSocket, log: &Log) -> Self {
        Self {
            socket,
            listener: false,
            state: HandlerState::Connected,
            log: log.clone(),
            hook: None,
        }
    }

    pub fn listener(mut self) -> Self {
        self.listener = true;
        self
    }

    pub fn connecting(mut self) -> Self {
        self.state = HandlerState::Connecting;
        self
    }

    pub fn closing(mut self) -> Self {
        self.state = HandlerState::Closing;
        self
    }

    pub fn hook(mut self, hook: impl FnMut(&mut dyn SocketEngine, &Call) + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    pub fn build(self) -> HandlerRef {
        Rc::new(RefCell::new(self))
    }

    fn record(&mut self, engine: &mut dyn SocketEngine, call: Call) {
        self.log.borrow_mut().push((self.socket, call.clone()));
        if let Some(hook) = self.hook.as_mut() {
            hook(engine, &call);
        }
    }
}

impl EventHandler for Recorder {
    fn socket(&self) -> RawSocket {
        self.socket
    }

    fn is_listener(&self) -> bool {
        self.listener
    }

    fn state(&self) -> HandlerState {
        self.state
    }

    fn on_read_ready(&mut self, engine: &mut dyn SocketEngine) {
        self.record(engine, Call::Read);
    }

    fn on_write_ready(&mut self, engine: &mut dyn SocketEngine) {
        self.record(engine, Call::Write);
    }

    fn on_accept_ready(&mut self, engine: &mut dyn SocketEngine) {
        self.record(engine, Call::Accept);
    }

    fn on_error(&mut self, engine: &mut dyn SocketEngine, reason: io::Error) {
        self.record(engine, Call::Error(reason.kind()));
    }
}

/// State behind a [`ScriptedPoller`], shared with the test.
#[derive(Default)]
pub struct PollerState {
    pub registered: HashMap<RawSocket, (u64, Interest)>,
    pub queued: Vec<Readiness>,
    pub fail_register: bool,
    pub fail_poll: bool,
    pub polls: usize,
}

impl PollerState {
    /// Token the socket is currently registered under.
    pub fn token_of(&self, socket: RawSocket) -> u64 {
        self.registered
            .get(&socket)
            .map(|(token, _)| *token)
            .expect("Socket is not registered")
    }

    pub fn interest_of(&self, socket: RawSocket) -> Option<Interest> {
        self.registered.get(&socket).map(|(_, interest)| *interest)
    }

    /// Queues a report for a registered socket.
    pub fn fire(&mut self, socket: RawSocket, readable: bool, writable: bool, error: bool) {
        let token = self.token_of(socket);
        self.fire_token(token, readable, writable, error);
    }

    /// Queues a report under an explicit token.
    pub fn fire_token(&mut self, token: u64, readable: bool, writable: bool, error: bool) {
        self.queued.push(Readiness {
            token,
            readable,
            writable,
            error,
        });
    }
}

/// [`Poller`] whose readiness is scripted by the test.
pub struct ScriptedPoller(Rc<RefCell<PollerState>>);

impl ScriptedPoller {
    pub fn new() -> (Self, Rc<RefCell<PollerState>>) {
        let state = Rc::new(RefCell::new(PollerState::default()));
        (Self(state.clone()), state)
    }
}

impl Poller for ScriptedPoller {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn register(&mut self, socket: RawSocket, token: u64, interest: Interest) -> io::Result<()> {
        let mut state = self.0.borrow_mut();
        if state.fail_register {
            return Err(io::Error::other("register refused"));
        }
        if state.registered.contains_key(&socket) {
            return Err(io::Error::from(io::ErrorKind::AlreadyExists));
        }
        state.registered.insert(socket, (token, interest));
        Ok(())
    }

    fn reregister(&mut self, socket: RawSocket, token: u64, interest: Interest) -> io::Result<()> {
        let mut state = self.0.borrow_mut();
        match state.registered.get_mut(&socket) {
            Some(entry) => {
                *entry = (token, interest);
                Ok(())
            }
            None => Err(io::Error::from(io::ErrorKind::NotFound)),
        }
    }

    fn deregister(&mut self, socket: RawSocket) -> io::Result<()> {
        let mut state = self.0.borrow_mut();
        match state.registered.remove(&socket) {
            Some(_) => Ok(()),
            None => Err(io::Error::from(io::ErrorKind::NotFound)),
        }
    }

    fn poll(&mut self, events: &mut Vec<Readiness>, _timeout: Option<Duration>) -> io::Result<()> {
        let mut state = self.0.borrow_mut();
        state.polls += 1;
        events.clear();

        if state.fail_poll {
            return Err(io::Error::other("poll failed"));
        }

        events.append(&mut state.queued);
        Ok(())
    }
}

/// State behind a [`ScriptedPort`], shared with the test.
#[derive(Default)]
pub struct PortState {
    /// Operations posted and not yet completed: (user_data, socket, kind).
    pub outstanding: Vec<(u64, RawSocket, OpKind)>,
    pub cancelled: Vec<u64>,
    pub finished: Vec<Completion>,
    pub fail_post: bool,
    pub fail_wait: bool,
    pub waits: usize,
}

impl PortState {
    /// Number of outstanding operations of `kind` on `socket`.
    pub fn pending(&self, socket: RawSocket, kind: OpKind) -> usize {
        self.outstanding
            .iter()
            .filter(|(_, s, k)| *s == socket && *k == kind)
            .count()
    }

    /// Completes the oldest outstanding operation of `kind` on `socket` and
    /// returns its `user_data`.
    pub fn complete(&mut self, socket: RawSocket, kind: OpKind, outcome: Outcome) -> u64 {
        let pos = self
            .outstanding
            .iter()
            .position(|(_, s, k)| *s == socket && *k == kind)
            .expect("No such operation outstanding");

        let (user_data, _, _) = self.outstanding.remove(pos);
        self.finished.push(Completion { user_data, outcome });
        user_data
    }
}

/// [`CompletionPort`] whose completions are scripted by the test.
///
/// Cancelling an outstanding operation completes it with
/// [`Outcome::Cancelled`], as a kernel port would.
pub struct ScriptedPort(Rc<RefCell<PortState>>);

impl ScriptedPort {
    pub fn new() -> (Self, Rc<RefCell<PortState>>) {
        let state = Rc::new(RefCell::new(PortState::default()));
        (Self(state.clone()), state)
    }
}

impl CompletionPort for ScriptedPort {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn post(&mut self, user_data: u64, socket: RawSocket, kind: OpKind) -> io::Result<()> {
        let mut state = self.0.borrow_mut();
        if state.fail_post {
            return Err(io::Error::other("post refused"));
        }
        state.outstanding.push((user_data, socket, kind));
        Ok(())
    }

    fn cancel(&mut self, user_data: u64) -> io::Result<()> {
        let mut state = self.0.borrow_mut();
        state.cancelled.push(user_data);

        if let Some(pos) = state.outstanding.iter().position(|(u, _, _)| *u == user_data) {
            state.outstanding.remove(pos);
            state.finished.push(Completion {
                user_data,
                outcome: Outcome::Cancelled,
            });
        }
        Ok(())
    }

    fn wait(
        &mut self,
        completions: &mut Vec<Completion>,
        _timeout: Option<Duration>,
    ) -> io::Result<()> {
        let mut state = self.0.borrow_mut();
        state.waits += 1;

        if state.fail_wait {
            return Err(io::Error::other("wait failed"));
        }

        completions.append(&mut state.finished);
        Ok(())
    }
}
