//! Windows `WSAPoll`-based poller implementation.
//!
//! This module provides the readiness-based Windows backend. It mirrors the
//! semantics of Linux `epoll` and macOS `kqueue` using non-blocking sockets
//! and `WSAPoll`.
//!
//! `WSAPoll` keeps no kernel-side registration, so the poller holds the
//! registry itself and rebuilds the `WSAPOLLFD` array on every poll.

use super::windows::ensure_winsock;
use super::{Interest, Poller, RawSocket, Readiness, timeout_millis};

use std::collections::HashMap;
use std::io;
use std::thread;
use std::time::Duration;

use windows_sys::Win32::Networking::WinSock::{
    POLLERR, POLLHUP, POLLIN, POLLNVAL, POLLOUT, SOCKET, SOCKET_ERROR, WSAPOLLFD, WSAPoll,
};

/// Windows poller based on `WSAPoll`.
pub struct WsaPoller {
    /// Registered sockets: `socket → (token, interest)`.
    reg: HashMap<RawSocket, (u64, Interest)>,

    /// Reusable buffer of poll descriptors.
    fds: Vec<WSAPOLLFD>,
}

impl WsaPoller {
    /// Create a new `WsaPoller`, initializing Winsock once per process.
    ///
    /// `WSAPoll` reports every ready socket at once, so `max_events` only
    /// pre-sizes the descriptor buffer.
    pub fn new(max_events: usize) -> io::Result<Self> {
        ensure_winsock()?;

        Ok(Self {
            reg: HashMap::new(),
            fds: Vec::with_capacity(max_events),
        })
    }
}

impl Poller for WsaPoller {
    fn name(&self) -> &'static str {
        "wsapoll"
    }

    fn register(&mut self, socket: RawSocket, token: u64, interest: Interest) -> io::Result<()> {
        self.reg.insert(socket, (token, interest));
        Ok(())
    }

    fn reregister(&mut self, socket: RawSocket, token: u64, interest: Interest) -> io::Result<()> {
        match self.reg.get_mut(&socket) {
            Some(entry) => {
                *entry = (token, interest);
                Ok(())
            }
            None => Err(io::Error::from(io::ErrorKind::NotFound)),
        }
    }

    fn deregister(&mut self, socket: RawSocket) -> io::Result<()> {
        self.reg.remove(&socket);
        Ok(())
    }

    fn poll(&mut self, events: &mut Vec<Readiness>, timeout: Option<Duration>) -> io::Result<()> {
        events.clear();
        self.fds.clear();

        for (&fd, &(_, interest)) in self.reg.iter() {
            let mut ev = 0;
            if interest.wants_readable() {
                ev |= POLLIN;
            }
            if interest.write {
                ev |= POLLOUT;
            }

            self.fds.push(WSAPOLLFD {
                fd: fd as SOCKET,
                events: ev,
                revents: 0,
            });
        }

        // WSAPoll rejects an empty set.
        if self.fds.is_empty() {
            if let Some(t) = timeout {
                thread::sleep(t);
            }
            return Ok(());
        }

        let rc = unsafe {
            WSAPoll(
                self.fds.as_mut_ptr(),
                self.fds.len() as u32,
                timeout_millis(timeout),
            )
        };
        if rc == SOCKET_ERROR {
            return Err(io::Error::last_os_error());
        }

        for pfd in &self.fds {
            let re = pfd.revents as i32;
            if re == 0 {
                continue;
            }

            let fd = pfd.fd as RawSocket;
            if let Some(&(token, _)) = self.reg.get(&fd) {
                events.push(Readiness {
                    token,
                    readable: (re & (POLLIN | POLLHUP) as i32) != 0,
                    writable: (re & POLLOUT as i32) != 0,
                    error: (re & (POLLERR | POLLNVAL) as i32) != 0,
                });
            }
        }

        Ok(())
    }
}
