//! Linux `epoll`-based poller implementation.
//!
//! Level-triggered: a socket that stays readable is reported on every poll
//! until drained, which is what lets the engine deliver only one callback per
//! socket per dispatch without losing the other conditions.
//!
//! This backend is selected automatically on Linux targets.

use super::{Interest, Poller, RawSocket, Readiness, timeout_millis};

use libc::{
    EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD, EPOLLERR, EPOLLHUP, EPOLLIN,
    EPOLLOUT, EPOLLRDHUP, epoll_create1, epoll_ctl, epoll_event, epoll_wait,
};
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Linux `epoll` poller.
///
/// This poller owns:
/// - an `epoll` instance,
/// - a reusable event buffer sized to the number of events taken per poll.
pub struct EpollPoller {
    /// Epoll file descriptor.
    epoll: RawFd,

    /// Reusable buffer for epoll events.
    events: Vec<epoll_event>,
}

impl EpollPoller {
    /// Create a new `EpollPoller` returning at most `max_events` per poll.
    pub fn new(max_events: usize) -> io::Result<Self> {
        let epoll = unsafe { epoll_create1(EPOLL_CLOEXEC) };
        if epoll < 0 {
            return Err(io::Error::last_os_error());
        }

        let empty = epoll_event { events: 0, u64: 0 };

        Ok(Self {
            epoll,
            events: vec![empty; max_events.max(1)],
        })
    }

    fn control(&self, op: i32, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        let mut event = epoll_event {
            events: flags(interest),
            u64: token,
        };

        let rc = unsafe { epoll_ctl(self.epoll, op, fd, &mut event) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

fn flags(interest: Interest) -> u32 {
    let mut flags = 0;

    if interest.wants_readable() {
        flags |= EPOLLIN | EPOLLRDHUP;
    }
    if interest.write {
        flags |= EPOLLOUT;
    }

    flags as u32
}

impl Poller for EpollPoller {
    fn name(&self) -> &'static str {
        "epoll"
    }

    fn register(&mut self, socket: RawSocket, token: u64, interest: Interest) -> io::Result<()> {
        self.control(EPOLL_CTL_ADD, socket, token, interest)
    }

    fn reregister(&mut self, socket: RawSocket, token: u64, interest: Interest) -> io::Result<()> {
        self.control(EPOLL_CTL_MOD, socket, token, interest)
    }

    fn deregister(&mut self, socket: RawSocket) -> io::Result<()> {
        let rc = unsafe { epoll_ctl(self.epoll, EPOLL_CTL_DEL, socket, std::ptr::null_mut()) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    fn poll(&mut self, events: &mut Vec<Readiness>, timeout: Option<Duration>) -> io::Result<()> {
        events.clear();

        let n = unsafe {
            epoll_wait(
                self.epoll,
                self.events.as_mut_ptr(),
                self.events.len() as i32,
                timeout_millis(timeout),
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        for ev in &self.events[..n as usize] {
            let bits = ev.events;
            let token = ev.u64;

            let readable = bits & ((EPOLLIN | EPOLLHUP | EPOLLRDHUP) as u32) != 0;
            let writable = bits & (EPOLLOUT as u32) != 0;
            let error = bits & (EPOLLERR as u32) != 0;

            if let Some(e) = events.iter_mut().find(|e| e.token == token) {
                e.readable |= readable;
                e.writable |= writable;
                e.error |= error;
            } else {
                events.push(Readiness {
                    token,
                    readable,
                    writable,
                    error,
                });
            }
        }

        Ok(())
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        unsafe { libc::close(self.epoll) };
    }
}
