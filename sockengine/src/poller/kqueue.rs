//! `kqueue`-based poller for macOS and FreeBSD.
//!
//! Read and write readiness are separate filters. The write filter is always
//! installed and toggled with `EV_ENABLE`/`EV_DISABLE`, so re-arming write
//! interest never has to add or delete kernel state.

use super::{Interest, Poller, RawSocket, Readiness};

use libc::{
    EV_ADD, EV_DELETE, EV_DISABLE, EV_ENABLE, EV_EOF, EV_ERROR, EVFILT_READ, EVFILT_WRITE, kevent,
    kqueue, timespec,
};
use std::io;
use std::os::unix::io::RawFd;
use std::ptr;
use std::time::Duration;

/// BSD `kqueue` poller.
pub struct KqueuePoller {
    /// Kqueue file descriptor.
    kqueue: RawFd,

    /// Reusable buffer for reaped kevents.
    events: Vec<kevent>,
}

fn change(fd: RawFd, filter: i16, flags: u16, token: u64) -> kevent {
    kevent {
        ident: fd as usize,
        filter: filter as _,
        flags: flags as _,
        fflags: 0,
        data: 0,
        udata: token as usize as *mut _,
    }
}

impl KqueuePoller {
    /// Create a new `KqueuePoller` returning at most `max_events` per poll.
    pub fn new(max_events: usize) -> io::Result<Self> {
        let kqueue = unsafe { kqueue() };
        if kqueue < 0 {
            return Err(io::Error::last_os_error());
        }

        let events = (0..max_events.max(1))
            .map(|_| change(0, 0, 0, 0))
            .collect();

        Ok(KqueuePoller { kqueue, events })
    }

    fn apply(&self, changes: &[kevent]) -> io::Result<()> {
        let rc = unsafe {
            kevent(
                self.kqueue,
                changes.as_ptr(),
                changes.len() as i32,
                ptr::null_mut(),
                0,
                ptr::null(),
            )
        };

        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    fn changes(fd: RawFd, token: u64, interest: Interest) -> [kevent; 2] {
        let read = if interest.wants_readable() {
            EV_ADD | EV_ENABLE
        } else {
            EV_ADD | EV_DISABLE
        };
        let write = if interest.write {
            EV_ADD | EV_ENABLE
        } else {
            EV_ADD | EV_DISABLE
        };

        [
            change(fd, EVFILT_READ, read, token),
            change(fd, EVFILT_WRITE, write, token),
        ]
    }
}

impl Poller for KqueuePoller {
    fn name(&self) -> &'static str {
        "kqueue"
    }

    fn register(&mut self, socket: RawSocket, token: u64, interest: Interest) -> io::Result<()> {
        self.apply(&Self::changes(socket, token, interest))
    }

    fn reregister(&mut self, socket: RawSocket, token: u64, interest: Interest) -> io::Result<()> {
        self.apply(&Self::changes(socket, token, interest))
    }

    fn deregister(&mut self, socket: RawSocket) -> io::Result<()> {
        // Each filter is deleted on its own so a missing one does not hide
        // the other.
        let read = self.apply(&[change(socket, EVFILT_READ, EV_DELETE, 0)]);
        let write = self.apply(&[change(socket, EVFILT_WRITE, EV_DELETE, 0)]);
        read.and(write)
    }

    fn poll(&mut self, events: &mut Vec<Readiness>, timeout: Option<Duration>) -> io::Result<()> {
        events.clear();

        let ts = timeout.map(|t| timespec {
            tv_sec: t.as_secs().min(i64::MAX as u64) as _,
            tv_nsec: t.subsec_nanos() as _,
        });
        let ts_ptr = ts.as_ref().map_or(ptr::null(), |t| t as *const timespec);

        let n = unsafe {
            kevent(
                self.kqueue,
                ptr::null(),
                0,
                self.events.as_mut_ptr(),
                self.events.len() as i32,
                ts_ptr,
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
            let token = ev.udata as usize as u64;
            let flags = ev.flags as u16;
            let filter = ev.filter as i16;

            let error = flags & EV_ERROR != 0;
            let readable = filter == EVFILT_READ || (flags & EV_EOF != 0);
            let writable = filter == EVFILT_WRITE && (flags & EV_EOF == 0);

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

impl Drop for KqueuePoller {
    fn drop(&mut self) {
        unsafe { libc::close(self.kqueue) };
    }
}
