//! Linux `io_uring` completion port.
//!
//! Each posted operation is a one-shot `POLL_ADD` whose `user_data` is the
//! engine's operation key. Cancellation uses `ASYNC_CANCEL`, whose own
//! completion is tagged with a reserved value and swallowed here. Bounded
//! waits use the extended `io_uring_enter` argument where the kernel has it
//! and a tagged `TIMEOUT` entry otherwise. That entry also completes on the
//! first other completion, so it never outlives the wait that armed it by
//! more than one reap.

use super::{Completion, CompletionPort, OpKind, Outcome};
use crate::poller::RawSocket;

use io_uring::{IoUring, cqueue, opcode, types};
use std::io;
use std::time::Duration;

/// Reserved `user_data` for cancellation requests.
///
/// Operation keys are slab indices, so `u64::MAX` never collides.
const CANCEL_TAG: u64 = u64::MAX;

/// Reserved `user_data` for fallback wait timeouts.
const TIMEOUT_TAG: u64 = u64::MAX - 1;

/// `io_uring` instance used as a completion port.
pub struct UringPort {
    ring: IoUring,

    /// Scratch buffer for drained completion entries.
    cqes: Vec<cqueue::Entry>,

    /// Maximum number of entries drained by one wait.
    max_events: usize,
}

impl UringPort {
    /// Creates a ring with at least `entries` submission slots that hands
    /// out at most `max_events` completions per wait. Entries beyond that
    /// stay in the completion queue for the next wait.
    pub fn new(entries: u32, max_events: usize) -> io::Result<Self> {
        let ring = IoUring::new(entries.max(2).next_power_of_two())?;
        let max_events = max_events.max(1);

        Ok(Self {
            ring,
            cqes: Vec::with_capacity(max_events),
            max_events,
        })
    }

    /// Enters the kernel, blocking per `timeout` unless completions are
    /// already queued. Returns false if a blocking wait was interrupted.
    fn enter(&mut self, timeout: Option<Duration>) -> io::Result<bool> {
        if !self.ring.completion().is_empty() {
            self.ring.submit()?;
            return Ok(true);
        }

        match timeout {
            Some(t) if t.is_zero() => {
                self.ring.submit()?;
            }
            Some(t) => {
                let ts = types::Timespec::new()
                    .sec(t.as_secs())
                    .nsec(t.subsec_nanos());

                let waited = if self.ring.params().is_feature_ext_arg() {
                    let args = types::SubmitArgs::new().timespec(&ts);
                    self.ring.submitter().submit_with_args(1, &args)
                } else {
                    let entry = opcode::Timeout::new(&ts)
                        .count(1)
                        .build()
                        .user_data(TIMEOUT_TAG);
                    self.push(&entry)?;
                    self.ring.submit_and_wait(1)
                };

                match waited {
                    Ok(_) => {}
                    Err(e) if is_timeout(&e) => {}
                    Err(e) => return Err(e),
                }
            }
            None => match self.ring.submit_and_wait(1) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(false),
                Err(e) => return Err(e),
            },
        }

        Ok(true)
    }

    /// Drains up to `max_events` entries into `completions`, dropping the
    /// ones tagged for cancellations and timeouts. Returns how many entries
    /// were drained and how many of them were handed out.
    fn reap(&mut self, completions: &mut Vec<Completion>) -> (usize, usize) {
        self.cqes.clear();
        self.cqes.extend(self.ring.completion().take(self.max_events));

        let before = completions.len();

        for cqe in &self.cqes {
            if matches!(cqe.user_data(), CANCEL_TAG | TIMEOUT_TAG) {
                continue;
            }

            completions.push(Completion {
                user_data: cqe.user_data(),
                outcome: outcome(cqe.result()),
            });
        }

        (self.cqes.len(), completions.len() - before)
    }

    /// Pushes an entry, flushing the submission queue once if it is full.
    fn push(&mut self, entry: &io_uring::squeue::Entry) -> io::Result<()> {
        // SAFETY: poll and cancel entries reference no user memory; the
        // timeout entry's timespec outlives the submission that reads it.
        if unsafe { self.ring.submission().push(entry) }.is_ok() {
            return Ok(());
        }

        self.ring.submit()?;

        unsafe { self.ring.submission().push(entry) }
            .map_err(|_| io::Error::other("io_uring submission queue full"))
    }
}

fn poll_mask(kind: OpKind) -> u32 {
    let mask = match kind {
        OpKind::Read => libc::POLLIN | libc::POLLRDHUP,
        OpKind::Accept => libc::POLLIN,
        OpKind::Write => libc::POLLOUT,
    };

    mask as u16 as u32
}

fn outcome(result: i32) -> Outcome {
    if result < 0 {
        let errno = -result;
        if errno == libc::ECANCELED {
            return Outcome::Cancelled;
        }
        return Outcome::Failed(io::Error::from_raw_os_error(errno));
    }

    let revents = result as u32;
    if revents & (libc::POLLNVAL as u16 as u32) != 0 {
        Outcome::Failed(io::Error::from_raw_os_error(libc::EBADF))
    } else if revents & (libc::POLLERR as u16 as u32) != 0 {
        Outcome::SocketError
    } else {
        Outcome::Ready
    }
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::ETIME) | Some(libc::EINTR))
}

impl CompletionPort for UringPort {
    fn name(&self) -> &'static str {
        "io_uring"
    }

    fn post(&mut self, user_data: u64, socket: RawSocket, kind: OpKind) -> io::Result<()> {
        let entry = opcode::PollAdd::new(types::Fd(socket), poll_mask(kind))
            .build()
            .user_data(user_data);

        self.push(&entry)
    }

    fn cancel(&mut self, user_data: u64) -> io::Result<()> {
        let entry = opcode::AsyncCancel::new(user_data)
            .build()
            .user_data(CANCEL_TAG);

        self.push(&entry)
    }

    fn wait(
        &mut self,
        completions: &mut Vec<Completion>,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        loop {
            if !self.enter(timeout)? {
                return Ok(());
            }

            let (drained, handed_out) = self.reap(completions);

            // An unbounded wait woken only by tagged entries keeps waiting.
            if timeout.is_some() || handed_out > 0 || drained == 0 {
                return Ok(());
            }
        }
    }
}
