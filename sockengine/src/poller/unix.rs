use libc::{SO_ERROR, SOL_SOCKET, c_int, getsockopt, socklen_t};
use std::os::fd::RawFd;
use std::{io, mem};

/// Raw socket type handed to the engine by its handlers.
pub type RawSocket = RawFd;

/// Retrieves the pending socket error via `SO_ERROR`.
///
/// The engine only asks after the OS flagged an error condition, so an empty
/// `SO_ERROR` is still reported as a reset connection.
pub(crate) fn sys_socket_error(fd: RawSocket) -> io::Error {
    let mut err: c_int = 0;
    let mut len = mem::size_of::<c_int>() as socklen_t;

    let rc = unsafe {
        getsockopt(
            fd,
            SOL_SOCKET,
            SO_ERROR,
            &mut err as *mut _ as *mut _,
            &mut len,
        )
    };

    if rc < 0 {
        io::Error::last_os_error()
    } else if err != 0 {
        io::Error::from_raw_os_error(err)
    } else {
        io::Error::from(io::ErrorKind::ConnectionReset)
    }
}

/// Returns true if the error means the descriptor is no longer known to the
/// kernel primitive (already closed, or never added).
pub(crate) fn is_gone(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EBADF) | Some(libc::ENOENT))
}
