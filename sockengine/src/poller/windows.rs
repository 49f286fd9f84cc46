//! Windows platform layer.
//!
//! Mirrors the Unix platform layer and exposes identical function names and
//! semantics where possible. Only WinSock sockets are supported; the engine
//! never multiplexes file handles.

use std::io;
use std::mem;
use std::sync::OnceLock;

use windows_sys::Win32::Networking::WinSock::{
    SO_ERROR, SOCKET, SOL_SOCKET, WSADATA, WSAENOTSOCK, WSAStartup, getsockopt,
};

/// Raw socket type handed to the engine by its handlers.
pub type RawSocket = std::os::windows::io::RawSocket;

/// Creates a MAKEWORD value for Winsock version.
#[inline]
const fn makeword(low: u8, high: u8) -> u16 {
    ((high as u16) << 8) | (low as u16)
}

/// Result of the one-time `WSAStartup` call.
static WINSOCK_INIT: OnceLock<i32> = OnceLock::new();

/// Initialize Winsock if not already initialized.
///
/// Returns the `WSAStartup` error code of the first call, if it failed.
pub(crate) fn ensure_winsock() -> io::Result<()> {
    let rc = *WINSOCK_INIT.get_or_init(|| unsafe {
        let mut data: WSADATA = mem::zeroed();
        WSAStartup(makeword(2, 2), &mut data as *mut _)
    });

    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(rc))
    }
}

/// Retrieves the pending socket error via `SO_ERROR`.
///
/// An empty `SO_ERROR` is still reported as a reset connection, since the
/// engine only asks after the OS flagged an error condition.
pub(crate) fn sys_socket_error(fd: RawSocket) -> io::Error {
    unsafe {
        let mut err: i32 = 0;
        let mut len: i32 = mem::size_of::<i32>() as i32;

        let rc = getsockopt(
            fd as SOCKET,
            SOL_SOCKET,
            SO_ERROR,
            &mut err as *mut _ as *mut u8,
            &mut len,
        );

        if rc != 0 {
            io::Error::last_os_error()
        } else if err != 0 {
            io::Error::from_raw_os_error(err)
        } else {
            io::Error::from(io::ErrorKind::ConnectionReset)
        }
    }
}

/// Returns true if the error means the socket no longer exists.
pub(crate) fn is_gone(err: &io::Error) -> bool {
    err.raw_os_error() == Some(WSAENOTSOCK)
}
