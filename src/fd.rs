// Buffered framed I/O channels over file descriptors
//
// SPDX-License-Identifier: Apache-2.0

//! Thin non-blocking wrappers over descriptor syscalls with errno
//! classification shared by the channel state machine.

use std::io::{self, SeekFrom};
use std::os::unix::io::RawFd;

/// Outcome of a single non-blocking read or write attempt.
#[derive(Debug)]
pub(crate) enum IoStatus {
    /// The syscall transferred this many bytes.
    Success(usize),
    /// The descriptor is not ready; retry on the next readiness event.
    WouldBlock,
    /// The peer closed its end (zero-length read).
    Shutdown,
    /// Unrecoverable I/O error.
    Err(io::Error),
}

pub(crate) fn read(fd: RawFd, buf: &mut [u8]) -> IoStatus {
    loop {
        let ret = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if ret > 0 {
            return IoStatus::Success(ret as usize);
        }
        if ret == 0 {
            return IoStatus::Shutdown;
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) => return IoStatus::WouldBlock,
            _ => return IoStatus::Err(err),
        }
    }
}

pub(crate) fn write(fd: RawFd, buf: &[u8]) -> IoStatus {
    loop {
        let ret = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if ret > 0 {
            return IoStatus::Success(ret as usize);
        }
        if ret == 0 {
            return IoStatus::WouldBlock;
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) => return IoStatus::WouldBlock,
            _ => return IoStatus::Err(err),
        }
    }
}

/// Puts the descriptor into non-blocking mode, returning the previous
/// status flags so they can be restored on release.
pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<libc::c_int> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags == -1 {
        return Err(io::Error::last_os_error());
    }
    if flags & libc::O_NONBLOCK == 0
        && unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } == -1
    {
        return Err(io::Error::last_os_error());
    }
    Ok(flags)
}

pub(crate) fn restore_flags(fd: RawFd, flags: libc::c_int) -> io::Result<()> {
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Folds out-of-band data into the normal stream on sockets; a no-op for
/// other descriptor kinds.
pub(crate) fn set_oob_inline(fd: RawFd) -> io::Result<()> {
    let on: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_OOBINLINE,
            &on as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    sock_result(ret)
}

/// Disables lingering close on sockets so dropping the channel never blocks.
pub(crate) fn disable_linger(fd: RawFd) -> io::Result<()> {
    let linger = libc::linger {
        l_onoff: 0,
        l_linger: 0,
    };
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            &linger as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::linger>() as libc::socklen_t,
        )
    };
    sock_result(ret)
}

fn sock_result(ret: libc::c_int) -> io::Result<()> {
    if ret == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    // Pipes and regular files have no socket options.
    if err.raw_os_error() == Some(libc::ENOTSOCK) {
        return Ok(());
    }
    Err(err)
}

/// Half-closes the write side of a socket. Fails with `ENOTSOCK` on
/// non-socket descriptors; the caller decides what to do then.
pub(crate) fn shutdown_write(fd: RawFd) -> io::Result<()> {
    if unsafe { libc::shutdown(fd, libc::SHUT_WR) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

pub(crate) fn seek(fd: RawFd, pos: SeekFrom) -> io::Result<u64> {
    let (offset, whence) = match pos {
        SeekFrom::Start(n) => (n as libc::off_t, libc::SEEK_SET),
        SeekFrom::Current(n) => (n as libc::off_t, libc::SEEK_CUR),
        SeekFrom::End(n) => (n as libc::off_t, libc::SEEK_END),
    };
    let ret = unsafe { libc::lseek(fd, offset, whence) };
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as u64)
    }
}

pub(crate) fn close(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

pub(crate) fn is_valid(fd: RawFd) -> bool {
    unsafe { libc::fcntl(fd, libc::F_GETFD) != -1 }
}
