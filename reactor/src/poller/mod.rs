pub mod popol;

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

pub use self::popol::Poller;

/// Readiness interest for a registered descriptor.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default, Display)]
#[display("{{read: {read}, write: {write}}}")]
pub struct IoType {
    /// Wake when the descriptor has data to read.
    pub read: bool,
    /// Wake when the descriptor can accept writes.
    pub write: bool,
}

impl IoType {
    pub fn none() -> Self {
        IoType {
            read: false,
            write: false,
        }
    }

    pub fn read_only() -> Self {
        IoType {
            read: true,
            write: false,
        }
    }

    pub fn write_only() -> Self {
        IoType {
            read: false,
            write: true,
        }
    }

    pub fn read_write() -> Self {
        IoType {
            read: true,
            write: true,
        }
    }

    pub fn is_none(self) -> bool { !self.read && !self.write }
}

/// Poll-level failure reported for a single descriptor.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Error)]
pub enum IoFail {
    /// The peer hung up or the connection was reset (`POLLHUP`).
    #[display("connection hangup")]
    Connectivity,

    /// OS-level polling error on the descriptor (`POLLERR`/`POLLNVAL`).
    #[display("OS-level polling error")]
    Os,
}

/// Object-safe abstraction over a readiness multiplexer.
///
/// Implementations queue the events produced by [`Poll::poll`] and yield them
/// through their [`Iterator`] implementation, one `(descriptor, result)` pair
/// at a time.
pub trait Poll: Iterator<Item = (RawFd, Result<IoType, IoFail>)> {
    /// Starts monitoring a descriptor with the given interest.
    fn register(&mut self, fd: RawFd, interest: IoType);

    /// Stops monitoring a descriptor; queued events for it are discarded.
    fn unregister(&mut self, fd: RawFd);

    /// Changes the monitored interest; takes effect on the next poll.
    fn set_interest(&mut self, fd: RawFd, interest: IoType) -> bool;

    /// Blocks until at least one descriptor is ready or the timeout elapses
    /// (`None` blocks indefinitely). Returns the number of descriptors with
    /// events; an expired timeout is `Ok(0)`, not an error.
    fn poll(&mut self, timeout: Option<Duration>) -> io::Result<usize>;
}
