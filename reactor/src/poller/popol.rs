use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use popol::Timeout;

use super::{IoFail, IoType, Poll};

/// Poller backend based on the level-triggered `poll(2)` syscall as exposed
/// by the [`popol`] crate.
pub struct Poller {
    poll: popol::Sources<RawFd>,
    spool: Vec<popol::Event<RawFd>>,
    events: VecDeque<(RawFd, Result<IoType, IoFail>)>,
}

impl Poller {
    pub fn new() -> Self {
        Self {
            poll: popol::Sources::new(),
            spool: Vec::with_capacity(64),
            events: empty!(),
        }
    }
}

impl Default for Poller {
    fn default() -> Self { Self::new() }
}

impl From<IoType> for popol::Interest {
    fn from(ty: IoType) -> Self {
        match (ty.read, ty.write) {
            (true, true) => popol::interest::ALL,
            (true, false) => popol::interest::READ,
            (false, true) => popol::interest::WRITE,
            (false, false) => popol::interest::NONE,
        }
    }
}

impl Poll for Poller {
    fn register(&mut self, fd: RawFd, interest: IoType) {
        self.poll.register(fd, &fd, interest.into());
    }

    fn unregister(&mut self, fd: RawFd) {
        self.poll.unregister(&fd);
        self.events.retain(|(key, _)| *key != fd);
    }

    fn set_interest(&mut self, fd: RawFd, interest: IoType) -> bool {
        // Queued events reflecting the old interest are stale by now.
        self.events.retain(|(key, _)| *key != fd);
        self.poll.set(&fd, interest.into())
    }

    fn poll(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        let timeout = timeout.map(Timeout::from).unwrap_or(Timeout::Never);

        self.spool.clear();
        // Blocking call
        match self.poll.poll(&mut self.spool, timeout) {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::TimedOut => return Ok(0),
            Err(err) => return Err(err),
        }

        for ev in self.spool.drain(..) {
            let fd = ev.key;
            let res = if ev.is_error() || ev.is_invalid() {
                Err(IoFail::Os)
            } else if ev.is_readable() || ev.is_writable() {
                // Hangup may arrive together with final readable data; the
                // EOF is then observed by the read itself.
                Ok(IoType {
                    read: ev.is_readable(),
                    write: ev.is_writable(),
                })
            } else if ev.is_hangup() {
                Err(IoFail::Connectivity)
            } else {
                continue;
            };
            self.events.push_back((fd, res));
        }

        Ok(self.events.len())
    }
}

impl Iterator for Poller {
    type Item = (RawFd, Result<IoType, IoFail>);

    fn next(&mut self) -> Option<Self::Item> {
        self.events.pop_front()
    }
}
