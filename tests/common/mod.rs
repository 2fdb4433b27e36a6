#![allow(dead_code)]

use std::os::unix::io::{IntoRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use fdmux::Reactor;

/// A connected socket pair: one end kept for the test to drive, the other
/// handed over to a channel as a raw descriptor.
pub fn pair() -> (UnixStream, RawFd) {
    let (ours, theirs) = UnixStream::pair().expect("socketpair");
    (ours, theirs.into_raw_fd())
}

/// Spins the reactor until `until` holds, with a hard deadline so a broken
/// event flow fails the test instead of hanging it.
pub fn pump(reactor: &Reactor, mut until: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !until() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        reactor.run_once(true).expect("reactor iteration");
        std::thread::sleep(Duration::from_millis(1));
    }
}
