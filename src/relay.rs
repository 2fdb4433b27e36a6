// Buffered framed I/O channels over file descriptors
//
// SPDX-License-Identifier: Apache-2.0

//! Couples two channels into a bidirectional relay: frames read on one side
//! are written to the other, with cross-backpressure and half-close
//! propagation.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use fdmux::Reactor;

use crate::channel::{
    Channel, ChannelConfig, ChannelError, ChannelEvent, Direction, WriteOutcome,
};

/// Teardown policy of a [`Relay`].
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub enum RelayMode {
    /// Each side closes on its own once both reading ends are done.
    #[default]
    WaitBoth,
    /// Either side finishing closing tears the other down immediately.
    CloseTogether,
}

#[derive(Default)]
struct Side {
    channel: Option<Channel>,
    /// This side's reading end delivered EOF or failed.
    read_closed: bool,
    /// This side's channel finished closing.
    closed: bool,
    /// This side's reads are paused because the peer's output queue filled.
    throttled: bool,
}

struct RelayInner {
    mode: RelayMode,
    sides: RefCell<[Side; 2]>,
    tap: RefCell<Option<Box<dyn FnMut(usize, &[u8])>>>,
    on_done: RefCell<Option<Box<dyn FnOnce()>>>,
    done: Cell<bool>,
}

/// A bidirectional pump between two channels sharing one reactor.
///
/// Data read on side 0 is written to side 1 and vice versa. When a write
/// queue fills, the reading side is paused and the overflowing buffer is
/// admitted past the budget, so no data is dropped or reordered; the pause
/// lifts as soon as the congested queue makes progress. EOF on one reading
/// end propagates as a write shutdown on the other.
#[derive(Clone)]
pub struct Relay {
    inner: Rc<RelayInner>,
}

impl Relay {
    /// Spawns both channels and couples them. `on_done` runs exactly once,
    /// after both channels finished closing.
    pub fn couple(
        reactor: &Rc<Reactor>,
        side_a: ChannelConfig,
        side_b: ChannelConfig,
        mode: RelayMode,
        on_done: impl FnOnce() + 'static,
    ) -> Result<Relay, ChannelError> {
        let inner = Rc::new(RelayInner {
            mode,
            sides: RefCell::new([Side::default(), Side::default()]),
            tap: RefCell::new(None),
            on_done: RefCell::new(Some(Box::new(on_done))),
            done: Cell::new(false),
        });

        let relay_a = Rc::clone(&inner);
        let chan_a = Channel::spawn(reactor, side_a, move |chan: &Channel, ev| {
            RelayInner::on_event(&relay_a, 0, chan, ev)
        })?;
        let relay_b = Rc::clone(&inner);
        let chan_b = match Channel::spawn(reactor, side_b, move |chan: &Channel, ev| {
            RelayInner::on_event(&relay_b, 1, chan, ev)
        }) {
            Ok(chan) => chan,
            Err(err) => {
                chan_a.close(true, false, false);
                return Err(err);
            }
        };

        {
            let mut sides = inner.sides.borrow_mut();
            sides[0].channel = Some(chan_a);
            sides[1].channel = Some(chan_b);
        }
        Ok(Relay { inner })
    }

    /// Installs an observer invoked with every relayed buffer and the index
    /// (0 or 1) of the side it was read from.
    pub fn set_tap(&self, tap: impl FnMut(usize, &[u8]) + 'static) {
        *self.inner.tap.borrow_mut() = Some(Box::new(tap));
    }

    /// Whether both sides finished closing.
    pub fn is_done(&self) -> bool { self.inner.done.get() }

    /// Tears both sides down, discarding queued output.
    pub fn abort(&self) {
        for side in 0..2 {
            if let Some(chan) = self.inner.channel(side) {
                chan.close(true, true, false);
            }
        }
    }
}

impl RelayInner {
    fn channel(&self, side: usize) -> Option<Channel> {
        self.sides.borrow()[side].channel.clone()
    }

    /// Event pump shared by both sides. Channel calls made here may re-enter
    /// this function synchronously for the peer, so no `sides` borrow is
    /// held across them.
    fn on_event(inner: &Rc<RelayInner>, side: usize, chan: &Channel, event: ChannelEvent) {
        let peer = 1 - side;
        match event {
            ChannelEvent::ReadComplete(msg) | ChannelEvent::IncompleteRead(msg) => {
                let data = msg.to_vec();
                if let Some(tap) = inner.tap.borrow_mut().as_mut() {
                    tap(side, &data);
                }
                let Some(peer_chan) = inner.channel(peer) else {
                    // Peer already gone; stop pulling data with nowhere to go.
                    let _ = chan.shutdown(Direction::Read);
                    return;
                };
                match peer_chan.write(data, false) {
                    Ok(WriteOutcome::Accepted) => {}
                    Ok(WriteOutcome::QueueFull(data)) => {
                        // Pause our reads, then push the buffer past the
                        // budget: it was already consumed from the stream
                        // and dropping or re-reading it would corrupt order.
                        inner.sides.borrow_mut()[side].throttled = true;
                        chan.set_read_allowed(false);
                        if peer_chan.write(data, true).is_err() {
                            inner.read_side_done(side);
                        }
                    }
                    Err(_) => inner.read_side_done(side),
                }
            }
            ChannelEvent::WriteComplete(_) | ChannelEvent::WriteAborted(_) => {
                // Our queue made progress; resume the reader feeding it.
                let release = {
                    let mut sides = inner.sides.borrow_mut();
                    std::mem::replace(&mut sides[peer].throttled, false)
                };
                if release {
                    if let Some(peer_chan) = inner.channel(peer) {
                        peer_chan.set_read_allowed(true);
                    }
                }
            }
            ChannelEvent::ReadEof | ChannelEvent::ReadError(_) => {
                inner.read_side_done(side);
            }
            ChannelEvent::WriteError(_) => {
                // Nothing can reach this side's writer anymore; the peer's
                // reading is pointless.
                inner.sides.borrow_mut()[peer].read_closed = true;
                if let Some(peer_chan) = inner.channel(peer) {
                    let _ = peer_chan.shutdown(Direction::Read);
                }
                inner.maybe_close_both();
            }
            ChannelEvent::Closing => {
                {
                    let mut sides = inner.sides.borrow_mut();
                    sides[side].closed = true;
                    sides[side].channel = None;
                }
                if inner.mode == RelayMode::CloseTogether {
                    if let Some(peer_chan) = inner.channel(peer) {
                        peer_chan.close(true, true, false);
                    }
                }
                inner.maybe_done();
            }
            ChannelEvent::SeekSuccess(_) | ChannelEvent::SeekFailure(_) => {}
        }
    }

    /// Marks a reading end finished and propagates the half-close to the
    /// peer's writer, so it drains its queue and signals EOF downstream.
    fn read_side_done(&self, side: usize) {
        self.sides.borrow_mut()[side].read_closed = true;
        let peer = 1 - side;
        if let Some(peer_chan) = self.channel(peer) {
            let _ = peer_chan.shutdown(Direction::Write);
        }
        if self.mode == RelayMode::CloseTogether {
            // An ended stream closes its own side at once; the Closing event
            // then pulls the peer down with it.
            if let Some(chan) = self.channel(side) {
                chan.close(false, true, false);
            }
            return;
        }
        self.maybe_close_both();
    }

    /// Once both reading ends are done no new data can flow; close whatever
    /// is still open, draining queued output first.
    fn maybe_close_both(&self) {
        let both_done = {
            let sides = self.sides.borrow();
            sides[0].read_closed && sides[1].read_closed
        };
        if !both_done {
            return;
        }
        for side in 0..2 {
            let open = {
                let sides = self.sides.borrow();
                !sides[side].closed && sides[side].channel.is_some()
            };
            if open {
                if let Some(chan) = self.channel(side) {
                    chan.close(false, true, false);
                }
            }
        }
    }

    fn maybe_done(&self) {
        let all_closed = {
            let sides = self.sides.borrow();
            sides.iter().all(|side| side.closed)
        };
        if all_closed && !self.done.replace(true) {
            if let Some(on_done) = self.on_done.borrow_mut().take() {
                on_done();
            }
        }
    }
}
