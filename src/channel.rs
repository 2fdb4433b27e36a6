// Buffered framed I/O channels over file descriptors
//
// SPDX-License-Identifier: Apache-2.0

//! Buffered duplex channel over one or two raw file descriptors.
//!
//! A [`Channel`] owns the non-blocking state of its descriptors, frames the
//! inbound byte stream according to a [`FrameMode`], queues outbound data
//! with a bounded budget, and delivers [`ChannelEvent`]s to a single
//! [`ChannelHandler`]. Shutdown, close and seek requests issued while output
//! is pending are queued behind it and execute in stream order.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io::{self, SeekFrom};
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};

use fdmux::{EventHandler, IoEvent, IoFail, IoType, Reactor};

use crate::fd::{self, IoStatus};
use crate::frame::{self, FrameMode, FrameState, Scan, LENGTH_PREFIX};
use crate::queue::{Chunk, CloseArgs, Command, Message, QueueItem, ReadQueue, WriteQueue};

/// Channel direction, as seen from the owning process.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Display)]
#[display(Debug)]
pub enum Direction {
    Read,
    Write,
}

/// Errors returned by [`Channel`] operations.
#[derive(Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum ChannelError {
    /// channel has no file descriptors to operate on
    NoDescriptors,

    /// channel has no {0} direction
    NoDirection(Direction),

    /// channel is closed or closing
    Closed,

    /// blocked framing requires a non-zero block size
    ZeroBlockSize,

    /// compression cannot be combined with length-prefixed framing
    #[cfg(feature = "compression")]
    CompressedVectored,

    /// frame of {len} bytes exceeds the configured cap of {max} bytes
    OversizeFrame { len: usize, max: usize },

    /// I/O error. Details: {0}
    #[from]
    Io(io::Error),

    /// reactor failure. Details: {0}
    #[from]
    Reactor(fdmux::Error),
}

/// Result of a [`Channel::write`] call.
#[derive(Debug)]
pub enum WriteOutcome {
    /// The buffer was queued (and possibly already sent).
    Accepted,
    /// The output budget is exhausted; the buffer is handed back untouched.
    /// Re-submitting the identical buffer later is safe.
    QueueFull(Vec<u8>),
}

/// Events delivered to the channel handler.
#[derive(Debug)]
pub enum ChannelEvent {
    /// A complete frame arrived.
    ReadComplete(Message),
    /// A partial frame was evicted: buffered input exceeded its cap, or the
    /// stream ended mid-frame.
    IncompleteRead(Message),
    /// Reading failed; the read direction is dead.
    ReadError(io::Error),
    /// The peer closed its writing end.
    ReadEof,
    /// A queued buffer was fully written out.
    WriteComplete(Vec<u8>),
    /// A queued buffer was discarded by an aborting close or write failure.
    WriteAborted(Vec<u8>),
    /// Writing failed; the write direction is dead and remaining output is
    /// reported via [`ChannelEvent::WriteAborted`].
    WriteError(io::Error),
    /// The channel finished closing. No further events follow.
    Closing,
    /// A queued seek succeeded; carries the new file offset.
    SeekSuccess(u64),
    /// A queued seek failed; the channel stays usable.
    SeekFailure(io::Error),
}

/// Sink for [`ChannelEvent`]s. Implemented for any
/// `FnMut(&Channel, ChannelEvent)` closure.
pub trait ChannelHandler {
    fn on_event(&mut self, channel: &Channel, event: ChannelEvent);
}

impl<F: FnMut(&Channel, ChannelEvent)> ChannelHandler for F {
    fn on_event(&mut self, channel: &Channel, event: ChannelEvent) { self(channel, event) }
}

/// Static configuration of a channel.
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// Descriptor read from, if any.
    pub input: Option<RawFd>,
    /// Descriptor written to, if any. May equal `input` for duplex sockets.
    pub output: Option<RawFd>,
    /// Framing of the inbound stream.
    pub mode: FrameMode,
    /// Size of a single read, and the block size of [`FrameMode::Blocked`].
    pub read_hint: usize,
    /// Cap on buffered input bytes; 0 disables the cap.
    pub in_max: usize,
    /// Cap on queued output bytes; 0 disables the cap.
    pub out_max: usize,
    /// Line terminator for [`FrameMode::Line`].
    pub delimiter: u8,
    /// On close, restore descriptor flags and leave the descriptors open
    /// instead of closing them.
    pub keep_fds: bool,
    /// Deflate queued output before writing it. Not available with
    /// [`FrameMode::Vectored`], whose length prefixes describe the
    /// uncompressed payload.
    #[cfg(feature = "compression")]
    pub compress: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            input: None,
            output: None,
            mode: FrameMode::Raw,
            read_hint: 8192,
            in_max: 0,
            out_max: 0,
            delimiter: b'\n',
            keep_fds: false,
            #[cfg(feature = "compression")]
            compress: false,
        }
    }
}

impl ChannelConfig {
    /// Reads and writes the same descriptor (sockets, terminals).
    pub fn duplex(fd: RawFd) -> Self {
        Self {
            input: Some(fd),
            output: Some(fd),
            ..Default::default()
        }
    }

    /// Reads one descriptor and writes another (pipe pairs).
    pub fn pair(input: RawFd, output: RawFd) -> Self {
        Self {
            input: Some(input),
            output: Some(output),
            ..Default::default()
        }
    }

    pub fn reader(fd: RawFd) -> Self {
        Self {
            input: Some(fd),
            ..Default::default()
        }
    }

    pub fn writer(fd: RawFd) -> Self {
        Self {
            output: Some(fd),
            ..Default::default()
        }
    }

    pub fn with_mode(mut self, mode: FrameMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Per-direction lifecycle.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum DirState {
    Open,
    /// A shutdown is queued behind pending output.
    ShutdownPending,
    Shutdown,
    Error,
}

struct Inner {
    cfg: ChannelConfig,
    rfd: Option<RawFd>,
    wfd: Option<RawFd>,
    rstate: DirState,
    wstate: DirState,
    rqueue: ReadQueue,
    wqueue: WriteQueue,
    fstate: FrameState,
    /// Read-throttle depth: reads resume only once every throttler released.
    throttle: u32,
    /// Reads are paused while a queued seek waits for the output to drain.
    seek_paused: bool,
    /// A graceful close is queued; no further writes are accepted.
    closing: bool,
    /// Original descriptor status flags, restored when the channel releases
    /// descriptors it does not own.
    saved: Vec<(RawFd, libc::c_int)>,
}

struct Shared {
    weak: Weak<Shared>,
    reactor: Rc<Reactor>,
    handler: RefCell<Box<dyn ChannelHandler>>,
    inner: RefCell<Inner>,
    pending: RefCell<VecDeque<ChannelEvent>>,
    delivering: Cell<bool>,
    deferred_close: RefCell<Option<CloseArgs>>,
    dead: Cell<bool>,
}

/// A buffered, framed, event-driven channel over raw file descriptors.
///
/// Cheap to clone; clones refer to the same underlying channel.
#[derive(Clone)]
pub struct Channel {
    shared: Rc<Shared>,
}

impl Channel {
    /// Creates a channel over the descriptors named in `cfg`, puts them into
    /// non-blocking mode and registers them with the reactor.
    pub fn spawn(
        reactor: &Rc<Reactor>,
        cfg: ChannelConfig,
        handler: impl ChannelHandler + 'static,
    ) -> Result<Channel, ChannelError> {
        let (rfd, wfd) = (cfg.input, cfg.output);
        if rfd.is_none() && wfd.is_none() {
            return Err(ChannelError::NoDescriptors);
        }
        if cfg.mode == FrameMode::Blocked && cfg.read_hint == 0 {
            return Err(ChannelError::ZeroBlockSize);
        }
        #[cfg(feature = "compression")]
        if cfg.compress && cfg.mode == FrameMode::Vectored {
            // The length prefix describes uncompressed payload bytes and
            // would no longer match the stream after coalescing.
            return Err(ChannelError::CompressedVectored);
        }
        let mut fds = vec![];
        fds.extend(rfd);
        if wfd != rfd {
            fds.extend(wfd);
        }
        for fd in &fds {
            if !fd::is_valid(*fd) {
                return Err(ChannelError::Io(io::Error::from_raw_os_error(libc::EBADF)));
            }
        }

        let mut saved = Vec::with_capacity(fds.len());
        for fd in &fds {
            match fd::set_nonblocking(*fd) {
                Ok(flags) => saved.push((*fd, flags)),
                Err(err) => {
                    for (fd, flags) in saved {
                        let _ = fd::restore_flags(fd, flags);
                    }
                    return Err(err.into());
                }
            }
            // Best-effort socket hygiene; pipes and files report ENOTSOCK
            // and are skipped inside.
            if let Err(_err) = fd::set_oob_inline(*fd).and_then(|_| fd::disable_linger(*fd)) {
                #[cfg(feature = "log")]
                log::warn!(target: "fdpipe", "Socket option setup failed on {fd}: {_err}");
            }
        }

        let shared = Rc::new_cyclic(|weak| Shared {
            weak: weak.clone(),
            reactor: Rc::clone(reactor),
            handler: RefCell::new(Box::new(handler)),
            inner: RefCell::new(Inner {
                cfg,
                rfd,
                wfd,
                rstate: if rfd.is_some() { DirState::Open } else { DirState::Shutdown },
                wstate: if wfd.is_some() { DirState::Open } else { DirState::Shutdown },
                rqueue: ReadQueue::default(),
                wqueue: WriteQueue::default(),
                fstate: FrameState::default(),
                throttle: 0,
                seek_paused: false,
                closing: false,
                saved,
            }),
            pending: empty!(),
            delivering: Cell::new(false),
            deferred_close: RefCell::new(None),
            dead: Cell::new(false),
        });

        for fd in &fds {
            let interest = if Some(*fd) == rfd {
                IoType::read_only()
            } else {
                IoType::none()
            };
            if let Err(err) = reactor.register(*fd, interest, shared.clone()) {
                for prev in &fds {
                    if prev == fd {
                        break;
                    }
                    let _ = reactor.deregister(*prev);
                }
                shared.dead.set(true);
                for (fd, flags) in shared.inner.borrow_mut().saved.drain(..) {
                    let _ = fd::restore_flags(fd, flags);
                }
                return Err(err.into());
            }
        }

        Ok(Channel { shared })
    }

    /// Queues `data` for writing. With the output budget exhausted the
    /// buffer is returned as [`WriteOutcome::QueueFull`] unless `bypass` is
    /// set, which admits it regardless.
    pub fn write(&self, data: Vec<u8>, bypass: bool) -> Result<WriteOutcome, ChannelError> {
        if self.shared.dead.get() {
            return Err(ChannelError::Closed);
        }
        {
            let mut inner = self.shared.inner.borrow_mut();
            if inner.closing {
                return Err(ChannelError::Closed);
            }
            if inner.wfd.is_none() {
                return Err(ChannelError::NoDirection(Direction::Write));
            }
            if inner.wstate != DirState::Open {
                return Err(ChannelError::Closed);
            }
            if data.is_empty() {
                return Ok(WriteOutcome::Accepted);
            }
            let vectored = inner.cfg.mode == FrameMode::Vectored;
            if vectored && data.len() > u32::MAX as usize {
                return Err(ChannelError::OversizeFrame {
                    len: data.len(),
                    max: u32::MAX as usize,
                });
            }
            // The length prefix counts against the budget too.
            let extra = if vectored { LENGTH_PREFIX } else { 0 };
            let max = inner.cfg.out_max;
            if !bypass && max > 0 && inner.wqueue.bytes() + data.len() + extra > max {
                return Ok(WriteOutcome::QueueFull(data));
            }
            if vectored {
                let prefix = (data.len() as u32).to_be_bytes().to_vec();
                inner.wqueue.push_internal(prefix, vec![]);
            }
            inner.wqueue.push_data(data);
            self.shared.sync_interest(&inner);
        }
        Ok(WriteOutcome::Accepted)
    }

    /// Half-closes one direction. A write shutdown is queued behind pending
    /// output; a read shutdown is immediate and evicts buffered input as a
    /// final [`ChannelEvent::IncompleteRead`].
    pub fn shutdown(&self, dir: Direction) -> Result<(), ChannelError> {
        if self.shared.dead.get() {
            return Err(ChannelError::Closed);
        }
        match dir {
            Direction::Write => {
                let drained = {
                    let mut inner = self.shared.inner.borrow_mut();
                    if inner.wfd.is_none() {
                        return Err(ChannelError::NoDirection(Direction::Write));
                    }
                    match inner.wstate {
                        DirState::Open => {}
                        // Idempotent.
                        _ => return Ok(()),
                    }
                    if inner.wqueue.is_empty() {
                        true
                    } else {
                        inner.wstate = DirState::ShutdownPending;
                        inner.wqueue.push_command(Command::ShutdownWrite);
                        false
                    }
                };
                if drained {
                    let mut events = vec![];
                    self.shared.finish_shutdown_write(&mut events);
                    self.shared.deliver(events);
                }
            }
            Direction::Read => {
                let mut events = vec![];
                {
                    let mut inner = self.shared.inner.borrow_mut();
                    if inner.rfd.is_none() {
                        return Err(ChannelError::NoDirection(Direction::Read));
                    }
                    if inner.rstate == DirState::Open {
                        let partial = inner.rqueue.take_all();
                        if !partial.is_empty() {
                            events.push(ChannelEvent::IncompleteRead(partial));
                        }
                        inner.fstate.reset();
                        inner.rstate = DirState::Shutdown;
                        self.shared.sync_interest(&inner);
                    }
                }
                self.shared.deliver(events);
            }
        }
        Ok(())
    }

    /// Closes the channel. With `abort` unset, queued output drains first;
    /// otherwise it is discarded and reported back as
    /// [`ChannelEvent::WriteAborted`]. With `notify` set the handler
    /// receives a final [`ChannelEvent::Closing`]. Safe to call from within
    /// the handler, including repeatedly.
    pub fn close(&self, abort: bool, notify: bool, keep_fds: bool) {
        self.shared.request_close(CloseArgs {
            abort,
            notify,
            keep_fds,
        });
    }

    /// Queues a seek behind pending output. Reads pause until the seek
    /// executes; buffered input and framer state are discarded on success.
    pub fn seek(&self, pos: SeekFrom) -> Result<(), ChannelError> {
        if self.shared.dead.get() {
            return Err(ChannelError::Closed);
        }
        let immediate = {
            let mut inner = self.shared.inner.borrow_mut();
            if inner.closing {
                return Err(ChannelError::Closed);
            }
            if inner.wqueue.is_empty() {
                true
            } else {
                inner.seek_paused = true;
                inner.wqueue.push_command(Command::Seek(pos));
                self.shared.sync_interest(&inner);
                false
            }
        };
        if immediate {
            let mut events = vec![];
            self.shared.finish_seek(pos, &mut events);
            self.shared.deliver(events);
        }
        Ok(())
    }

    /// Pauses (`false`) or resumes (`true`) reading. Pauses stack: each
    /// pause must be matched by a resume before reads continue.
    pub fn set_read_allowed(&self, allowed: bool) {
        if self.shared.dead.get() {
            return;
        }
        let mut inner = self.shared.inner.borrow_mut();
        if allowed {
            inner.throttle = inner.throttle.saturating_sub(1);
        } else {
            inner.throttle += 1;
        }
        self.shared.sync_interest(&inner);
    }

    /// Unsent output bytes currently queued.
    pub fn queued_output(&self) -> usize { self.shared.inner.borrow().wqueue.bytes() }

    pub fn frame_mode(&self) -> FrameMode { self.shared.inner.borrow().cfg.mode }

    pub fn input_fd(&self) -> Option<RawFd> { self.shared.inner.borrow().rfd }

    pub fn output_fd(&self) -> Option<RawFd> { self.shared.inner.borrow().wfd }

    /// Whether the channel finished closing.
    pub fn is_closed(&self) -> bool { self.shared.dead.get() }
}

impl EventHandler for Shared {
    fn event(&self, _reactor: &Reactor, fd: RawFd, event: IoEvent) {
        if self.dead.get() {
            return;
        }
        match event {
            IoEvent::Read => self.handle_readable(),
            IoEvent::Write => self.handle_writable(),
            IoEvent::Fault(fail) => self.handle_fault(fd, fail),
            // Deregistration is always driven by the channel itself.
            IoEvent::Destroy => {}
        }
    }
}

impl Shared {
    /// Queues events for the handler and drains the queue unless an outer
    /// delivery is already doing so. Handler callbacks may re-enter any
    /// channel method; re-entrant deliveries only extend the queue.
    fn deliver(&self, events: Vec<ChannelEvent>) {
        self.pending.borrow_mut().extend(events);
        if self.delivering.replace(true) {
            return;
        }
        let Some(rc) = self.weak.upgrade() else {
            self.delivering.set(false);
            return;
        };
        let channel = Channel { shared: rc };
        loop {
            let Some(event) = self.pending.borrow_mut().pop_front() else {
                break;
            };
            self.handler.borrow_mut().on_event(&channel, event);
        }
        self.delivering.set(false);
        let deferred = self.deferred_close.borrow_mut().take();
        if let Some(args) = deferred {
            self.request_close(args);
        }
    }

    /// Aligns poller interest with the channel state. Reads are wanted while
    /// the read side is open, unthrottled and not paused by a seek; writes
    /// are wanted while the output queue holds anything (including queued
    /// commands awaiting execution).
    fn sync_interest(&self, inner: &Inner) {
        if self.dead.get() {
            return;
        }
        let read_on = inner.rfd.is_some()
            && inner.rstate == DirState::Open
            && inner.throttle == 0
            && !inner.seek_paused;
        let write_on = inner.wfd.is_some() && !inner.wqueue.is_empty();

        match (inner.rfd, inner.wfd) {
            (Some(rfd), Some(wfd)) if rfd == wfd => {
                let _ = self.reactor.set_interest(rfd, IoType {
                    read: read_on,
                    write: write_on,
                });
            }
            (rfd, wfd) => {
                if let Some(rfd) = rfd {
                    let _ = self.reactor.set_interest(rfd, IoType {
                        read: read_on,
                        write: false,
                    });
                }
                if let Some(wfd) = wfd {
                    let _ = self.reactor.set_interest(wfd, IoType {
                        read: false,
                        write: write_on,
                    });
                }
            }
        }
    }

    fn handle_readable(&self) {
        let mut events = vec![];
        let mut drained = None;
        {
            let mut inner = self.inner.borrow_mut();
            if inner.rstate != DirState::Open || inner.throttle > 0 || inner.seek_paused {
                self.sync_interest(&inner);
                return;
            }
            let rfd = match inner.rfd {
                Some(fd) => fd,
                None => return,
            };

            let mut eof = false;
            let mut buf = vec![0u8; inner.cfg.read_hint.max(1)];
            match fd::read(rfd, &mut buf) {
                IoStatus::Success(n) => {
                    buf.truncate(n);
                    inner.rqueue.push(Chunk::new(Rc::from(buf)));
                }
                IoStatus::WouldBlock => {}
                IoStatus::Shutdown => eof = true,
                IoStatus::Err(err) => {
                    inner.rstate = DirState::Error;
                    events.push(ChannelEvent::ReadError(err));
                    self.sync_interest(&inner);
                    drop(inner);
                    self.deliver(events);
                    return;
                }
            }

            let Inner {
                cfg,
                rqueue,
                fstate,
                rstate,
                ..
            } = &mut *inner;
            loop {
                match frame::scan(
                    cfg.mode,
                    rqueue,
                    fstate,
                    cfg.read_hint,
                    cfg.in_max,
                    cfg.delimiter,
                ) {
                    Scan::None => break,
                    Scan::Complete(msg) => events.push(ChannelEvent::ReadComplete(msg)),
                    Scan::Incomplete(msg) => events.push(ChannelEvent::IncompleteRead(msg)),
                    Scan::Oversize { len, max } => {
                        *rstate = DirState::Error;
                        events.push(ChannelEvent::ReadError(io::Error::new(
                            io::ErrorKind::InvalidData,
                            ChannelError::OversizeFrame { len, max },
                        )));
                        break;
                    }
                }
            }

            if eof {
                let partial = rqueue.take_all();
                if !partial.is_empty() {
                    events.push(ChannelEvent::IncompleteRead(partial));
                }
                fstate.reset();
                *rstate = DirState::Shutdown;
                events.push(ChannelEvent::ReadEof);
                drained = Some(rfd);
            }
            self.sync_interest(&inner);
        }
        if let Some(fd) = drained {
            self.release_if_unused(fd);
        }
        self.deliver(events);
    }

    fn handle_writable(&self) {
        let mut events = vec![];
        let mut queued_close = None;
        'outer: loop {
            if self.dead.get() {
                break;
            }
            let mut command = None;
            {
                let mut inner = self.inner.borrow_mut();
                let wfd = inner.wfd;
                #[cfg(feature = "compression")]
                if inner.cfg.compress {
                    if let Err(err) = crate::compress::coalesce(&mut inner.wqueue) {
                        inner.wstate = DirState::Error;
                        events.push(ChannelEvent::WriteError(err));
                        queued_close = self.abort_queue(&mut inner, &mut events);
                        self.sync_interest(&inner);
                        break;
                    }
                }
                loop {
                    // The writer may already be released while commands
                    // queued behind data still await execution; the data
                    // itself is discarded.
                    let Some(wfd) = wfd else {
                        match inner.wqueue.pop_front() {
                            None => {
                                self.sync_interest(&inner);
                                break 'outer;
                            }
                            Some(QueueItem::Command(cmd)) => {
                                command = Some(cmd);
                                break;
                            }
                            Some(QueueItem::Data(seg)) => {
                                if !seg.internal {
                                    events.push(ChannelEvent::WriteAborted(seg.data));
                                }
                                for carried in seg.carried {
                                    events.push(ChannelEvent::WriteAborted(carried));
                                }
                                continue;
                            }
                        }
                    };
                    match inner.wqueue.front_mut() {
                        None => {
                            self.sync_interest(&inner);
                            break 'outer;
                        }
                        Some(QueueItem::Command(_)) => {
                            match inner.wqueue.pop_front() {
                                Some(QueueItem::Command(cmd)) => command = Some(cmd),
                                _ => unreachable!("front was a command"),
                            }
                            break;
                        }
                        Some(QueueItem::Data(seg)) => {
                            let slice_start = seg.sent;
                            match fd::write(wfd, &seg.data[slice_start..]) {
                                IoStatus::Success(n) => {
                                    if let Some(seg) = inner.wqueue.advance(n) {
                                        if !seg.internal {
                                            events.push(ChannelEvent::WriteComplete(seg.data));
                                        }
                                        for carried in seg.carried {
                                            events.push(ChannelEvent::WriteComplete(carried));
                                        }
                                    }
                                }
                                IoStatus::WouldBlock | IoStatus::Shutdown => {
                                    self.sync_interest(&inner);
                                    break 'outer;
                                }
                                IoStatus::Err(err) => {
                                    inner.wstate = DirState::Error;
                                    events.push(ChannelEvent::WriteError(err));
                                    queued_close = self.abort_queue(&mut inner, &mut events);
                                    self.sync_interest(&inner);
                                    break 'outer;
                                }
                            }
                        }
                    }
                }
            }
            // Commands execute outside the queue borrow so their handlers
            // can touch the reactor and deliver events.
            match command {
                Some(Command::ShutdownWrite) => self.finish_shutdown_write(&mut events),
                Some(Command::Seek(pos)) => self.finish_seek(pos, &mut events),
                Some(Command::Close(args)) => {
                    self.destroy(args, &mut events);
                    break;
                }
                None => {}
            }
        }
        if let Some(args) = queued_close {
            self.destroy(args, &mut events);
        }
        self.deliver(events);
    }

    fn handle_fault(&self, fd: RawFd, fail: IoFail) {
        let is_read_side = self.inner.borrow().rfd == Some(fd);
        if matches!(fail, IoFail::Connectivity) && is_read_side {
            // Hang-up on the read side: drain whatever is left, then the
            // zero-length read reports EOF through the regular path.
            self.handle_readable();
            self.release_if_unused(fd);
            return;
        }
        let mut events = vec![];
        let mut queued_close = None;
        {
            let mut inner = self.inner.borrow_mut();
            let err_kind = match fail {
                IoFail::Connectivity => io::ErrorKind::ConnectionReset,
                IoFail::Os => io::ErrorKind::Other,
            };
            if inner.rfd == Some(fd) && inner.rstate == DirState::Open {
                inner.rstate = DirState::Error;
                events.push(ChannelEvent::ReadError(io::Error::new(
                    err_kind,
                    "descriptor fault",
                )));
            }
            if inner.wfd == Some(fd) && inner.wstate == DirState::Open {
                inner.wstate = DirState::Error;
                events.push(ChannelEvent::WriteError(io::Error::new(
                    err_kind,
                    "descriptor fault",
                )));
                queued_close = self.abort_queue(&mut inner, &mut events);
            }
            self.sync_interest(&inner);
        }
        if let Some(args) = queued_close {
            self.destroy(args, &mut events);
        } else {
            self.release_if_unused(fd);
        }
        self.deliver(events);
    }

    /// Removes a descriptor from the poller once neither direction can use
    /// it any more. Hang-up and error conditions are reported by `poll(2)`
    /// regardless of interest and would otherwise fire every iteration.
    fn release_if_unused(&self, fd: RawFd) {
        if self.dead.get() {
            return;
        }
        let inner = self.inner.borrow();
        let read_live = inner.rfd == Some(fd) && inner.rstate == DirState::Open;
        // Commands queued behind a completed shutdown still need write
        // readiness to execute.
        let write_live = inner.wfd == Some(fd)
            && (matches!(inner.wstate, DirState::Open | DirState::ShutdownPending)
                || !inner.wqueue.is_empty());
        if !read_live && !write_live && self.reactor.is_registered(fd) {
            let _ = self.reactor.deregister(fd);
        }
    }

    /// Discards queued output, reporting each user buffer back. A queued
    /// seek fails in place; a queued close is handed back to the caller,
    /// which must run the teardown once the `inner` borrow is released.
    fn abort_queue(&self, inner: &mut Inner, events: &mut Vec<ChannelEvent>) -> Option<CloseArgs> {
        let mut close = None;
        for item in inner.wqueue.drain() {
            match item {
                QueueItem::Data(seg) => {
                    if !seg.internal {
                        events.push(ChannelEvent::WriteAborted(seg.data));
                    }
                    for carried in seg.carried {
                        events.push(ChannelEvent::WriteAborted(carried));
                    }
                }
                QueueItem::Command(Command::Seek(_)) => {
                    inner.seek_paused = false;
                    events.push(ChannelEvent::SeekFailure(io::Error::new(
                        io::ErrorKind::Other,
                        "seek discarded with the output queue",
                    )));
                }
                QueueItem::Command(Command::Close(args)) => close = Some(args),
                QueueItem::Command(Command::ShutdownWrite) => {}
            }
        }
        close
    }

    fn finish_shutdown_write(&self, events: &mut Vec<ChannelEvent>) {
        let mut inner = self.inner.borrow_mut();
        let Some(wfd) = inner.wfd else { return };
        inner.wstate = DirState::Shutdown;
        match fd::shutdown_write(wfd) {
            Ok(()) => {}
            Err(err) if err.raw_os_error() == Some(libc::ENOTSOCK) => {
                // Pipes have no half-close; releasing the descriptor is the
                // only way to signal EOF downstream. A shared descriptor is
                // left alone since the read side still needs it.
                if inner.rfd != Some(wfd) {
                    let _ = self.reactor.deregister(wfd);
                    let keep = inner.cfg.keep_fds;
                    if let Some(idx) = inner.saved.iter().position(|(fd, _)| *fd == wfd) {
                        let (fd, flags) = inner.saved.remove(idx);
                        if keep {
                            let _ = fd::restore_flags(fd, flags);
                        } else {
                            fd::close(fd);
                        }
                    }
                    inner.wfd = None;
                }
            }
            Err(err) => {
                inner.wstate = DirState::Error;
                events.push(ChannelEvent::WriteError(err));
            }
        }
        self.sync_interest(&inner);
    }

    fn finish_seek(&self, pos: SeekFrom, events: &mut Vec<ChannelEvent>) {
        let mut inner = self.inner.borrow_mut();
        let Some(fd) = inner.rfd.or(inner.wfd) else { return };
        match fd::seek(fd, pos) {
            Ok(offset) => {
                // Buffered input refers to the old file position.
                inner.rqueue.clear();
                inner.fstate.reset();
                events.push(ChannelEvent::SeekSuccess(offset));
            }
            Err(err) => events.push(ChannelEvent::SeekFailure(err)),
        }
        inner.seek_paused = false;
        self.sync_interest(&inner);
    }

    /// Initiates channel teardown, honoring delivery re-entrancy and
    /// pending output.
    fn request_close(&self, args: CloseArgs) {
        if self.dead.get() {
            return;
        }
        if self.delivering.get() {
            let mut slot = self.deferred_close.borrow_mut();
            let merged = match slot.take() {
                Some(prev) => CloseArgs {
                    abort: prev.abort || args.abort,
                    notify: prev.notify || args.notify,
                    keep_fds: prev.keep_fds || args.keep_fds,
                },
                None => args,
            };
            *slot = Some(merged);
            return;
        }
        let immediate = {
            let mut inner = self.inner.borrow_mut();
            if args.abort || inner.wqueue.is_empty() {
                true
            } else if inner.closing {
                false
            } else {
                inner.closing = true;
                inner.wqueue.push_command(Command::Close(args));
                self.sync_interest(&inner);
                false
            }
        };
        if immediate {
            let mut events = vec![];
            self.destroy(args, &mut events);
            self.deliver(events);
        }
    }

    /// Final teardown: deregisters and releases descriptors, reports
    /// discarded output. Idempotent.
    fn destroy(&self, mut args: CloseArgs, events: &mut Vec<ChannelEvent>) {
        if self.dead.replace(true) {
            return;
        }
        #[cfg(feature = "log")]
        log::debug!(target: "fdpipe", "Closing channel (abort={})", args.abort);
        let mut inner = self.inner.borrow_mut();
        for fd in [inner.rfd, inner.wfd].into_iter().flatten() {
            if self.reactor.is_registered(fd) {
                let _ = self.reactor.deregister(fd);
            }
        }
        // An earlier graceful close may still sit in the queue; its wishes
        // are folded into the teardown that overtook it.
        if let Some(queued) = self.abort_queue(&mut inner, events) {
            args.notify |= queued.notify;
            args.keep_fds |= queued.keep_fds;
        }
        inner.rqueue.clear();
        let keep = args.keep_fds || inner.cfg.keep_fds;
        for (fd, flags) in inner.saved.drain(..) {
            if keep {
                if let Err(_err) = fd::restore_flags(fd, flags) {
                    #[cfg(feature = "log")]
                    log::warn!(target: "fdpipe", "Failed to restore flags on released {fd}: {_err}");
                }
            } else {
                fd::close(fd);
            }
        }
        inner.rfd = None;
        inner.wfd = None;
        if args.notify {
            events.push(ChannelEvent::Closing);
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.shared.inner.borrow();
        f.debug_struct("Channel")
            .field("input", &inner.rfd)
            .field("output", &inner.wfd)
            .field("mode", &inner.cfg.mode)
            .field("queued", &inner.wqueue.bytes())
            .field("closed", &self.shared.dead.get())
            .finish()
    }
}
