// Buffered framed I/O channels over file descriptors
//
// SPDX-License-Identifier: Apache-2.0

//! Blocking facade over a [`Channel`] for code living outside the reactor
//! thread.
//!
//! A [`SyncChannel`] stays on the reactor thread and bridges channel events
//! into a mutex-protected inbox; any number of [`SyncHandle`]s may be sent
//! to other threads and block on it with optional timeouts. Outbound buffers
//! travel the opposite way through a bounded queue drained by a recurring
//! reactor timer.

use std::collections::VecDeque;
use std::io;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use fdmux::{Reactor, TimerId};

use crate::channel::{
    Channel, ChannelConfig, ChannelError, ChannelEvent, WriteOutcome,
};

/// How often the reactor drains the outbound queue of a [`SyncChannel`].
const PUMP_INTERVAL: Duration = Duration::from_millis(5);

/// Cap on outbound buffers waiting to enter the channel.
const PENDING_CAP: usize = 32;

/// Outcome of a blocking read.
#[derive(Debug)]
pub enum SyncRead {
    /// A complete frame.
    Data(Vec<u8>),
    /// The timeout elapsed with nothing to deliver.
    WouldWait,
    /// The stream ended; no further data follows.
    Eof,
    /// The channel was cancelled; every later call returns this too.
    Cancelled,
    /// Reading failed.
    Error(io::Error),
}

/// Outcome of a blocking write.
#[derive(Debug)]
pub enum SyncWrite {
    /// The buffer was queued for writing.
    Accepted,
    /// The timeout elapsed before the queue had room; the buffer is handed
    /// back untouched.
    WouldWait(Vec<u8>),
    /// The channel was cancelled.
    Cancelled,
    /// The channel is closed and accepts no further writes.
    Closed,
}

#[derive(Debug)]
enum Delivered {
    Data(Vec<u8>),
    Eof,
    Error(io::Error),
}

struct SharedState {
    fifo: Mutex<VecDeque<Delivered>>,
    read_ready: Condvar,
    pending: Mutex<VecDeque<Vec<u8>>>,
    write_progress: Condvar,
    cancelled: AtomicBool,
    closed: AtomicBool,
    /// The stream ended; sticky so every read past the buffered frames
    /// reports EOF.
    eof: AtomicBool,
}

/// Recovers the guard from a poisoned mutex; the queues stay consistent
/// across a panicking reader or writer.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poison| poison.into_inner())
}

impl SharedState {
    fn wake_all(&self) {
        self.read_ready.notify_all();
        self.write_progress.notify_all();
    }

    fn absorb(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::ReadComplete(msg) | ChannelEvent::IncompleteRead(msg) => {
                lock(&self.fifo).push_back(Delivered::Data(msg.to_vec()));
                self.read_ready.notify_all();
            }
            ChannelEvent::ReadEof => {
                self.eof.store(true, Ordering::Release);
                lock(&self.fifo).push_back(Delivered::Eof);
                self.read_ready.notify_all();
            }
            ChannelEvent::ReadError(err) => {
                lock(&self.fifo).push_back(Delivered::Error(err));
                self.read_ready.notify_all();
            }
            ChannelEvent::WriteComplete(_) | ChannelEvent::WriteAborted(_) => {
                self.write_progress.notify_all();
            }
            ChannelEvent::WriteError(_) | ChannelEvent::Closing => {
                self.closed.store(true, Ordering::Release);
                self.wake_all();
            }
            ChannelEvent::SeekSuccess(_) | ChannelEvent::SeekFailure(_) => {}
        }
    }
}

/// Reactor-thread end of the blocking adapter. Dropping it cancels the pump
/// timer and closes the channel gracefully.
pub struct SyncChannel {
    channel: Channel,
    shared: Arc<SharedState>,
    reactor: Rc<Reactor>,
    pump_id: TimerId,
}

/// Thread-safe handle blocking on the adapted channel.
#[derive(Clone)]
pub struct SyncHandle {
    shared: Arc<SharedState>,
}

impl SyncChannel {
    /// Spawns a channel over `cfg` and wraps it for blocking use.
    pub fn attach(reactor: &Rc<Reactor>, cfg: ChannelConfig) -> Result<SyncChannel, ChannelError> {
        let shared = Arc::new(SharedState {
            fifo: Mutex::new(VecDeque::new()),
            read_ready: Condvar::new(),
            pending: Mutex::new(VecDeque::new()),
            write_progress: Condvar::new(),
            cancelled: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            eof: AtomicBool::new(false),
        });

        let sink = Arc::clone(&shared);
        let channel = Channel::spawn(reactor, cfg, move |_: &Channel, event| {
            sink.absorb(event)
        })?;

        let pump_shared = Arc::clone(&shared);
        let pump_chan = channel.clone();
        let pump_id = reactor.schedule_cron(PUMP_INTERVAL, move |_: &Reactor| {
            Self::pump(&pump_chan, &pump_shared);
        });

        Ok(SyncChannel {
            channel,
            shared,
            reactor: Rc::clone(reactor),
            pump_id,
        })
    }

    /// Moves queued outbound buffers into the channel until it pushes back.
    fn pump(channel: &Channel, shared: &SharedState) {
        let mut progressed = false;
        loop {
            let Some(data) = lock(&shared.pending).pop_front() else {
                break;
            };
            match channel.write(data, false) {
                Ok(WriteOutcome::Accepted) => progressed = true,
                Ok(WriteOutcome::QueueFull(data)) => {
                    lock(&shared.pending).push_front(data);
                    break;
                }
                Err(_) => {
                    shared.closed.store(true, Ordering::Release);
                    shared.wake_all();
                    return;
                }
            }
        }
        if progressed {
            shared.write_progress.notify_all();
        }
    }

    /// Detaches a handle usable from any thread.
    pub fn handle(&self) -> SyncHandle {
        SyncHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn channel(&self) -> &Channel { &self.channel }

    /// Blocking read for callers on the reactor thread: drives the loop
    /// itself until a frame arrives, the timeout elapses or the stream ends.
    pub fn read_on(&self, timeout: Option<Duration>) -> SyncRead {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.shared.cancelled.load(Ordering::Acquire) {
                return SyncRead::Cancelled;
            }
            if let Some(delivered) = lock(&self.shared.fifo).pop_front() {
                return delivered.into();
            }
            if self.shared.closed.load(Ordering::Acquire)
                || self.shared.eof.load(Ordering::Acquire)
            {
                return SyncRead::Eof;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return SyncRead::WouldWait;
            }
            if let Err(err) = self.reactor.run_once(false) {
                return SyncRead::Error(io::Error::new(io::ErrorKind::Other, err.to_string()));
            }
        }
    }

    /// Blocking write for callers on the reactor thread.
    pub fn write_on(&self, data: Vec<u8>, timeout: Option<Duration>) -> SyncWrite {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut data = data;
        loop {
            if self.shared.cancelled.load(Ordering::Acquire) {
                return SyncWrite::Cancelled;
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return SyncWrite::Closed;
            }
            match self.channel.write(data, false) {
                Ok(WriteOutcome::Accepted) => return SyncWrite::Accepted,
                Ok(WriteOutcome::QueueFull(returned)) => data = returned,
                Err(_) => return SyncWrite::Closed,
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return SyncWrite::WouldWait(data);
            }
            if self.reactor.run_once(false).is_err() {
                return SyncWrite::Closed;
            }
        }
    }

    /// Cancels the adapter: every blocked and future handle call returns
    /// `Cancelled`. The cancellation is sticky.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::Release);
        self.shared.wake_all();
    }
}

impl Drop for SyncChannel {
    fn drop(&mut self) {
        self.reactor.cancel(self.pump_id);
        self.shared.closed.store(true, Ordering::Release);
        self.shared.wake_all();
        if !self.channel.is_closed() {
            self.channel.close(false, false, false);
        }
    }
}

impl From<Delivered> for SyncRead {
    fn from(delivered: Delivered) -> Self {
        match delivered {
            Delivered::Data(data) => SyncRead::Data(data),
            Delivered::Eof => SyncRead::Eof,
            Delivered::Error(err) => SyncRead::Error(err),
        }
    }
}

impl SyncHandle {
    /// Blocks until a frame arrives, the stream ends, the timeout elapses
    /// or the adapter is cancelled. `None` waits indefinitely.
    pub fn read(&self, timeout: Option<Duration>) -> SyncRead {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut fifo = lock(&self.shared.fifo);
        loop {
            if self.shared.cancelled.load(Ordering::Acquire) {
                return SyncRead::Cancelled;
            }
            if let Some(delivered) = fifo.pop_front() {
                return delivered.into();
            }
            if self.shared.closed.load(Ordering::Acquire)
                || self.shared.eof.load(Ordering::Acquire)
            {
                return SyncRead::Eof;
            }
            fifo = match deadline {
                None => self
                    .shared
                    .read_ready
                    .wait(fifo)
                    .unwrap_or_else(|poison| poison.into_inner()),
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return SyncRead::WouldWait;
                    }
                    let (guard, _timed_out) = self
                        .shared
                        .read_ready
                        .wait_timeout(fifo, left)
                        .unwrap_or_else(|poison| poison.into_inner());
                    guard
                }
            };
        }
    }

    /// Blocks until the outbound queue has room for `data`, then queues it.
    pub fn write(&self, data: Vec<u8>, timeout: Option<Duration>) -> SyncWrite {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut pending = lock(&self.shared.pending);
        loop {
            if self.shared.cancelled.load(Ordering::Acquire) {
                return SyncWrite::Cancelled;
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return SyncWrite::Closed;
            }
            if pending.len() < PENDING_CAP {
                pending.push_back(data);
                return SyncWrite::Accepted;
            }
            pending = match deadline {
                None => self
                    .shared
                    .write_progress
                    .wait(pending)
                    .unwrap_or_else(|poison| poison.into_inner()),
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return SyncWrite::WouldWait(data);
                    }
                    let (guard, _timed_out) = self
                        .shared
                        .write_progress
                        .wait_timeout(pending, left)
                        .unwrap_or_else(|poison| poison.into_inner());
                    guard
                }
            };
        }
    }

    /// Cancels the adapter from any thread; see [`SyncChannel::cancel`].
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::Release);
        self.shared.wake_all();
    }

    pub fn is_cancelled(&self) -> bool { self.shared.cancelled.load(Ordering::Acquire) }

    pub fn is_closed(&self) -> bool { self.shared.closed.load(Ordering::Acquire) }
}
