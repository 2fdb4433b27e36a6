use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::poller::popol::Poller;
use crate::poller::{IoFail, IoType, Poll};
use crate::signals::{self, MAX_SIGNAL};
use crate::timeouts::{TimeoutManager, TimerId};

/// Errors returned by [`Reactor`] operations.
#[derive(Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum Error {
    /// file descriptor {0} is not open
    InvalidFd(RawFd),

    /// file descriptor {0} is already registered with the reactor
    AlreadyRegistered(RawFd),

    /// file descriptor {0} is not registered with the reactor
    NotRegistered(RawFd),

    /// signal number {0} is outside the supported range
    InvalidSignal(i32),

    /// polling error. Details: {0}
    #[from]
    Poll(io::Error),
}

/// Readiness notification delivered to an [`EventHandler`].
#[derive(Debug)]
pub enum IoEvent {
    /// The descriptor has data (or EOF) to read.
    Read,
    /// The descriptor accepts writes without blocking.
    Write,
    /// The descriptor entered an error or hang-up condition.
    Fault(IoFail),
    /// The descriptor was removed from the reactor; no further events follow.
    Destroy,
}

/// I/O event sink attached to a registered descriptor.
pub trait EventHandler {
    fn event(&self, reactor: &Reactor, fd: RawFd, event: IoEvent);
}

enum TimerCb {
    Oneshot(Box<dyn FnOnce(&Reactor)>),
    Cron {
        interval: Duration,
        cb: Box<dyn FnMut(&Reactor)>,
    },
}

struct Registration {
    handler: Rc<dyn EventHandler>,
    interest: IoType,
}

/// Single-threaded readiness event loop multiplexing file descriptors,
/// timers and POSIX signals.
///
/// All registered callbacks run on the thread calling [`Reactor::run`] or
/// [`Reactor::run_once`]; handlers may freely call back into the reactor.
pub struct Reactor {
    poller: RefCell<Box<dyn Poll>>,
    registry: RefCell<HashMap<RawFd, Registration>>,
    timers: RefCell<TimeoutManager>,
    timer_cbs: RefCell<HashMap<TimerId, TimerCb>>,
    signal_cbs: RefCell<HashMap<i32, Vec<Box<dyn FnMut(&Reactor, i32)>>>>,
    demand: RefCell<Option<Box<dyn Fn() -> bool>>>,
    tick: RefCell<Option<Box<dyn FnMut(&Reactor)>>>,
    stop: Cell<bool>,
    firing: Cell<Option<TimerId>>,
    firing_cancelled: Cell<bool>,
}

impl Reactor {
    /// Creates a reactor backed by the default `poll(2)` poller.
    pub fn new() -> Self { Self::with_poller(Box::new(Poller::new())) }

    pub fn with_poller(poller: Box<dyn Poll>) -> Self {
        Self {
            poller: RefCell::new(poller),
            registry: empty!(),
            timers: RefCell::new(TimeoutManager::new()),
            timer_cbs: empty!(),
            signal_cbs: empty!(),
            demand: RefCell::new(None),
            tick: RefCell::new(None),
            stop: Cell::new(false),
            firing: Cell::new(None),
            firing_cancelled: Cell::new(false),
        }
    }

    /// Registers a descriptor with its event handler and initial interest.
    pub fn register(
        &self,
        fd: RawFd,
        interest: IoType,
        handler: Rc<dyn EventHandler>,
    ) -> Result<(), Error> {
        if unsafe { libc::fcntl(fd, libc::F_GETFD) } == -1 {
            return Err(Error::InvalidFd(fd));
        }
        let mut registry = self.registry.borrow_mut();
        if registry.contains_key(&fd) {
            return Err(Error::AlreadyRegistered(fd));
        }
        #[cfg(feature = "log")]
        log::trace!(target: "reactor", "Registering {fd} with interest {interest}");
        self.poller.borrow_mut().register(fd, interest);
        registry.insert(fd, Registration { handler, interest });
        Ok(())
    }

    /// Updates the interest mask of a registered descriptor.
    pub fn set_interest(&self, fd: RawFd, interest: IoType) -> Result<(), Error> {
        let mut registry = self.registry.borrow_mut();
        let reg = registry.get_mut(&fd).ok_or(Error::NotRegistered(fd))?;
        if reg.interest != interest {
            reg.interest = interest;
            self.poller.borrow_mut().set_interest(fd, interest);
        }
        Ok(())
    }

    /// Current interest mask of a registered descriptor.
    pub fn interest(&self, fd: RawFd) -> Result<IoType, Error> {
        self.registry
            .borrow()
            .get(&fd)
            .map(|reg| reg.interest)
            .ok_or(Error::NotRegistered(fd))
    }

    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.registry.borrow().contains_key(&fd)
    }

    /// Removes a descriptor. The handler receives a final [`IoEvent::Destroy`]
    /// and is then released; the descriptor itself is left open.
    pub fn deregister(&self, fd: RawFd) -> Result<(), Error> {
        let reg = self
            .registry
            .borrow_mut()
            .remove(&fd)
            .ok_or(Error::NotRegistered(fd))?;
        #[cfg(feature = "log")]
        log::trace!(target: "reactor", "Deregistering {fd}");
        self.poller.borrow_mut().unregister(fd);
        reg.handler.event(self, fd, IoEvent::Destroy);
        Ok(())
    }

    /// Schedules a one-shot callback to run after `delay`.
    pub fn schedule(&self, delay: Duration, cb: impl FnOnce(&Reactor) + 'static) -> TimerId {
        let id = self.timers.borrow_mut().register(Instant::now() + delay);
        self.timer_cbs
            .borrow_mut()
            .insert(id, TimerCb::Oneshot(Box::new(cb)));
        id
    }

    /// Schedules a recurring callback firing every `interval`. The next
    /// deadline is computed from the scheduled time, not the delivery time,
    /// so delivery jitter does not accumulate.
    pub fn schedule_cron(
        &self,
        interval: Duration,
        cb: impl FnMut(&Reactor) + 'static,
    ) -> TimerId {
        let id = self.timers.borrow_mut().register(Instant::now() + interval);
        self.timer_cbs.borrow_mut().insert(
            id,
            TimerCb::Cron {
                interval,
                cb: Box::new(cb),
            },
        );
        id
    }

    /// Cancels a pending timer. Safe to call from within the timer's own
    /// callback; the cron then does not re-arm.
    pub fn cancel(&self, id: TimerId) -> bool {
        if self.firing.get() == Some(id) {
            self.firing_cancelled.set(true);
            return true;
        }
        let cancelled = self.timers.borrow_mut().cancel(id);
        if cancelled {
            self.timer_cbs.borrow_mut().remove(&id);
        }
        cancelled
    }

    /// Registers a callback invoked on delivery of a POSIX signal. Multiple
    /// callbacks per signal run in registration order.
    pub fn register_signal(
        &self,
        signum: i32,
        cb: impl FnMut(&Reactor, i32) + 'static,
    ) -> Result<(), Error> {
        if !(1..=MAX_SIGNAL).contains(&signum) {
            return Err(Error::InvalidSignal(signum));
        }
        let mut cbs = self.signal_cbs.borrow_mut();
        let list = cbs.entry(signum).or_default();
        if list.is_empty() {
            signals::install(signum)?;
        }
        list.push(Box::new(cb));
        Ok(())
    }

    /// Installs a predicate polled before each blocking wait; while it
    /// returns `true` the reactor does not sleep.
    pub fn set_demand(&self, pred: impl Fn() -> bool + 'static) {
        *self.demand.borrow_mut() = Some(Box::new(pred));
    }

    pub fn clear_demand(&self) { *self.demand.borrow_mut() = None; }

    /// Installs a callback invoked at the end of every loop iteration.
    pub fn set_tick(&self, cb: impl FnMut(&Reactor) + 'static) {
        *self.tick.borrow_mut() = Some(Box::new(cb));
    }

    pub fn clear_tick(&self) { *self.tick.borrow_mut() = None; }

    /// Asks [`Reactor::run`] to return after the current iteration.
    pub fn request_stop(&self) { self.stop.set(true); }

    /// Runs the loop until [`Reactor::request_stop`] is called from a
    /// handler, timer or signal callback.
    pub fn run(&self) -> Result<(), Error> {
        self.stop.set(false);
        while !self.stop.get() {
            self.run_once(false)?;
        }
        Ok(())
    }

    /// Performs a single loop iteration. With `nonblocking` set the poll
    /// does not sleep even when no timer is due.
    pub fn run_once(&self, nonblocking: bool) -> Result<(), Error> {
        let now = Instant::now();
        let demand = self
            .demand
            .borrow()
            .as_ref()
            .map(|pred| pred())
            .unwrap_or(false);
        let timeout = if nonblocking || demand {
            Some(Duration::ZERO)
        } else {
            self.timers.borrow_mut().next(now)
        };

        match self.poller.borrow_mut().poll(timeout) {
            Ok(_) => {}
            // A signal arrived; fall through to drain the signal counters.
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(Error::Poll(err)),
        }

        self.deliver_signals();
        self.fire_timers();
        self.dispatch_io();
        self.run_tick();

        Ok(())
    }

    fn deliver_signals(&self) {
        let signums: Vec<i32> = self.signal_cbs.borrow().keys().copied().collect();
        for signum in signums {
            let pending = signals::take_pending(signum);
            if pending == 0 {
                continue;
            }
            #[cfg(feature = "log")]
            log::trace!(target: "reactor", "Signal {signum} delivered {pending} time(s)");
            // Callbacks are moved out so they may register further signal
            // handlers without hitting the RefCell.
            let Some(mut list) = self.signal_cbs.borrow_mut().remove(&signum) else {
                continue;
            };
            for _ in 0..pending {
                for cb in list.iter_mut() {
                    cb(self, signum);
                }
            }
            let mut cbs = self.signal_cbs.borrow_mut();
            match cbs.remove(&signum) {
                // Callbacks added during delivery go after the existing ones.
                Some(added) => list.extend(added),
                None => {}
            }
            cbs.insert(signum, list);
        }
    }

    fn fire_timers(&self) {
        let now = Instant::now();
        let mut woken = Vec::new();
        self.timers.borrow_mut().wake(now, &mut woken);
        for (id, when) in woken {
            let Some(cb) = self.timer_cbs.borrow_mut().remove(&id) else {
                continue;
            };
            match cb {
                TimerCb::Oneshot(cb) => cb(self),
                TimerCb::Cron { interval, mut cb } => {
                    self.firing.set(Some(id));
                    self.firing_cancelled.set(false);
                    cb(self);
                    self.firing.set(None);
                    if !self.firing_cancelled.replace(false) {
                        self.timers.borrow_mut().reschedule(id, when + interval);
                        self.timer_cbs
                            .borrow_mut()
                            .insert(id, TimerCb::Cron { interval, cb });
                    }
                }
            }
        }
    }

    fn dispatch_io(&self) {
        let mut ready = Vec::new();
        {
            let mut poller = self.poller.borrow_mut();
            while let Some(ev) = poller.next() {
                ready.push(ev);
            }
        }
        for (fd, res) in ready {
            let Some((handler, interest)) = self
                .registry
                .borrow()
                .get(&fd)
                .map(|reg| (Rc::clone(&reg.handler), reg.interest))
            else {
                continue;
            };
            match res {
                Err(fail) => handler.event(self, fd, IoEvent::Fault(fail)),
                Ok(io) => {
                    // Writes go first so queued output drains before new
                    // input is accepted.
                    if io.write && interest.write {
                        handler.event(self, fd, IoEvent::Write);
                    }
                    if io.read && interest.read && self.is_registered(fd) {
                        handler.event(self, fd, IoEvent::Read);
                    }
                }
            }
        }
    }

    fn run_tick(&self) {
        let Some(mut cb) = self.tick.borrow_mut().take() else {
            return;
        };
        cb(self);
        let mut slot = self.tick.borrow_mut();
        if slot.is_none() {
            *slot = Some(cb);
        }
    }
}

impl Default for Reactor {
    fn default() -> Self { Self::new() }
}
