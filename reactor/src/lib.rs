//! Single-threaded readiness reactor ([`Reactor`]) multiplexing descriptor
//! I/O, one-shot and recurring timers, and deferred POSIX signal delivery.
//!
//! The reactor blocks in a single `poll(2)` call until a descriptor becomes
//! ready or the nearest timer deadline expires, then dispatches callbacks for
//! pending signals, due timers and ready descriptors, all synchronously in
//! the context of the thread driving [`Reactor::run_once`] or
//! [`Reactor::run`]. Handlers may call back into the reactor (register or
//! deregister descriptors, schedule timers, request a stop) from within their
//! own dispatch.
//!
//! Multiple independent reactors may coexist (e.g. one per worker thread),
//! but a single instance must only ever be driven and accessed by one thread.

#[macro_use]
extern crate amplify;

pub mod poller;
mod reactor;
mod signals;
mod timeouts;

pub use poller::{IoFail, IoType, Poll};
pub use reactor::{Error, EventHandler, IoEvent, Reactor};
pub use signals::MAX_SIGNAL;
pub use timeouts::{TimeoutManager, TimerId};
