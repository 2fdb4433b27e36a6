// Buffered framed I/O channels over file descriptors
//
// SPDX-License-Identifier: Apache-2.0

//! Buffered, framed, event-driven I/O over raw file descriptors.
//!
//! The crate builds on the [`fdmux`] reactor and provides three layers:
//! - [`Channel`]: a buffered duplex (or simplex) channel over one or two
//!   descriptors, slicing the byte stream into frames and queueing writes
//!   with bounded memory;
//! - [`Relay`]: a coupler pumping data between two channels with
//!   cross-backpressure and half-close propagation;
//! - [`SyncChannel`]/[`SyncHandle`]: a blocking facade over a channel for
//!   code living outside the reactor thread.

#[macro_use]
extern crate amplify;

pub mod blocking;
mod channel;
#[cfg(feature = "compression")]
mod compress;
mod fd;
mod frame;
mod queue;
mod relay;

pub use blocking::{SyncChannel, SyncHandle, SyncRead, SyncWrite};
pub use channel::{
    Channel, ChannelConfig, ChannelError, ChannelEvent, ChannelHandler, Direction, WriteOutcome,
};
pub use frame::{FrameMode, UnknownFrameMode, LENGTH_PREFIX};
pub use queue::{Chunk, Message};
pub use relay::{Relay, RelayMode};
