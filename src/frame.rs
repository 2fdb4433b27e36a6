// Buffered framed I/O channels over file descriptors
//
// SPDX-License-Identifier: Apache-2.0

//! Framing policies slicing the buffered input stream into messages.

use std::str::FromStr;

use crate::queue::{Message, ReadQueue};

/// Width of the big-endian length prefix used by [`FrameMode::Vectored`].
pub const LENGTH_PREFIX: usize = 4;

/// How the input byte stream is sliced into delivered messages.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default, Display)]
pub enum FrameMode {
    /// Deliver bytes as they arrive, without reassembly.
    #[default]
    #[display("raw")]
    Raw,

    /// Deliver fixed-size blocks of the configured read hint.
    #[display("blocked")]
    Blocked,

    /// Deliver length-prefixed frames (4-byte big-endian prefix).
    #[display("vectored")]
    Vectored,

    /// Deliver delimiter-terminated lines, delimiter included.
    #[display("line")]
    Line,
}

/// unknown framing mode `{0}`; use raw, blocked, vectored or line
#[derive(Clone, Eq, PartialEq, Debug, Display, Error)]
#[display(doc_comments)]
pub struct UnknownFrameMode(pub String);

impl FromStr for FrameMode {
    type Err = UnknownFrameMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raw" => Ok(FrameMode::Raw),
            "blocked" => Ok(FrameMode::Blocked),
            "vectored" => Ok(FrameMode::Vectored),
            "line" => Ok(FrameMode::Line),
            other => Err(UnknownFrameMode(other.to_owned())),
        }
    }
}

/// Framer state persisting between reads: a decoded-but-unsatisfied length
/// prefix.
#[derive(Debug, Default)]
pub(crate) struct FrameState {
    pending_len: Option<usize>,
}

impl FrameState {
    pub fn reset(&mut self) { self.pending_len = None; }
}

/// One framing step over the input queue.
#[derive(Debug)]
pub(crate) enum Scan {
    /// Not enough buffered data for a frame.
    None,
    /// A complete frame was extracted.
    Complete(Message),
    /// The buffer exceeded its cap without completing a frame; the partial
    /// data is evicted.
    Incomplete(Message),
    /// A length prefix announced a frame above the configured cap.
    Oversize { len: usize, max: usize },
}

/// Attempts to extract the next frame from `q` according to `mode`.
///
/// `hint` is the block size for [`FrameMode::Blocked`]; `max` caps buffered
/// input (0 means unlimited); `delim` terminates [`FrameMode::Line`] frames.
pub(crate) fn scan(
    mode: FrameMode,
    q: &mut ReadQueue,
    state: &mut FrameState,
    hint: usize,
    max: usize,
    delim: u8,
) -> Scan {
    match mode {
        FrameMode::Raw => {
            if q.bytes() > 0 {
                Scan::Complete(q.take_all())
            } else {
                Scan::None
            }
        }
        FrameMode::Blocked => {
            // A zero hint would slice empty blocks forever.
            if hint > 0 && q.bytes() >= hint {
                Scan::Complete(q.take_bytes(hint))
            } else {
                Scan::None
            }
        }
        FrameMode::Vectored => {
            if state.pending_len.is_none() {
                let mut prefix = [0u8; LENGTH_PREFIX];
                if q.peek(&mut prefix) < LENGTH_PREFIX {
                    return Scan::None;
                }
                let len = u32::from_be_bytes(prefix) as usize;
                if max > 0 && len > max {
                    return Scan::Oversize { len, max };
                }
                q.skip_bytes(LENGTH_PREFIX);
                state.pending_len = Some(len);
            }
            let len = state.pending_len.expect("just set");
            if q.bytes() >= len {
                state.pending_len = None;
                Scan::Complete(q.take_bytes(len))
            } else {
                Scan::None
            }
        }
        FrameMode::Line => match q.find_byte(delim) {
            Some(pos) => Scan::Complete(q.take_bytes(pos + 1)),
            None if max > 0 && q.bytes() > max => Scan::Incomplete(q.take_all()),
            None => Scan::None,
        },
    }
}
