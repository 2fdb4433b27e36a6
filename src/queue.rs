// Buffered framed I/O channels over file descriptors
//
// SPDX-License-Identifier: Apache-2.0

//! Byte queues backing both directions of a channel: a segmented output
//! queue interleaving data with queued commands, and a zero-copy input
//! queue of reference-counted chunks.

use std::collections::VecDeque;
use std::io::SeekFrom;
use std::rc::Rc;

/// Arguments of a queued or immediate close.
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct CloseArgs {
    /// Discard queued output instead of draining it first.
    pub abort: bool,
    /// Deliver a final `Closing` event to the handler.
    pub notify: bool,
    /// Restore descriptor flags and leave the descriptors open.
    pub keep_fds: bool,
}

/// Command queued behind pending output so it executes in stream order.
#[derive(Debug)]
pub(crate) enum Command {
    ShutdownWrite,
    Close(CloseArgs),
    Seek(SeekFrom),
}

/// A single buffer queued for writing, with partial-write progress.
#[derive(Debug)]
pub(crate) struct WriteSeg {
    pub data: Vec<u8>,
    pub sent: usize,
    /// Internal segments (length prefixes, compressed envelopes) produce no
    /// completion event of their own.
    pub internal: bool,
    /// Original user buffers represented by this segment, reported back on
    /// completion or abort.
    pub carried: Vec<Vec<u8>>,
}

#[derive(Debug)]
pub(crate) enum QueueItem {
    Data(WriteSeg),
    Command(Command),
}

/// FIFO of write segments and commands with a running byte total.
#[derive(Debug, Default)]
pub(crate) struct WriteQueue {
    items: VecDeque<QueueItem>,
    bytes: usize,
}

impl WriteQueue {
    /// Unsent payload bytes currently held. Commands are weightless.
    pub fn bytes(&self) -> usize { self.bytes }

    pub fn is_empty(&self) -> bool { self.items.is_empty() }

    pub fn push_data(&mut self, data: Vec<u8>) {
        self.bytes += data.len();
        self.items.push_back(QueueItem::Data(WriteSeg {
            data,
            sent: 0,
            internal: false,
            carried: vec![],
        }));
    }

    pub fn push_internal(&mut self, data: Vec<u8>, carried: Vec<Vec<u8>>) {
        self.bytes += data.len();
        self.items.push_back(QueueItem::Data(WriteSeg {
            data,
            sent: 0,
            internal: true,
            carried,
        }));
    }

    pub fn push_command(&mut self, cmd: Command) {
        self.items.push_back(QueueItem::Command(cmd));
    }

    pub fn front_mut(&mut self) -> Option<&mut QueueItem> { self.items.front_mut() }

    pub fn pop_front(&mut self) -> Option<QueueItem> {
        let item = self.items.pop_front();
        if let Some(QueueItem::Data(seg)) = &item {
            self.bytes -= seg.data.len() - seg.sent;
        }
        item
    }

    /// Records `n` bytes written from the front segment. Returns the segment
    /// once fully sent.
    pub fn advance(&mut self, n: usize) -> Option<WriteSeg> {
        let QueueItem::Data(seg) = self.items.front_mut()? else {
            return None;
        };
        self.bytes -= n;
        seg.sent += n;
        debug_assert!(seg.sent <= seg.data.len());
        if seg.sent == seg.data.len() {
            match self.items.pop_front() {
                Some(QueueItem::Data(seg)) => Some(seg),
                _ => unreachable!("front was a data segment"),
            }
        } else {
            None
        }
    }

    pub fn drain(&mut self) -> impl Iterator<Item = QueueItem> + '_ {
        self.bytes = 0;
        self.items.drain(..)
    }

    /// Removes the leading run of untouched user segments, returning their
    /// concatenated payload and the original buffers. Partially written or
    /// internal segments end the run.
    #[cfg(feature = "compression")]
    pub fn take_plain_run(&mut self) -> Option<(Vec<u8>, Vec<Vec<u8>>)> {
        let mut payload = Vec::new();
        let mut carried = Vec::new();
        while let Some(QueueItem::Data(seg)) = self.items.front() {
            if seg.sent > 0 || seg.internal {
                break;
            }
            match self.items.pop_front() {
                Some(QueueItem::Data(seg)) => {
                    self.bytes -= seg.data.len();
                    payload.extend_from_slice(&seg.data);
                    carried.push(seg.data);
                    carried.extend(seg.carried);
                }
                _ => unreachable!("front was a data segment"),
            }
        }
        if carried.is_empty() {
            None
        } else {
            Some((payload, carried))
        }
    }

    /// Re-inserts a transformed segment at the queue front.
    #[cfg(feature = "compression")]
    pub fn push_front_internal(&mut self, data: Vec<u8>, carried: Vec<Vec<u8>>) {
        self.bytes += data.len();
        self.items.push_front(QueueItem::Data(WriteSeg {
            data,
            sent: 0,
            internal: true,
            carried,
        }));
    }
}

/// A view into a reference-counted read buffer. Cloning or splitting a chunk
/// never copies the underlying bytes.
#[derive(Clone, Debug)]
pub struct Chunk {
    buf: Rc<[u8]>,
    start: usize,
    end: usize,
}

impl Chunk {
    pub(crate) fn new(buf: Rc<[u8]>) -> Self {
        let end = buf.len();
        Self { buf, start: 0, end }
    }

    pub fn as_bytes(&self) -> &[u8] { &self.buf[self.start..self.end] }

    pub fn len(&self) -> usize { self.end - self.start }

    pub fn is_empty(&self) -> bool { self.start == self.end }

    /// Splits off the first `n` bytes, leaving the remainder in `self`. Both
    /// halves share the same backing buffer.
    pub(crate) fn split_to(&mut self, n: usize) -> Chunk {
        debug_assert!(n <= self.len());
        let head = Chunk {
            buf: Rc::clone(&self.buf),
            start: self.start,
            end: self.start + n,
        };
        self.start += n;
        head
    }
}

/// A complete frame delivered to the channel handler, possibly spanning
/// several read buffers.
#[derive(Clone, Debug, Default)]
pub struct Message {
    chunks: Vec<Chunk>,
}

impl Message {
    pub(crate) fn push(&mut self, chunk: Chunk) {
        if !chunk.is_empty() {
            self.chunks.push(chunk);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Chunk> { self.chunks.iter() }

    pub fn len(&self) -> usize { self.chunks.iter().map(Chunk::len).sum() }

    pub fn is_empty(&self) -> bool { self.chunks.is_empty() }

    /// Copies the frame into a single contiguous buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for chunk in &self.chunks {
            out.extend_from_slice(chunk.as_bytes());
        }
        out
    }
}

/// Input buffer accumulating chunks until the framer finds a complete frame.
#[derive(Debug, Default)]
pub(crate) struct ReadQueue {
    chunks: VecDeque<Chunk>,
    bytes: usize,
}

impl ReadQueue {
    pub fn bytes(&self) -> usize { self.bytes }

    pub fn push(&mut self, chunk: Chunk) {
        self.bytes += chunk.len();
        self.chunks.push_back(chunk);
    }

    /// Removes exactly `n` buffered bytes as a message. Panics if fewer are
    /// buffered.
    pub fn take_bytes(&mut self, n: usize) -> Message {
        debug_assert!(n <= self.bytes);
        let mut msg = Message::default();
        let mut left = n;
        while left > 0 {
            let front = self.chunks.front_mut().expect("enough buffered bytes");
            if front.len() <= left {
                left -= front.len();
                msg.push(self.chunks.pop_front().expect("non-empty queue"));
            } else {
                msg.push(front.split_to(left));
                left = 0;
            }
        }
        self.bytes -= n;
        msg
    }

    pub fn take_all(&mut self) -> Message {
        let mut msg = Message::default();
        for chunk in self.chunks.drain(..) {
            msg.push(chunk);
        }
        self.bytes = 0;
        msg
    }

    /// Discards `n` buffered bytes.
    pub fn skip_bytes(&mut self, n: usize) { let _ = self.take_bytes(n); }

    /// Offset of the first occurrence of `byte`, if buffered.
    pub fn find_byte(&self, byte: u8) -> Option<usize> {
        let mut offset = 0;
        for chunk in &self.chunks {
            if let Some(pos) = chunk.as_bytes().iter().position(|b| *b == byte) {
                return Some(offset + pos);
            }
            offset += chunk.len();
        }
        None
    }

    /// Copies up to `out.len()` buffered bytes without consuming them.
    /// Returns how many were copied.
    pub fn peek(&self, out: &mut [u8]) -> usize {
        let mut copied = 0;
        for chunk in &self.chunks {
            if copied == out.len() {
                break;
            }
            let bytes = chunk.as_bytes();
            let n = bytes.len().min(out.len() - copied);
            out[copied..copied + n].copy_from_slice(&bytes[..n]);
            copied += n;
        }
        copied
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.bytes = 0;
    }
}
