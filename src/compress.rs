// Buffered framed I/O channels over file descriptors
//
// SPDX-License-Identifier: Apache-2.0

//! Write-side deflate transform. Queued user buffers are coalesced into a
//! single compressed segment just before hitting the descriptor; the
//! original buffers are still reported back on completion or abort.

use std::io::{self, Write};

use flate2::write::DeflateEncoder;
use flate2::Compression;

use crate::queue::WriteQueue;

/// Replaces the leading run of untouched user segments with one deflated
/// segment carrying the originals. Partially sent and already-transformed
/// segments are left alone.
pub(crate) fn coalesce(wqueue: &mut WriteQueue) -> io::Result<()> {
    let Some((payload, carried)) = wqueue.take_plain_run() else {
        return Ok(());
    };
    let mut encoder = DeflateEncoder::new(
        Vec::with_capacity(payload.len() / 2),
        Compression::default(),
    );
    encoder.write_all(&payload)?;
    let compressed = encoder.finish()?;
    wqueue.push_front_internal(compressed, carried);
    Ok(())
}
