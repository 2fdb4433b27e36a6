//! Channel throughput tester: pumps length-prefixed frames through a
//! socketpair, draining them on a worker thread via the blocking adapter,
//! and reports the achieved rate.

use std::cell::Cell;
use std::os::unix::io::IntoRawFd;
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::thread;
use std::time::Instant;

use clap::Parser;
use fdmux::Reactor;
use fdpipe::{
    Channel, ChannelConfig, ChannelEvent, Direction, FrameMode, SyncChannel, SyncRead,
    WriteOutcome,
};

#[derive(Parser)]
#[command(author, version, about)]
pub struct Args {
    /// Payload bytes per frame.
    #[arg(short, long, default_value_t = 4096)]
    pub size: usize,

    /// Number of frames to pump.
    #[arg(short = 'n', long, default_value_t = 100_000)]
    pub count: u64,

    /// Cap, in bytes, on output queued by the writer.
    #[arg(short, long, default_value_t = 1 << 20)]
    pub queue_max: usize,
}

struct Totals {
    frames: u64,
    bytes: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let (write_sock, read_sock) = UnixStream::pair()?;

    let reactor = Rc::new(Reactor::new());

    // Reader side: a blocking handle drained by a worker thread.
    let mut reader_cfg =
        ChannelConfig::duplex(read_sock.into_raw_fd()).with_mode(FrameMode::Vectored);
    reader_cfg.in_max = args.queue_max;
    let sync = SyncChannel::attach(&reactor, reader_cfg)?;
    let handle = sync.handle();

    let (tx, rx) = crossbeam_channel::bounded::<Totals>(1);
    let worker = thread::spawn(move || {
        let mut totals = Totals {
            frames: 0,
            bytes: 0,
        };
        loop {
            match handle.read(None) {
                SyncRead::Data(data) => {
                    totals.frames += 1;
                    totals.bytes += data.len() as u64;
                }
                SyncRead::WouldWait => continue,
                SyncRead::Eof | SyncRead::Cancelled => break,
                SyncRead::Error(err) => {
                    eprintln!("read failed: {err}");
                    break;
                }
            }
        }
        tx.send(totals).ok();
    });

    // Writer side: refills the queue from its own completion events.
    let frame = vec![0x5au8; args.size];
    let remaining = Rc::new(Cell::new(args.count));
    let writer_remaining = Rc::clone(&remaining);
    let mut writer_cfg =
        ChannelConfig::duplex(write_sock.into_raw_fd()).with_mode(FrameMode::Vectored);
    writer_cfg.out_max = args.queue_max;
    let pattern = frame.clone();
    let writer = Channel::spawn(&reactor, writer_cfg, move |chan: &Channel, event| {
        if let ChannelEvent::WriteComplete(_) = event {
            fill(chan, &pattern, &writer_remaining);
        }
    })?;

    let started = Instant::now();
    fill(&writer, &frame, &remaining);

    let totals = loop {
        reactor.run_once(false)?;
        match rx.try_recv() {
            Ok(totals) => break totals,
            Err(crossbeam_channel::TryRecvError::Empty) => {}
            Err(crossbeam_channel::TryRecvError::Disconnected) => {
                return Err("reader thread died".into());
            }
        }
    };
    let elapsed = started.elapsed();
    worker.join().map_err(|_| "reader thread panicked")?;
    writer.close(true, false, false);
    drop(sync);

    let mib = totals.bytes as f64 / (1024.0 * 1024.0);
    println!(
        "{} frames, {mib:.1} MiB in {:.3}s: {:.1} MiB/s, {:.0} frames/s",
        totals.frames,
        elapsed.as_secs_f64(),
        mib / elapsed.as_secs_f64(),
        totals.frames as f64 / elapsed.as_secs_f64(),
    );
    Ok(())
}

/// Queues frames until the output budget pushes back or the target count is
/// reached, then half-closes the stream so the reader sees EOF.
fn fill(chan: &Channel, frame: &[u8], remaining: &Rc<Cell<u64>>) {
    while remaining.get() > 0 {
        match chan.write(frame.to_vec(), false) {
            Ok(WriteOutcome::Accepted) => remaining.set(remaining.get() - 1),
            Ok(WriteOutcome::QueueFull(_)) => return,
            Err(err) => {
                eprintln!("write failed: {err}");
                remaining.set(0);
                break;
            }
        }
    }
    if remaining.get() == 0 && chan.queued_output() == 0 {
        let _ = chan.shutdown(Direction::Write);
    }
}
