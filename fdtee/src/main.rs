//! Framed pipe tee: couples stdin/stdout with a TCP connection or an
//! arbitrary descriptor pair, optionally copying everything that flows
//! through into a file.

use std::fs::File;
use std::io::Write;
use std::net::TcpStream;
use std::os::unix::io::{IntoRawFd, RawFd};
use std::path::PathBuf;
use std::rc::Rc;

use clap::Parser;
use fdmux::Reactor;
use fdpipe::{ChannelConfig, FrameMode, Relay, RelayMode};

#[derive(Parser)]
#[command(author, version, about)]
pub struct Args {
    /// TCP address (host:port) to couple stdin/stdout with.
    #[arg(short, long, conflicts_with_all = ["fd_in", "fd_out"])]
    pub connect: Option<String>,

    /// Descriptor to read the far side from.
    #[arg(long, requires = "fd_out")]
    pub fd_in: Option<RawFd>,

    /// Descriptor to write the far side to.
    #[arg(long, requires = "fd_in")]
    pub fd_out: Option<RawFd>,

    /// Framing of both streams: raw, blocked, vectored or line.
    #[arg(short = 'm', long, default_value = "raw")]
    pub frame: FrameMode,

    /// Copy everything relayed, both directions, into this file.
    #[arg(short, long)]
    pub tee: Option<PathBuf>,

    /// Cap, in bytes, on output queued per side.
    #[arg(short, long, default_value_t = 1 << 20)]
    pub queue_max: usize,

    /// Block size for blocked framing (also the per-read buffer size).
    #[arg(short, long, default_value_t = 8192)]
    pub block: usize,

    /// Line delimiter byte for line framing.
    #[arg(short, long, default_value_t = b'\n')]
    pub delimiter: u8,

    /// Tear the local side down as soon as the far side is gone.
    #[arg(long)]
    pub close_together: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let far = far_side(&args)?;
    let mut near = ChannelConfig::pair(0, 1).with_mode(args.frame);
    // stdin/stdout belong to the shell; only their flags are borrowed.
    near.keep_fds = true;
    near.out_max = args.queue_max;
    near.read_hint = args.block;
    near.delimiter = args.delimiter;
    let far = ChannelConfig {
        out_max: args.queue_max,
        read_hint: args.block,
        delimiter: args.delimiter,
        ..far.with_mode(args.frame)
    };

    let reactor = Rc::new(Reactor::new());
    let mode = if args.close_together {
        RelayMode::CloseTogether
    } else {
        RelayMode::WaitBoth
    };

    let stop = Rc::clone(&reactor);
    let relay = Relay::couple(&reactor, near, far, mode, move || stop.request_stop())?;

    if let Some(path) = &args.tee {
        let mut file = File::create(path)?;
        relay.set_tap(move |_side, data| {
            let _ = file.write_all(data);
        });
    }

    let aborter = relay.clone();
    reactor.register_signal(libc::SIGINT, move |_: &Reactor, _| aborter.abort())?;

    reactor.run()?;
    Ok(())
}

fn far_side(args: &Args) -> Result<ChannelConfig, Box<dyn std::error::Error>> {
    if let Some(addr) = &args.connect {
        let stream = TcpStream::connect(addr)?;
        return Ok(ChannelConfig::duplex(stream.into_raw_fd()));
    }
    match (args.fd_in, args.fd_out) {
        (Some(input), Some(output)) if input == output => Ok(ChannelConfig::duplex(input)),
        (Some(input), Some(output)) => Ok(ChannelConfig::pair(input, output)),
        _ => Err("either --connect or both --fd-in and --fd-out are required".into()),
    }
}
