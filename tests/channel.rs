mod common;

use std::cell::RefCell;
use std::io::{Read, SeekFrom, Write};
use std::net::Shutdown;
use std::os::unix::io::IntoRawFd;
use std::rc::Rc;
use std::time::Duration;

use fdmux::Reactor;
use fdpipe::{
    Channel, ChannelConfig, ChannelError, ChannelEvent, Direction, FrameMode, WriteOutcome,
};

type Events = Rc<RefCell<Vec<ChannelEvent>>>;

fn recorder() -> (Events, impl FnMut(&Channel, ChannelEvent)) {
    let events: Events = Rc::new(RefCell::new(vec![]));
    let sink = Rc::clone(&events);
    (events, move |_: &Channel, ev| sink.borrow_mut().push(ev))
}

#[test]
fn raw_writes_arrive_in_order() {
    let reactor = Rc::new(Reactor::new());
    let (mut ours, fd) = common::pair();
    let (events, sink) = recorder();
    let chan = Channel::spawn(&reactor, ChannelConfig::duplex(fd), sink).unwrap();

    assert!(matches!(
        chan.write(b"hello".to_vec(), false).unwrap(),
        WriteOutcome::Accepted
    ));
    assert!(matches!(
        chan.write(b" world".to_vec(), false).unwrap(),
        WriteOutcome::Accepted
    ));

    let mut received = vec![0u8; 11];
    ours.set_read_timeout(Some(Duration::from_millis(10))).unwrap();
    let mut got = 0;
    common::pump(&reactor, || {
        if let Ok(n) = ours.read(&mut received[got..]) {
            got += n;
        }
        got == 11
    });
    assert_eq!(&received, b"hello world");

    let events = events.borrow();
    let completed: Vec<&Vec<u8>> = events
        .iter()
        .filter_map(|ev| match ev {
            ChannelEvent::WriteComplete(data) => Some(data),
            _ => None,
        })
        .collect();
    assert_eq!(completed, vec![b"hello".as_slice(), b" world".as_slice()]);
}

#[test]
fn vectored_frames_survive_tiny_reads() {
    let reactor = Rc::new(Reactor::new());
    let (writer_ext, reader_fd) = common::pair();

    let (events, sink) = recorder();
    let mut cfg = ChannelConfig::duplex(reader_fd).with_mode(FrameMode::Vectored);
    // Reads of three bytes split every frame and its prefix.
    cfg.read_hint = 3;
    let _chan = Channel::spawn(&reactor, cfg, sink).unwrap();

    let mut feed = writer_ext;
    for payload in [b"first".as_slice(), b"second frame".as_slice()] {
        feed.write_all(&(payload.len() as u32).to_be_bytes()).unwrap();
        feed.write_all(payload).unwrap();
    }

    common::pump(&reactor, || {
        events
            .borrow()
            .iter()
            .filter(|ev| matches!(ev, ChannelEvent::ReadComplete(_)))
            .count()
            == 2
    });

    let events = events.borrow();
    let frames: Vec<Vec<u8>> = events
        .iter()
        .filter_map(|ev| match ev {
            ChannelEvent::ReadComplete(msg) => Some(msg.to_vec()),
            _ => None,
        })
        .collect();
    assert_eq!(frames, vec![b"first".to_vec(), b"second frame".to_vec()]);
}

#[test]
fn line_frames_keep_their_delimiter() {
    let reactor = Rc::new(Reactor::new());
    let (mut feed, fd) = common::pair();
    let (events, sink) = recorder();
    let cfg = ChannelConfig::duplex(fd).with_mode(FrameMode::Line);
    let _chan = Channel::spawn(&reactor, cfg, sink).unwrap();

    feed.write_all(b"abc\ndef\n").unwrap();
    common::pump(&reactor, || events.borrow().len() == 2);

    let events = events.borrow();
    match (&events[0], &events[1]) {
        (ChannelEvent::ReadComplete(first), ChannelEvent::ReadComplete(second)) => {
            assert_eq!(first.to_vec(), b"abc\n");
            assert_eq!(second.to_vec(), b"def\n");
        }
        other => panic!("{other:?}"),
    }
}

#[test]
fn overlong_line_is_evicted_as_incomplete() {
    let reactor = Rc::new(Reactor::new());
    let (mut feed, fd) = common::pair();
    let (events, sink) = recorder();
    let mut cfg = ChannelConfig::duplex(fd).with_mode(FrameMode::Line);
    cfg.in_max = 8;
    let _chan = Channel::spawn(&reactor, cfg, sink).unwrap();

    feed.write_all(b"no newline at all").unwrap();
    common::pump(&reactor, || !events.borrow().is_empty());

    let events = events.borrow();
    match &events[0] {
        ChannelEvent::IncompleteRead(msg) => assert_eq!(msg.to_vec(), b"no newline at all"),
        other => panic!("{other:?}"),
    }
}

#[test]
fn blocked_mode_slices_fixed_blocks() {
    let reactor = Rc::new(Reactor::new());
    let (mut feed, fd) = common::pair();
    let (events, sink) = recorder();
    let mut cfg = ChannelConfig::duplex(fd).with_mode(FrameMode::Blocked);
    cfg.read_hint = 4;
    let _chan = Channel::spawn(&reactor, cfg, sink).unwrap();

    feed.write_all(b"abcdefgh").unwrap();
    common::pump(&reactor, || events.borrow().len() == 2);
    {
        let events = events.borrow();
        match (&events[0], &events[1]) {
            (ChannelEvent::ReadComplete(a), ChannelEvent::ReadComplete(b)) => {
                assert_eq!(a.to_vec(), b"abcd");
                assert_eq!(b.to_vec(), b"efgh");
            }
            other => panic!("{other:?}"),
        }
    }

    // A short trailing block is delivered as incomplete once the stream ends.
    feed.write_all(b"xy").unwrap();
    feed.shutdown(Shutdown::Write).unwrap();
    common::pump(&reactor, || events.borrow().len() >= 4);

    let events = events.borrow();
    match &events[2] {
        ChannelEvent::IncompleteRead(msg) => assert_eq!(msg.to_vec(), b"xy"),
        other => panic!("{other:?}"),
    }
    assert!(matches!(events[3], ChannelEvent::ReadEof));
}

#[test]
fn oversize_vectored_frame_kills_the_read_side() {
    let reactor = Rc::new(Reactor::new());
    let (mut feed, fd) = common::pair();
    let (events, sink) = recorder();
    let mut cfg = ChannelConfig::duplex(fd).with_mode(FrameMode::Vectored);
    cfg.in_max = 16;
    let _chan = Channel::spawn(&reactor, cfg, sink).unwrap();

    feed.write_all(&1000u32.to_be_bytes()).unwrap();
    common::pump(&reactor, || !events.borrow().is_empty());

    let events = events.borrow();
    match &events[0] {
        ChannelEvent::ReadError(err) => {
            assert_eq!(err.kind(), std::io::ErrorKind::InvalidData)
        }
        other => panic!("{other:?}"),
    }
}

#[test]
fn full_queue_rejects_then_accepts_after_drain() {
    let reactor = Rc::new(Reactor::new());
    let (mut ours, fd) = common::pair();
    let (events, sink) = recorder();
    let mut cfg = ChannelConfig::duplex(fd);
    cfg.out_max = 64;
    let chan = Channel::spawn(&reactor, cfg, sink).unwrap();

    assert!(matches!(
        chan.write(vec![b'a'; 60], false).unwrap(),
        WriteOutcome::Accepted
    ));
    match chan.write(vec![b'b'; 8], false).unwrap() {
        WriteOutcome::QueueFull(returned) => assert_eq!(returned, vec![b'b'; 8]),
        other => panic!("{other:?}"),
    }

    // A bypass write is admitted past the budget.
    assert!(matches!(
        chan.write(vec![b'c'; 8], true).unwrap(),
        WriteOutcome::Accepted
    ));

    let mut sunk = [0u8; 128];
    ours.set_read_timeout(Some(Duration::from_millis(10))).unwrap();
    let mut got = 0;
    common::pump(&reactor, || {
        if let Ok(n) = ours.read(&mut sunk[got..]) {
            got += n;
        }
        got == 68
    });
    assert_eq!(events.borrow().len(), 2);

    assert!(matches!(
        chan.write(vec![b'd'; 8], false).unwrap(),
        WriteOutcome::Accepted
    ));
}

#[test]
fn vectored_prefix_counts_against_the_budget() {
    let reactor = Rc::new(Reactor::new());
    let (_ours, fd) = common::pair();
    let (_events, sink) = recorder();
    let mut cfg = ChannelConfig::duplex(fd).with_mode(FrameMode::Vectored);
    cfg.out_max = 10;
    let chan = Channel::spawn(&reactor, cfg, sink).unwrap();

    // 8 payload + 4 prefix exceeds the 10-byte budget.
    assert!(matches!(
        chan.write(vec![0u8; 8], false).unwrap(),
        WriteOutcome::QueueFull(_)
    ));
    // 6 + 4 fits exactly.
    assert!(matches!(
        chan.write(vec![0u8; 6], false).unwrap(),
        WriteOutcome::Accepted
    ));
}

#[test]
fn shutdown_drains_queued_output_first() {
    let reactor = Rc::new(Reactor::new());
    let (mut ours, fd) = common::pair();
    let (events, sink) = recorder();
    let chan = Channel::spawn(&reactor, ChannelConfig::duplex(fd), sink).unwrap();

    chan.write(b"last words".to_vec(), false).unwrap();
    chan.shutdown(Direction::Write).unwrap();
    assert!(matches!(
        chan.write(b"too late".to_vec(), false),
        Err(ChannelError::Closed)
    ));

    let mut received = Vec::new();
    ours.set_read_timeout(Some(Duration::from_millis(10))).unwrap();
    let mut buf = [0u8; 64];
    let mut eof = false;
    common::pump(&reactor, || {
        match ours.read(&mut buf) {
            Ok(0) => eof = true,
            Ok(n) => received.extend_from_slice(&buf[..n]),
            Err(_) => {}
        }
        eof
    });
    // Everything queued before the shutdown made it out, then EOF.
    assert_eq!(received, b"last words");
    assert!(events
        .borrow()
        .iter()
        .any(|ev| matches!(ev, ChannelEvent::WriteComplete(_))));
}

#[test]
fn abort_close_reports_discarded_output() {
    let reactor = Rc::new(Reactor::new());
    let (_ours, fd) = common::pair();
    let (events, sink) = recorder();
    let mut cfg = ChannelConfig::duplex(fd);
    cfg.out_max = 1 << 20;
    let chan = Channel::spawn(&reactor, cfg, sink).unwrap();

    // Big enough that the socket buffer cannot swallow it in one pass.
    chan.write(vec![0u8; 1 << 20], false).unwrap();
    reactor.run_once(true).unwrap();
    assert!(chan.queued_output() > 0);

    chan.close(true, true, false);
    assert!(chan.is_closed());

    let events = events.borrow();
    assert!(events
        .iter()
        .any(|ev| matches!(ev, ChannelEvent::WriteAborted(data) if data.len() == 1 << 20)));
    assert!(matches!(events.last(), Some(ChannelEvent::Closing)));
}

#[test]
fn close_is_reentrant_from_the_handler() {
    let reactor = Rc::new(Reactor::new());
    let (mut feed, fd) = common::pair();

    let closings = Rc::new(RefCell::new(0u32));
    let seen = Rc::clone(&closings);
    let chan = Channel::spawn(&reactor, ChannelConfig::duplex(fd), move |chan: &Channel, ev| {
        match ev {
            ChannelEvent::ReadComplete(_) => {
                // A repeated close from inside the delivery must not recurse.
                chan.close(true, true, false);
                chan.close(true, true, false);
            }
            ChannelEvent::Closing => *seen.borrow_mut() += 1,
            _ => {}
        }
    })
    .unwrap();

    feed.write_all(b"boom").unwrap();
    common::pump(&reactor, || *closings.borrow() > 0);
    assert_eq!(*closings.borrow(), 1);
    assert!(chan.is_closed());
}

#[test]
fn read_throttle_stacks() {
    let reactor = Rc::new(Reactor::new());
    let (mut feed, fd) = common::pair();
    let (events, sink) = recorder();
    let chan = Channel::spawn(&reactor, ChannelConfig::duplex(fd), sink).unwrap();

    chan.set_read_allowed(false);
    chan.set_read_allowed(false);
    feed.write_all(b"held back").unwrap();

    for _ in 0..20 {
        reactor.run_once(true).unwrap();
    }
    assert!(events.borrow().is_empty());

    // One release is not enough with two pauses outstanding.
    chan.set_read_allowed(true);
    for _ in 0..20 {
        reactor.run_once(true).unwrap();
    }
    assert!(events.borrow().is_empty());

    chan.set_read_allowed(true);
    common::pump(&reactor, || !events.borrow().is_empty());
    match &events.borrow()[0] {
        ChannelEvent::ReadComplete(msg) => assert_eq!(msg.to_vec(), b"held back"),
        other => panic!("{other:?}"),
    };
}

#[test]
fn seek_queues_behind_pending_writes() {
    let reactor = Rc::new(Reactor::new());
    let path = std::env::temp_dir().join(format!("fdpipe-seek-{}", std::process::id()));
    let file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .read(true)
        .write(true)
        .open(&path)
        .unwrap();
    let fd = file.into_raw_fd();

    let (events, sink) = recorder();
    let chan = Channel::spawn(&reactor, ChannelConfig::writer(fd), sink).unwrap();

    chan.write(b"abcdef".to_vec(), false).unwrap();
    chan.seek(SeekFrom::Start(0)).unwrap();
    chan.write(b"XY".to_vec(), false).unwrap();

    common::pump(&reactor, || {
        events
            .borrow()
            .iter()
            .filter(|ev| matches!(ev, ChannelEvent::WriteComplete(_)))
            .count()
            == 2
    });

    {
        let events = events.borrow();
        let seek_pos = events
            .iter()
            .position(|ev| matches!(ev, ChannelEvent::SeekSuccess(0)))
            .expect("seek executed");
        let first_write = events
            .iter()
            .position(|ev| matches!(ev, ChannelEvent::WriteComplete(_)))
            .unwrap();
        assert!(first_write < seek_pos, "seek ran before queued output");
    }

    chan.close(false, false, false);
    let mut contents = String::new();
    let mut reopened = std::fs::File::open(&path).unwrap();
    reopened.read_to_string(&mut contents).unwrap();
    assert_eq!(contents, "XYcdef");
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn channel_without_descriptors_is_rejected() {
    let reactor = Rc::new(Reactor::new());
    let (_events, sink) = recorder();
    assert!(matches!(
        Channel::spawn(&reactor, ChannelConfig::default(), sink),
        Err(ChannelError::NoDescriptors)
    ));
}

#[test]
fn write_error_still_honors_a_queued_close() {
    let reactor = Rc::new(Reactor::new());
    let (ours, fd) = common::pair();
    let (events, sink) = recorder();
    let chan = Channel::spawn(&reactor, ChannelConfig::duplex(fd), sink).unwrap();

    // Enough output that the close has to queue behind it.
    let payload = vec![0x55u8; 4 << 20];
    assert!(matches!(chan.write(payload, false).unwrap(), WriteOutcome::Accepted));
    chan.close(false, true, false);
    assert!(!chan.is_closed());

    // Severing the peer fails the pending output before the close executes.
    drop(ours);
    common::pump(&reactor, || chan.is_closed());

    let events = events.borrow();
    let closings = events.iter().filter(|ev| matches!(ev, ChannelEvent::Closing)).count();
    assert_eq!(closings, 1);
    assert!(events
        .iter()
        .any(|ev| matches!(ev, ChannelEvent::WriteAborted(data) if data.len() == 4 << 20)));
}

#[test]
fn write_error_fails_a_queued_seek() {
    let reactor = Rc::new(Reactor::new());
    let (ours, fd) = common::pair();
    let (events, sink) = recorder();
    let chan = Channel::spawn(&reactor, ChannelConfig::duplex(fd), sink).unwrap();

    let payload = vec![0xaau8; 4 << 20];
    assert!(matches!(chan.write(payload, false).unwrap(), WriteOutcome::Accepted));
    chan.seek(SeekFrom::Start(0)).unwrap();

    drop(ours);
    common::pump(&reactor, || {
        events
            .borrow()
            .iter()
            .any(|ev| matches!(ev, ChannelEvent::SeekFailure(_)))
    });
}

#[test]
fn zero_block_size_is_rejected_at_spawn() {
    let reactor = Rc::new(Reactor::new());
    let (_ours, fd) = common::pair();
    let (_events, sink) = recorder();
    let mut cfg = ChannelConfig::duplex(fd).with_mode(FrameMode::Blocked);
    cfg.read_hint = 0;
    assert!(matches!(
        Channel::spawn(&reactor, cfg, sink),
        Err(ChannelError::ZeroBlockSize)
    ));
}

#[cfg(feature = "compression")]
#[test]
fn compressed_vectored_is_rejected_at_spawn() {
    let reactor = Rc::new(Reactor::new());
    let (_ours, fd) = common::pair();
    let (_events, sink) = recorder();
    let mut cfg = ChannelConfig::duplex(fd).with_mode(FrameMode::Vectored);
    cfg.compress = true;
    assert!(matches!(
        Channel::spawn(&reactor, cfg, sink),
        Err(ChannelError::CompressedVectored)
    ));
}

#[test]
fn eof_releases_the_read_descriptor() {
    let reactor = Rc::new(Reactor::new());
    let (ours, fd) = common::pair();
    let (events, sink) = recorder();
    let chan = Channel::spawn(&reactor, ChannelConfig::reader(fd), sink).unwrap();

    ours.shutdown(Shutdown::Write).unwrap();
    common::pump(&reactor, || {
        events.borrow().iter().any(|ev| matches!(ev, ChannelEvent::ReadEof))
    });

    // A drained descriptor leaves the poller so its hang-up state cannot
    // wake the reactor every iteration.
    assert!(!reactor.is_registered(fd));
    assert!(!chan.is_closed());
}
