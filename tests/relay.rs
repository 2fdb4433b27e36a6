mod common;

use std::cell::{Cell, RefCell};
use std::io::{Read, Write};
use std::net::Shutdown;
use std::rc::Rc;
use std::time::Duration;

use fdmux::Reactor;
use fdpipe::{ChannelConfig, Relay, RelayMode};

#[test]
fn relays_both_directions_and_propagates_half_close() {
    let reactor = Rc::new(Reactor::new());
    let (mut near_ext, near_fd) = common::pair();
    let (mut far_ext, far_fd) = common::pair();

    let done = Rc::new(Cell::new(0u32));
    let on_done = Rc::clone(&done);
    let relay = Relay::couple(
        &reactor,
        ChannelConfig::duplex(near_fd),
        ChannelConfig::duplex(far_fd),
        RelayMode::WaitBoth,
        move || on_done.set(on_done.get() + 1),
    )
    .unwrap();

    let tapped = Rc::new(RefCell::new(Vec::<(usize, Vec<u8>)>::new()));
    let tap = Rc::clone(&tapped);
    relay.set_tap(move |side, data| tap.borrow_mut().push((side, data.to_vec())));

    near_ext.set_read_timeout(Some(Duration::from_millis(10))).unwrap();
    far_ext.set_read_timeout(Some(Duration::from_millis(10))).unwrap();

    // Near to far.
    near_ext.write_all(b"ping").unwrap();
    let mut buf = [0u8; 16];
    let mut got = 0;
    common::pump(&reactor, || {
        if let Ok(n) = far_ext.read(&mut buf[got..]) {
            got += n;
        }
        got == 4
    });
    assert_eq!(&buf[..4], b"ping");

    // Far to near.
    far_ext.write_all(b"pong!").unwrap();
    got = 0;
    common::pump(&reactor, || {
        if let Ok(n) = near_ext.read(&mut buf[got..]) {
            got += n;
        }
        got == 5
    });
    assert_eq!(&buf[..5], b"pong!");

    assert_eq!(
        *tapped.borrow(),
        vec![(0, b"ping".to_vec()), (1, b"pong!".to_vec())]
    );

    // EOF on the near side must surface as EOF on the far side.
    near_ext.shutdown(Shutdown::Write).unwrap();
    let mut eof = false;
    common::pump(&reactor, || {
        if let Ok(0) = far_ext.read(&mut buf) {
            eof = true;
        }
        eof
    });

    // Once the far side stops writing too, the relay winds down exactly once.
    far_ext.shutdown(Shutdown::Write).unwrap();
    common::pump(&reactor, || relay.is_done());
    assert_eq!(done.get(), 1);
}

#[test]
fn backpressure_loses_nothing() {
    const TOTAL: usize = 1 << 20;

    let reactor = Rc::new(Reactor::new());
    let (near_ext, near_fd) = common::pair();
    let (far_ext, far_fd) = common::pair();

    // Tiny budgets force the relay to throttle and bypass-resubmit.
    let mut near_cfg = ChannelConfig::duplex(near_fd);
    near_cfg.out_max = 4096;
    near_cfg.read_hint = 1024;
    let mut far_cfg = ChannelConfig::duplex(far_fd);
    far_cfg.out_max = 4096;
    far_cfg.read_hint = 1024;

    let relay = Relay::couple(
        &reactor,
        near_cfg,
        far_cfg,
        RelayMode::WaitBoth,
        || {},
    )
    .unwrap();

    let feeder = std::thread::spawn(move || {
        let mut near_ext = near_ext;
        let pattern: Vec<u8> = (0..TOTAL).map(|i| (i % 251) as u8).collect();
        near_ext.write_all(&pattern).unwrap();
        near_ext.shutdown(Shutdown::Write).unwrap();
        // Keep the socket open so the near side's writer stays usable.
        near_ext
    });

    let drainer = std::thread::spawn(move || {
        let mut far_ext = far_ext;
        let mut received = Vec::with_capacity(TOTAL);
        let mut buf = [0u8; 8192];
        loop {
            match far_ext.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => received.extend_from_slice(&buf[..n]),
                Err(err) => panic!("drain failed: {err}"),
            }
        }
        let _ = far_ext.shutdown(Shutdown::Write);
        received
    });

    common::pump(&reactor, || relay.is_done());

    let _near_ext = feeder.join().unwrap();
    let received = drainer.join().unwrap();
    assert_eq!(received.len(), TOTAL);
    assert!(received
        .iter()
        .enumerate()
        .all(|(i, byte)| *byte == (i % 251) as u8));
}

#[test]
fn close_together_tears_the_peer_down() {
    let reactor = Rc::new(Reactor::new());
    let (near_ext, near_fd) = common::pair();
    let (_far_ext, far_fd) = common::pair();

    let done = Rc::new(Cell::new(false));
    let on_done = Rc::clone(&done);
    let _relay = Relay::couple(
        &reactor,
        ChannelConfig::duplex(near_fd),
        ChannelConfig::duplex(far_fd),
        RelayMode::CloseTogether,
        move || on_done.set(true),
    )
    .unwrap();

    // Dropping the near peer entirely finishes its channel; the far side
    // must follow without its own stream ending.
    drop(near_ext);
    common::pump(&reactor, || done.get());
}
