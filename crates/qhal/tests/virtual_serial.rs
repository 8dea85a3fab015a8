//! Virtual serial links between kernel threads.

use std::sync::Arc;

use parking_lot::Mutex;
use qhal::{Channel, ChannelError, VirtualSerial, VirtualSerialConfig, VirtualSerialState};
use qkernel::{Kernel, ThreadConfig, ThreadPriority, Timeout};

#[test]
fn echo_between_threads() {
    let kernel = Kernel::start();
    let sys = kernel.system().clone();
    let (host, device) = VirtualSerial::pair(&sys);

    let echo = {
        let device = Arc::clone(&device);
        sys.spawn(ThreadConfig::new("echo", ThreadPriority::NORMAL.below(1)), move || {
            let mut line = [0u8; 4];
            assert_eq!(device.read(&mut line), Ok(4));
            line.make_ascii_uppercase();
            assert_eq!(device.write(&line), Ok(4));
        })
        .unwrap()
    };

    assert_eq!(host.write(b"ping"), Ok(4));
    let mut reply = [0u8; 4];
    assert_eq!(host.read_timeout(&mut reply, Timeout::Ticks(100)), Ok(4));
    assert_eq!(&reply, b"PING");

    sys.join(echo);
    assert_eq!(host.available(), 0);
    assert_eq!(device.available(), 0);
}

#[test]
fn stop_releases_blocked_reader() {
    let kernel = Kernel::start();
    let sys = kernel.system().clone();
    let (_host, device) = VirtualSerial::pair(&sys);
    let outcome = Arc::new(Mutex::new(None));

    let reader = {
        let (device, outcome) = (Arc::clone(&device), Arc::clone(&outcome));
        sys.spawn(ThreadConfig::new("reader", ThreadPriority::NORMAL.above(1)), move || {
            let mut buf = [0u8; 8];
            let count = device.read(&mut buf);
            *outcome.lock() = Some((count, device.get_timeout(Timeout::Immediate)));
        })
        .unwrap()
    };
    assert!(outcome.lock().is_none());

    device.stop();

    assert_eq!(*outcome.lock(), Some((Ok(0), Err(ChannelError::NotReady))));
    assert_eq!(device.state(), VirtualSerialState::Stop);
    sys.join(reader);
}

#[test]
fn restarted_endpoint_carries_traffic_again() {
    let kernel = Kernel::start();
    let sys = kernel.system();
    let (a, b) = VirtualSerial::pair(sys);

    b.stop();
    assert_eq!(b.write(b"x"), Err(ChannelError::NotReady));
    assert_eq!(a.put_timeout(1, Timeout::Immediate), Ok(()));

    b.start(VirtualSerialConfig {
        far_end: Arc::downgrade(&a),
    });
    assert_eq!(b.available(), 1, "bytes written while stopped stay queued");
    assert_eq!(b.write(b"ok"), Ok(2));

    let mut buf = [0u8; 2];
    assert_eq!(a.read(&mut buf), Ok(2));
    assert_eq!(&buf, b"ok");
    assert_eq!(b.get(), Ok(1));
}
