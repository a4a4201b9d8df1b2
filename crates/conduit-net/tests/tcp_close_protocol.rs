use std::{
    net::TcpListener,
    os::fd::AsRawFd,
    sync::{
        Arc, mpsc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use conduit_net::{CloseReason, Config, Connection, ConnectionError, Shared};

fn accept_one(listener: TcpListener, shared: Arc<Shared>) -> mpsc::Receiver<Arc<Connection>> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let (stream, peer) = listener.accept().unwrap();
        stream.set_nonblocking(true).unwrap();
        let mio_stream = mio::net::TcpStream::from_std(stream);
        let connection = Connection::from_accepted(shared, peer, mio_stream, |_| {});
        tx.send(connection).unwrap();
    });
    rx
}

fn connect_and_wait_with_close(
    shared: Arc<Shared>,
    addr: std::net::SocketAddr,
    on_closed: impl FnOnce(CloseReason) + Send + 'static,
) -> Arc<Connection> {
    let (established_tx, established_rx) = mpsc::channel();
    let conn = Connection::connect(
        shared,
        addr,
        move |_| {
            let _ = established_tx.send(());
        },
        |err| panic!("connect failed: {err}"),
        on_closed,
    );
    established_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    conn
}

#[test]
fn peer_close_delivers_exactly_one_success_reason_and_no_empty_receive() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = accept_one(listener, Shared::new(Config::default()).unwrap())
        .recv_timeout(Duration::from_secs(2))
        .unwrap();

    let consumer_invoked = Arc::new(AtomicBool::new(false));
    let consumer_invoked_for_cb = Arc::clone(&consumer_invoked);

    let (closed_tx, closed_rx) = mpsc::channel();
    let client = connect_and_wait_with_close(Shared::new(Config::default()).unwrap(), addr, move |reason| {
        let _ = closed_tx.send(reason);
    });
    client
        .receive_async(move |_| {
            consumer_invoked_for_cb.store(true, Ordering::SeqCst);
        })
        .unwrap();

    server.close();

    let reason = closed_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(matches!(reason, CloseReason::PeerClosed));
    assert!(reason.is_success());

    std::thread::sleep(Duration::from_millis(100));
    assert!(!consumer_invoked.load(Ordering::SeqCst));
    assert!(client.is_closed());
}

#[test]
fn reset_during_send_surfaces_as_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let (accepted_tx, accepted_rx) = mpsc::channel();
    std::thread::spawn(move || {
        let (stream, _peer) = listener.accept().unwrap();
        accepted_tx.send(stream).unwrap();
    });

    let (closed_tx, closed_rx) = mpsc::channel();
    let client = connect_and_wait_with_close(Shared::new(Config::default()).unwrap(), addr, move |reason| {
        let _ = closed_tx.send(reason);
    });

    let server_stream = accepted_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    let linger = libc::linger { l_onoff: 1, l_linger: 0 };
    let rc = unsafe {
        libc::setsockopt(
            server_stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            std::ptr::addr_of!(linger).cast(),
            std::mem::size_of::<libc::linger>() as libc::socklen_t,
        )
    };
    assert_eq!(rc, 0);
    drop(server_stream);

    for _ in 0..200 {
        client.enqueue_send(&[&[0xFF; 64]]);
        std::thread::sleep(Duration::from_millis(10));
        if let Ok(reason) = closed_rx.try_recv() {
            assert!(matches!(reason, CloseReason::Transport(_) | CloseReason::PeerClosed));
            return;
        }
    }
    panic!("connection never observed the peer reset");
}

#[test]
fn second_receive_registration_is_rejected_without_closing_the_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let _server = accept_one(listener, Shared::new(Config::default()).unwrap())
        .recv_timeout(Duration::from_secs(2))
        .unwrap();

    let client = connect_and_wait_with_close(Shared::new(Config::default()).unwrap(), addr, |_| {});

    assert!(client.receive_async(|_| {}).is_ok());
    let second = client.receive_async(|_| {});
    assert!(matches!(second, Err(ConnectionError::ConsumerAlreadyRegistered)));
    assert!(!client.is_closed());

    client.close();
}
