use std::{
    net::TcpListener,
    sync::{
        Arc, mpsc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use conduit_net::{Config, Connection, CountingMonitor, Shared};

/// Registers `conn`'s consumer, accumulating delivered bytes into
/// `total` and re-registering until `target` bytes have arrived, at
/// which point it signals `done_tx` instead of re-arming.
fn register_consumer(conn: Arc<Connection>, total: Arc<AtomicUsize>, target: usize, done_tx: mpsc::Sender<()>) {
    let next_conn = Arc::clone(&conn);
    let next_total = Arc::clone(&total);
    let next_tx = done_tx.clone();
    let _ = conn.receive_async(move |ranges| {
        let batch: usize = ranges.iter().map(|range| range.len()).sum();
        let seen = next_total.fetch_add(batch, Ordering::SeqCst) + batch;
        if seen >= target {
            let _ = next_tx.send(());
        } else {
            register_consumer(Arc::clone(&next_conn), Arc::clone(&next_total), target, next_tx.clone());
        }
    });
}

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

fn connect_and_wait(shared: Arc<Shared>, addr: std::net::SocketAddr) -> Arc<Connection> {
    let (established_tx, established_rx) = mpsc::channel();
    let conn = Connection::connect(
        shared,
        addr,
        move |_| {
            let _ = established_tx.send(());
        },
        |err| panic!("connect failed: {err}"),
        |_| {},
    );
    established_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    conn
}

#[test]
fn coalesce_bounds_os_sends_while_preserving_total_bytes() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = accept_one(listener, Shared::new(Config::default()).unwrap())
        .recv_timeout(Duration::from_secs(2))
        .unwrap();

    let total = Arc::new(AtomicUsize::new(0));
    let (done_tx, done_rx) = mpsc::channel();
    register_consumer(Arc::clone(&server), Arc::clone(&total), 100 * 1024, done_tx);

    let monitor = Arc::new(CountingMonitor::new());
    let client_shared =
        Shared::with_monitor(Config::default(), Arc::clone(&monitor) as Arc<_>).unwrap();
    let client = connect_and_wait(client_shared, addr);

    let payload = vec![0xAB_u8; 1024];
    let slices: Vec<&[u8]> = std::iter::repeat(payload.as_slice()).take(100).collect();
    client.enqueue_send(&slices);

    done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(total.load(Ordering::SeqCst), 100 * 1024);
    assert!(monitor.sends_started() <= 2, "expected at most 2 OS sends, got {}", monitor.sends_started());

    client.close();
    server.close();
}

#[test]
fn send_blocked_monitor_defers_every_slice_until_unblocked() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = accept_one(listener, Shared::new(Config::default()).unwrap())
        .recv_timeout(Duration::from_secs(2))
        .unwrap();

    let total = Arc::new(AtomicUsize::new(0));
    let (done_tx, done_rx) = mpsc::channel();
    register_consumer(Arc::clone(&server), Arc::clone(&total), 10, done_tx);

    let monitor = Arc::new(CountingMonitor::new());
    let client_shared =
        Shared::with_monitor(Config::default(), Arc::clone(&monitor) as Arc<_>).unwrap();
    let client = connect_and_wait(client_shared, addr);

    monitor.set_send_blocked(true);
    for _ in 0..10 {
        client.enqueue_send(&[&[0x09]]);
    }
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(client.send_queue_size(), 10);
    assert_eq!(monitor.sends_started(), 0);

    monitor.set_send_blocked(false);
    client.enqueue_send(&[]);

    done_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(total.load(Ordering::SeqCst), 10);
    assert_eq!(client.send_queue_size(), 0);

    client.close();
    server.close();
}
