use std::{io, net::SocketAddr, thread};

/// Resolves a remote address into a connected, non-blocking socket.
///
/// Exists as a trait so callers can substitute a connection-pooling
/// resolver or a test double; [`DefaultConnector`] is the production
/// implementation used when none is supplied.
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        remote: SocketAddr,
        on_success: Box<dyn FnOnce(mio::net::TcpStream) + Send>,
        on_failure: Box<dyn FnOnce(io::Error) + Send>,
    );
}

/// Spawns the blocking OS connect call on a dedicated thread and reports
/// back through `on_success`/`on_failure`, grounded in the same
/// non-blocking-socket idiom used by the send/receive engines.
pub struct DefaultConnector;

impl Connector for DefaultConnector {
    fn connect(
        &self,
        remote: SocketAddr,
        on_success: Box<dyn FnOnce(mio::net::TcpStream) + Send>,
        on_failure: Box<dyn FnOnce(io::Error) + Send>,
    ) {
        thread::Builder::new()
            .name("conduit-connect".into())
            .spawn(move || match std::net::TcpStream::connect(remote) {
                Ok(std_stream) => match std_stream.set_nonblocking(true) {
                    Ok(()) => on_success(mio::net::TcpStream::from_std(std_stream)),
                    Err(err) => on_failure(err),
                },
                Err(err) => on_failure(err),
            })
            .expect("failed to spawn connect thread");
    }
}
