use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    net::SocketAddr,
    os::fd::AsRawFd,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use mio::Interest;

use crate::{
    error::{CloseReason, ConnectionError},
    pool::{buffer::BorrowedBuffer, context::OpContext},
    reactor::{ReadinessHandler, Registration},
    shared::Shared,
};

enum IoState {
    Unbound,
    Open { stream: mio::net::TcpStream, registration: Registration, writable_armed: bool },
    Closed,
}

#[derive(Default)]
struct SendState {
    queue: VecDeque<Vec<u8>>,
    in_flight: bool,
}

#[derive(Default)]
struct Staging {
    buffer: Vec<u8>,
}

struct QueuedReceive {
    buffer: BorrowedBuffer,
    filled: usize,
}

#[derive(Default)]
struct RecvState {
    queue: VecDeque<QueuedReceive>,
    consumer: Option<Box<dyn FnMut(&[&[u8]]) + Send>>,
}

enum SendOutcome {
    CompletedInline,
    Posted,
    Failed(io::Error),
}

enum ReadOutcome {
    Bytes(usize),
    Error(io::Error),
}

/// Clears `recv_active` on every return path out of `receive_loop`,
/// including the early ones.
struct RecvActiveGuard<'a>(&'a AtomicBool);

impl Drop for RecvActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Default)]
struct Counters {
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
    sends_started: AtomicU64,
    receives_started: AtomicU64,
}

/// A point-in-time read of a connection's advisory counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct CountersSnapshot {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
    pub bytes_received: u64,
    pub sends_started: u64,
    pub receives_started: u64,
}

/// One connected socket: owns its lifecycle, coalesces outbound writes,
/// and dispatches received byte ranges to a single consumer.
///
/// Built only through [`Connection::connect`] or [`Connection::from_accepted`];
/// both bind a `connection_closed` listener at construction so it can
/// never race a caller registering one after the fact.
pub struct Connection {
    shared: Arc<Shared>,
    remote: SocketAddr,

    io: Mutex<IoState>,
    send_state: spin::Mutex<SendState>,
    staging: Mutex<Staging>,
    send_ctx: Mutex<Option<OpContext>>,
    recv_state: Mutex<RecvState>,
    recv_ctx: Mutex<Option<OpContext>>,

    closed: AtomicBool,
    recv_active: AtomicBool,
    /// Mirrors `io`'s `Open` variant without requiring a lock: `drain`
    /// consults this under the send lock to bail out while still
    /// `Unbound` (an `enqueue_send` can legitimately race `connect`'s
    /// background resolution) instead of discovering the absent send
    /// context only after slices have already been popped off the queue.
    is_open: AtomicBool,
    counters: Counters,
    on_closed: Mutex<Option<Box<dyn FnOnce(CloseReason) + Send>>>,
}

impl Connection {
    fn new_unbound(
        shared: Arc<Shared>,
        remote: SocketAddr,
        on_closed: Box<dyn FnOnce(CloseReason) + Send>,
    ) -> Arc<Self> {
        Arc::new(Self {
            shared,
            remote,
            io: Mutex::new(IoState::Unbound),
            send_state: spin::Mutex::new(SendState::default()),
            staging: Mutex::new(Staging::default()),
            send_ctx: Mutex::new(None),
            recv_state: Mutex::new(RecvState::default()),
            recv_ctx: Mutex::new(None),
            closed: AtomicBool::new(false),
            recv_active: AtomicBool::new(false),
            is_open: AtomicBool::new(false),
            counters: Counters::default(),
            on_closed: Mutex::new(Some(on_closed)),
        })
    }

    /// Initiates an outbound connection through `shared.connector`.
    ///
    /// `on_established` fires once the socket transitions to `Open`
    /// (after which a drain is kicked, in case `enqueue_send` ran while
    /// still unbound); `on_failed` fires instead if the connect itself
    /// never produces a socket. `on_closed` is bound now so it cannot
    /// race a later registration.
    pub fn connect(
        shared: Arc<Shared>,
        remote: SocketAddr,
        on_established: impl FnOnce(&Arc<Connection>) + Send + 'static,
        on_failed: impl FnOnce(io::Error) + Send + 'static,
        on_closed: impl FnOnce(CloseReason) + Send + 'static,
    ) -> Arc<Self> {
        let connection = Self::new_unbound(Arc::clone(&shared), remote, Box::new(on_closed));
        let for_success = Arc::clone(&connection);
        shared.connector.connect(
            remote,
            Box::new(move |stream| {
                if matches!(for_success.init_socket(stream), Ok(true)) {
                    on_established(&for_success);
                    for_success.drain();
                }
            }),
            Box::new(on_failed),
        );
        connection
    }

    /// Adopts an already-accepted socket and transitions immediately to
    /// `Open`.
    pub fn from_accepted(
        shared: Arc<Shared>,
        remote: SocketAddr,
        stream: mio::net::TcpStream,
        on_closed: impl FnOnce(CloseReason) + Send + 'static,
    ) -> Arc<Self> {
        let connection = Self::new_unbound(shared, remote, Box::new(on_closed));
        let _ = connection.init_socket(stream);
        connection
    }

    /// `Ok(true)`: transitioned to `Open`. `Ok(false)`: short-circuited
    /// straight to `Closed` (caller must not fire `on_established`).
    /// `Err`: the context pool was exhausted; the connection is already
    /// closing.
    fn init_socket(self: &Arc<Self>, mut stream: mio::net::TcpStream) -> Result<bool, ConnectionError> {
        if stream.set_nodelay(true).is_err() {
            self.close_internal(CloseReason::Transport(io::Error::from(io::ErrorKind::NotConnected)));
            return Ok(false);
        }

        let send_ctx = match self.shared.contexts.get() {
            Ok(ctx) => ctx,
            Err(err) => {
                self.close_internal(CloseReason::Transport(io::Error::other(err.to_string())));
                return Err(err);
            }
        };
        let recv_ctx = match self.shared.contexts.get() {
            Ok(ctx) => ctx,
            Err(err) => {
                self.shared.contexts.put(send_ctx);
                self.close_internal(CloseReason::Transport(io::Error::other(err.to_string())));
                return Err(err);
            }
        };

        let handler: Arc<dyn ReadinessHandler> = Arc::clone(self) as Arc<dyn ReadinessHandler>;
        let registration = match self.shared.reactor.register(&mut stream, Interest::READABLE, handler) {
            Ok(reg) => reg,
            Err(err) => {
                self.shared.contexts.put(send_ctx);
                self.shared.contexts.put(recv_ctx);
                self.close_internal(CloseReason::Transport(err));
                return Ok(false);
            }
        };

        *self.send_ctx.lock().unwrap() = Some(send_ctx);
        *self.recv_ctx.lock().unwrap() = Some(recv_ctx);
        *self.io.lock().unwrap() = IoState::Open { stream, registration, writable_armed: false };
        self.is_open.store(true, Ordering::SeqCst);

        self.receive_loop();
        Ok(true)
    }

    /// Appends `slices` to the send queue in order and kicks a drain.
    /// Silently dropped once closed.
    pub fn enqueue_send(&self, slices: &[&[u8]]) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let total: usize = slices.iter().map(|s| s.len()).sum();
        {
            let mut send = self.send_state.lock();
            for slice in slices {
                send.queue.push_back((*slice).to_vec());
            }
        }
        self.shared.monitor.scheduled(total);
        self.drain();
    }

    /// Drains the send queue into coalesced packets, one OS send in
    /// flight at a time. Written as a loop rather than recursion: each
    /// inline completion re-enters the top instead of growing the stack.
    fn drain(&self) {
        loop {
            let started = {
                let mut send = self.send_state.lock();
                if send.in_flight
                    || send.queue.is_empty()
                    || self.closed.load(Ordering::SeqCst)
                    || !self.is_open.load(Ordering::SeqCst)
                    || self.shared.monitor.is_send_blocked()
                {
                    false
                } else {
                    send.in_flight = true;
                    true
                }
            };
            if !started {
                return;
            }

            let staged = self.stage_next_packet();
            if staged == 0 {
                self.send_state.lock().in_flight = false;
                return;
            }

            self.shared.monitor.send_starting(staged);
            self.counters.sends_started.fetch_add(1, Ordering::Relaxed);

            match self.write_staged() {
                SendOutcome::Posted => return,
                SendOutcome::CompletedInline => continue,
                SendOutcome::Failed(err) => {
                    self.shared.monitor.send_completed(0);
                    self.release_send_context();
                    self.close_internal(CloseReason::Transport(err));
                    return;
                }
            }
        }
    }

    /// Dequeues slices into the staging buffer up to the soft ceiling and
    /// binds the send context's window over it. Returns the staged
    /// length.
    ///
    /// Each lock is acquired and released independently (send queue, then
    /// staging, then the send context) rather than nested, so no lock is
    /// ever held while acquiring another.
    fn stage_next_packet(&self) -> usize {
        let mut popped = Vec::new();
        let mut popped_len = 0usize;
        {
            let mut send = self.send_state.lock();
            while popped_len < self.shared.config.max_send_packet_size {
                let Some(slice) = send.queue.pop_front() else { break };
                popped_len += slice.len();
                popped.push(slice);
            }
        }

        let len = {
            let mut staging = self.staging.lock().unwrap();
            staging.buffer.clear();
            for slice in &popped {
                staging.buffer.extend_from_slice(slice);
            }
            staging.buffer.len()
        };

        if len > 0 {
            if let Some(ctx) = self.send_ctx.lock().unwrap().as_mut() {
                ctx.bind_send(0, len);
            }
        }
        len
    }

    /// Writes the staged packet, resuming from the send context's offset
    /// across WouldBlock-interrupted partial writes. One completion
    /// handler fires only once the whole packet is accepted by the
    /// kernel, matching the one-post-one-completion contract.
    fn write_staged(&self) -> SendOutcome {
        loop {
            let binding = self.send_ctx.lock().unwrap().as_ref().and_then(OpContext::send_binding);
            let Some((offset, len)) = binding else {
                return SendOutcome::CompletedInline;
            };
            if offset >= len {
                self.finish_send(len);
                return SendOutcome::CompletedInline;
            }

            match self.write_once(offset, len) {
                Ok(written) => {
                    let new_offset = offset + written;
                    if let Some(ctx) = self.send_ctx.lock().unwrap().as_mut() {
                        ctx.bind_send(new_offset, len);
                    }
                    if new_offset >= len {
                        self.disarm_writable_if_needed();
                        self.finish_send(len);
                        return SendOutcome::CompletedInline;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.arm_writable();
                    return SendOutcome::Posted;
                }
                Err(err) => return SendOutcome::Failed(err),
            }
        }
    }

    fn write_once(&self, offset: usize, len: usize) -> io::Result<usize> {
        let mut io = self.io.lock().unwrap();
        let IoState::Open { stream, .. } = &mut *io else {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        };
        let staging = self.staging.lock().unwrap();
        stream.write(&staging.buffer[offset..len])
    }

    fn finish_send(&self, bytes: usize) {
        self.shared.monitor.send_completed(bytes);
        self.counters.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.counters.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.send_state.lock().in_flight = false;
    }

    fn release_send_context(&self) {
        if let Some(ctx) = self.send_ctx.lock().unwrap().take() {
            self.shared.contexts.put(ctx);
        }
    }

    fn arm_writable(&self) {
        let mut io = self.io.lock().unwrap();
        if let IoState::Open { stream, registration, writable_armed } = &mut *io {
            if !*writable_armed
                && self
                    .shared
                    .reactor
                    .reregister(stream, *registration, Interest::READABLE | Interest::WRITABLE)
                    .is_ok()
            {
                *writable_armed = true;
            }
        }
    }

    fn disarm_writable_if_needed(&self) {
        let mut io = self.io.lock().unwrap();
        if let IoState::Open { stream, registration, writable_armed } = &mut *io {
            if *writable_armed && self.shared.reactor.reregister(stream, *registration, Interest::READABLE).is_ok() {
                *writable_armed = false;
            }
        }
    }

    /// Registers `callback` as the sole pending consumer, then attempts
    /// to dispatch whatever is already queued. Fails if a registration
    /// is already outstanding (at most one is allowed at a time; a
    /// consumer may re-register synchronously from within its own
    /// invocation).
    pub fn receive_async<F>(&self, callback: F) -> Result<(), ConnectionError>
    where
        F: FnMut(&[&[u8]]) + Send + 'static,
    {
        {
            let mut recv = self.recv_state.lock().unwrap();
            if recv.consumer.is_some() {
                return Err(ConnectionError::ConsumerAlreadyRegistered);
            }
            recv.consumer = Some(Box::new(callback));
        }
        self.dispatch();
        Ok(())
    }

    /// Perpetually checks out a buffer, arms one receive, and handles its
    /// completion, looping back for the next arm instead of recursing.
    /// Returns as soon as an arm would block (the reactor resumes it via
    /// `on_readable`) or the connection closes.
    ///
    /// Guarded by `recv_active` rather than the receive-context lock alone:
    /// the initial call from `init_socket` and a reactor `on_readable` can
    /// observe readiness for the same registration concurrently, and since
    /// this loop already reads until `WouldBlock` (edge-triggered), a
    /// concurrent entrant would only race to rebind the one shared receive
    /// context's buffer. A second entrant is a no-op: the active loop will
    /// drain whatever became readable before it returns.
    fn receive_loop(&self) {
        if self.recv_active.swap(true, Ordering::AcqRel) {
            return;
        }
        let _guard = RecvActiveGuard(&self.recv_active);

        loop {
            let buffer = match self.shared.buffers.check_out() {
                Ok(buffer) => buffer,
                Err(err) => {
                    self.close_internal(CloseReason::Transport(io::Error::other(err.to_string())));
                    return;
                }
            };

            let mut ctx_guard = self.recv_ctx.lock().unwrap();
            let Some(ctx) = ctx_guard.as_mut() else {
                drop(ctx_guard);
                self.shared.buffers.check_in(buffer);
                return;
            };
            ctx.bind_recv(buffer);
            self.shared.monitor.receive_starting();
            self.counters.receives_started.fetch_add(1, Ordering::Relaxed);
            let outcome = self.read_once_locked(ctx);
            drop(ctx_guard);

            let Some(outcome) = outcome else {
                return;
            };

            match outcome {
                ReadOutcome::Bytes(0) => {
                    self.shared.monitor.receive_completed(0);
                    self.release_receive_context_and_buffer();
                    self.close_internal(CloseReason::PeerClosed);
                    return;
                }
                ReadOutcome::Error(err) => {
                    self.shared.monitor.receive_completed(0);
                    self.release_receive_context_and_buffer();
                    self.close_internal(CloseReason::Transport(err));
                    return;
                }
                ReadOutcome::Bytes(n) => {
                    self.shared.monitor.receive_completed(n);
                    self.counters.packets_received.fetch_add(1, Ordering::Relaxed);
                    self.counters.bytes_received.fetch_add(n as u64, Ordering::Relaxed);

                    let buffer = {
                        let mut ctx_guard = self.recv_ctx.lock().unwrap();
                        ctx_guard.as_mut().and_then(OpContext::take_recv_buffer)
                    };
                    if let Some(buffer) = buffer {
                        self.recv_state.lock().unwrap().queue.push_back(QueuedReceive { buffer, filled: n });
                    }
                    self.dispatch();
                }
            }
        }
    }

    /// A single non-blocking read attempt into the context's bound
    /// buffer. `None` means WouldBlock (the reactor will call back);
    /// `Some` means the operation already completed, successfully or not.
    fn read_once_locked(&self, ctx: &mut OpContext) -> Option<ReadOutcome> {
        let mut io = self.io.lock().unwrap();
        let IoState::Open { stream, .. } = &mut *io else {
            return Some(ReadOutcome::Error(io::Error::from(io::ErrorKind::NotConnected)));
        };
        let buffer = ctx.recv_buffer_mut().expect("receive context must be bound before reading");
        match stream.read(buffer.as_mut_slice()) {
            Ok(n) => Some(ReadOutcome::Bytes(n)),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => None,
            Err(err) => Some(ReadOutcome::Error(err)),
        }
    }

    fn release_receive_context_and_buffer(&self) {
        let ctx = self.recv_ctx.lock().unwrap().take();
        if let Some(ctx) = ctx {
            if let Some(buffer) = self.shared.contexts.put(ctx) {
                self.shared.buffers.check_in(buffer);
            }
        }
    }

    /// Takes the whole queued batch and the registered consumer
    /// together, invokes the consumer once outside any lock, then runs
    /// every release action.
    fn dispatch(&self) {
        let (batch, mut consumer) = {
            let mut recv = self.recv_state.lock().unwrap();
            if recv.consumer.is_none() || recv.queue.is_empty() {
                return;
            }
            let batch: Vec<QueuedReceive> = recv.queue.drain(..).collect();
            let consumer = recv.consumer.take().unwrap();
            (batch, consumer)
        };

        let slices: Vec<&[u8]> = batch.iter().map(|queued| &queued.buffer.as_slice()[..queued.filled]).collect();
        consumer(&slices);
        drop(slices);

        let mut total = 0usize;
        for queued in batch {
            total += queued.filled;
            self.shared.buffers.check_in(queued.buffer);
        }
        self.shared.monitor.receive_dispatched(total);
    }

    /// Explicit close. Idempotent.
    pub fn close(&self) {
        self.close_internal(CloseReason::Requested);
    }

    /// Single-shot teardown guarded by a compare-and-swap on `closed`.
    fn close_internal(&self, reason: CloseReason) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.shared.monitor.closed();
        if self.shared.config.verbose {
            tracing::info!(counters = ?self.counters_snapshot(), "connection closed");
        }

        {
            let mut io = self.io.lock().unwrap();
            if let IoState::Open { mut stream, registration, .. } = std::mem::replace(&mut *io, IoState::Closed) {
                set_linger(&stream, self.shared.config.socket_close_timeout_ms);
                let _ = self.shared.reactor.deregister(&mut stream, registration);
                let _ = stream.shutdown(std::net::Shutdown::Both);
            }
        }

        let in_flight = self.send_state.lock().in_flight;
        if !in_flight {
            self.release_send_context();
        }

        if let Some(on_closed) = self.on_closed.lock().unwrap().take() {
            on_closed(reason);
        }
    }

    pub fn effective_endpoint(&self) -> SocketAddr {
        self.remote
    }

    /// Advisory: the number of slices currently queued, not yet staged.
    pub fn send_queue_size(&self) -> usize {
        self.send_state.lock().queue.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn counters_snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            packets_sent: self.counters.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            packets_received: self.counters.packets_received.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
            sends_started: self.counters.sends_started.load(Ordering::Relaxed),
            receives_started: self.counters.receives_started.load(Ordering::Relaxed),
        }
    }
}

impl ReadinessHandler for Connection {
    fn on_readable(&self) {
        self.receive_loop();
    }

    fn on_writable(&self) {
        match self.write_staged() {
            SendOutcome::CompletedInline => self.drain(),
            SendOutcome::Posted => {}
            SendOutcome::Failed(err) => {
                self.shared.monitor.send_completed(0);
                self.release_send_context();
                self.close_internal(CloseReason::Transport(err));
            }
        }
    }
}

/// Applies the configured close timeout via `SO_LINGER`, mirroring the
/// raw-setsockopt idiom this codebase uses for socket buffer sizing.
fn set_linger(stream: &mio::net::TcpStream, timeout_ms: u64) {
    let linger = libc::linger { l_onoff: 1, l_linger: (timeout_ms / 1000) as libc::c_int };
    unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            (&raw const linger).cast(),
            core::mem::size_of::<libc::linger>() as libc::socklen_t,
        );
    }
}
