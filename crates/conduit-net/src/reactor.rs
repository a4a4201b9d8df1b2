use std::{
    collections::HashMap,
    io,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use mio::{Events, Interest, Poll, Token, event::Source};

use conduit_support::{ThreadPriority, thread_boot};

/// Notified on the reactor worker thread that observed readiness, with no
/// core lock held. Implementations must not block.
pub trait ReadinessHandler: Send + Sync {
    fn on_readable(&self);
    fn on_writable(&self);
}

/// Identifies a live registration: which worker owns it and the `Token`
/// that worker's `Poll` knows it by.
#[derive(Clone, Copy, Debug)]
pub struct Registration {
    worker: usize,
    token: Token,
}

type HandlerMap = Mutex<HashMap<Token, Arc<dyn ReadinessHandler>>>;

struct WorkerHandle {
    registry: Arc<mio::Registry>,
    handlers: Arc<HandlerMap>,
}

/// A fixed pool of reactor worker threads, each driving one OS readiness
/// multiplexer, realizing "OS completion callback" semantics over
/// readiness events: there is no portable completion-port primitive in
/// this stack, so readiness is treated as "the operation can now
/// complete" and the actual syscall plus the rest of the completion
/// handler run synchronously on the worker thread that observed it.
pub struct ReactorPool {
    workers: Vec<WorkerHandle>,
    next_worker: AtomicUsize,
    next_token: AtomicUsize,
}

impl ReactorPool {
    pub fn new(threads: usize) -> io::Result<Self> {
        let threads = threads.max(1);
        let core_ids = core_affinity::get_core_ids().unwrap_or_default();
        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let poll = Poll::new()?;
            let registry = Arc::new(poll.registry().try_clone()?);
            let handlers: Arc<HandlerMap> = Arc::new(Mutex::new(HashMap::new()));
            let worker_handlers = Arc::clone(&handlers);
            let core = if core_ids.is_empty() { None } else { Some(core_ids[i % core_ids.len()].id) };
            thread::Builder::new()
                .name(format!("conduit-reactor-{i}"))
                .spawn(move || worker_loop(poll, worker_handlers, core))
                .expect("failed to spawn reactor worker thread");
            workers.push(WorkerHandle { registry, handlers });
        }
        Ok(Self { workers, next_worker: AtomicUsize::new(0), next_token: AtomicUsize::new(1) })
    }

    /// Assigns `source` to a worker round-robin and registers it for
    /// `interest`. `handler` is invoked on that worker's thread for every
    /// subsequent readiness event until `deregister`.
    pub fn register<S>(
        &self,
        source: &mut S,
        interest: Interest,
        handler: Arc<dyn ReadinessHandler>,
    ) -> io::Result<Registration>
    where
        S: Source + ?Sized,
    {
        let worker = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        let token = Token(self.next_token.fetch_add(1, Ordering::Relaxed));
        let handle = &self.workers[worker];
        handle.registry.register(source, token, interest)?;
        handle.handlers.lock().unwrap().insert(token, handler);
        Ok(Registration { worker, token })
    }

    pub fn reregister<S>(&self, source: &mut S, reg: Registration, interest: Interest) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.workers[reg.worker].registry.reregister(source, reg.token, interest)
    }

    pub fn deregister<S>(&self, source: &mut S, reg: Registration) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        let handle = &self.workers[reg.worker];
        handle.handlers.lock().unwrap().remove(&reg.token);
        handle.registry.deregister(source)
    }
}

fn worker_loop(mut poll: Poll, handlers: Arc<HandlerMap>, core: Option<usize>) {
    thread_boot(core, ThreadPriority::High);
    let mut events = Events::with_capacity(256);
    loop {
        if let Err(err) = poll.poll(&mut events, Some(Duration::from_millis(250))) {
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            tracing::error!(?err, "reactor worker poll failed");
            continue;
        }

        for event in events.iter() {
            let handler = handlers.lock().unwrap().get(&event.token()).cloned();
            let Some(handler) = handler else { continue };
            if event.is_readable() {
                handler.on_readable();
            }
            if event.is_writable() {
                handler.on_writable();
            }
        }
    }
}
