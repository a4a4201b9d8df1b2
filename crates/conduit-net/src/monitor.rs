use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Process-wide lifecycle/telemetry sink injected into every
/// [`Connection`](crate::Connection).
///
/// The core emits these notifications at fixed transitions in the send and
/// receive engines; a monitor may aggregate or drop them freely. Every
/// method has a no-op default so implementors only override what they use.
pub trait ConnectionMonitor: Send + Sync {
    fn is_send_blocked(&self) -> bool {
        false
    }
    fn scheduled(&self, _bytes: usize) {}
    fn send_starting(&self, _bytes: usize) {}
    fn send_completed(&self, _bytes: usize) {}
    fn receive_starting(&self) {}
    fn receive_completed(&self, _bytes: usize) {}
    fn receive_dispatched(&self, _bytes: usize) {}
    fn closed(&self) {}
}

/// Discards every notification and never reports send-blocked.
#[derive(Default)]
pub struct NullMonitor;

impl ConnectionMonitor for NullMonitor {}

/// Atomic counters plus a toggleable send-blocked flag.
///
/// Suitable for the backpressure test in this crate and as a minimal
/// production stand-in when no richer telemetry pipeline is wired up.
#[derive(Default)]
pub struct CountingMonitor {
    send_blocked: AtomicBool,
    bytes_scheduled: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    sends_started: AtomicU64,
    receives_started: AtomicU64,
    bytes_dispatched: AtomicU64,
    closes: AtomicU64,
}

impl CountingMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_send_blocked(&self, blocked: bool) {
        self.send_blocked.store(blocked, Ordering::SeqCst);
    }

    pub fn bytes_scheduled(&self) -> u64 {
        self.bytes_scheduled.load(Ordering::SeqCst)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::SeqCst)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::SeqCst)
    }

    pub fn sends_started(&self) -> u64 {
        self.sends_started.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> u64 {
        self.closes.load(Ordering::SeqCst)
    }
}

impl ConnectionMonitor for CountingMonitor {
    fn is_send_blocked(&self) -> bool {
        self.send_blocked.load(Ordering::SeqCst)
    }

    fn scheduled(&self, bytes: usize) {
        self.bytes_scheduled.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn send_starting(&self, _bytes: usize) {
        self.sends_started.fetch_add(1, Ordering::Relaxed);
    }

    fn send_completed(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn receive_starting(&self) {
        self.receives_started.fetch_add(1, Ordering::Relaxed);
    }

    fn receive_completed(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn receive_dispatched(&self, bytes: usize) {
        self.bytes_dispatched.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn closed(&self) {
        self.closes.fetch_add(1, Ordering::Relaxed);
    }
}
