/// Soft ceiling on one coalesced outbound packet. The drain may exceed this
/// by at most one slice.
pub const DEFAULT_MAX_SEND_PACKET_SIZE: usize = 64 * 1024;

/// Tunables for a [`Shared`](crate::Shared) instance and the connections
/// built from it.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of chunks in the shared byte buffer pool.
    pub buffer_chunks_count: usize,
    /// Size in bytes of each buffer pool chunk; also the per-receive read
    /// size.
    pub socket_buffer_size: usize,
    /// Number of reusable operation contexts in the shared context pool.
    /// Each connection checks out two (one send, one receive) for its
    /// lifetime.
    pub send_receive_pool_size: usize,
    /// `SO_LINGER` timeout applied when a connection closes.
    pub socket_close_timeout_ms: u64,
    /// Soft ceiling on one coalesced outbound packet.
    pub max_send_packet_size: usize,
    /// Enables a counters snapshot log line on close.
    pub verbose: bool,
    /// Number of reactor worker threads driving readiness-triggered
    /// completions.
    pub reactor_threads: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            buffer_chunks_count: 256,
            socket_buffer_size: 64 * 1024,
            send_receive_pool_size: 256,
            socket_close_timeout_ms: 2_000,
            max_send_packet_size: DEFAULT_MAX_SEND_PACKET_SIZE,
            verbose: false,
            reactor_threads: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
        }
    }
}
