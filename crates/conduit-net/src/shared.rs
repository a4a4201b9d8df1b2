use std::{io, sync::Arc};

use crate::{
    config::Config,
    connector::{Connector, DefaultConnector},
    monitor::{ConnectionMonitor, NullMonitor},
    pool::{buffer::BufferPool, context::ContextPool},
    reactor::ReactorPool,
};

/// The process-wide (or per-listener) collaborators every [`Connection`](crate::Connection)
/// built from it shares: the buffer and context pools, the telemetry
/// monitor, the reactor, and the connector.
pub struct Shared {
    pub(crate) config: Config,
    pub(crate) buffers: BufferPool,
    pub(crate) contexts: ContextPool,
    pub(crate) monitor: Arc<dyn ConnectionMonitor>,
    pub(crate) reactor: ReactorPool,
    pub(crate) connector: Arc<dyn Connector>,
}

impl Shared {
    /// Builds pools and a reactor sized from `config`, with a no-op
    /// monitor and the default connector.
    pub fn new(config: Config) -> io::Result<Arc<Self>> {
        Self::with_monitor_and_connector(config, Arc::new(NullMonitor), Arc::new(DefaultConnector))
    }

    pub fn with_monitor(config: Config, monitor: Arc<dyn ConnectionMonitor>) -> io::Result<Arc<Self>> {
        Self::with_monitor_and_connector(config, monitor, Arc::new(DefaultConnector))
    }

    pub fn with_monitor_and_connector(
        config: Config,
        monitor: Arc<dyn ConnectionMonitor>,
        connector: Arc<dyn Connector>,
    ) -> io::Result<Arc<Self>> {
        let buffers = BufferPool::new(config.socket_buffer_size, config.buffer_chunks_count);
        let contexts = ContextPool::new(config.send_receive_pool_size);
        let reactor = ReactorPool::new(config.reactor_threads)?;
        Ok(Arc::new(Self { config, buffers, contexts, monitor, reactor, connector }))
    }
}
