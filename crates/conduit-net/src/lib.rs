//! An asynchronous, bidirectional, byte-oriented TCP connection core.
//!
//! Sits between a raw OS socket and a framed protocol layer: owns one
//! connected socket's lifecycle, coalesces outbound writes, recycles
//! receive buffers through a shared pool, and delivers received byte
//! ranges to a single consumer. See [`Connection`] for the public
//! surface and [`Shared`] for the pools/reactor/monitor every connection
//! draws from.

mod config;
mod connection;
mod connector;
mod error;
mod monitor;
mod pool;
mod reactor;
mod shared;

pub use config::{Config, DEFAULT_MAX_SEND_PACKET_SIZE};
pub use connection::{Connection, CountersSnapshot};
pub use connector::{Connector, DefaultConnector};
pub use error::{CloseReason, ConnectionError};
pub use monitor::{ConnectionMonitor, CountingMonitor, NullMonitor};
pub use reactor::{ReactorPool, ReadinessHandler, Registration};
pub use shared::Shared;
