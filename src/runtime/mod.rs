//! Runtime for the benchmark roles.
//!
//! - `pool`/`buffer`: pooled control buffers and chunked transfer buffers
//! - `token`: operation tracking for completion correlation
//! - `transport`: the point-to-point transport contract
//! - `tcp`: a non-blocking TCP transport built on mio
//!
//! Everything here runs on the single thread that owns the transport.

mod buffer;
mod connection;
mod pool;
mod tcp;
mod token;
mod transport;

pub use buffer::{BufferPools, BufferSet};
pub use pool::{ObjectPool, PoolError, PoolItem};
pub use tcp::TcpTransport;
pub use token::{JoinCounter, TokenAllocator};
pub use transport::{ConnId, Event, Transport, TransportError};

#[cfg(test)]
pub use transport::mock;
