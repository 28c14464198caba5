//! Transport contract shared by both benchmark roles.
//!
//! A transport moves two kinds of traffic between connected endpoints:
//!
//! - Control messages: small, self-contained, delivered to the receiver as
//!   [`Event::Message`] without a posted receive.
//! - Data chunks: tagged with a 32-bit value and matched in FIFO order
//!   against receives posted with the same tag on the same connection.
//!
//! Completions are not delivered through callbacks. `progress()` appends
//! the events that became ready to a caller-supplied list, and the caller
//! applies them to its own state. Every accepted submission produces exactly
//! one completion event carrying the caller's token.

use bytes::Bytes;
use std::fmt;
use std::io;
use std::net::SocketAddr;

/// Connection handle issued by a transport.
pub type ConnId = usize;

/// Failure reported in a completion or connection event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The peer refused or reset the connection.
    Refused,
    /// The connection is not established (yet, or anymore).
    NotConnected,
    /// The connect attempt did not finish within the connect timeout.
    TimedOut,
    /// The operation was canceled by a disconnect.
    Canceled,
    /// A data chunk larger than the posted receive arrived.
    Truncated { posted: usize, received: usize },
    /// Any other socket level failure.
    Io(io::ErrorKind),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Refused => write!(f, "connection refused"),
            TransportError::NotConnected => write!(f, "not connected"),
            TransportError::TimedOut => write!(f, "connection timed out"),
            TransportError::Canceled => write!(f, "operation canceled"),
            TransportError::Truncated { posted, received } => {
                write!(f, "message truncated ({received} bytes into {posted})")
            }
            TransportError::Io(kind) => write!(f, "I/O error: {kind}"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset => {
                TransportError::Refused
            }
            io::ErrorKind::NotConnected => TransportError::NotConnected,
            io::ErrorKind::TimedOut => TransportError::TimedOut,
            kind => TransportError::Io(kind),
        }
    }
}

/// Something that happened on the transport since the previous `progress()`.
#[derive(Debug)]
pub enum Event {
    /// An outgoing connect finished.
    Connected {
        conn: ConnId,
        result: Result<(), TransportError>,
    },
    /// A new inbound connection is established.
    Accepted { conn: ConnId },
    /// A control message arrived.
    Message { conn: ConnId, data: Bytes },
    /// A control message or data chunk submission completed.
    Sent {
        token: u64,
        result: Result<(), TransportError>,
    },
    /// A posted data receive completed.
    Received {
        token: u64,
        result: Result<Bytes, TransportError>,
    },
    /// The connection failed. Outstanding operations stay pending until the
    /// owner disconnects it.
    ConnectionError { conn: ConnId, error: TransportError },
    /// A disconnect finished. Every operation of the connection has already
    /// been completed and the handle may be reused afterwards.
    Disconnected { conn: ConnId },
}

/// Point-to-point transport driven by a single owner.
pub trait Transport {
    /// Start accepting connections on `addr`, returning the bound address.
    fn listen(&mut self, addr: SocketAddr) -> io::Result<SocketAddr>;

    /// Start connecting to `addr`. The outcome arrives as `Event::Connected`.
    fn connect(&mut self, addr: SocketAddr) -> io::Result<ConnId>;

    /// Send a control message. Completes with `Event::Sent`.
    fn send_control(&mut self, conn: ConnId, data: &[u8], token: u64);

    /// Send a data chunk with `tag`. Completes with `Event::Sent`.
    fn send_chunk(&mut self, conn: ConnId, data: &[u8], tag: u32, token: u64);

    /// Post a receive for one data chunk of at most `len` bytes with `tag`.
    /// Completes with `Event::Received`.
    fn recv_chunk(&mut self, conn: ConnId, len: usize, tag: u32, token: u64);

    /// Tear the connection down. Outstanding operations complete with
    /// `TransportError::Canceled`, followed by `Event::Disconnected`.
    ///
    /// Calling this on a connection that is already disconnecting is the
    /// caller's bug; the transport ignores it.
    fn disconnect(&mut self, conn: ConnId);

    /// Drive pending I/O without blocking and append ready events to `events`.
    fn progress(&mut self, events: &mut Vec<Event>) -> io::Result<()>;

    /// Health of an established connection.
    fn status(&self, conn: ConnId) -> Result<(), TransportError>;

    /// Human readable identity of the remote endpoint.
    fn peer_name(&self, conn: ConnId) -> String;

    fn is_disconnecting(&self, conn: ConnId) -> bool;

    /// Connections known to the transport, excluding those being torn down.
    fn num_connections(&self) -> usize;
}
