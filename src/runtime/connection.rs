//! Connection state for the TCP transport.
//!
//! Each connection tracks its lifecycle state, inbound byte accumulation,
//! queued outbound frames and the receives posted against it.

use bytes::{Bytes, BytesMut};
use mio::net::TcpStream;
use slab::Slab;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::Instant;

use super::transport::TransportError;

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Outgoing connect in flight.
    Connecting { started: Instant },
    /// Established and usable.
    Established,
    /// Connect failed or the socket broke. Waiting for the owner to
    /// disconnect.
    Failed,
    /// Disconnect requested. Removed once the owner has seen the
    /// `Disconnected` event.
    Closing,
}

/// A frame queued for writing.
#[derive(Debug)]
pub struct OutFrame {
    pub buf: Vec<u8>,
    pub written: usize,
    pub token: u64,
}

/// A receive waiting for its data chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostedRecv {
    pub token: u64,
    pub len: usize,
}

/// Tag matching between posted receives and arriving data chunks.
///
/// Both sides are FIFO per tag. A chunk that arrives before its receive is
/// parked in the unexpected queue.
#[derive(Debug, Default)]
pub struct TagMatcher {
    posted: HashMap<u32, VecDeque<PostedRecv>>,
    unexpected: HashMap<u32, VecDeque<Bytes>>,
}

impl TagMatcher {
    /// Post a receive. Completes immediately when a matching chunk is
    /// already waiting.
    pub fn post(
        &mut self,
        tag: u32,
        recv: PostedRecv,
    ) -> Option<(u64, Result<Bytes, TransportError>)> {
        if let Some(data) = pop_entry(&mut self.unexpected, tag) {
            return Some((recv.token, complete(recv, data)));
        }
        self.posted.entry(tag).or_default().push_back(recv);
        None
    }

    /// Deliver an arriving chunk. Completes the oldest matching receive, if any.
    pub fn arrive(&mut self, tag: u32, data: Bytes) -> Option<(u64, Result<Bytes, TransportError>)> {
        if let Some(recv) = pop_entry(&mut self.posted, tag) {
            return Some((recv.token, complete(recv, data)));
        }
        self.unexpected.entry(tag).or_default().push_back(data);
        None
    }

    /// Drop everything, returning the tokens of the receives still posted.
    pub fn cancel_all(&mut self) -> Vec<u64> {
        self.unexpected.clear();
        self.posted
            .drain()
            .flat_map(|(_, queue)| queue.into_iter().map(|r| r.token))
            .collect()
    }

    #[cfg(test)]
    pub fn posted_count(&self) -> usize {
        self.posted.values().map(VecDeque::len).sum()
    }

    #[cfg(test)]
    pub fn unexpected_count(&self) -> usize {
        self.unexpected.values().map(VecDeque::len).sum()
    }
}

fn pop_entry<T>(map: &mut HashMap<u32, VecDeque<T>>, tag: u32) -> Option<T> {
    let queue = map.get_mut(&tag)?;
    let item = queue.pop_front();
    if queue.is_empty() {
        map.remove(&tag);
    }
    item
}

fn complete(recv: PostedRecv, data: Bytes) -> Result<Bytes, TransportError> {
    if data.len() > recv.len {
        Err(TransportError::Truncated {
            posted: recv.len,
            received: data.len(),
        })
    } else {
        Ok(data)
    }
}

/// A single TCP connection.
#[derive(Debug)]
pub struct Connection {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    pub state: ConnState,
    /// Failure that moved the connection to `Failed`.
    pub error: Option<TransportError>,
    /// Bytes read but not yet parsed into frames.
    pub inbound: BytesMut,
    pub outbound: VecDeque<OutFrame>,
    pub matcher: TagMatcher,
}

impl Connection {
    pub fn connecting(stream: TcpStream, peer: SocketAddr) -> Self {
        Self::new(stream, peer, ConnState::Connecting { started: Instant::now() })
    }

    pub fn established(stream: TcpStream, peer: SocketAddr) -> Self {
        Self::new(stream, peer, ConnState::Established)
    }

    fn new(stream: TcpStream, peer: SocketAddr, state: ConnState) -> Self {
        Self {
            stream,
            peer,
            state,
            error: None,
            inbound: BytesMut::new(),
            outbound: VecDeque::new(),
            matcher: TagMatcher::default(),
        }
    }

    pub fn is_established(&self) -> bool {
        self.state == ConnState::Established
    }

    /// Mark the connection broken. Returns `false` if it already was.
    pub fn fail(&mut self, error: TransportError) -> bool {
        match self.state {
            ConnState::Failed | ConnState::Closing => false,
            _ => {
                self.state = ConnState::Failed;
                self.error = Some(error);
                true
            }
        }
    }

    /// Health as seen by the transport owner.
    pub fn status(&self) -> Result<(), TransportError> {
        match self.state {
            ConnState::Established => Ok(()),
            ConnState::Failed => Err(self.error.clone().unwrap_or(TransportError::NotConnected)),
            ConnState::Connecting { .. } | ConnState::Closing => Err(TransportError::NotConnected),
        }
    }
}

/// Registry of connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations.
pub struct ConnectionRegistry {
    connections: Slab<Connection>,
}

impl ConnectionRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            connections: Slab::with_capacity(capacity),
        }
    }

    /// The id the next `insert` will return.
    pub fn next_id(&self) -> usize {
        self.connections.vacant_key()
    }

    pub fn insert(&mut self, conn: Connection) -> usize {
        self.connections.insert(conn)
    }

    pub fn get(&self, id: usize) -> Option<&Connection> {
        self.connections.get(id)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection> {
        self.connections.get_mut(id)
    }

    pub fn remove(&mut self, id: usize) -> Option<Connection> {
        self.connections.try_remove(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Connection)> {
        self.connections.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recv(token: u64, len: usize) -> PostedRecv {
        PostedRecv { token, len }
    }

    #[test]
    fn test_matcher_posted_first() {
        let mut m = TagMatcher::default();

        assert!(m.post(7, recv(1, 16)).is_none());
        assert!(m.post(7, recv(2, 16)).is_none());
        assert_eq!(m.posted_count(), 2);

        // FIFO within a tag
        let (token, result) = m.arrive(7, Bytes::from_static(b"first")).unwrap();
        assert_eq!(token, 1);
        assert_eq!(&result.unwrap()[..], b"first");

        let (token, _) = m.arrive(7, Bytes::from_static(b"second")).unwrap();
        assert_eq!(token, 2);
        assert_eq!(m.posted_count(), 0);
    }

    #[test]
    fn test_matcher_unexpected_first() {
        let mut m = TagMatcher::default();

        assert!(m.arrive(3, Bytes::from_static(b"early")).is_none());
        assert!(m.arrive(4, Bytes::from_static(b"other")).is_none());
        assert_eq!(m.unexpected_count(), 2);

        let (token, result) = m.post(3, recv(9, 8)).unwrap();
        assert_eq!(token, 9);
        assert_eq!(&result.unwrap()[..], b"early");
        assert_eq!(m.unexpected_count(), 1);
    }

    #[test]
    fn test_matcher_truncation() {
        let mut m = TagMatcher::default();
        m.post(1, recv(5, 4));

        let (token, result) = m.arrive(1, Bytes::from_static(b"too long")).unwrap();
        assert_eq!(token, 5);
        assert_eq!(
            result.unwrap_err(),
            TransportError::Truncated {
                posted: 4,
                received: 8
            }
        );
    }

    #[test]
    fn test_matcher_cancel_all() {
        let mut m = TagMatcher::default();
        m.post(1, recv(10, 4));
        m.post(2, recv(11, 4));
        m.arrive(3, Bytes::from_static(b"x"));

        let mut tokens = m.cancel_all();
        tokens.sort_unstable();
        assert_eq!(tokens, vec![10, 11]);
        assert_eq!(m.posted_count(), 0);
        assert_eq!(m.unexpected_count(), 0);
    }
}
