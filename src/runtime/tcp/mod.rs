//! Non-blocking TCP transport built on mio.
//!
//! Readiness-based model: a zero-timeout poll reports which sockets are
//! ready, then non-blocking read/write syscalls run until `WouldBlock`.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! All sockets are registered for both readable and writable readiness.
//! Since readiness is edge-triggered, queued frames are also flushed on
//! submission and on every `progress()` call.

mod frame;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::time::Duration;
use tracing::{debug, error, trace, warn};

use self::frame::{FrameHeader, FrameKind, FRAME_HEADER_SIZE};
use super::connection::{ConnState, Connection, ConnectionRegistry, OutFrame, PostedRecv};
use super::transport::{ConnId, Event, Transport, TransportError};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const LISTEN_BACKLOG: i32 = 1024;
const READ_BUFFER_SIZE: usize = 64 * 1024;
const EVENT_CAPACITY: usize = 1024;

pub struct TcpTransport {
    poll: Poll,
    events: Events,
    listener: Option<TcpListener>,
    registry: ConnectionRegistry,
    /// Events produced since the last `progress()` returned.
    pending: VecDeque<Event>,
    /// Connections whose `Disconnected` event is queued in `pending`.
    closing: Vec<ConnId>,
    connect_timeout: Duration,
    /// Largest frame payload accepted from a peer.
    max_frame_len: usize,
    scratch: Vec<u8>,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration, max_frame_len: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENT_CAPACITY),
            listener: None,
            registry: ConnectionRegistry::new(64),
            pending: VecDeque::new(),
            closing: Vec::new(),
            connect_timeout,
            max_frame_len,
            scratch: vec![0u8; READ_BUFFER_SIZE],
        })
    }

    fn accept_connections(&mut self) {
        let Some(listener) = &self.listener else {
            return;
        };

        loop {
            match listener.accept() {
                Ok((mut stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer = %peer, error = %e, "failed to set TCP_NODELAY");
                    }

                    let id = self.registry.next_id();
                    if let Err(e) = self.poll.registry().register(
                        &mut stream,
                        Token(id),
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        warn!(peer = %peer, error = %e, "failed to register connection");
                        continue;
                    }

                    self.registry.insert(Connection::established(stream, peer));
                    self.pending.push_back(Event::Accepted { conn: id });
                    debug!(conn_id = id, peer = %peer, "accepted connection");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!("accept error: {}", e);
                    break;
                }
            }
        }
    }

    fn finish_connect(&mut self, id: ConnId) {
        let Some(conn) = self.registry.get_mut(id) else {
            return;
        };
        if !matches!(conn.state, ConnState::Connecting { .. }) {
            return;
        }

        let result = match conn.stream.take_error() {
            Ok(Some(e)) | Err(e) => Err(e),
            Ok(None) => match conn.stream.peer_addr() {
                Ok(_) => Ok(()),
                // still in progress
                Err(ref e) if e.kind() == io::ErrorKind::NotConnected => return,
                Err(e) => Err(e),
            },
        };

        match result {
            Ok(()) => {
                conn.state = ConnState::Established;
                if let Err(e) = conn.stream.set_nodelay(true) {
                    debug!(conn_id = id, error = %e, "failed to set TCP_NODELAY");
                }
                debug!(conn_id = id, peer = %conn.peer, "connection established");
                self.pending.push_back(Event::Connected {
                    conn: id,
                    result: Ok(()),
                });
            }
            Err(e) => self.fail(id, e.into()),
        }
    }

    fn check_connect_timeouts(&mut self) {
        let timeout = self.connect_timeout;
        let expired: Vec<ConnId> = self
            .registry
            .iter()
            .filter(|(_, c)| matches!(c.state, ConnState::Connecting { started } if started.elapsed() > timeout))
            .map(|(id, _)| id)
            .collect();

        for id in expired {
            self.fail(id, TransportError::TimedOut);
        }
    }

    /// Move a connection to `Failed` and report it once.
    fn fail(&mut self, id: ConnId, error: TransportError) {
        let Some(conn) = self.registry.get_mut(id) else {
            return;
        };

        let was_connecting = matches!(conn.state, ConnState::Connecting { .. });
        if !conn.fail(error.clone()) {
            return;
        }

        debug!(conn_id = id, peer = %conn.peer, error = %error, "connection failed");
        if was_connecting {
            self.pending.push_back(Event::Connected {
                conn: id,
                result: Err(error),
            });
        } else {
            self.pending
                .push_back(Event::ConnectionError { conn: id, error });
        }
    }

    fn handle_readable(&mut self, id: ConnId) {
        loop {
            let Some(conn) = self.registry.get_mut(id) else {
                return;
            };
            if !conn.is_established() {
                return;
            }

            match conn.stream.read(&mut self.scratch) {
                Ok(0) => {
                    self.fail(id, TransportError::Refused);
                    return;
                }
                Ok(n) => {
                    conn.inbound.extend_from_slice(&self.scratch[..n]);
                    if let Err(e) = parse_frames(id, conn, self.max_frame_len, &mut self.pending) {
                        self.fail(id, e.into());
                        return;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.fail(id, e.into());
                    return;
                }
            }
        }
    }

    fn flush(&mut self, id: ConnId) {
        let Some(conn) = self.registry.get_mut(id) else {
            return;
        };
        if !conn.is_established() {
            return;
        }

        let result = flush_frames(conn, &mut self.pending);
        if let Err(e) = result {
            self.fail(id, e.into());
        }
    }

    fn flush_all(&mut self) {
        let ids: Vec<ConnId> = self
            .registry
            .iter()
            .filter(|(_, c)| c.is_established() && !c.outbound.is_empty())
            .map(|(id, _)| id)
            .collect();

        for id in ids {
            self.flush(id);
        }
    }

    fn submit(&mut self, id: ConnId, kind: FrameKind, tag: u32, data: &[u8], token: u64) {
        let status = match self.registry.get(id) {
            Some(conn) => conn.status(),
            None => Err(TransportError::NotConnected),
        };
        if let Err(error) = status {
            self.pending.push_back(Event::Sent {
                token,
                result: Err(error),
            });
            return;
        }

        let buf = match FrameHeader::encode(kind, tag, data) {
            Ok(buf) => buf,
            Err(e) => {
                self.pending.push_back(Event::Sent {
                    token,
                    result: Err(e.into()),
                });
                return;
            }
        };

        if let Some(conn) = self.registry.get_mut(id) {
            conn.outbound.push_back(OutFrame {
                buf,
                written: 0,
                token,
            });
        }
        self.flush(id);
    }
}

/// Split complete frames off the inbound buffer and dispatch them.
fn parse_frames(
    id: ConnId,
    conn: &mut Connection,
    max_frame_len: usize,
    pending: &mut VecDeque<Event>,
) -> io::Result<()> {
    while let Some(header) = FrameHeader::decode(&conn.inbound, max_frame_len)? {
        let frame_len = header.frame_len();
        if conn.inbound.len() < frame_len {
            conn.inbound.reserve(frame_len - conn.inbound.len());
            break;
        }

        let mut frame = conn.inbound.split_to(frame_len);
        let payload = frame.split_off(FRAME_HEADER_SIZE).freeze();
        trace!(conn_id = id, kind = ?header.kind, tag = header.tag, len = header.len, "frame");

        match header.kind {
            FrameKind::Control => pending.push_back(Event::Message {
                conn: id,
                data: payload,
            }),
            FrameKind::Data => {
                if let Some((token, result)) = conn.matcher.arrive(header.tag, payload) {
                    pending.push_back(Event::Received { token, result });
                }
            }
        }
    }
    Ok(())
}

/// Write queued frames until the socket would block.
fn flush_frames(conn: &mut Connection, pending: &mut VecDeque<Event>) -> io::Result<()> {
    while let Some(frame) = conn.outbound.front_mut() {
        match conn.stream.write(&frame.buf[frame.written..]) {
            Ok(0) => {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
            }
            Ok(n) => {
                frame.written += n;
                if frame.written == frame.buf.len() {
                    let token = frame.token;
                    conn.outbound.pop_front();
                    pending.push_back(Event::Sent {
                        token,
                        result: Ok(()),
                    });
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Create a non-blocking TCP listener with address reuse.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}

impl Transport for TcpTransport {
    fn listen(&mut self, addr: SocketAddr) -> io::Result<SocketAddr> {
        let mut listener = TcpListener::from_std(create_listener(addr)?);
        self.poll
            .registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let local = listener.local_addr()?;
        self.listener = Some(listener);
        Ok(local)
    }

    fn connect(&mut self, addr: SocketAddr) -> io::Result<ConnId> {
        let mut stream = TcpStream::connect(addr)?;
        let id = self.registry.next_id();
        self.poll.registry().register(
            &mut stream,
            Token(id),
            Interest::READABLE | Interest::WRITABLE,
        )?;
        self.registry.insert(Connection::connecting(stream, addr));
        debug!(conn_id = id, peer = %addr, "connecting");
        Ok(id)
    }

    fn send_control(&mut self, conn: ConnId, data: &[u8], token: u64) {
        self.submit(conn, FrameKind::Control, 0, data, token);
    }

    fn send_chunk(&mut self, conn: ConnId, data: &[u8], tag: u32, token: u64) {
        self.submit(conn, FrameKind::Data, tag, data, token);
    }

    fn recv_chunk(&mut self, id: ConnId, len: usize, tag: u32, token: u64) {
        let Some(conn) = self.registry.get_mut(id) else {
            self.pending.push_back(Event::Received {
                token,
                result: Err(TransportError::NotConnected),
            });
            return;
        };
        if let Err(error) = conn.status() {
            self.pending.push_back(Event::Received {
                token,
                result: Err(error),
            });
            return;
        }

        if let Some((token, result)) = conn.matcher.post(tag, PostedRecv { token, len }) {
            self.pending.push_back(Event::Received { token, result });
        }
    }

    fn disconnect(&mut self, id: ConnId) {
        let Some(conn) = self.registry.get_mut(id) else {
            return;
        };
        if conn.state == ConnState::Closing {
            return;
        }

        if matches!(conn.state, ConnState::Connecting { .. }) {
            self.pending.push_back(Event::Connected {
                conn: id,
                result: Err(TransportError::Canceled),
            });
        }
        conn.state = ConnState::Closing;

        for frame in conn.outbound.drain(..) {
            self.pending.push_back(Event::Sent {
                token: frame.token,
                result: Err(TransportError::Canceled),
            });
        }
        for token in conn.matcher.cancel_all() {
            self.pending.push_back(Event::Received {
                token,
                result: Err(TransportError::Canceled),
            });
        }

        if let Err(e) = self.poll.registry().deregister(&mut conn.stream) {
            debug!(conn_id = id, error = %e, "deregister failed");
        }
        // the peer may already be gone
        let _ = conn.stream.shutdown(Shutdown::Both);

        debug!(conn_id = id, peer = %conn.peer, "disconnected");
        self.pending.push_back(Event::Disconnected { conn: id });
        self.closing.push(id);
    }

    fn progress(&mut self, events: &mut Vec<Event>) -> io::Result<()> {
        self.poll.poll(&mut self.events, Some(Duration::ZERO))?;

        let ready: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|e| {
                (
                    e.token(),
                    e.is_readable() || e.is_read_closed() || e.is_error(),
                    e.is_writable() || e.is_write_closed() || e.is_error(),
                )
            })
            .collect();

        for (token, readable, writable) in ready {
            match token {
                LISTENER_TOKEN => self.accept_connections(),
                Token(id) => {
                    let connecting = self
                        .registry
                        .get(id)
                        .is_some_and(|c| matches!(c.state, ConnState::Connecting { .. }));
                    if connecting {
                        self.finish_connect(id);
                    }
                    if readable {
                        self.handle_readable(id);
                    }
                    if writable {
                        self.flush(id);
                    }
                }
            }
        }

        self.check_connect_timeouts();
        self.flush_all();

        events.extend(self.pending.drain(..));
        for id in self.closing.drain(..) {
            self.registry.remove(id);
        }
        Ok(())
    }

    fn status(&self, conn: ConnId) -> Result<(), TransportError> {
        match self.registry.get(conn) {
            Some(c) => c.status(),
            None => Err(TransportError::NotConnected),
        }
    }

    fn peer_name(&self, conn: ConnId) -> String {
        self.registry
            .get(conn)
            .map(|c| c.peer.to_string())
            .unwrap_or_else(|| "<unknown>".to_string())
    }

    fn is_disconnecting(&self, conn: ConnId) -> bool {
        self.registry
            .get(conn)
            .is_some_and(|c| c.state == ConnState::Closing)
    }

    fn num_connections(&self) -> usize {
        self.registry
            .iter()
            .filter(|(_, c)| c.state != ConnState::Closing)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn pump_until<F>(transports: &mut [&mut TcpTransport], events: &mut Vec<Vec<Event>>, mut done: F)
    where
        F: FnMut(&[Vec<Event>]) -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done(events) {
            assert!(Instant::now() < deadline, "timed out waiting for events");
            for (t, out) in transports.iter_mut().zip(events.iter_mut()) {
                t.progress(out).unwrap();
            }
        }
    }

    #[test]
    fn test_connect_send_and_match() {
        let mut server = TcpTransport::new(Duration::from_secs(5), 4096).unwrap();
        let mut client = TcpTransport::new(Duration::from_secs(5), 4096).unwrap();
        let addr = server.listen(([127, 0, 0, 1], 0).into()).unwrap();

        let conn = client.connect(addr).unwrap();
        let mut events = vec![Vec::new(), Vec::new()];
        pump_until(&mut [&mut server, &mut client], &mut events, |ev| {
            ev[0].iter().any(|e| matches!(e, Event::Accepted { .. }))
                && ev[1].iter().any(|e| matches!(e, Event::Connected { .. }))
        });

        let accepted = events[0]
            .iter()
            .find_map(|e| match e {
                Event::Accepted { conn } => Some(*conn),
                _ => None,
            })
            .unwrap();
        assert!(events[1]
            .iter()
            .any(|e| matches!(e, Event::Connected { result: Ok(()), .. })));
        assert!(client.status(conn).is_ok());

        // Data sent before the receive is posted waits in the unexpected queue
        client.send_control(conn, b"hello", 1);
        client.send_chunk(conn, b"chunk-a", 42, 2);
        client.send_chunk(conn, b"chunk-b", 42, 3);
        events.iter_mut().for_each(Vec::clear);
        pump_until(&mut [&mut server, &mut client], &mut events, |ev| {
            ev[0].iter().any(|e| matches!(e, Event::Message { .. }))
                && ev[1].iter().filter(|e| matches!(e, Event::Sent { .. })).count() == 3
        });

        match &events[0][0] {
            Event::Message { conn, data } => {
                assert_eq!(*conn, accepted);
                assert_eq!(&data[..], b"hello");
            }
            other => panic!("unexpected event {other:?}"),
        }

        server.recv_chunk(accepted, 16, 42, 10);
        server.recv_chunk(accepted, 16, 42, 11);
        events.iter_mut().for_each(Vec::clear);
        pump_until(&mut [&mut server, &mut client], &mut events, |ev| {
            ev[0].iter().filter(|e| matches!(e, Event::Received { .. })).count() == 2
        });

        let received: Vec<(u64, Vec<u8>)> = events[0]
            .iter()
            .filter_map(|e| match e {
                Event::Received { token, result } => {
                    Some((*token, result.as_ref().unwrap().to_vec()))
                }
                _ => None,
            })
            .collect();
        assert_eq!(received[0], (10, b"chunk-a".to_vec()));
        assert_eq!(received[1], (11, b"chunk-b".to_vec()));
    }

    #[test]
    fn test_disconnect_cancels_posted_receives() {
        let mut server = TcpTransport::new(Duration::from_secs(5), 4096).unwrap();
        let mut client = TcpTransport::new(Duration::from_secs(5), 4096).unwrap();
        let addr = server.listen(([127, 0, 0, 1], 0).into()).unwrap();

        let conn = client.connect(addr).unwrap();
        let mut events = vec![Vec::new(), Vec::new()];
        pump_until(&mut [&mut server, &mut client], &mut events, |ev| {
            ev[1].iter().any(|e| matches!(e, Event::Connected { .. }))
        });

        client.recv_chunk(conn, 8, 1, 7);
        client.disconnect(conn);
        assert!(client.is_disconnecting(conn));
        assert_eq!(client.num_connections(), 0);

        let mut out = Vec::new();
        client.progress(&mut out).unwrap();
        assert!(matches!(
            out[0],
            Event::Received {
                token: 7,
                result: Err(TransportError::Canceled)
            }
        ));
        assert!(matches!(out[1], Event::Disconnected { conn: c } if c == conn));

        // The handle is released after the event was delivered
        assert!(client.status(conn).is_err());
        assert!(!client.is_disconnecting(conn));
    }

    #[test]
    fn test_oversized_frame_fails_connection() {
        let mut server = TcpTransport::new(Duration::from_secs(5), 16).unwrap();
        let mut client = TcpTransport::new(Duration::from_secs(5), 4096).unwrap();
        let addr = server.listen(([127, 0, 0, 1], 0).into()).unwrap();

        let conn = client.connect(addr).unwrap();
        let mut events = vec![Vec::new(), Vec::new()];
        pump_until(&mut [&mut server, &mut client], &mut events, |ev| {
            ev[0].iter().any(|e| matches!(e, Event::Accepted { .. }))
                && ev[1].iter().any(|e| matches!(e, Event::Connected { .. }))
        });
        let accepted = events[0]
            .iter()
            .find_map(|e| match e {
                Event::Accepted { conn } => Some(*conn),
                _ => None,
            })
            .unwrap();

        client.send_chunk(conn, &[0u8; 64], 3, 1);
        events.iter_mut().for_each(Vec::clear);
        pump_until(&mut [&mut server, &mut client], &mut events, |ev| {
            ev[0].iter().any(|e| matches!(e, Event::ConnectionError { .. }))
        });

        assert!(events[0]
            .iter()
            .any(|e| matches!(e, Event::ConnectionError { conn: c, .. } if *c == accepted)));
        assert!(server.status(accepted).is_err());
    }

    #[test]
    fn test_connect_refused() {
        // Bind then drop to get a port with no listener
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };

        let mut client = TcpTransport::new(Duration::from_secs(5), 4096).unwrap();
        let conn = match client.connect(addr) {
            Ok(conn) => conn,
            // Some platforms report the refusal synchronously
            Err(_) => return,
        };

        let mut events = vec![Vec::new()];
        pump_until(&mut [&mut client], &mut events, |ev| {
            ev[0].iter().any(|e| matches!(e, Event::Connected { .. }))
        });
        assert!(events[0]
            .iter()
            .any(|e| matches!(e, Event::Connected { conn: c, result: Err(_) } if *c == conn)));
    }
}
