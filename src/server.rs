//! Server role.
//!
//! Accepts connections and services read and write requests:
//!
//! - READ: the requested amount of data is sent back in chunks tagged with
//!   the request's sequence number, followed by a read completion on the
//!   data path.
//! - WRITE: chunk receives are posted for the announced amount of data;
//!   once all chunks arrived a write completion is sent back.
//!
//! Per-connection statistics are reported and reset every print interval.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io;
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::protocol::{
    self, check_buffers, check_message, IntegrityError, IoHeader, IoMessage, IoOp, Opcode, Pools,
    BUSY_PROGRESS_COUNT,
};
use crate::runtime::{
    BufferSet, ConnId, Event, JoinCounter, PoolError, TokenAllocator, Transport, TransportError,
};
use crate::status::{fatal, RunStatus, TerminateFlag};

const MBYTE: f64 = 1024.0 * 1024.0;

/// Resources of one in-flight server operation.
enum ServerOp {
    /// A completion message being sent.
    Message(IoMessage),
    /// READ payload being sent.
    ReadData {
        conn: ConnId,
        iov: BufferSet,
        join: JoinCounter,
    },
    /// WRITE payload being received.
    WriteData {
        conn: ConnId,
        sn: u32,
        iov: BufferSet,
        join: JoinCounter,
    },
}

/// Counters of one connection since the last report.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStats {
    pub bytes: [u64; 2],
    pub completions: [u64; 2],
}

impl ConnectionStats {
    fn reset(&mut self) {
        *self = Self::default();
    }

    fn add(&mut self, other: &ConnectionStats) {
        for i in 0..2 {
            self.bytes[i] += other.bytes[i];
            self.completions[i] += other.completions[i];
        }
    }
}

pub struct Server<T: Transport> {
    config: Config,
    transport: T,
    pools: Pools,
    ops: TokenAllocator<ServerOp>,
    stats: BTreeMap<ConnId, ConnectionStats>,
    status: RunStatus,
    terminate: TerminateFlag,
    events: Vec<Event>,
}

impl<T: Transport> Server<T> {
    pub fn new(config: Config, transport: T, terminate: TerminateFlag) -> Result<Self, PoolError> {
        let pools = Pools::new(config.iomsg_size, config.chunk_size, config.offcache_buffers)?;
        Ok(Self {
            config,
            transport,
            pools,
            ops: TokenAllocator::new(1024),
            stats: BTreeMap::new(),
            status: RunStatus::Ok,
            terminate,
            events: Vec::new(),
        })
    }

    /// Start listening on `addr`, retrying every retry interval.
    pub fn listen(&mut self, addr: SocketAddr) -> io::Result<SocketAddr> {
        let mut retry: u64 = 1;
        loop {
            match self.transport.listen(addr) {
                Ok(local) => {
                    info!(addr = %local, "listening for connections");
                    return Ok(local);
                }
                Err(e) if retry > self.config.retries || self.terminate.is_requested() => {
                    return Err(e);
                }
                Err(e) => {
                    let limit = if self.config.retries == u64::MAX {
                        String::new()
                    } else {
                        format!("/{}", self.config.retries)
                    };
                    warn!(
                        "restarting listener on {} in {:?} (retry {}{}): {}",
                        addr, self.config.retry_interval, retry, limit, e
                    );
                    std::thread::sleep(self.config.retry_interval);
                    retry += 1;
                }
            }
        }
    }

    /// Service requests until terminated, then tear down every connection.
    pub fn run(&mut self) -> RunStatus {
        let mut prev_report = Instant::now();

        while self.status == RunStatus::Ok {
            if self.terminate.is_requested() {
                self.status = RunStatus::Terminated;
                break;
            }

            for _ in 0..BUSY_PROGRESS_COUNT {
                self.progress();
            }

            let elapsed = prev_report.elapsed();
            if elapsed >= self.config.print_interval {
                self.report(elapsed.as_secs_f64());
                prev_report = Instant::now();
            }
        }

        self.destroy_connections();
        self.status
    }

    /// Drive the transport once and apply its events.
    pub fn progress(&mut self) {
        let mut events = std::mem::take(&mut self.events);
        if let Err(e) = self.transport.progress(&mut events) {
            error!(error = %e, "transport progress failed");
        }

        for event in events.drain(..) {
            self.handle_event(event);
        }
        self.events = events;
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Accepted { conn } => {
                debug!(conn_id = conn, peer = %self.transport.peer_name(conn), "connection accepted");
                assert!(
                    self.stats.insert(conn, ConnectionStats::default()).is_none(),
                    "connection duplicate in statistics map"
                );
            }
            Event::Message { conn, data } => self.dispatch_io_message(conn, &data),
            Event::Sent { token, result } => self.send_completed(token, result.err()),
            Event::Received { token, result } => self.recv_completed(token, result),
            Event::ConnectionError { conn, error } => {
                info!(
                    "disconnecting connection {} with status {}",
                    self.transport.peer_name(conn),
                    error
                );
                self.transport.disconnect(conn);
            }
            Event::Disconnected { conn } => {
                assert!(
                    self.stats.remove(&conn).is_some(),
                    "disconnected connection missing from statistics map"
                );
            }
            Event::Connected { conn, .. } => {
                debug!(conn_id = conn, "unexpected connect completion");
            }
        }
    }

    fn dispatch_io_message(&mut self, conn: ConnId, data: &[u8]) {
        let parsed = if self.config.validate {
            check_message(data, self.config.iomsg_size, None)
        } else {
            IoHeader::decode(data).map_err(IntegrityError::Malformed)
        };

        let header = match parsed {
            Ok(header) => header,
            Err(IntegrityError::Malformed(e)) => {
                warn!(conn_id = conn, "{}", e);
                return;
            }
            Err(e) => fatal(e),
        };

        trace!(
            op = %header.opcode,
            sn = header.sn,
            data_size = header.data_size,
            conn_id = conn,
            "got io message"
        );

        if header.opcode.is_completion() {
            warn!(conn_id = conn, "invalid opcode: {}", header.opcode);
            return;
        }

        let data_size = match usize::try_from(header.data_size) {
            Ok(size) if size > 0 && size <= self.config.max_data_size => size,
            _ => {
                warn!(
                    conn_id = conn,
                    data_size = header.data_size,
                    max_data_size = self.config.max_data_size,
                    "invalid data size in {} request",
                    header.opcode
                );
                self.transport.disconnect(conn);
                return;
            }
        };

        let Some(stats) = self.stats.get_mut(&conn) else {
            warn!(conn_id = conn, "io message on unknown connection");
            return;
        };

        match header.opcode {
            Opcode::Read => {
                stats.bytes[IoOp::Read.index()] += data_size as u64;
                self.handle_io_read_request(conn, header.sn, data_size);
            }
            Opcode::Write => {
                stats.bytes[IoOp::Write.index()] += data_size as u64;
                self.handle_io_write_request(conn, header.sn, data_size);
            }
            Opcode::ReadComp | Opcode::WriteComp => unreachable!(),
        }
    }

    fn handle_io_read_request(&mut self, conn: ConnId, sn: u32, data_size: usize) {
        trace!(conn_id = conn, sn, "sending io read data");
        let validate = self.config.validate;
        let iov = self
            .pools
            .buffers
            .acquire(data_size, sn, validate)
            .unwrap_or_else(|e| fatal(e));

        let token = self.ops.next_token();
        protocol::send_data(&mut self.transport, conn, &iov, sn, token);
        let join = JoinCounter::new(iov.len());
        self.ops.alloc(ServerOp::ReadData { conn, iov, join });

        // response goes on the data path behind the payload
        trace!(conn_id = conn, sn, "sending io read response");
        self.send_io_message(conn, Opcode::ReadComp, sn, 0);
    }

    fn handle_io_write_request(&mut self, conn: ConnId, sn: u32, data_size: usize) {
        trace!(conn_id = conn, sn, "receiving io write data");
        let iov = self
            .pools
            .buffers
            .acquire(data_size, sn, false)
            .unwrap_or_else(|e| fatal(e));

        let token = self.ops.next_token();
        protocol::recv_data(&mut self.transport, conn, &iov, sn, token);
        let join = JoinCounter::new(iov.len());
        self.ops.alloc(ServerOp::WriteData { conn, sn, iov, join });
    }

    fn send_io_message(&mut self, conn: ConnId, opcode: Opcode, sn: u32, data_size: u64) {
        let msg = self
            .pools
            .message(opcode, sn, data_size, self.config.validate)
            .unwrap_or_else(|e| fatal(e));

        let token = self.ops.next_token();
        protocol::send_io_message(&mut self.transport, conn, &msg, token);
        self.ops.alloc(ServerOp::Message(msg));
    }

    fn send_completed(&mut self, token: u64, error: Option<TransportError>) {
        let done = match self.ops.get_mut(token) {
            Some(ServerOp::Message(_)) => true,
            Some(ServerOp::ReadData { join, .. }) => join.arrive(error),
            Some(ServerOp::WriteData { .. }) | None => {
                panic!("send completion for unknown operation {token}")
            }
        };
        if !done {
            return;
        }

        match self.ops.free(token) {
            Some(ServerOp::Message(msg)) => self.pools.messages.put(msg),
            Some(ServerOp::ReadData { conn, iov, .. }) => {
                if let Some(stats) = self.stats.get_mut(&conn) {
                    stats.completions[IoOp::Read.index()] += 1;
                }
                self.pools.buffers.release(iov);
            }
            _ => unreachable!(),
        }
    }

    fn recv_completed(&mut self, token: u64, result: Result<Bytes, TransportError>) {
        let Some(ServerOp::WriteData { iov, join, .. }) = self.ops.get_mut(token) else {
            panic!("receive completion for unknown operation {token}");
        };

        let error = match result {
            Ok(data) => {
                iov.chunk_mut(join.completed()).store(&data);
                None
            }
            Err(e) => Some(e),
        };
        if !join.arrive(error) {
            return;
        }

        let Some(ServerOp::WriteData { conn, sn, iov, join }) = self.ops.free(token) else {
            unreachable!();
        };

        if let Some(e) = join.error() {
            debug!(conn_id = conn, sn, error = %e, "write data not received");
        } else {
            // respond only while the connection is healthy
            if self.transport.status(conn).is_ok() {
                self.send_io_message(conn, Opcode::WriteComp, sn, iov.data_size() as u64);
            }

            if self.config.validate {
                if let Err(e) = check_buffers(&iov, sn) {
                    fatal(e);
                }
            }
        }

        if let Some(stats) = self.stats.get_mut(&conn) {
            stats.completions[IoOp::Write.index()] += 1;
        }
        self.pools.buffers.release(iov);
    }

    /// Log throughput and completion spread, then reset the counters.
    fn report(&mut self, interval: f64) {
        let mut line = String::new();

        if let Some(&first) = self.stats.keys().next() {
            let mut total = ConnectionStats::default();
            let mut min = [first; 2];
            let mut max = [first; 2];

            for (&conn, stats) in &self.stats {
                total.add(stats);
                for op in IoOp::ALL {
                    let i = op.index();
                    if stats.completions[i] <= self.stats[&min[i]].completions[i] {
                        min[i] = conn;
                    }
                    if stats.completions[i] >= self.stats[&max[i]].completions[i] {
                        max[i] = conn;
                    }
                }
            }

            for op in IoOp::ALL {
                let i = op.index();
                let _ = write!(
                    line,
                    "{} {:.2} MBs min:{}({}) max:{} total:{} | ",
                    op,
                    total.bytes[i] as f64 / (interval * MBYTE),
                    self.stats[&min[i]].completions[i],
                    self.transport.peer_name(min[i]),
                    self.stats[&max[i]].completions[i],
                    total.completions[i]
                );
            }
        }

        let _ = write!(
            line,
            "active: {}/{} buffers:{}",
            self.stats.len(),
            self.transport.num_connections(),
            self.pools.buffers.sets_allocated()
        );
        info!("{}", line);

        for stats in self.stats.values_mut() {
            stats.reset();
        }
    }

    /// Disconnect every connection and wait for the teardown to finish.
    fn destroy_connections(&mut self) {
        let conns: Vec<ConnId> = self.stats.keys().copied().collect();
        for conn in conns {
            if !self.transport.is_disconnecting(conn) {
                self.transport.disconnect(conn);
            }
        }

        while !self.stats.is_empty() {
            self.progress();
        }
        debug!(in_flight = self.ops.len(), "connections destroyed");
    }
}

#[cfg(test)]
impl<T: Transport> Server<T> {
    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn connection_stats(&self, conn: ConnId) -> Option<&ConnectionStats> {
        self.stats.get(&conn)
    }

    pub fn num_tracked(&self) -> usize {
        self.stats.len()
    }

    pub fn in_flight(&self) -> usize {
        self.ops.len()
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}
