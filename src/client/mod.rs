//! Client role.
//!
//! Drives a set of servers with read and write operations under two
//! concurrency bounds: a global window over all servers and a per-connection
//! window. Servers whose window is full leave the active rotation until one
//! of their operations completes. Failed connects are retried every retry
//! interval, and servers that stop answering are disconnected after the
//! reply timeout.

mod peer;
mod rotation;

use peer::{OpCounters, PeerInfo, PeerState};
use rotation::{ActiveRotation, RotationMember};

use bytes::Bytes;
use std::collections::{BTreeSet, HashMap};
use std::fmt::Write as _;
use std::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::protocol::{
    self, check_buffers, check_message, IoHeader, IoMessage, IoOp, Opcode, Pools,
    BUSY_PROGRESS_COUNT,
};
use crate::random::Random;
use crate::runtime::{
    BufferSet, ConnId, Event, JoinCounter, PoolError, TokenAllocator, Transport, TransportError,
};
use crate::status::{fatal, RunStatus, TerminateFlag};

const MBYTE: f64 = 1024.0 * 1024.0;

/// Resources of one in-flight client operation.
enum ClientOp {
    /// A request message being sent.
    Message(IoMessage),
    /// READ payload chunks plus the trailing read completion.
    ReadData {
        peer: usize,
        conn: ConnId,
        sn: u32,
        iov: BufferSet,
        comp: IoMessage,
        join: JoinCounter,
    },
    /// WRITE payload being sent.
    WriteData { iov: BufferSet, join: JoinCounter },
}

fn is_control_iter(iter: u64) -> bool {
    iter % 10 == 0
}

/// Aggregates for one column of the performance report.
#[derive(Debug, Clone, Copy)]
struct PerfInfo {
    min: u64,
    max: u64,
    min_index: Option<usize>,
    total: u64,
    total_bytes: u64,
}

impl Default for PerfInfo {
    fn default() -> Self {
        Self {
            min: u64::MAX,
            max: 0,
            min_index: None,
            total: 0,
            total_bytes: 0,
        }
    }
}

impl PerfInfo {
    fn add(&mut self, index: usize, completed: u64, bytes: u64) {
        if completed < self.min {
            self.min = completed;
            self.min_index = Some(index);
        }
        self.max = self.max.max(completed);
        self.total += completed;
        self.total_bytes += bytes;
    }
}

pub struct Client<T: Transport> {
    config: Config,
    transport: T,
    pools: Pools,
    ops: TokenAllocator<ClientOp>,
    peers: Vec<PeerInfo>,
    /// Connection handle to peer index, for every live handle.
    lookup: HashMap<ConnId, usize>,
    /// Peers with a connect in flight.
    connecting: BTreeSet<usize>,
    /// Peers in the Active state.
    connected: usize,
    rotation: ActiveRotation,
    /// Operations committed on active peers and not yet completed.
    outstanding: u64,
    /// Completions observed over the whole run.
    completions: u64,
    random: Random,
    status: RunStatus,
    terminate: TerminateFlag,
    start_time: Instant,
    events: Vec<Event>,
}

impl<T: Transport> Client<T> {
    pub fn new(config: Config, transport: T, terminate: TerminateFlag) -> Result<Self, PoolError> {
        let pools = Pools::new(config.iomsg_size, config.chunk_size, config.offcache_buffers)?;
        let mut random = Random::new(config.seed);

        // spread start-up load across servers
        let mut servers = config.servers.clone();
        random.shuffle(&mut servers);
        debug!(?servers, "server order");

        Ok(Self {
            peers: servers.into_iter().map(PeerInfo::new).collect(),
            config,
            transport,
            pools,
            ops: TokenAllocator::new(1024),
            lookup: HashMap::new(),
            connecting: BTreeSet::new(),
            connected: 0,
            rotation: ActiveRotation::new(),
            outstanding: 0,
            completions: 0,
            random,
            status: RunStatus::Ok,
            terminate,
            start_time: Instant::now(),
            events: Vec::new(),
        })
    }

    fn server_name(&self, idx: usize) -> String {
        format!("server [{}] {}", idx, self.peers[idx].addr)
    }

    /// Issue up to `iterations` operations, then tear every connection down.
    pub fn run(&mut self) -> RunStatus {
        self.status = RunStatus::Ok;
        self.outstanding = 0;

        let mut sn = self.random.next_u32();
        let mut prev_time = Instant::now();
        let mut total_iter: u64 = 0;
        let mut total_prev_iter: u64 = 0;

        info!(
            servers = self.peers.len(),
            iterations = self.config.iterations,
            window = self.config.window,
            conn_window = self.config.conn_window,
            "starting client run"
        );

        while total_iter < self.config.iterations && self.status == RunStatus::Ok {
            if self.terminate.is_requested() {
                self.status = RunStatus::Terminated;
                break;
            }

            self.connect_all(is_control_iter(total_iter));
            if self.status != RunStatus::Ok {
                break;
            }

            if self.connected == 0 {
                if self.connecting.is_empty() && !self.any_disconnecting() {
                    info!(
                        "all remote servers are down, reconnecting in {:?}",
                        self.config.retry_interval
                    );
                    std::thread::sleep(self.config.retry_interval);
                    self.check_time_limit(Instant::now());
                } else {
                    self.progress();
                }
                continue;
            }

            trace!(iteration = total_iter, "iteration");
            let conns_window = self.config.conn_window.saturating_mul(self.connected);
            let max_outstanding = self.config.window.min(conns_window) as u64 - 1;

            self.progress();
            self.wait_for_responses(max_outstanding);
            if self.status != RunStatus::Ok {
                break;
            }

            // disconnects during progress may have emptied the rotation
            let Some(idx) = self.rotation.pick() else {
                continue;
            };

            match self.get_op() {
                IoOp::Read => self.do_io_read(idx, sn),
                IoOp::Write => self.do_io_write(idx, sn),
            };

            total_iter += 1;
            sn = sn.wrapping_add(1);

            if is_control_iter(total_iter)
                && total_iter - total_prev_iter >= self.connected as u64
            {
                let now = Instant::now();
                if now.duration_since(prev_time) >= self.config.print_interval {
                    self.wait_for_responses(0);
                    if self.status != RunStatus::Ok {
                        break;
                    }

                    self.report(
                        total_iter - total_prev_iter,
                        now.duration_since(prev_time).as_secs_f64(),
                    );
                    total_prev_iter = total_iter;
                    prev_time = now;
                    self.check_time_limit(now);
                }
            }
        }

        self.wait_for_responses(0);
        if self.status == RunStatus::Ok {
            self.report(total_iter - total_prev_iter, prev_time.elapsed().as_secs_f64());
        }

        self.destroy_peers();
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
            Event::Connected { conn, result } => self.connect_completed(conn, result),
            Event::Message { conn, data } => self.dispatch_io_message(conn, &data),
            Event::Sent { token, result } => self.send_completed(token, result.err()),
            Event::Received { token, result } => self.recv_completed(token, result),
            Event::ConnectionError { conn, error } => {
                match self.lookup.get(&conn) {
                    Some(&idx) if self.peers[idx].is_active_on(conn) => {
                        self.disconnect_peer(idx, &error.to_string());
                    }
                    _ => debug!(conn_id = conn, error = %error, "error on inactive connection"),
                }
            }
            Event::Disconnected { conn } => {
                let Some(idx) = self.lookup.remove(&conn) else {
                    debug!(conn_id = conn, "disconnect of unknown connection");
                    return;
                };
                assert_eq!(
                    self.peers[idx].state,
                    PeerState::Disconnecting(conn),
                    "{} disconnected without a request",
                    self.server_name(idx)
                );
                debug!(server = %self.server_name(idx), "disconnected");
                self.peers[idx].reset();
            }
            Event::Accepted { conn } => {
                warn!(conn_id = conn, "unexpected inbound connection");
            }
        }
    }

    fn any_disconnecting(&self) -> bool {
        self.peers
            .iter()
            .any(|p| matches!(p.state, PeerState::Disconnecting(_)))
    }

    /// Start connecting idle servers whose retry interval has elapsed.
    ///
    /// Unless `force` is set, nothing happens while at least one server is
    /// connected.
    fn connect_all(&mut self, force: bool) {
        if self.connected == self.peers.len() {
            return;
        }
        if !force && self.connected > 0 {
            return;
        }

        let retries = self.config.retries;
        if self.connected == 0
            && self
                .peers
                .iter()
                .all(|p| p.is_idle() && p.retry_count >= retries)
        {
            warn!("no server has connect attempts left (retries {})", retries);
            if self.status == RunStatus::Ok {
                self.status = RunStatus::ConnectRetriesExceeded;
            }
            return;
        }

        let now = Instant::now();
        for idx in 0..self.peers.len() {
            let peer = &self.peers[idx];
            if !peer.is_idle() || peer.retry_count >= self.config.retries {
                continue;
            }
            if let Some(prev) = peer.prev_connect_time {
                if now.duration_since(prev) < self.config.retry_interval {
                    continue;
                }
            }

            self.connect(idx);
            self.peers[idx].prev_connect_time = Some(now);
        }
    }

    fn connect(&mut self, idx: usize) {
        if !self.connecting.insert(idx) {
            fatal(format!("{} is already connecting", self.server_name(idx)));
        }

        let addr = self.peers[idx].addr;
        match self.transport.connect(addr) {
            Ok(conn) => {
                debug!(server = %self.server_name(idx), conn_id = conn, "connecting");
                assert!(
                    self.lookup.insert(conn, idx).is_none(),
                    "connection handle {conn} already in use"
                );
                self.peers[idx].state = PeerState::Connecting(conn);
            }
            Err(e) => {
                self.connecting.remove(&idx);
                self.connect_failed(idx, &e.to_string());
            }
        }
    }

    fn connect_completed(&mut self, conn: ConnId, result: Result<(), TransportError>) {
        let Some(&idx) = self.lookup.get(&conn) else {
            debug!(conn_id = conn, "connect completion for unknown connection");
            return;
        };
        self.connecting.remove(&idx);

        if self.peers[idx].state != PeerState::Connecting(conn) {
            // torn down before the connect finished
            debug!(server = %self.server_name(idx), "connect completion after disconnect");
            return;
        }

        match result {
            Ok(()) => self.connect_succeeded(idx, conn),
            Err(e) => self.connect_failed(idx, &e.to_string()),
        }
    }

    fn connect_succeeded(&mut self, idx: usize, conn: ConnId) {
        let peer = &mut self.peers[idx];
        let attempts = peer.retry_count + 1;
        peer.retry_count = 0;
        peer.prev_connect_time = None;
        peer.state = PeerState::Active(conn);

        self.connected += 1;
        self.rotation.add(&mut self.peers, idx, &mut self.random);
        info!("Connected to {} after {} attempts", self.server_name(idx), attempts);
    }

    fn connect_failed(&mut self, idx: usize, reason: &str) {
        self.peers[idx].retry_count += 1;
        let retries = self.peers[idx].retry_count;

        // the first server to run out of retries ends the run
        if retries >= self.config.retries && self.status == RunStatus::Ok {
            self.status = RunStatus::ConnectRetriesExceeded;
        }

        let limit = if self.config.retries == u64::MAX {
            String::new()
        } else {
            format!("/{}", self.config.retries)
        };
        warn!(
            "Connect to {} failed (retry {}{}): {}",
            self.server_name(idx),
            retries,
            limit,
            reason
        );

        if self.peers[idx].state.conn().is_some() {
            self.disconnect_peer(idx, reason);
        }
    }

    /// Start tearing down the connection of `idx`. Its uncompleted operations
    /// stop counting as outstanding right away.
    fn disconnect_peer(&mut self, idx: usize, reason: &str) {
        let state = self.peers[idx].state;
        let Some(conn) = state.conn() else {
            panic!("disconnecting {} without a connection", self.server_name(idx));
        };

        if matches!(state, PeerState::Disconnecting(_)) || self.transport.is_disconnecting(conn) {
            info!(
                "not disconnecting {} due to \"{}\" because disconnection is already in progress",
                self.peers[idx], reason
            );
            return;
        }
        info!("disconnecting {} due to \"{}\"", self.peers[idx], reason);

        match state {
            PeerState::Active(_) => {
                if self.peers[idx].active_index().is_some() {
                    self.rotation.remove(&mut self.peers, idx);
                }
                let uncompleted = self.peers[idx].uncompleted();
                assert!(
                    uncompleted <= self.outstanding,
                    "{} uncompleted on {} exceeds {} outstanding",
                    uncompleted,
                    self.server_name(idx),
                    self.outstanding
                );
                self.outstanding -= uncompleted;
                self.connected -= 1;
            }
            PeerState::Connecting(_) => {
                self.connecting.remove(&idx);
            }
            PeerState::Idle | PeerState::Disconnecting(_) => unreachable!(),
        }

        self.peers[idx].state = PeerState::Disconnecting(conn);
        self.transport.disconnect(conn);
    }

    fn get_op(&mut self) -> IoOp {
        let ops = &self.config.operations;
        if ops.len() == 1 {
            return ops[0];
        }
        ops[self.random.urand(ops.len())]
    }

    fn get_data_size(&mut self) -> usize {
        self.random.rand(
            self.config.min_data_size as u64,
            self.config.max_data_size as u64,
        ) as usize
    }

    fn active_conn(&self, idx: usize) -> ConnId {
        match self.peers[idx].state {
            PeerState::Active(conn) => conn,
            state => panic!("{} picked in state {:?}", self.server_name(idx), state),
        }
    }

    fn send_io_message(&mut self, conn: ConnId, opcode: Opcode, sn: u32, data_size: u64) {
        let msg = self
            .pools
            .message(opcode, sn, data_size, self.config.validate)
            .unwrap_or_else(|e| fatal(e));

        let token = self.ops.next_token();
        protocol::send_io_message(&mut self.transport, conn, &msg, token);
        self.ops.alloc(ClientOp::Message(msg));
    }

    /// Issue a READ on `idx`. Returns the requested size, or 0 when the
    /// connection is not usable.
    fn do_io_read(&mut self, idx: usize, sn: u32) -> usize {
        let conn = self.active_conn(idx);
        if let Err(e) = self.transport.status(conn) {
            debug!(server = %self.server_name(idx), error = %e, "skipping read");
            return 0;
        }

        let data_size = self.get_data_size();
        self.send_io_message(conn, Opcode::Read, sn, data_size as u64);
        self.commit_operation(idx, IoOp::Read, data_size as u64);

        let iov = self
            .pools
            .buffers
            .acquire(data_size, sn, false)
            .unwrap_or_else(|e| fatal(e));
        let comp = self.pools.messages.get().unwrap_or_else(|e| fatal(e));

        // data chunks then the read completion, all matched by sn
        let token = self.ops.next_token();
        protocol::recv_data(&mut self.transport, conn, &iov, sn, token);
        self.transport
            .recv_chunk(conn, self.config.iomsg_size, sn, token);
        let join = JoinCounter::new(iov.len() + 1);
        self.ops.alloc(ClientOp::ReadData {
            peer: idx,
            conn,
            sn,
            iov,
            comp,
            join,
        });

        data_size
    }

    /// Issue a WRITE on `idx`. Returns the written size, or 0 when the
    /// connection is not usable.
    fn do_io_write(&mut self, idx: usize, sn: u32) -> usize {
        let conn = self.active_conn(idx);
        if let Err(e) = self.transport.status(conn) {
            debug!(server = %self.server_name(idx), error = %e, "skipping write");
            return 0;
        }

        let data_size = self.get_data_size();
        self.send_io_message(conn, Opcode::Write, sn, data_size as u64);
        self.commit_operation(idx, IoOp::Write, data_size as u64);

        let iov = self
            .pools
            .buffers
            .acquire(data_size, sn, self.config.validate)
            .unwrap_or_else(|e| fatal(e));

        trace!(size = data_size, sn, "sending data");
        let token = self.ops.next_token();
        protocol::send_data(&mut self.transport, conn, &iov, sn, token);
        let join = JoinCounter::new(iov.len());
        self.ops.alloc(ClientOp::WriteData { iov, join });

        data_size
    }

    fn commit_operation(&mut self, idx: usize, op: IoOp, data_size: u64) {
        let window = self.config.conn_window as u64;
        let peer = &mut self.peers[idx];
        let i = op.index();

        assert!(
            peer.uncompleted() < window,
            "uncompleted {} reached conn window {}",
            peer.uncompleted(),
            window
        );
        assert!(
            peer.counters.bytes_completed[i] <= peer.counters.bytes_sent[i],
            "{op}: bytes completed {} > bytes sent {}",
            peer.counters.bytes_completed[i],
            peer.counters.bytes_sent[i]
        );

        peer.counters.sent[i] += 1;
        peer.counters.bytes_sent[i] += data_size;
        self.outstanding += 1;

        if peer.uncompleted() == window {
            self.rotation.remove(&mut self.peers, idx);
        }
    }

    fn handle_operation_completion(&mut self, idx: usize, op: IoOp, data_size: u64) {
        let window = self.config.conn_window as u64;
        let peer = &mut self.peers[idx];
        let i = op.index();

        assert!(
            peer.uncompleted() <= window,
            "uncompleted {} above conn window {}",
            peer.uncompleted(),
            window
        );
        assert!(
            peer.counters.completed[i] < peer.counters.sent[i],
            "{op}: completion without a pending operation on {}",
            peer.addr
        );
        assert!(self.outstanding > 0, "completion with nothing outstanding");

        let readmit = peer.uncompleted() == window;

        peer.counters.bytes_completed[i] += data_size;
        peer.counters.completed[i] += 1;
        if peer.counters.uncompleted_op(op) == 0 {
            assert_eq!(
                peer.counters.bytes_completed[i], peer.counters.bytes_sent[i],
                "{op}: bytes mismatch with nothing pending"
            );
        } else {
            assert!(peer.counters.bytes_completed[i] <= peer.counters.bytes_sent[i]);
        }

        self.outstanding -= 1;
        self.completions += 1;

        if readmit {
            self.rotation.add(&mut self.peers, idx, &mut self.random);
        }
    }

    fn dispatch_io_message(&mut self, conn: ConnId, data: &[u8]) {
        let header = match IoHeader::decode(data) {
            Ok(header) => header,
            Err(e) => {
                warn!(conn_id = conn, "{}", e);
                return;
            }
        };

        trace!(
            op = %header.opcode,
            sn = header.sn,
            data_size = header.data_size,
            conn_id = conn,
            "got io message"
        );

        if header.opcode != Opcode::WriteComp {
            warn!(conn_id = conn, "invalid opcode: {}", header.opcode);
            return;
        }

        match self.lookup.get(&conn) {
            Some(&idx) if self.peers[idx].is_active_on(conn) => {
                self.handle_operation_completion(idx, IoOp::Write, header.data_size);
            }
            // already subtracted from outstanding when the teardown started
            _ => info!(conn_id = conn, "got write completion on failed connection"),
        }
    }

    fn send_completed(&mut self, token: u64, error: Option<TransportError>) {
        let done = match self.ops.get_mut(token) {
            Some(ClientOp::Message(_)) => true,
            Some(ClientOp::WriteData { join, .. }) => join.arrive(error),
            Some(ClientOp::ReadData { .. }) | None => {
                panic!("send completion for unknown operation {token}")
            }
        };
        if !done {
            return;
        }

        match self.ops.free(token) {
            Some(ClientOp::Message(msg)) => self.pools.messages.put(msg),
            Some(ClientOp::WriteData { iov, .. }) => self.pools.buffers.release(iov),
            _ => unreachable!(),
        }
    }

    fn recv_completed(&mut self, token: u64, result: Result<Bytes, TransportError>) {
        let Some(ClientOp::ReadData { iov, comp, join, .. }) = self.ops.get_mut(token) else {
            panic!("receive completion for unknown operation {token}");
        };

        let error = match result {
            Ok(data) => {
                let idx = join.completed();
                if idx < iov.len() {
                    iov.chunk_mut(idx).store(&data);
                } else {
                    comp.store(&data);
                }
                None
            }
            Err(e) => Some(e),
        };
        if !join.arrive(error) {
            return;
        }

        let Some(ClientOp::ReadData {
            peer,
            conn,
            sn,
            iov,
            comp,
            join,
        }) = self.ops.free(token)
        else {
            unreachable!();
        };

        if self.peers[peer].is_active_on(conn) {
            self.handle_operation_completion(peer, IoOp::Read, iov.data_size() as u64);
        }

        if let Some(e) = join.error() {
            debug!(server = %self.server_name(peer), sn, error = %e, "read failed");
        } else if self.config.validate {
            if let Err(e) = check_message(comp.as_slice(), self.config.iomsg_size, Some(sn)) {
                fatal(e);
            }
            if let Err(e) = check_buffers(&iov, sn) {
                fatal(e);
            }
        }

        self.pools.buffers.release(iov);
        self.pools.messages.put(comp);
    }

    /// Poll until at most `max_outstanding` operations are in flight.
    ///
    /// When no operation completes for longer than the client timeout, the
    /// servers with uncompleted operations are disconnected, unless the debug
    /// timeout flag keeps them for inspection.
    fn wait_for_responses(&mut self, max_outstanding: u64) {
        let mut timer_start = Instant::now();
        let mut timed_out = false;
        let mut last_completions = self.completions;
        let mut count = 0;

        while self.outstanding > max_outstanding && self.status == RunStatus::Ok {
            if count < BUSY_PROGRESS_COUNT {
                count += 1;
                self.progress();
                continue;
            }
            count = 0;

            let now = Instant::now();
            if self.terminate.is_requested() {
                self.status = RunStatus::Terminated;
                break;
            }
            self.check_time_limit(now);
            if timed_out {
                continue;
            }

            if self.completions != last_completions {
                last_completions = self.completions;
                timer_start = now;
                continue;
            }

            if now.duration_since(timer_start) > self.config.client_timeout {
                self.dump_timeout_waiting_for_replies_info();
                if !self.config.debug_timeout {
                    self.disconnect_uncompleted_peers("timeout for replies");
                }
                timed_out = true;
            }
        }
    }

    fn dump_timeout_waiting_for_replies_info(&self) {
        let mut dump = String::new();
        let mut total = 0;
        for peer in &self.peers {
            if peer.state.conn().is_none() || peer.uncompleted() == 0 {
                continue;
            }
            let _ = write!(dump, "\n{peer}");
            total += 1;
        }
        warn!(
            "timeout waiting for {} replies on the following connections:{}\ntotal: {}",
            self.outstanding, dump, total
        );
    }

    fn disconnect_uncompleted_peers(&mut self, reason: &str) {
        let stalled: Vec<usize> = (0..self.peers.len())
            .filter(|&idx| {
                matches!(self.peers[idx].state, PeerState::Active(_))
                    && self.peers[idx].uncompleted() > 0
            })
            .collect();

        for idx in stalled.into_iter().rev() {
            self.disconnect_peer(idx, reason);
        }
    }

    fn check_time_limit(&mut self, now: Instant) {
        if self.status == RunStatus::Ok
            && now.duration_since(self.start_time) >= self.config.runtime_limit
        {
            self.status = RunStatus::RuntimeExceeded;
        }
    }

    /// Log completions and throughput since the previous report, then reset
    /// the per-server counters.
    fn report(&mut self, num_iters: u64, elapsed: f64) {
        if num_iters == 0 {
            return;
        }

        let latency_usec = elapsed / num_iters as f64 * 1e6;
        let mut per_op = [PerfInfo::default(); 2];
        let mut overall = PerfInfo::default();

        for (idx, peer) in self.peers.iter_mut().enumerate() {
            let c = peer.counters;
            if matches!(peer.state, PeerState::Active(_)) {
                assert_eq!(c.bytes_sent, c.bytes_completed, "{} has pending bytes", peer.addr);
            }

            for op in IoOp::ALL {
                let i = op.index();
                per_op[i].add(idx, c.completed[i], c.bytes_completed[i]);
            }
            overall.add(
                idx,
                c.completed.iter().sum(),
                c.bytes_completed.iter().sum(),
            );
            peer.counters = OpCounters::default();
        }

        let mut line = format!(
            "total min:{} max:{} total:{}",
            overall.min, overall.max, overall.total
        );
        for op in IoOp::ALL {
            let perf = &per_op[op.index()];
            let min_name = perf
                .min_index
                .map(|idx| self.peers[idx].addr.to_string())
                .unwrap_or_else(|| "-".to_string());
            let _ = write!(
                line,
                " | {} {:.2} MBs min:{}({}) max:{} total:{}",
                op,
                perf.total_bytes as f64 / elapsed / MBYTE,
                perf.min,
                min_name,
                perf.max,
                perf.total
            );
        }
        let _ = write!(
            line,
            " | active:{}/{}",
            self.connected,
            self.transport.num_connections()
        );
        if self.config.window == 1 {
            let _ = write!(line, " latency:{latency_usec:.2}usec");
        }
        let _ = write!(line, " buffers:{}", self.pools.buffers.sets_allocated());
        info!("{}", line);
    }

    /// Disconnect every server and wait until all of them are idle.
    fn destroy_peers(&mut self) {
        for idx in 0..self.peers.len() {
            if self.peers[idx].state.conn().is_some() {
                self.disconnect_peer(idx, "End of the Client run");
            }
        }

        let remaining = self.peers.iter().filter(|p| !p.is_idle()).count();
        if remaining > 0 {
            info!("waiting for {} disconnects to complete", remaining);
            while self.peers.iter().any(|p| !p.is_idle()) {
                self.progress();
            }
        }
        debug!(in_flight = self.ops.len(), "servers destroyed");
    }
}

#[cfg(test)]
impl<T: Transport> Client<T> {
    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn outstanding(&self) -> u64 {
        self.outstanding
    }

    pub fn peers(&self) -> &[PeerInfo] {
        &self.peers
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}
