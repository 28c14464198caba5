//! Per-server bookkeeping on the client.

use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

use super::rotation::RotationMember;
use crate::protocol::IoOp;
use crate::runtime::ConnId;

/// Connection lifecycle of one server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// No connection object.
    Idle,
    /// Connect issued, waiting for its outcome.
    Connecting(ConnId),
    /// Established and eligible for scheduling.
    Active(ConnId),
    /// Teardown requested, waiting for the transport to finish it.
    Disconnecting(ConnId),
}

impl PeerState {
    pub fn conn(self) -> Option<ConnId> {
        match self {
            PeerState::Idle => None,
            PeerState::Connecting(conn)
            | PeerState::Active(conn)
            | PeerState::Disconnecting(conn) => Some(conn),
        }
    }
}

/// Operation counters since the last report, indexed by [`IoOp::index`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OpCounters {
    pub sent: [u64; 2],
    pub completed: [u64; 2],
    pub bytes_sent: [u64; 2],
    pub bytes_completed: [u64; 2],
}

impl OpCounters {
    pub fn uncompleted_op(&self, op: IoOp) -> u64 {
        let i = op.index();
        assert!(
            self.completed[i] <= self.sent[i],
            "{op}: completed {} > sent {}",
            self.completed[i],
            self.sent[i]
        );
        self.sent[i] - self.completed[i]
    }

    pub fn uncompleted(&self) -> u64 {
        self.uncompleted_op(IoOp::Read) + self.uncompleted_op(IoOp::Write)
    }
}

#[derive(Debug)]
pub struct PeerInfo {
    pub addr: SocketAddr,
    pub state: PeerState,
    /// Consecutive failed connect attempts.
    pub retry_count: u64,
    pub prev_connect_time: Option<Instant>,
    active_index: Option<usize>,
    pub counters: OpCounters,
}

impl PeerInfo {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            state: PeerState::Idle,
            retry_count: 0,
            prev_connect_time: None,
            active_index: None,
            counters: OpCounters::default(),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.state == PeerState::Idle
    }

    pub fn is_active_on(&self, conn: ConnId) -> bool {
        self.state == PeerState::Active(conn)
    }

    pub fn uncompleted(&self) -> u64 {
        self.counters.uncompleted()
    }

    /// Back to Idle after teardown. Retry bookkeeping survives.
    pub fn reset(&mut self) {
        assert!(
            self.active_index.is_none(),
            "resetting {} while in the rotation",
            self.addr
        );
        self.state = PeerState::Idle;
        self.counters = OpCounters::default();
    }
}

impl RotationMember for PeerInfo {
    fn active_index(&self) -> Option<usize> {
        self.active_index
    }

    fn set_active_index(&mut self, index: Option<usize>) {
        self.active_index = index;
    }
}

impl fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = &self.counters;
        write!(
            f,
            "{} read {}/{} write {}/{}",
            self.addr,
            c.completed[IoOp::Read.index()],
            c.sent[IoOp::Read.index()],
            c.completed[IoOp::Write.index()],
            c.sent[IoOp::Write.index()]
        )?;
        if matches!(self.state, PeerState::Disconnecting(_)) {
            write!(f, " (disconnecting)")?;
        }
        Ok(())
    }
}
