//! Benchmark protocol shared by the client and server roles.
//!
//! A request or completion travels as a fixed-size control message:
//!
//! ```text
//! +---------+--------+---------+----------------+-------------------+
//! | sn (LE) | opcode | padding | data_size (LE) | validation tail   |
//! | u32     | u8     | [u8; 3] | u64            | iomsg_size - 16   |
//! +---------+--------+---------+----------------+-------------------+
//! ```
//!
//! The tail is filled with the stream seeded by `sn` when validation is
//! enabled. Payload data moves as chunks tagged with `sn`, so the receiver
//! can match them against its posted receives.

use std::collections::TryReserveError;
use std::fmt;

use crate::random;
use crate::runtime::{BufferPools, BufferSet, ConnId, ObjectPool, PoolError, PoolItem, Transport};

/// Size of the encoded control message header.
pub const HEADER_SIZE: usize = 16;

/// Event-pump calls between wall-clock checks in busy loops.
pub const BUSY_PROGRESS_COUNT: usize = 1000;

/// Operation kinds a client can issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IoOp {
    Read,
    Write,
}

impl IoOp {
    pub const ALL: [IoOp; 2] = [IoOp::Read, IoOp::Write];

    /// Position in per-operation counter arrays.
    pub fn index(self) -> usize {
        match self {
            IoOp::Read => 0,
            IoOp::Write => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            IoOp::Read => "read",
            IoOp::Write => "write",
        }
    }
}

impl fmt::Display for IoOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Control message opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Read = 0,
    Write = 1,
    ReadComp = 2,
    WriteComp = 3,
}

impl Opcode {
    pub fn name(self) -> &'static str {
        match self {
            Opcode::Read => "read",
            Opcode::Write => "write",
            Opcode::ReadComp => "read completion",
            Opcode::WriteComp => "write completion",
        }
    }

    pub fn is_completion(self) -> bool {
        matches!(self, Opcode::ReadComp | Opcode::WriteComp)
    }
}

impl From<IoOp> for Opcode {
    fn from(op: IoOp) -> Self {
        match op {
            IoOp::Read => Opcode::Read,
            IoOp::Write => Opcode::Write,
        }
    }
}

impl TryFrom<u8> for Opcode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Opcode::Read),
            1 => Ok(Opcode::Write),
            2 => Ok(Opcode::ReadComp),
            3 => Ok(Opcode::WriteComp),
            other => Err(ProtocolError::UnknownOpcode(other)),
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Malformed control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Fewer bytes than a header.
    Short { len: usize },
    UnknownOpcode(u8),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Short { len } => {
                write!(f, "io message too short ({len} < {HEADER_SIZE} bytes)")
            }
            ProtocolError::UnknownOpcode(op) => write!(f, "invalid opcode: {op}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Decoded control message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoHeader {
    pub sn: u32,
    pub opcode: Opcode,
    pub data_size: u64,
}

impl IoHeader {
    /// Write the header into the first [`HEADER_SIZE`] bytes of `buf`.
    pub fn encode(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.sn.to_le_bytes());
        buf[4] = self.opcode as u8;
        buf[5..8].fill(0);
        buf[8..16].copy_from_slice(&self.data_size.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < HEADER_SIZE {
            return Err(ProtocolError::Short { len: buf.len() });
        }

        let sn = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let opcode = Opcode::try_from(buf[4])?;
        let mut size = [0u8; 8];
        size.copy_from_slice(&buf[8..16]);
        Ok(Self {
            sn,
            opcode,
            data_size: u64::from_le_bytes(size),
        })
    }
}

/// A pooled control message buffer of `iomsg_size` bytes.
#[derive(Debug)]
pub struct IoMessage {
    header: IoHeader,
    buf: Vec<u8>,
}

impl PoolItem for IoMessage {
    fn allocate(size: usize) -> Result<Self, TryReserveError> {
        Ok(Self {
            header: IoHeader {
                sn: 0,
                opcode: Opcode::Read,
                data_size: 0,
            },
            buf: Vec::<u8>::allocate(size)?,
        })
    }
}

impl IoMessage {
    pub fn init(&mut self, opcode: Opcode, sn: u32, data_size: u64, validate: bool) {
        self.header = IoHeader {
            sn,
            opcode,
            data_size,
        };
        self.header.encode(&mut self.buf);
        if validate {
            let mut seed = sn;
            random::fill(&mut seed, &mut self.buf[HEADER_SIZE..]);
        }
    }

    pub fn header(&self) -> &IoHeader {
        &self.header
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Replace the content with a received message.
    pub fn store(&mut self, data: &[u8]) {
        let len = data.len().min(self.buf.len());
        self.buf[..len].copy_from_slice(&data[..len]);
    }
}

/// Received content differs from what the sender generated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    SequenceMismatch { expected: u32, actual: u32 },
    Corrupted { what: &'static str, offset: usize },
    Malformed(ProtocolError),
}

impl fmt::Display for IntegrityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrityError::SequenceMismatch { expected, actual } => {
                write!(f, "io msg sn mismatch {expected} != {actual}")
            }
            IntegrityError::Corrupted { what, offset } => {
                write!(f, "{what} data corruption at {offset} position")
            }
            IntegrityError::Malformed(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for IntegrityError {}

/// Check a received control message against its sequence number and, if
/// `expected_sn` is given, against the sequence number the receiver expects.
pub fn check_message(
    data: &[u8],
    iomsg_size: usize,
    expected_sn: Option<u32>,
) -> Result<IoHeader, IntegrityError> {
    if data.len() != iomsg_size {
        return Err(IntegrityError::Corrupted {
            what: "io msg",
            offset: data.len().min(iomsg_size),
        });
    }

    let header = IoHeader::decode(data).map_err(IntegrityError::Malformed)?;
    if let Some(expected) = expected_sn {
        if expected != header.sn {
            return Err(IntegrityError::SequenceMismatch {
                expected,
                actual: header.sn,
            });
        }
    }

    let tail = &data[HEADER_SIZE..];
    let mut seed = header.sn;
    let valid = random::validate(&mut seed, tail);
    if valid < tail.len() {
        return Err(IntegrityError::Corrupted {
            what: "io msg",
            offset: HEADER_SIZE + valid,
        });
    }
    Ok(header)
}

/// Check the content of a received transfer.
pub fn check_buffers(iov: &BufferSet, sn: u32) -> Result<(), IntegrityError> {
    match iov.first_mismatch(sn) {
        Some(offset) => Err(IntegrityError::Corrupted { what: "iov", offset }),
        None => Ok(()),
    }
}

/// Send a control message. Read completions travel on the data path tagged
/// with their sequence number, so the requester can match them behind the
/// payload chunks.
pub fn send_io_message<T: Transport + ?Sized>(
    transport: &mut T,
    conn: ConnId,
    msg: &IoMessage,
    token: u64,
) {
    let header = msg.header();
    if header.opcode == Opcode::ReadComp {
        transport.send_chunk(conn, msg.as_slice(), header.sn, token);
    } else {
        transport.send_control(conn, msg.as_slice(), token);
    }
}

/// Send every chunk of `iov` tagged with `sn`. One completion per chunk
/// arrives for `token`.
pub fn send_data<T: Transport + ?Sized>(
    transport: &mut T,
    conn: ConnId,
    iov: &BufferSet,
    sn: u32,
    token: u64,
) {
    for chunk in iov.iter() {
        transport.send_chunk(conn, chunk.as_slice(), sn, token);
    }
}

/// Post a receive for every chunk of `iov` tagged with `sn`. One completion
/// per chunk arrives for `token`, in chunk order.
pub fn recv_data<T: Transport + ?Sized>(
    transport: &mut T,
    conn: ConnId,
    iov: &BufferSet,
    sn: u32,
    token: u64,
) {
    for chunk in iov.iter() {
        transport.recv_chunk(conn, chunk.size(), sn, token);
    }
}

/// Pools shared by the operations of one role.
pub struct Pools {
    pub messages: ObjectPool<IoMessage>,
    pub buffers: BufferPools,
}

impl Pools {
    pub fn new(iomsg_size: usize, chunk_size: usize, offcache: usize) -> Result<Self, PoolError> {
        Ok(Self {
            messages: ObjectPool::new("io messages", iomsg_size),
            buffers: BufferPools::new(chunk_size, offcache)?,
        })
    }

    /// Take a message buffer initialized with the given header.
    pub fn message(
        &mut self,
        opcode: Opcode,
        sn: u32,
        data_size: u64,
        validate: bool,
    ) -> Result<IoMessage, PoolError> {
        let mut msg = self.messages.get()?;
        msg.init(opcode, sn, data_size, validate);
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::mock::MockTransport;

    #[test]
    fn test_header_layout() {
        let mut buf = [0xffu8; HEADER_SIZE];
        IoHeader {
            sn: 0x0a0b_0c0d,
            opcode: Opcode::WriteComp,
            data_size: 4097,
        }
        .encode(&mut buf);

        assert_eq!(&buf[0..4], &[0x0d, 0x0c, 0x0b, 0x0a]);
        assert_eq!(buf[4], 3);
        assert_eq!(&buf[5..8], &[0, 0, 0]);
        assert_eq!(&buf[8..16], &4097u64.to_le_bytes());

        let header = IoHeader::decode(&buf).unwrap();
        assert_eq!(header.sn, 0x0a0b_0c0d);
        assert_eq!(header.opcode, Opcode::WriteComp);
        assert_eq!(header.data_size, 4097);
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(
            IoHeader::decode(&[0u8; 4]),
            Err(ProtocolError::Short { len: 4 })
        );

        let mut buf = [0u8; HEADER_SIZE];
        buf[4] = 7;
        assert_eq!(IoHeader::decode(&buf), Err(ProtocolError::UnknownOpcode(7)));
    }

    #[test]
    fn test_message_validation() {
        let mut pools = Pools::new(64, 1024, 0).unwrap();
        let msg = pools.message(Opcode::Write, 99, 4096, true).unwrap();

        let header = check_message(msg.as_slice(), 64, Some(99)).unwrap();
        assert_eq!(header.opcode, Opcode::Write);
        assert_eq!(header.data_size, 4096);

        assert_eq!(
            check_message(msg.as_slice(), 64, Some(100)),
            Err(IntegrityError::SequenceMismatch {
                expected: 100,
                actual: 99
            })
        );

        let mut corrupted = msg.as_slice().to_vec();
        corrupted[40] ^= 1;
        assert_eq!(
            check_message(&corrupted, 64, None),
            Err(IntegrityError::Corrupted {
                what: "io msg",
                offset: 40
            })
        );

        assert!(check_message(&corrupted[..32], 64, None).is_err());
        pools.messages.put(msg);
    }

    #[test]
    fn test_corrupted_transfer_reports_offset() {
        let mut pools = Pools::new(64, 1024, 0).unwrap();
        let mut iov = pools.buffers.acquire(4096, 5, true).unwrap();
        assert!(check_buffers(&iov, 5).is_ok());

        iov.chunk_mut(1).as_mut_slice()[3] ^= 0x80;
        assert_eq!(
            check_buffers(&iov, 5),
            Err(IntegrityError::Corrupted {
                what: "iov",
                offset: 1027
            })
        );
        pools.buffers.release(iov);
    }

    #[test]
    fn test_read_completion_uses_data_path() {
        let mut pools = Pools::new(32, 1024, 0).unwrap();
        let mut transport = MockTransport::new();

        let comp = pools.message(Opcode::ReadComp, 12, 0, false).unwrap();
        send_io_message(&mut transport, 0, &comp, 1);
        let req = pools.message(Opcode::Read, 13, 100, false).unwrap();
        send_io_message(&mut transport, 0, &req, 2);

        assert_eq!(transport.chunks.len(), 1);
        assert_eq!(transport.chunks[0].1, 12);
        assert_eq!(transport.controls.len(), 1);
        assert_eq!(transport.controls[0].1.len(), 32);

        pools.messages.put(comp);
        pools.messages.put(req);
    }

    #[test]
    fn test_chunked_transfer_uses_one_tag() {
        let mut pools = Pools::new(32, 1000, 0).unwrap();
        let mut transport = MockTransport::new();
        let iov = pools.buffers.acquire(2500, 77, true).unwrap();

        send_data(&mut transport, 3, &iov, 77, 9);
        recv_data(&mut transport, 3, &iov, 77, 10);

        let sizes: Vec<usize> = transport.chunks.iter().map(|(_, _, d)| d.len()).collect();
        assert_eq!(sizes, vec![1000, 1000, 500]);
        assert!(transport.chunks.iter().all(|(conn, tag, _)| *conn == 3 && *tag == 77));

        let posted = transport.posted_for(3);
        assert_eq!(posted.len(), 3);
        assert!(posted.iter().all(|p| p.token == 10 && p.tag == 77));
        assert_eq!(posted[2].len, 500);

        pools.buffers.release(iov);
    }
}
