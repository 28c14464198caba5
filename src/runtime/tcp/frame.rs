//! Wire framing for the TCP transport.
//!
//! Every frame starts with a 12-byte header:
//!
//! ```text
//! +------+----------+-----------+--------------+
//! | kind | reserved | tag (LE)  | length (LE)  |
//! | u8   | [u8; 3]  | u32       | u32          |
//! +------+----------+-----------+--------------+
//! ```
//!
//! followed by `length` payload bytes.

use std::io;

pub const FRAME_HEADER_SIZE: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Control message, delivered without a posted receive.
    Control = 1,
    /// Tagged data chunk, matched against posted receives.
    Data = 2,
}

impl TryFrom<u8> for FrameKind {
    type Error = io::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(FrameKind::Control),
            2 => Ok(FrameKind::Data),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown frame kind {other}"),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: FrameKind,
    pub tag: u32,
    pub len: usize,
}

impl FrameHeader {
    /// Build a complete frame: header followed by `payload`.
    pub fn encode(kind: FrameKind, tag: u32, payload: &[u8]) -> io::Result<Vec<u8>> {
        let len = u32::try_from(payload.len()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "payload too large for one frame")
        })?;

        let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        buf.push(kind as u8);
        buf.extend_from_slice(&[0u8; 3]);
        buf.extend_from_slice(&tag.to_le_bytes());
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(payload);
        Ok(buf)
    }

    /// Parse a header from the front of `buf`.
    ///
    /// Returns `Ok(None)` when fewer than [`FRAME_HEADER_SIZE`] bytes are
    /// available. A payload longer than `max_len` is an error.
    pub fn decode(buf: &[u8], max_len: usize) -> io::Result<Option<Self>> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let kind = FrameKind::try_from(buf[0])?;
        let tag = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let len = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
        if len > max_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame length {len} exceeds {max_len}"),
            ));
        }
        Ok(Some(Self { kind, tag, len }))
    }

    /// Header plus payload length.
    pub fn frame_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let frame = FrameHeader::encode(FrameKind::Data, 0x0102_0304, b"abc").unwrap();

        assert_eq!(frame.len(), FRAME_HEADER_SIZE + 3);
        assert_eq!(frame[0], 2);
        assert_eq!(&frame[1..4], &[0, 0, 0]);
        assert_eq!(&frame[4..8], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&frame[8..12], &[3, 0, 0, 0]);
        assert_eq!(&frame[12..], b"abc");

        let header = FrameHeader::decode(&frame, 16).unwrap().unwrap();
        assert_eq!(header.kind, FrameKind::Data);
        assert_eq!(header.tag, 0x0102_0304);
        assert_eq!(header.len, 3);
        assert_eq!(header.frame_len(), frame.len());
    }

    #[test]
    fn test_decode_needs_full_header() {
        let frame = FrameHeader::encode(FrameKind::Control, 0, b"").unwrap();
        assert!(FrameHeader::decode(&frame[..FRAME_HEADER_SIZE - 1], 16)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_decode_rejects_unknown_kind() {
        let mut frame = FrameHeader::encode(FrameKind::Control, 0, b"x").unwrap();
        frame[0] = 9;
        let err = FrameHeader::decode(&frame, 16).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_decode_rejects_oversized_length() {
        let frame = FrameHeader::encode(FrameKind::Data, 7, &[0u8; 65]).unwrap();
        assert_eq!(FrameHeader::decode(&frame, 65).unwrap().unwrap().len, 65);

        // Rejected from the header alone, before the payload is buffered
        let err = FrameHeader::decode(&frame[..FRAME_HEADER_SIZE], 64).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
