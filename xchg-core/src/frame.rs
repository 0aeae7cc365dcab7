//! Binary frames: Relay Frame (32-byte header, Router TCP links) and Call Frame (40-byte header, chunked calls).
//!
//! Relay Frame:
//! ```text
//! [sig:1][version:1][frameType:1][reserved:1][frameLen:4][SID:8][transactionId:8][sessionId:8][payload]
//! ```
//! Call Frame (signature in the first reserved byte):
//! ```text
//! [frameType:1][status:1][sig:1][reserved:1][reserved:4][transactionId:8][sessionId:8][reserved:8][offset:4][totalSize:4][payload]
//! ```
//! All integers little-endian.

use crate::protocol::{CallFrameType, CallStatus, RelayFrameType, PROTOCOL_VERSION, SIGNATURE};

pub const RELAY_HEADER_LEN: usize = 32;
pub const CALL_HEADER_LEN: usize = 40;

/// Upper bound for one Relay Frame and for one reassembled Call Frame payload.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Control/data unit on a Router TCP link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayFrame {
    pub frame_type: RelayFrameType,
    /// Router-local connection id the frame targets (or answers for).
    pub sid: u64,
    pub transaction_id: u64,
    pub session_id: u64,
    pub payload: Vec<u8>,
}

impl RelayFrame {
    pub fn new(frame_type: RelayFrameType, sid: u64, transaction_id: u64, payload: Vec<u8>) -> Self {
        Self {
            frame_type,
            sid,
            transaction_id,
            session_id: 0,
            payload,
        }
    }

    /// Routing error answer for `transaction_id`.
    pub fn error(sid: u64, transaction_id: u64, message: &str) -> Self {
        Self::new(
            RelayFrameType::Error,
            sid,
            transaction_id,
            message.as_bytes().to_vec(),
        )
    }

    pub fn encode(&self) -> Vec<u8> {
        let frame_len = (RELAY_HEADER_LEN + self.payload.len()) as u32;
        let mut out = Vec::with_capacity(frame_len as usize);
        out.push(SIGNATURE);
        out.push(PROTOCOL_VERSION);
        out.push(self.frame_type as u8);
        out.push(0);
        out.extend_from_slice(&frame_len.to_le_bytes());
        out.extend_from_slice(&self.sid.to_le_bytes());
        out.extend_from_slice(&self.transaction_id.to_le_bytes());
        out.extend_from_slice(&self.session_id.to_le_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decode one frame from the front of a stream buffer. Returns the frame and bytes consumed.
    /// `NeedMore` means the header or payload is incomplete; every other error is a protocol error.
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize), FrameError> {
        if bytes.len() < RELAY_HEADER_LEN {
            return Err(FrameError::NeedMore);
        }
        if bytes[0] != SIGNATURE {
            return Err(FrameError::Signature);
        }
        if bytes[1] != PROTOCOL_VERSION {
            return Err(FrameError::Version(bytes[1]));
        }
        let frame_type = RelayFrameType::from_u8(bytes[2]).ok_or(FrameError::FrameType(bytes[2]))?;
        let frame_len = read_u32(bytes, 4) as usize;
        if frame_len < RELAY_HEADER_LEN {
            return Err(FrameError::Length);
        }
        if frame_len > MAX_FRAME_LEN {
            return Err(FrameError::TooLarge);
        }
        if bytes.len() < frame_len {
            return Err(FrameError::NeedMore);
        }
        let frame = RelayFrame {
            frame_type,
            sid: read_u64(bytes, 8),
            transaction_id: read_u64(bytes, 16),
            session_id: read_u64(bytes, 24),
            payload: bytes[RELAY_HEADER_LEN..frame_len].to_vec(),
        };
        Ok((frame, frame_len))
    }
}

/// One chunk of a logical call or response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallFrame {
    pub frame_type: CallFrameType,
    pub status: CallStatus,
    pub transaction_id: u64,
    pub session_id: u64,
    /// Position of `payload` within the logical message.
    pub offset: u32,
    /// Length of the whole logical message.
    pub total_size: u32,
    pub payload: Vec<u8>,
}

impl CallFrame {
    /// Unchunked call carrying the whole message.
    pub fn call(transaction_id: u64, session_id: u64, payload: Vec<u8>) -> Self {
        Self::whole(CallFrameType::Call, CallStatus::Ok, transaction_id, session_id, payload)
    }

    /// Unchunked response carrying the whole message.
    pub fn response(
        status: CallStatus,
        transaction_id: u64,
        session_id: u64,
        payload: Vec<u8>,
    ) -> Self {
        Self::whole(CallFrameType::Response, status, transaction_id, session_id, payload)
    }

    fn whole(
        frame_type: CallFrameType,
        status: CallStatus,
        transaction_id: u64,
        session_id: u64,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            frame_type,
            status,
            transaction_id,
            session_id,
            offset: 0,
            total_size: payload.len() as u32,
            payload,
        }
    }

    /// True when this chunk ends the logical message.
    pub fn is_last_chunk(&self) -> bool {
        self.offset as usize + self.payload.len() >= self.total_size as usize
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(CALL_HEADER_LEN + self.payload.len());
        out.push(self.frame_type as u8);
        out.push(self.status as u8);
        out.push(SIGNATURE);
        out.push(0);
        out.extend_from_slice(&[0u8; 4]);
        out.extend_from_slice(&self.transaction_id.to_le_bytes());
        out.extend_from_slice(&self.session_id.to_le_bytes());
        out.extend_from_slice(&[0u8; 8]);
        out.extend_from_slice(&self.offset.to_le_bytes());
        out.extend_from_slice(&self.total_size.to_le_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decode a whole datagram (or relayed payload) as one Call Frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < CALL_HEADER_LEN {
            return Err(FrameError::Length);
        }
        if bytes[2] != SIGNATURE {
            return Err(FrameError::Signature);
        }
        let frame_type = CallFrameType::from_u8(bytes[0]).ok_or(FrameError::FrameType(bytes[0]))?;
        let offset = read_u32(bytes, 32);
        let total_size = read_u32(bytes, 36);
        let payload = &bytes[CALL_HEADER_LEN..];
        if total_size as usize > MAX_FRAME_LEN
            || offset as usize + payload.len() > total_size as usize
        {
            return Err(FrameError::Length);
        }
        Ok(CallFrame {
            frame_type,
            status: CallStatus::from_u8(bytes[1]),
            transaction_id: read_u64(bytes, 8),
            session_id: read_u64(bytes, 16),
            offset,
            total_size,
            payload: payload.to_vec(),
        })
    }

    /// Cheap check used to demultiplex datagrams: Call Frame vs discovery message.
    pub fn looks_like(bytes: &[u8]) -> bool {
        bytes.len() >= CALL_HEADER_LEN && bytes[2] == SIGNATURE
    }
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(b)
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(b)
}

/// Malformed frame. Everything except `NeedMore` is dropped without a response.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("need more bytes")]
    NeedMore,
    #[error("bad signature")]
    Signature,
    #[error("unsupported version {0}")]
    Version(u8),
    #[error("unknown frame type {0:#04x}")]
    FrameType(u8),
    #[error("inconsistent length")]
    Length,
    #[error("frame too large")]
    TooLarge,
}
