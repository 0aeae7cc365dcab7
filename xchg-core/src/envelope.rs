//! Mailbox envelopes for the HTTP relay: `[sourceAddress:30][Call Frame]`.
//! A mailbox read returns a stream of `[len:4 LE][envelope]`.

use crate::address::{Address, ADDRESS_LEN};
use crate::frame::{CallFrame, FrameError};

pub fn encode_envelope(from: &Address, frame: &CallFrame) -> Vec<u8> {
    let mut out = from.as_bytes().to_vec();
    out.extend_from_slice(&frame.encode());
    out
}

pub fn decode_envelope(bytes: &[u8]) -> Result<(Address, CallFrame), FrameError> {
    if bytes.len() < ADDRESS_LEN {
        return Err(FrameError::Length);
    }
    let from = Address::from_slice(&bytes[..ADDRESS_LEN]).map_err(|_| FrameError::Length)?;
    let frame = CallFrame::decode(&bytes[ADDRESS_LEN..])?;
    Ok((from, frame))
}

pub fn encode_envelope_stream(envelopes: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::with_capacity(envelopes.iter().map(|e| e.len() + 4).sum());
    for e in envelopes {
        out.extend_from_slice(&(e.len() as u32).to_le_bytes());
        out.extend_from_slice(e);
    }
    out
}

/// Stops at the first truncated entry.
pub fn decode_envelope_stream(mut bytes: &[u8]) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    while bytes.len() >= 4 {
        let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        if bytes.len() - 4 < len {
            break;
        }
        out.push(bytes[4..4 + len].to_vec());
        bytes = &bytes[4 + len..];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_carries_sender() {
        let from = Address::from_bytes([9; ADDRESS_LEN]);
        let frame = CallFrame::call(3, 0, b"abc".to_vec());
        let (got_from, got) = decode_envelope(&encode_envelope(&from, &frame)).unwrap();
        assert_eq!(got_from, from);
        assert_eq!(got, frame);
        assert!(decode_envelope(&[1, 2, 3]).is_err());
    }

    #[test]
    fn stream_stops_at_truncation() {
        let bytes = encode_envelope_stream(&[b"one".to_vec(), Vec::new(), b"three".to_vec()]);
        assert_eq!(decode_envelope_stream(&bytes).len(), 3);
        let cut = decode_envelope_stream(&bytes[..bytes.len() - 1]);
        assert_eq!(cut, vec![b"one".to_vec(), Vec::new()]);
    }
}
