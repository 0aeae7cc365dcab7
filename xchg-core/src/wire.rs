//! Discovery datagrams: one tag byte, then the bincode-encoded [`Message`].
//!
//! Call Frames share the UDP socket and carry the signature byte at offset 2. A discovery
//! datagram starts with [`DISCOVERY_TAG`] followed by the bincode variant index, whose
//! high bytes are zero, so the two never look alike.

use crate::protocol::Message;

pub const DISCOVERY_TAG: u8 = 0xD1;

/// Largest discovery datagram accepted (a 4096-bit key and signature fit easily).
pub const MAX_DISCOVERY_LEN: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("not a discovery datagram")]
    NotDiscovery,
    #[error("discovery datagram of {0} bytes is too large")]
    TooLarge(usize),
    #[error("bad discovery message: {0}")]
    Bincode(#[from] bincode::Error),
}

pub fn encode_datagram(msg: &Message) -> Result<Vec<u8>, WireError> {
    let mut out = vec![DISCOVERY_TAG];
    bincode::serialize_into(&mut out, msg)?;
    if out.len() > MAX_DISCOVERY_LEN {
        return Err(WireError::TooLarge(out.len()));
    }
    Ok(out)
}

/// Decode a whole datagram; trailing bytes are rejected.
pub fn decode_datagram(datagram: &[u8]) -> Result<Message, WireError> {
    let Some((&DISCOVERY_TAG, body)) = datagram.split_first() else {
        return Err(WireError::NotDiscovery);
    };
    if datagram.len() > MAX_DISCOVERY_LEN {
        return Err(WireError::TooLarge(datagram.len()));
    }
    let msg: Message = bincode::deserialize(body)?;
    if bincode::serialized_size(&msg)? as usize != body.len() {
        return Err(WireError::NotDiscovery);
    }
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::protocol::{PROTOCOL_VERSION, SIGNATURE};

    fn request() -> Message {
        Message::ResolveRequest {
            protocol_version: PROTOCOL_VERSION,
            target: Address::from_public_key_der(b"target"),
            nonce: [7u8; 16],
        }
    }

    #[test]
    fn request_survives_the_socket() {
        let bytes = encode_datagram(&request()).unwrap();
        assert_eq!(bytes[0], DISCOVERY_TAG);
        match decode_datagram(&bytes).unwrap() {
            Message::ResolveRequest { target, nonce, .. } => {
                assert_eq!(target, Address::from_public_key_der(b"target"));
                assert_eq!(nonce, [7u8; 16]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn call_frames_and_garbage_are_not_discovery() {
        let bytes = encode_datagram(&request()).unwrap();
        assert_ne!(bytes[2], SIGNATURE);
        assert!(matches!(
            decode_datagram(&[0, 0, SIGNATURE, 0]),
            Err(WireError::NotDiscovery)
        ));
        assert!(matches!(decode_datagram(&[]), Err(WireError::NotDiscovery)));
        let mut bytes = encode_datagram(&request()).unwrap();
        bytes.truncate(bytes.len() - 3);
        assert!(matches!(decode_datagram(&bytes), Err(WireError::Bincode(_))));
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut bytes = encode_datagram(&request()).unwrap();
        bytes.push(0);
        assert!(decode_datagram(&bytes).is_err());
    }

    #[test]
    fn oversized_response_rejected() {
        let msg = Message::ResolveResponse {
            protocol_version: PROTOCOL_VERSION,
            address: Address::from_public_key_der(b"b"),
            public_key: vec![1; MAX_DISCOVERY_LEN],
            nonce: [0u8; 16],
            signature: vec![9; 4],
        };
        assert!(matches!(encode_datagram(&msg), Err(WireError::TooLarge(_))));
    }
}
