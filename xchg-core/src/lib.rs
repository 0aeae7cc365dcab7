//! xchg protocol reference implementation.
//! Host-driven: no I/O; hosts feed bytes in and send whatever comes back out.

pub mod address;
pub mod call;
pub mod chunk;
pub mod envelope;
pub mod frame;
pub mod handshake;
pub mod identity;
pub mod nonce;
pub mod protocol;
pub mod wire;

pub use address::{Address, AddressError, ADDRESS_LEN};
pub use chunk::{split_into_chunks, ChunkReceiveResult, Reassembler, DEFAULT_CHUNK_SIZE};
pub use frame::{CallFrame, FrameError, RelayFrame, CALL_HEADER_LEN, RELAY_HEADER_LEN};
pub use handshake::{Handshake, HandshakeError, HandshakeState, Role};
pub use identity::{CryptoError, Keypair, PublicKey, SessionKey};
pub use nonce::{NonceError, Nonces, SnakeCounter};
pub use protocol::{
    CallFrameType, CallStatus, Message, RelayFrameType, ServerProcessor, PROTOCOL_VERSION,
};
