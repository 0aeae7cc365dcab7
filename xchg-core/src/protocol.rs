//! xchg wire protocol: frame types, status codes, reserved functions, LAN discovery messages.

use serde::{Deserialize, Serialize};

use crate::address::Address;

/// Signature byte carried by every Relay Frame and Call Frame.
pub const SIGNATURE: u8 = 0xAA;

/// Current protocol version. Carried in Relay Frames and discovery messages.
pub const PROTOCOL_VERSION: u8 = 1;

/// Default Router TCP relay port.
pub const DEFAULT_ROUTER_TCP_PORT: u16 = 8484;
/// Default Router HTTP (status + mailbox) port.
pub const DEFAULT_ROUTER_HTTP_PORT: u16 = 8485;
/// Local UDP port range used for peer discovery (first free wins).
pub const DEFAULT_UDP_PORT_START: u16 = 42000;
pub const DEFAULT_UDP_PORT_END: u16 = 42500;

/// Reserved function: issue a single-use auth nonce.
pub const FN_GET_NONCE: &str = "/xchg-get-nonce";
/// Reserved function: prove identity, establish a session.
pub const FN_AUTH: &str = "/xchg-auth";

pub fn is_reserved_function(name: &str) -> bool {
    name == FN_GET_NONCE || name == FN_AUTH
}

/// Relay Frame types (Router TCP links).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RelayFrameType {
    Init1 = 0x01,
    Init2 = 0x02,
    Init3 = 0x03,
    Init4 = 0x04,
    Init5 = 0x05,
    Init6 = 0x06,
    ResolveAddress = 0x10,
    ResolvedAddress = 0x11,
    Call = 0x20,
    Response = 0x21,
    Error = 0xFF,
}

impl RelayFrameType {
    pub fn from_u8(v: u8) -> Option<Self> {
        use RelayFrameType::*;
        Some(match v {
            0x01 => Init1,
            0x02 => Init2,
            0x03 => Init3,
            0x04 => Init4,
            0x05 => Init5,
            0x06 => Init6,
            0x10 => ResolveAddress,
            0x11 => ResolvedAddress,
            0x20 => Call,
            0x21 => Response,
            0xFF => Error,
            _ => return None,
        })
    }

    pub fn is_handshake(self) -> bool {
        (self as u8) >= 0x01 && (self as u8) <= 0x06
    }
}

/// Call Frame types (chunked request/response).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CallFrameType {
    Call = 0x10,
    Response = 0x11,
}

impl CallFrameType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x10 => Some(CallFrameType::Call),
            0x11 => Some(CallFrameType::Response),
            _ => None,
        }
    }
}

/// Status byte of a response Call Frame. Non-zero statuses carry a UTF-8 message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CallStatus {
    Ok = 0,
    /// The processor returned an error.
    Error = 1,
    /// Unknown session id or undecryptable payload.
    WrongSession = 2,
    /// Call counter rejected by the replay window.
    NonceRejected = 3,
    /// Nonce check or auth callback failed.
    AuthFailed = 4,
    /// Malformed call payload.
    BadRequest = 5,
}

impl CallStatus {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => CallStatus::Ok,
            2 => CallStatus::WrongSession,
            3 => CallStatus::NonceRejected,
            4 => CallStatus::AuthFailed,
            5 => CallStatus::BadRequest,
            _ => CallStatus::Error,
        }
    }

    /// Statuses after which the caller must re-authenticate.
    pub fn invalidates_session(self) -> bool {
        matches!(self, CallStatus::WrongSession | CallStatus::NonceRejected)
    }
}

/// LAN discovery messages (UDP only), carried by [`crate::wire`] datagrams.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Broadcast: who owns `target`? Owner must sign `nonce`.
    ResolveRequest {
        protocol_version: u8,
        target: Address,
        nonce: [u8; 16],
    },
    /// Unicast reply from the owner of `address`.
    ResolveResponse {
        protocol_version: u8,
        address: Address,
        public_key: Vec<u8>,
        nonce: [u8; 16],
        signature: Vec<u8>,
    },
}

/// Application logic behind a peer. The only integration point between the protocol and the application.
pub trait ServerProcessor: Send + Sync {
    /// Accept or reject the auth data presented in `/xchg-auth`.
    fn auth(&self, auth_data: &[u8]) -> Result<(), String>;
    /// Execute `function` with `parameter`.
    fn call(&self, function: &str, parameter: &[u8]) -> Result<Vec<u8>, String>;
}
