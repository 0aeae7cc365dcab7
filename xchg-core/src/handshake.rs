//! Transport-level mutual authentication (Init1..Init6).
//!
//! ```text
//! initiator                                responder
//!   Init1  own public key (DER)     ──►
//!                                   ◄──  Init2  own public key (DER)
//!                                   ◄──  Init3  RSA(secret2, initiator)
//!   Init4  RSA(secret2, responder)  ──►
//!   Init5  RSA(secret1, responder)  ──►
//!                                   ◄──  Init6  RSA(secret1, initiator)
//! ```
//! Host-driven: the host feeds received frames and sends whatever frames come back.
//! Any failure moves the state to `Failed`, produces no output, and later frames are ignored.

use std::sync::Arc;

use tracing::debug;

use crate::address::Address;
use crate::identity::{generate_secret, Keypair, PublicKey, SECRET_LEN};
use crate::protocol::RelayFrameType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Pending,
    Established,
    Failed,
}

/// Frame the host must send: type + payload.
pub type HandshakeOutput = (RelayFrameType, Vec<u8>);

pub struct Handshake {
    role: Role,
    keypair: Arc<Keypair>,
    expected: Option<Address>,
    remote: Option<PublicKey>,
    /// Secret we issued and expect back (secret2 for the responder, secret1 for the initiator).
    issued: Option<[u8; SECRET_LEN]>,
    proof_received: bool,
    state: HandshakeState,
}

impl Handshake {
    pub fn initiator(keypair: Arc<Keypair>) -> Self {
        Self::new(Role::Initiator, keypair)
    }

    pub fn responder(keypair: Arc<Keypair>) -> Self {
        Self::new(Role::Responder, keypair)
    }

    fn new(role: Role, keypair: Arc<Keypair>) -> Self {
        Self {
            role,
            keypair,
            expected: None,
            remote: None,
            issued: None,
            proof_received: false,
            state: HandshakeState::Pending,
        }
    }

    /// Abort unless the remote key hashes to `address`.
    pub fn expect_address(mut self, address: Address) -> Self {
        self.expected = Some(address);
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == HandshakeState::Established
    }

    pub fn remote_public_key(&self) -> Option<&PublicKey> {
        self.remote.as_ref()
    }

    /// Remote address, known once the remote key was received (trusted only when established).
    pub fn remote_address(&self) -> Option<Address> {
        self.remote.as_ref().map(|k| k.address())
    }

    /// First frames to send. Only the initiator speaks first.
    pub fn start(&self) -> Vec<HandshakeOutput> {
        match self.role {
            Role::Initiator => vec![(
                RelayFrameType::Init1,
                self.keypair.public_key().as_der().to_vec(),
            )],
            Role::Responder => Vec::new(),
        }
    }

    /// Process one handshake frame.
    pub fn on_frame(
        &mut self,
        frame_type: RelayFrameType,
        payload: &[u8],
    ) -> Result<Vec<HandshakeOutput>, HandshakeError> {
        if self.state != HandshakeState::Pending {
            return Err(HandshakeError::NotPending);
        }
        let result = match (self.role, frame_type) {
            (Role::Responder, RelayFrameType::Init1) => self.on_init1(payload),
            (Role::Initiator, RelayFrameType::Init2) => self.on_init2(payload),
            (Role::Initiator, RelayFrameType::Init3) => self.on_init3(payload),
            (Role::Responder, RelayFrameType::Init4) => self.on_init4(payload),
            (Role::Responder, RelayFrameType::Init5) => self.on_init5(payload),
            (Role::Initiator, RelayFrameType::Init6) => self.on_init6(payload),
            _ => Err(HandshakeError::Unexpected(frame_type)),
        };
        if let Err(e) = &result {
            debug!(role = ?self.role, ?frame_type, error = %e, "handshake aborted");
            self.state = HandshakeState::Failed;
        }
        result
    }

    fn remote(&self) -> Result<&PublicKey, HandshakeError> {
        self.remote.as_ref().ok_or(HandshakeError::Unexpected(RelayFrameType::Init3))
    }

    fn accept_remote_key(&mut self, der: &[u8]) -> Result<(), HandshakeError> {
        if self.remote.is_some() {
            return Err(HandshakeError::Duplicate);
        }
        let key = PublicKey::from_der(der).map_err(|_| HandshakeError::BadKey)?;
        if let Some(expected) = self.expected {
            if key.address() != expected {
                return Err(HandshakeError::AddressMismatch);
            }
        }
        self.remote = Some(key);
        Ok(())
    }

    fn on_init1(&mut self, payload: &[u8]) -> Result<Vec<HandshakeOutput>, HandshakeError> {
        self.accept_remote_key(payload)?;
        let secret2 = generate_secret();
        let challenge = self.remote()?.encrypt(&secret2)?;
        self.issued = Some(secret2);
        Ok(vec![
            (
                RelayFrameType::Init2,
                self.keypair.public_key().as_der().to_vec(),
            ),
            (RelayFrameType::Init3, challenge),
        ])
    }

    fn on_init2(&mut self, payload: &[u8]) -> Result<Vec<HandshakeOutput>, HandshakeError> {
        self.accept_remote_key(payload)?;
        Ok(Vec::new())
    }

    fn on_init3(&mut self, payload: &[u8]) -> Result<Vec<HandshakeOutput>, HandshakeError> {
        let secret2 = self.keypair.decrypt(payload)?;
        let remote = self.remote()?;
        let proof = remote.encrypt(&secret2)?;
        let secret1 = generate_secret();
        let challenge = remote.encrypt(&secret1)?;
        self.issued = Some(secret1);
        Ok(vec![
            (RelayFrameType::Init4, proof),
            (RelayFrameType::Init5, challenge),
        ])
    }

    fn on_init4(&mut self, payload: &[u8]) -> Result<Vec<HandshakeOutput>, HandshakeError> {
        self.verify_proof(payload)?;
        self.proof_received = true;
        Ok(Vec::new())
    }

    fn on_init5(&mut self, payload: &[u8]) -> Result<Vec<HandshakeOutput>, HandshakeError> {
        if !self.proof_received {
            return Err(HandshakeError::Unexpected(RelayFrameType::Init5));
        }
        let secret1 = self.keypair.decrypt(payload)?;
        let proof = self.remote()?.encrypt(&secret1)?;
        self.state = HandshakeState::Established;
        Ok(vec![(RelayFrameType::Init6, proof)])
    }

    fn on_init6(&mut self, payload: &[u8]) -> Result<Vec<HandshakeOutput>, HandshakeError> {
        self.verify_proof(payload)?;
        self.state = HandshakeState::Established;
        Ok(Vec::new())
    }

    fn verify_proof(&self, payload: &[u8]) -> Result<(), HandshakeError> {
        let issued = self
            .issued
            .ok_or(HandshakeError::Unexpected(RelayFrameType::Init4))?;
        let returned = self.keypair.decrypt(payload)?;
        if returned[..] != issued[..] {
            return Err(HandshakeError::SecretMismatch);
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("handshake already finished or aborted")]
    NotPending,
    #[error("unexpected {0:?} at this point")]
    Unexpected(RelayFrameType),
    #[error("remote key sent twice")]
    Duplicate,
    #[error("invalid remote public key")]
    BadKey,
    #[error("remote key does not match the expected address")]
    AddressMismatch,
    #[error("returned secret does not match")]
    SecretMismatch,
    #[error(transparent)]
    Crypto(#[from] crate::identity::CryptoError),
}
