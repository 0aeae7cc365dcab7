//! Node identity and crypto: RSA keypairs, public keys, session keys, sealed boxes.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use rsa::{Oaep, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

use crate::address::Address;

/// RSA modulus size for generated node keys.
pub const DEFAULT_KEY_BITS: usize = 2048;

/// AES-256 session key length.
pub const SESSION_KEY_LEN: usize = 32;

/// Length of the random handshake secrets.
pub const SECRET_LEN: usize = 32;

const GCM_NONCE_LEN: usize = 12;

pub type SessionKey = [u8; SESSION_KEY_LEN];

/// RSA public key together with its PKCS#1 DER encoding (the form that goes on the wire and is hashed into the address).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    key: RsaPublicKey,
    der: Vec<u8>,
}

impl PublicKey {
    pub fn from_der(der: &[u8]) -> Result<Self, CryptoError> {
        let key = RsaPublicKey::from_pkcs1_der(der).map_err(|_| CryptoError::Key)?;
        Ok(Self {
            key,
            der: der.to_vec(),
        })
    }

    fn from_rsa(key: RsaPublicKey) -> Result<Self, CryptoError> {
        let der = key
            .to_pkcs1_der()
            .map_err(|_| CryptoError::Key)?
            .as_bytes()
            .to_vec();
        Ok(Self { key, der })
    }

    pub fn as_der(&self) -> &[u8] {
        &self.der
    }

    pub fn address(&self) -> Address {
        Address::from_public_key_der(&self.der)
    }

    /// RSA-OAEP (SHA-256) encryption to the owner of this key.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.key
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), plaintext)
            .map_err(|_| CryptoError::Encrypt)
    }

    /// Verify a PKCS#1 v1.5 SHA-256 signature over `message`.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let hashed = Sha256::digest(message);
        self.key
            .verify(Pkcs1v15Sign::new::<Sha256>(), &hashed, signature)
            .is_ok()
    }
}

/// RSA keypair. Keep the private key private; expose only the public key and address.
pub struct Keypair {
    private: RsaPrivateKey,
    public: PublicKey,
    address: Address,
}

impl Keypair {
    /// Generate a new random keypair with [`DEFAULT_KEY_BITS`].
    pub fn generate() -> Result<Self, CryptoError> {
        Self::generate_with_bits(DEFAULT_KEY_BITS)
    }

    pub fn generate_with_bits(bits: usize) -> Result<Self, CryptoError> {
        let private = RsaPrivateKey::new(&mut OsRng, bits).map_err(|_| CryptoError::Key)?;
        Self::from_private(private)
    }

    fn from_private(private: RsaPrivateKey) -> Result<Self, CryptoError> {
        let public = PublicKey::from_rsa(RsaPublicKey::from(&private))?;
        let address = public.address();
        Ok(Self {
            private,
            public,
            address,
        })
    }

    pub fn from_pkcs8_pem(pem: &str) -> Result<Self, CryptoError> {
        let private = RsaPrivateKey::from_pkcs8_pem(pem).map_err(|_| CryptoError::Key)?;
        Self::from_private(private)
    }

    pub fn to_pkcs8_pem(&self) -> Result<String, CryptoError> {
        self.private
            .to_pkcs8_pem(LineEnding::LF)
            .map(|pem| pem.as_str().to_owned())
            .map_err(|_| CryptoError::Key)
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// RSA-OAEP (SHA-256) decryption of data encrypted to our public key.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.private
            .decrypt(Oaep::new::<Sha256>(), ciphertext)
            .map_err(|_| CryptoError::Decrypt)
    }

    /// PKCS#1 v1.5 SHA-256 signature over `message`.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let hashed = Sha256::digest(message);
        self.private
            .sign(Pkcs1v15Sign::new::<Sha256>(), &hashed)
            .map_err(|_| CryptoError::Sign)
    }
}

/// Fresh random AES-256 key for a new session.
pub fn generate_session_key() -> SessionKey {
    let mut key = [0u8; SESSION_KEY_LEN];
    OsRng.fill_bytes(&mut key);
    key
}

/// Fresh random handshake secret.
pub fn generate_secret() -> [u8; SECRET_LEN] {
    let mut secret = [0u8; SECRET_LEN];
    OsRng.fill_bytes(&mut secret);
    secret
}

/// AES-256-GCM with a random 96-bit nonce prepended to the ciphertext.
pub fn seal(key: &SessionKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::Key)?;
    let mut nonce_bytes = [0u8; GCM_NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|_| CryptoError::Encrypt)?;
    let mut out = Vec::with_capacity(GCM_NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Inverse of [`seal`].
pub fn open(key: &SessionKey, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < GCM_NONCE_LEN {
        return Err(CryptoError::Decrypt);
    }
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::Key)?;
    let (nonce_bytes, ciphertext) = sealed.split_at(GCM_NONCE_LEN);
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| CryptoError::Decrypt)
}

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid key")]
    Key,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
    #[error("signing failed")]
    Sign,
}
