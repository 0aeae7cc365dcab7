//! Call payload layouts shared by callers and callees.
//!
//! * unencrypted (session 0): `[fnLen:1][fn][params]`
//! * in a session, before sealing: `[counter:8][fnLen:1][fn][params]`
//! * `/xchg-auth` request: `[len(pubDER):4][pubDER][RSA(nonce ∥ authData)]`
//! * `/xchg-auth` response: `RSA(sessionId:8 ∥ aesKey:32)`

use crate::identity::{CryptoError, Keypair, PublicKey, SessionKey, SESSION_KEY_LEN};
use crate::nonce::NONCE_LEN;

pub fn encode_plain_call(function: &str, params: &[u8]) -> Result<Vec<u8>, CallError> {
    let mut out = Vec::with_capacity(1 + function.len() + params.len());
    push_function(&mut out, function)?;
    out.extend_from_slice(params);
    Ok(out)
}

pub fn decode_plain_call(bytes: &[u8]) -> Result<(String, &[u8]), CallError> {
    split_function(bytes)
}

pub fn encode_session_call(
    counter: u64,
    function: &str,
    params: &[u8],
) -> Result<Vec<u8>, CallError> {
    let mut out = Vec::with_capacity(9 + function.len() + params.len());
    out.extend_from_slice(&counter.to_le_bytes());
    push_function(&mut out, function)?;
    out.extend_from_slice(params);
    Ok(out)
}

pub fn decode_session_call(bytes: &[u8]) -> Result<(u64, String, &[u8]), CallError> {
    if bytes.len() < 8 {
        return Err(CallError::Truncated);
    }
    let mut counter = [0u8; 8];
    counter.copy_from_slice(&bytes[..8]);
    let (function, params) = split_function(&bytes[8..])?;
    Ok((u64::from_le_bytes(counter), function, params))
}

fn push_function(out: &mut Vec<u8>, function: &str) -> Result<(), CallError> {
    let len = u8::try_from(function.len()).map_err(|_| CallError::FunctionName)?;
    out.push(len);
    out.extend_from_slice(function.as_bytes());
    Ok(())
}

fn split_function(bytes: &[u8]) -> Result<(String, &[u8]), CallError> {
    let (&len, rest) = bytes.split_first().ok_or(CallError::Truncated)?;
    let len = len as usize;
    if rest.len() < len {
        return Err(CallError::Truncated);
    }
    let function = std::str::from_utf8(&rest[..len]).map_err(|_| CallError::FunctionName)?;
    Ok((function.to_string(), &rest[len..]))
}

/// Decrypted `/xchg-auth` request.
pub struct AuthRequest {
    pub caller: PublicKey,
    pub nonce: [u8; NONCE_LEN],
    pub auth_data: Vec<u8>,
}

pub fn encode_auth_request(
    caller: &PublicKey,
    callee: &PublicKey,
    nonce: &[u8; NONCE_LEN],
    auth_data: &[u8],
) -> Result<Vec<u8>, CallError> {
    let mut secret = Vec::with_capacity(NONCE_LEN + auth_data.len());
    secret.extend_from_slice(nonce);
    secret.extend_from_slice(auth_data);
    let encrypted = callee.encrypt(&secret)?;
    let der = caller.as_der();
    let mut out = Vec::with_capacity(4 + der.len() + encrypted.len());
    out.extend_from_slice(&(der.len() as u32).to_le_bytes());
    out.extend_from_slice(der);
    out.extend_from_slice(&encrypted);
    Ok(out)
}

pub fn decode_auth_request(bytes: &[u8], callee: &Keypair) -> Result<AuthRequest, CallError> {
    if bytes.len() < 4 {
        return Err(CallError::Truncated);
    }
    let der_len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let rest = &bytes[4..];
    if rest.len() < der_len {
        return Err(CallError::Truncated);
    }
    let caller = PublicKey::from_der(&rest[..der_len])?;
    let secret = callee.decrypt(&rest[der_len..])?;
    if secret.len() < NONCE_LEN {
        return Err(CallError::Truncated);
    }
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&secret[..NONCE_LEN]);
    Ok(AuthRequest {
        caller,
        nonce,
        auth_data: secret[NONCE_LEN..].to_vec(),
    })
}

pub fn encode_auth_response(
    session_id: u64,
    key: &SessionKey,
    caller: &PublicKey,
) -> Result<Vec<u8>, CallError> {
    let mut plain = Vec::with_capacity(8 + SESSION_KEY_LEN);
    plain.extend_from_slice(&session_id.to_le_bytes());
    plain.extend_from_slice(key);
    Ok(caller.encrypt(&plain)?)
}

pub fn decode_auth_response(bytes: &[u8], caller: &Keypair) -> Result<(u64, SessionKey), CallError> {
    let plain = caller.decrypt(bytes)?;
    if plain.len() != 8 + SESSION_KEY_LEN {
        return Err(CallError::Truncated);
    }
    let mut id = [0u8; 8];
    id.copy_from_slice(&plain[..8]);
    let mut key = [0u8; SESSION_KEY_LEN];
    key.copy_from_slice(&plain[8..]);
    Ok((u64::from_le_bytes(id), key))
}

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("call payload truncated")]
    Truncated,
    #[error("function name must be UTF-8 and at most 255 bytes")]
    FunctionName,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::generate_session_key;
    use crate::identity::tests::test_keypair;

    #[test]
    fn session_call_layout() {
        let bytes = encode_session_call(7, "version", b"args").unwrap();
        assert_eq!(&bytes[..8], &7u64.to_le_bytes());
        assert_eq!(bytes[8], 7);
        assert_eq!(&bytes[9..16], b"version");
        let (counter, function, params) = decode_session_call(&bytes).unwrap();
        assert_eq!(counter, 7);
        assert_eq!(function, "version");
        assert_eq!(params, b"args");
    }

    #[test]
    fn plain_call_rejects_truncation() {
        let bytes = encode_plain_call("/xchg-get-nonce", b"").unwrap();
        assert_eq!(decode_plain_call(&bytes).unwrap().0, "/xchg-get-nonce");
        assert!(matches!(
            decode_plain_call(&bytes[..5]),
            Err(CallError::Truncated)
        ));
        assert!(matches!(decode_plain_call(&[]), Err(CallError::Truncated)));
        assert!(matches!(
            encode_plain_call(&"x".repeat(256), b""),
            Err(CallError::FunctionName)
        ));
    }

    #[test]
    fn auth_request_and_response() {
        let caller = test_keypair();
        let callee = test_keypair();
        let nonce = [3u8; NONCE_LEN];
        let req =
            encode_auth_request(caller.public_key(), callee.public_key(), &nonce, b"pass").unwrap();
        let decoded = decode_auth_request(&req, &callee).unwrap();
        assert_eq!(decoded.nonce, nonce);
        assert_eq!(decoded.auth_data, b"pass");
        assert_eq!(decoded.caller.address(), caller.address());
        assert!(decode_auth_request(&req, &caller).is_err());

        let key = generate_session_key();
        let resp = encode_auth_response(0xDEAD, &key, &decoded.caller).unwrap();
        let (id, got) = decode_auth_response(&resp, &caller).unwrap();
        assert_eq!(id, 0xDEAD);
        assert_eq!(got, key);
    }
}
