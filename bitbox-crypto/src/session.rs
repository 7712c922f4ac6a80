//! AES-128-ECB message encryption for the control channel.
//!
//! The scheme is fixed by the legacy protocol and must stay byte-compatible
//! with it: the plaintext is the JSON document, a newline, then random
//! printable ASCII (excluding `"` and `\`) up to the next 16-byte boundary.
//! ECB mode carries no integrity or semantic security; interoperability with
//! existing clients takes precedence here.

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};

use crate::errors::{CryptoError, Result};

pub const AES_KEY_BYTES: usize = 16;
const BLOCK: usize = 16;

/// A per-session AES-128 key.
#[derive(Clone)]
pub struct SessionKey([u8; AES_KEY_BYTES]);

impl SessionKey {
    /// Generate a fresh key from the system CSPRNG.
    pub fn generate() -> Self {
        let mut key = [0u8; AES_KEY_BYTES];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != AES_KEY_BYTES {
            return Err(CryptoError::InvalidKey(format!(
                "expected {} key bytes, got {}",
                AES_KEY_BYTES,
                bytes.len()
            )));
        }
        let mut key = [0u8; AES_KEY_BYTES];
        key.copy_from_slice(bytes);
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; AES_KEY_BYTES] {
        &self.0
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of logs.
        f.write_str("SessionKey(..)")
    }
}

/// Encrypt one JSON line; returns the base64 payload value.
pub fn encrypt_message(key: &SessionKey, json: &str) -> String {
    let mut plain = json.as_bytes().to_vec();
    plain.push(b'\n');
    while plain.len() % BLOCK != 0 {
        // Printable range 32-126, minus the two characters that would break
        // a JSON string if the padding is ever echoed back.
        let next: u8 = OsRng.gen_range(32..=126);
        if next != b'"' && next != b'\\' {
            plain.push(next);
        }
    }

    let cipher = Aes128::new(GenericArray::from_slice(&key.0));
    for chunk in plain.chunks_mut(BLOCK) {
        cipher.encrypt_block(GenericArray::from_mut_slice(chunk));
    }
    BASE64.encode(plain)
}

/// Decrypt a base64 payload and recover the JSON line before the padding.
pub fn decrypt_message(key: &SessionKey, payload: &str) -> Result<String> {
    let mut data = BASE64
        .decode(payload)
        .map_err(|e| CryptoError::BadPayload(format!("invalid base64: {}", e)))?;
    if data.is_empty() || data.len() % BLOCK != 0 {
        return Err(CryptoError::BadPayload(format!(
            "ciphertext length {} is not a positive multiple of {}",
            data.len(),
            BLOCK
        )));
    }

    let cipher = Aes128::new(GenericArray::from_slice(&key.0));
    for chunk in data.chunks_mut(BLOCK) {
        cipher.decrypt_block(GenericArray::from_mut_slice(chunk));
    }

    // Padding comes after the first newline.
    let line = match data.iter().position(|&b| b == b'\n') {
        Some(end) => &data[..end],
        None => {
            return Err(CryptoError::BadPayload(
                "plaintext contains no newline".to_string(),
            ))
        }
    };
    String::from_utf8(line.to_vec())
        .map_err(|_| CryptoError::BadPayload("plaintext is not UTF-8".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_various_lengths() {
        let key = SessionKey::generate();
        for json in [
            r#"{"command":"LIST_PEERS_REQUEST"}"#,
            r#"{"a":1}"#,
            // 15 bytes + newline: exactly one block, no padding.
            r#"{"abcdefghij":1}"#,
            "",
        ] {
            let payload = encrypt_message(&key, json);
            assert_eq!(decrypt_message(&key, &payload).unwrap(), json);
        }
    }

    #[test]
    fn ciphertext_is_block_aligned() {
        let key = SessionKey::generate();
        let payload = encrypt_message(&key, r#"{"command":"LIST_PEERS_REQUEST"}"#);
        let raw = BASE64.decode(payload).unwrap();
        assert_eq!(raw.len() % BLOCK, 0);
    }

    #[test]
    fn padding_is_printable_and_json_safe() {
        let key = SessionKey::generate();
        let json = r#"{"x":1}"#;
        let payload = encrypt_message(&key, json);

        let mut data = BASE64.decode(payload).unwrap();
        let cipher = Aes128::new(GenericArray::from_slice(key.as_bytes()));
        for chunk in data.chunks_mut(BLOCK) {
            cipher.decrypt_block(GenericArray::from_mut_slice(chunk));
        }
        let newline = data.iter().position(|&b| b == b'\n').unwrap();
        for &b in &data[newline + 1..] {
            assert!((32..=126).contains(&b));
            assert!(b != b'"' && b != b'\\');
        }
    }

    #[test]
    fn wrong_key_fails_or_garbles() {
        let key = SessionKey::generate();
        let other = SessionKey::generate();
        let json = r#"{"command":"LIST_PEERS_REQUEST"}"#;
        let payload = encrypt_message(&key, json);
        match decrypt_message(&other, &payload) {
            Ok(garbled) => assert_ne!(garbled, json),
            Err(_) => {}
        }
    }

    #[test]
    fn rejects_unaligned_ciphertext() {
        let key = SessionKey::generate();
        let err = decrypt_message(&key, &BASE64.encode(b"short")).unwrap_err();
        assert!(matches!(err, CryptoError::BadPayload(_)));
    }

    #[test]
    fn key_from_bytes_checks_length() {
        assert!(SessionKey::from_bytes(&[0u8; 16]).is_ok());
        assert!(SessionKey::from_bytes(&[0u8; 15]).is_err());
        assert!(SessionKey::from_bytes(&[0u8; 32]).is_err());
    }
}
