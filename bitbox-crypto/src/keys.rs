//! Authorized-key handling and the RSA session-key wrap.
//!
//! The wrap is `RSA/ECB/NoPadding` over a custom block layout fixed by the
//! legacy protocol: the input block is one byte shorter than the modulus
//! (so the value stays below it, as if led by a zero byte), the AES key
//! occupies the front, and secure-random bytes fill the tail.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, RsaPrivateKey, RsaPublicKey};
use tracing::warn;

use crate::errors::{CryptoError, Result};
use crate::session::{SessionKey, AES_KEY_BYTES};

/// One entry of the `authorized_keys` configuration value.
#[derive(Debug, Clone)]
pub struct AuthorizedKey {
    pub ident: String,
    pub key: RsaPublicKey,
}

/// Parse a comma-separated list of OpenSSH public keys. Invalid entries are
/// logged and skipped; several keys may share an identity, in which case the
/// first match wins at lookup time.
pub fn parse_authorized_keys(value: &str) -> Vec<AuthorizedKey> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| match parse_openssh_rsa(entry) {
            Ok(key) => Some(key),
            Err(error) => {
                warn!(%error, "skipping invalid authorized key entry");
                None
            }
        })
        .collect()
}

fn parse_openssh_rsa(entry: &str) -> Result<AuthorizedKey> {
    let public = ssh_key::PublicKey::from_openssh(entry)
        .map_err(|e| CryptoError::InvalidKey(format!("unparseable OpenSSH key: {}", e)))?;
    let rsa_data = match public.key_data() {
        ssh_key::public::KeyData::Rsa(rsa) => rsa,
        other => {
            return Err(CryptoError::InvalidKey(format!(
                "unsupported key algorithm {:?}",
                other.algorithm()
            )))
        }
    };
    let key = RsaPublicKey::try_from(rsa_data)
        .map_err(|e| CryptoError::InvalidKey(format!("invalid RSA components: {}", e)))?;
    Ok(AuthorizedKey {
        ident: public.comment().to_string(),
        key,
    })
}

/// Wrap a session key under a peer's public key; returns base64 ciphertext
/// of exactly the modulus size.
pub fn wrap_session_key(session: &SessionKey, public: &RsaPublicKey) -> Result<String> {
    let modulus_len = public.size();
    if modulus_len <= AES_KEY_BYTES {
        return Err(CryptoError::Wrap("modulus too small".to_string()));
    }

    // Key first, random tail, one byte short of the modulus.
    let mut block = vec![0u8; modulus_len - 1];
    block[..AES_KEY_BYTES].copy_from_slice(session.as_bytes());
    OsRng.fill_bytes(&mut block[AES_KEY_BYTES..]);

    let m = BigUint::from_bytes_be(&block);
    let c = rsa::hazmat::rsa_encrypt(public, &m).map_err(|e| CryptoError::Wrap(e.to_string()))?;

    let raw = c.to_bytes_be();
    let mut ciphertext = vec![0u8; modulus_len - raw.len()];
    ciphertext.extend_from_slice(&raw);
    Ok(BASE64.encode(ciphertext))
}

/// Recover a session key wrapped by [`wrap_session_key`].
pub fn unwrap_session_key(wrapped: &str, private: &RsaPrivateKey) -> Result<SessionKey> {
    let ciphertext = BASE64
        .decode(wrapped)
        .map_err(|e| CryptoError::Unwrap(format!("invalid base64: {}", e)))?;
    let c = BigUint::from_bytes_be(&ciphertext);
    let m = rsa::hazmat::rsa_decrypt_and_check(private, None::<&mut OsRng>, &c)
        .map_err(|e| CryptoError::Unwrap(e.to_string()))?;

    // Restore the leading zeros BigUint strips; the block is one byte
    // shorter than the modulus.
    let raw = m.to_bytes_be();
    let block_len = private.size() - 1;
    if raw.len() > block_len {
        return Err(CryptoError::Unwrap("plaintext exceeds block".to_string()));
    }
    let mut block = vec![0u8; block_len - raw.len()];
    block.extend_from_slice(&raw);
    SessionKey::from_bytes(&block[..AES_KEY_BYTES])
}

/// Load an RSA private key from a PEM file (PKCS#1 or PKCS#8).
pub fn load_private_key(path: &std::path::Path) -> Result<RsaPrivateKey> {
    let pem = std::fs::read_to_string(path)?;
    RsaPrivateKey::from_pkcs1_pem(&pem)
        .or_else(|_| RsaPrivateKey::from_pkcs8_pem(&pem))
        .map_err(|e| CryptoError::InvalidKey(format!("unreadable private key: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_keypair() -> (RsaPrivateKey, RsaPublicKey) {
        // Small modulus keeps the test fast; the layout logic is size-independent.
        let private = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let public = RsaPublicKey::from(&private);
        (private, public)
    }

    #[test]
    fn wrap_unwrap_round_trip() {
        let (private, public) = test_keypair();
        let session = SessionKey::generate();
        let wrapped = wrap_session_key(&session, &public).unwrap();
        let recovered = unwrap_session_key(&wrapped, &private).unwrap();
        assert_eq!(recovered.as_bytes(), session.as_bytes());
    }

    #[test]
    fn ciphertext_is_modulus_sized() {
        let (_, public) = test_keypair();
        let session = SessionKey::generate();
        let wrapped = wrap_session_key(&session, &public).unwrap();
        let raw = BASE64.decode(wrapped).unwrap();
        assert_eq!(raw.len(), public.size());
    }

    #[test]
    fn wrap_emits_fresh_padding() {
        let (_, public) = test_keypair();
        let session = SessionKey::generate();
        // Same key, two wraps: random tails make the ciphertexts differ.
        let a = wrap_session_key(&session, &public).unwrap();
        let b = wrap_session_key(&session, &public).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn unwrap_rejects_garbage() {
        let (private, _) = test_keypair();
        assert!(unwrap_session_key("not base64 at all!!!", &private).is_err());
    }

    #[test]
    fn authorized_keys_parse_and_skip_invalid() {
        let (_, public) = test_keypair();
        let ssh_rsa = ssh_key::public::RsaPublicKey::try_from(&public).unwrap();
        let entry = ssh_key::PublicKey::new(
            ssh_key::public::KeyData::Rsa(ssh_rsa),
            "aaron@krusty",
        );
        let line = entry.to_openssh().unwrap();

        let value = format!("{}, this is not a key", line);
        let keys = parse_authorized_keys(&value);
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].ident, "aaron@krusty");
    }

    #[test]
    fn parsed_key_interoperates_with_wrap() {
        let (private, public) = test_keypair();
        let ssh_rsa = ssh_key::public::RsaPublicKey::try_from(&public).unwrap();
        let entry =
            ssh_key::PublicKey::new(ssh_key::public::KeyData::Rsa(ssh_rsa), "ident");
        let keys = parse_authorized_keys(&entry.to_openssh().unwrap());

        let session = SessionKey::generate();
        let wrapped = wrap_session_key(&session, &keys[0].key).unwrap();
        let recovered = unwrap_session_key(&wrapped, &private).unwrap();
        assert_eq!(recovered.as_bytes(), session.as_bytes());
    }
}
