//! Cryptography for the BitBox control channel.
//!
//! The peer channel is plaintext; only the operator control channel is
//! encrypted. Authentication is challenge-free: the daemon wraps a fresh
//! AES-128 session key under the public key registered for the client's
//! identity, and possession of the matching private key is what admits the
//! client. Both the AES mode (ECB with printable padding) and the RSA wrap
//! layout are fixed by the legacy wire format and reproduced exactly.

pub mod errors;
pub mod keys;
pub mod session;

pub use errors::{CryptoError, Result};
pub use keys::{
    load_private_key, parse_authorized_keys, unwrap_session_key, wrap_session_key, AuthorizedKey,
};
pub use session::{decrypt_message, encrypt_message, SessionKey, AES_KEY_BYTES};
