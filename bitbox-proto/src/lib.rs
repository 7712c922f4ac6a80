//! BitBox wire protocol.
//!
//! Peers exchange newline-terminated JSON objects; every object carries a
//! `command` field naming its message type. This crate defines the message
//! catalogue for the peer channel ([`Message`]) and the operator control
//! channel ([`control`]), plus the line codec with per-type field validation.

pub mod codec;
pub mod control;
pub mod errors;
pub mod message;

pub use codec::{decode, encode};
pub use errors::{ProtoError, Result};
pub use message::{FileDescriptor, HostPort, Message};
