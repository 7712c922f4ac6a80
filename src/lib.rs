//! BitBox workspace root.
//!
//! This crate re-exports the member crates and hosts the integration tests
//! that exercise interactions between them: two-node convergence, the
//! incoming-connection bound with refused-peer fallback, and the
//! authenticated control channel.

pub use bitbox_crypto as crypto;
pub use bitbox_daemon as daemon;
pub use bitbox_fs as fs;
pub use bitbox_net as net;
pub use bitbox_proto as proto;
pub use bitbox_sync as sync;
