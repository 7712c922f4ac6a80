//! The BitBox sync engine.
//!
//! Sits between the change detector and the peer layer: local events become
//! requests to every active peer, inbound requests are applied to the
//! file-tree model, and accepted transfers are driven block by block until
//! the content digest verifies. Failures never escape as crate errors; every
//! fallible path answers the requesting peer with a `status:false` response
//! carrying the reason.

pub mod engine;

pub use engine::{event_message, SyncEngine};
