//! Verification daemon internals.
//!
//! Exposed as a library so the protocol layer ([`service`]) can be driven by
//! whatever transport ends up in front of it; the `verifaced` binary only
//! wires configuration, storage and the challenge sweeper.

pub mod audit;
pub mod challenge;
pub mod config;
pub mod rate_limiter;
pub mod service;
pub mod store;
