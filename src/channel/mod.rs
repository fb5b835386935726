//! Realtime channel modules.
//!
//! - `client`: websocket transport, channel membership, reply correlation,
//!   and reconnect handling.
//! - `proto`: protocol frames shared with the realtime service.
//! - `registry`: typed event keys and the listener callback registry.

/// Websocket channel client and connection lifecycle.
pub mod client;
/// Channel protocol frames.
pub mod proto;
/// Event keys, client events, and the callback registry.
pub mod registry;
