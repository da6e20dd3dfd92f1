//! Delta synchronization between peers.
//!
//! - [`collector`] builds outgoing batches from the local outbox.
//! - [`apply`] runs the conflict policy over incoming batches and stores the
//!   result. The push handler and the client's pull share it.
//! - [`client`] speaks the HTTP protocol to one peer.
//! - [`exchange`] strings those together into one full exchange.

pub mod apply;
pub mod client;
pub mod collector;
pub mod exchange;

pub use apply::{Applier, ApplyReport};
pub use client::{PushOutcome, SyncClient};
pub use collector::ChangeCollector;
pub use exchange::{HttpExchange, Peer, PeerExchange, PeerOutcome, PeerReport};
