//! Background delivery of queued outbound messages.
//!
//! One drain per peer at a time, guarded by the peer's keyed lock. Peers
//! are drained concurrently; within a peer, messages go strictly in FIFO
//! order and a message backing off blocks the ones behind it.

mod engine;

pub use engine::{DeliveryEngine, DrainReport};
