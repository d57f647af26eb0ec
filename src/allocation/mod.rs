//! Contract-net task allocation, task side.
//!
//! A [`TaskAgent`] discovers the compute nodes, sends them a call for
//! proposals, and once every node has answered accepts the lowest proposed
//! completion time ([`BidBook::winner`]) and rejects the others. An eviction
//! from its node sends it back to discovery.

pub mod bids;
pub mod task;

pub use bids::BidBook;
pub use task::{TaskAgent, TaskPhase, TaskReport};
