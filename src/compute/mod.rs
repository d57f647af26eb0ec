//! Compute node agent.
//!
//! A node answers calls for proposals with its projected completion time,
//! polls the tasks it knows about until every one of them is assigned, and
//! then runs rebalancing rounds with its peers (see [`crate::balancing`]).

pub mod node;
pub mod timer;

pub use node::{ComputeNode, NodePhase, NodeReport};
