//! Pure rebalancing logic used by compute nodes.
//!
//! Nothing in here talks to the bus; [`crate::compute`] drives these pieces
//! from its event loop.
//!
//! - [`state`]: a node's workload ledger, its pairing lock and round counters
//! - [`pairing`]: fleet statistics and the lightest-with-heaviest pairing
//! - [`selection`]: greedy choice of the one task to migrate in a round

pub mod pairing;
pub mod selection;
pub mod state;

pub use pairing::{pairing_role, pairs, rank_by_load, FleetStats, PairingRole};
pub use selection::{select_transfer, Transfer};
pub use state::{
    AssignedTask, BalancingLock, LoadSnapshot, RoundState, Workload, STAGNATION_ROUNDS,
};
