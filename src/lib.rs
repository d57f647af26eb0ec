pub mod allocation;
pub mod balancing;
pub mod bus;
pub mod compute;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod fleet;
pub mod results;
pub mod shutdown;

pub use error::{FleetError, Result};
pub use fleet::{Fleet, FleetOutcome, FleetSummary, FleetView};
