//! Message plumbing between tasks and nodes.
//!
//! - [`MessageBus`]: asynchronous point-to-point and multicast delivery,
//!   per-sender FIFO, at-least-once (optionally with injected duplicates)
//! - [`Directory`]: service registry used for discovery
//! - [`protocol`]: the frame format and its typed [`Message`] view

pub mod address;
pub mod directory;
pub mod protocol;
pub mod transport;

pub use address::{EntityId, NodeId, TaskId};
pub use directory::{Directory, ServiceTag};
pub use protocol::{Frame, Message, Performative, Topic};
pub use transport::{Mailbox, MessageBus};
