use std::sync::Mutex;

use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;

use crate::bus::address::EntityId;
use crate::bus::protocol::{Frame, Message};
use crate::config::BusConfig;
use crate::error::{FleetError, Result};

/// Inbound queue of one entity.
///
/// A single channel per receiver is what gives the bus its per-sender FIFO
/// guarantee; frames from different senders interleave in arrival order.
#[derive(Debug)]
pub struct Mailbox {
    rx: mpsc::UnboundedReceiver<Frame>,
}

impl Mailbox {
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /// Non-blocking receive, used by tests that drive a single agent by hand.
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }
}

/// In-process, asynchronous point-to-point and multicast delivery.
#[derive(Debug)]
pub struct MessageBus {
    routes: DashMap<EntityId, mpsc::UnboundedSender<Frame>>,
    duplicate_ratio: f64,
    rng: Mutex<StdRng>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(&BusConfig::default())
    }
}

impl MessageBus {
    pub fn new(config: &BusConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            routes: DashMap::new(),
            duplicate_ratio: config.duplicate_ratio,
            rng: Mutex::new(rng),
        }
    }

    /// Register an entity and hand back the receiving end of its mailbox.
    pub fn register(&self, id: EntityId) -> Result<Mailbox> {
        let (tx, rx) = mpsc::unbounded_channel();
        match self.routes.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(FleetError::DuplicateEntity(id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(tx);
                tracing::trace!(entity = %id, "Mailbox registered");
                Ok(Mailbox { rx })
            }
        }
    }

    pub fn deregister(&self, id: &EntityId) {
        if self.routes.remove(id).is_some() {
            tracing::trace!(entity = %id, "Mailbox deregistered");
        }
    }

    /// Deliver one message. Fails only if the recipient is not (or no longer) registered.
    pub fn send(&self, from: &EntityId, to: &EntityId, message: Message) -> Result<()> {
        let frame = message.into_frame(from.clone());
        self.deliver(to, frame)
    }

    /// Deliver the same message to every recipient; returns how many were reached.
    pub fn multicast(&self, from: &EntityId, to: &[EntityId], message: Message) -> usize {
        let frame = message.into_frame(from.clone());
        to.iter()
            .filter(|recipient| match self.deliver(recipient, frame.clone()) {
                Ok(()) => true,
                Err(e) => {
                    tracing::debug!(sender = %from, error = %e, "Multicast leg dropped");
                    false
                }
            })
            .count()
    }

    fn deliver(&self, to: &EntityId, frame: Frame) -> Result<()> {
        let route = self
            .routes
            .get(to)
            .ok_or_else(|| FleetError::UnknownRecipient(to.clone()))?;

        if self.should_duplicate() {
            tracing::trace!(recipient = %to, sender = %frame.sender, "Injecting duplicate frame");
            let _ = route.send(frame.clone());
        }

        route
            .send(frame)
            .map_err(|_| FleetError::UnknownRecipient(to.clone()))
    }

    fn should_duplicate(&self) -> bool {
        if self.duplicate_ratio <= 0.0 {
            return false;
        }
        match self.rng.lock() {
            Ok(mut rng) => rng.gen_bool(self.duplicate_ratio.min(1.0)),
            Err(_) => false,
        }
    }
}
