use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::allocation::bids::BidBook;
use crate::bus::{
    Directory, EntityId, Frame, Mailbox, Message, MessageBus, NodeId, ServiceTag, TaskId,
};
use crate::config::{TaskSpec, Timing};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    /// Looking for nodes to ask (also the state right after an eviction)
    Discovering,
    /// Call for proposals sent, waiting for every node to answer
    Bidding,
    Assigned,
}

impl std::fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskPhase::Discovering => write!(f, "discovering"),
            TaskPhase::Bidding => write!(f, "bidding"),
            TaskPhase::Assigned => write!(f, "assigned"),
        }
    }
}

/// Read-only view of a task, published after every event it handles.
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub id: TaskId,
    pub complexity: u32,
    pub phase: TaskPhase,
    pub assigned_node: Option<NodeId>,
    pub bid_round: u64,
    pub evictions: u32,
}

/// Bidding side of the contract net: one unit of work looking for a node.
pub struct TaskAgent {
    id: TaskId,
    complexity: u32,
    phase: TaskPhase,
    assigned_node: Option<NodeId>,
    bids: BidBook,
    round: u64,
    bidding_since: Option<Instant>,
    evictions: u32,
    retry_interval: Duration,
    bid_timeout: Duration,
    bus: Arc<MessageBus>,
    directory: Arc<Directory>,
    report_tx: watch::Sender<TaskReport>,
}

impl TaskAgent {
    pub fn new(
        spec: &TaskSpec,
        timing: &Timing,
        bus: Arc<MessageBus>,
        directory: Arc<Directory>,
    ) -> (Self, watch::Receiver<TaskReport>) {
        let id = spec.id();
        let (report_tx, report_rx) = watch::channel(TaskReport {
            id: id.clone(),
            complexity: spec.complexity,
            phase: TaskPhase::Discovering,
            assigned_node: None,
            bid_round: 0,
            evictions: 0,
        });

        let agent = Self {
            id,
            complexity: spec.complexity,
            phase: TaskPhase::Discovering,
            assigned_node: None,
            bids: BidBook::default(),
            round: 0,
            bidding_since: None,
            evictions: 0,
            retry_interval: timing.task_retry(),
            bid_timeout: timing.bid_timeout(),
            bus,
            directory,
            report_tx,
        };

        (agent, report_rx)
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    fn address(&self) -> EntityId {
        EntityId::Task(self.id.clone())
    }

    /// Register on the bus and in the directory.
    pub fn attach(&self) -> Result<Mailbox> {
        let mailbox = self.bus.register(self.address())?;
        self.directory.register(self.address(), ServiceTag::Tasks);
        Ok(mailbox)
    }

    fn detach(&self) {
        self.directory.deregister(&self.address());
        self.bus.deregister(&self.address());
    }

    /// Run the task until shutdown. Returns the final report.
    pub async fn run(mut self, mut mailbox: Mailbox, shutdown: CancellationToken) -> TaskReport {
        tracing::debug!(task = %self.id, complexity = self.complexity, "Task ready");
        self.start_bidding();
        self.publish();

        let mut retry = tokio::time::interval_at(
            Instant::now() + self.retry_interval,
            self.retry_interval,
        );
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                frame = mailbox.recv() => match frame {
                    Some(frame) => self.handle(frame),
                    None => break,
                },
                _ = retry.tick() => self.on_retry_tick(),
            }
            self.publish();
        }

        self.detach();
        tracing::debug!(task = %self.id, phase = %self.phase, "Task stopped");
        self.report()
    }

    fn handle(&mut self, frame: Frame) {
        let message = match Message::from_frame(&frame) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(task = %self.id, error = %e, "Dropping malformed message");
                return;
            }
        };

        match (frame.sender, message) {
            (
                EntityId::Node(node),
                Message::Propose {
                    round,
                    completion_time,
                },
            ) => self.on_proposal(node, round, completion_time),
            (EntityId::Node(node), Message::Evict) => self.on_evict(node),
            (sender, Message::StatusQuery) => self.on_status_query(&sender),
            (sender, other) => {
                tracing::debug!(task = %self.id, %sender, kind = other.kind(), "Ignoring unexpected message");
            }
        }
    }

    /// Discover the nodes and send them a call for proposals.
    fn start_bidding(&mut self) {
        self.phase = TaskPhase::Discovering;
        self.assigned_node = None;
        self.bidding_since = None;

        let nodes = match self.directory.search_nodes() {
            Ok(nodes) => nodes,
            Err(e) => {
                tracing::warn!(task = %self.id, error = %e, "Node discovery failed, will retry");
                return;
            }
        };
        if nodes.is_empty() {
            tracing::debug!(task = %self.id, "No nodes registered yet, will retry");
            return;
        }

        self.round += 1;
        self.bids = BidBook::open(self.round, nodes.iter().copied());
        let recipients: Vec<EntityId> = nodes.into_iter().map(EntityId::Node).collect();
        let reached = self.bus.multicast(
            &self.address(),
            &recipients,
            Message::CallForProposal {
                round: self.round,
                complexity: self.complexity,
            },
        );

        self.phase = TaskPhase::Bidding;
        self.bidding_since = Some(Instant::now());
        tracing::debug!(
            task = %self.id,
            round = self.round,
            nodes = recipients.len(),
            reached,
            "Call for proposals sent"
        );
    }

    fn on_proposal(&mut self, node: NodeId, round: u64, completion_time: f64) {
        if self.phase != TaskPhase::Bidding {
            tracing::trace!(task = %self.id, node, round, "Proposal outside bidding ignored");
            return;
        }
        if !self.bids.record(node, round, completion_time) {
            tracing::trace!(task = %self.id, node, round, current = self.bids.round(), "Stale proposal ignored");
            return;
        }
        if self.bids.is_complete() {
            self.close_bidding();
        }
    }

    /// Accept the best proposal and reject the rest.
    fn close_bidding(&mut self) {
        let Some((winner, completion_time)) = self.bids.winner() else {
            return;
        };
        let round = self.bids.round();
        let from = self.address();

        let losers: Vec<EntityId> = self
            .bids
            .nodes()
            .filter(|&node| node != winner)
            .map(EntityId::Node)
            .collect();

        if let Err(e) = self.bus.send(
            &from,
            &EntityId::Node(winner),
            Message::AcceptProposal {
                round,
                complexity: self.complexity,
            },
        ) {
            tracing::warn!(task = %self.id, node = winner, error = %e, "Winning node vanished, bidding again");
            self.start_bidding();
            return;
        }
        self.bus
            .multicast(&from, &losers, Message::RejectProposal { round });

        self.assigned_node = Some(winner);
        self.phase = TaskPhase::Assigned;
        self.bidding_since = None;
        tracing::info!(
            task = %self.id,
            node = winner,
            completion_time,
            round,
            "Task assigned"
        );
    }

    fn on_evict(&mut self, node: NodeId) {
        if self.phase != TaskPhase::Assigned || self.assigned_node != Some(node) {
            tracing::warn!(
                task = %self.id,
                node,
                assigned = ?self.assigned_node,
                "Eviction from a node that does not hold this task ignored"
            );
            return;
        }

        self.evictions += 1;
        tracing::info!(task = %self.id, node, evictions = self.evictions, "Task evicted, bidding again");
        self.start_bidding();
    }

    fn on_status_query(&self, sender: &EntityId) {
        let reply = Message::StatusReply {
            assigned: self.assigned_node.is_some(),
        };
        if let Err(e) = self.bus.send(&self.address(), sender, reply) {
            tracing::debug!(task = %self.id, error = %e, "Status reply not delivered");
        }
    }

    fn on_retry_tick(&mut self) {
        match self.phase {
            TaskPhase::Discovering => self.start_bidding(),
            TaskPhase::Bidding => {
                let expired = self
                    .bidding_since
                    .is_some_and(|since| since.elapsed() >= self.bid_timeout);
                if expired {
                    tracing::warn!(
                        task = %self.id,
                        round = self.round,
                        outstanding = self.bids.outstanding(),
                        "Bid collection timed out, bidding again"
                    );
                    self.start_bidding();
                }
            }
            TaskPhase::Assigned => {}
        }
    }

    pub fn report(&self) -> TaskReport {
        TaskReport {
            id: self.id.clone(),
            complexity: self.complexity,
            phase: self.phase,
            assigned_node: self.assigned_node,
            bid_round: self.round,
            evictions: self.evictions,
        }
    }

    fn publish(&self) {
        self.report_tx.send_replace(self.report());
    }
}
