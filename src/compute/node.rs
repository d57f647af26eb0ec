use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::balancing::{
    pairing_role, rank_by_load, select_transfer, AssignedTask, BalancingLock, FleetStats,
    LoadSnapshot, PairingRole, RoundState, Workload,
};
use crate::bus::{
    Directory, EntityId, Frame, Mailbox, Message, MessageBus, NodeId, ServiceTag, TaskId,
};
use crate::compute::timer::discovery_ticker;
use crate::config::{NodeSpec, Timing};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodePhase {
    Idle,
    /// Own snapshot sent, waiting for every known node's snapshot
    SnapshotCollecting,
    /// Pairing request sent, waiting for the partner's answer
    Pairing,
    /// Pair agreed, a task may be in flight
    Exchanging,
    /// Fleet balanced or stagnant; reopened only by newly discovered tasks
    Converged,
}

impl std::fmt::Display for NodePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodePhase::Idle => write!(f, "idle"),
            NodePhase::SnapshotCollecting => write!(f, "snapshot_collecting"),
            NodePhase::Pairing => write!(f, "pairing"),
            NodePhase::Exchanging => write!(f, "exchanging"),
            NodePhase::Converged => write!(f, "converged"),
        }
    }
}

/// Read-only view of a node, published after every event it handles.
#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    pub id: NodeId,
    pub name: String,
    pub capacity: u32,
    pub total_time: f64,
    pub tasks: Vec<AssignedTask>,
    pub phase: NodePhase,
    pub partner: Option<NodeId>,
    pub settled: bool,
    pub unchanged_rounds: u32,
    pub rounds: u32,
    pub migrations_out: u32,
    pub migrations_in: u32,
}

impl NodeReport {
    pub fn is_converged(&self) -> bool {
        self.phase == NodePhase::Converged
    }

    /// Termination summary: totals, then each task's share of the node's work.
    pub fn log_summary(&self) {
        tracing::info!(
            node_id = self.id,
            name = %self.name,
            capacity = self.capacity,
            total_time = self.total_time,
            tasks = self.tasks.len(),
            rounds = self.rounds,
            migrations_out = self.migrations_out,
            migrations_in = self.migrations_in,
            "Node finished"
        );

        let held: u64 = self.tasks.iter().map(|t| u64::from(t.complexity)).sum();
        for task in &self.tasks {
            let share = if held == 0 {
                0.0
            } else {
                100.0 * f64::from(task.complexity) / held as f64
            };
            tracing::info!(
                node_id = self.id,
                task = %task.id,
                complexity = task.complexity,
                share_pct = (share * 10.0).round() / 10.0,
                "Held task"
            );
        }
    }
}

/// Compute node: bids for tasks, then balances its load with its peers.
pub struct ComputeNode {
    id: NodeId,
    name: String,
    workload: Workload,
    /// Every task this node knows about, and whether it is assigned to anyone
    known_tasks: BTreeMap<TaskId, bool>,
    /// Latest snapshot per node; `None` until one arrives
    known_nodes: BTreeMap<NodeId, Option<LoadSnapshot>>,
    /// Highest bid round accepted per task
    accepted_rounds: HashMap<TaskId, u64>,
    lock: BalancingLock,
    initiator: bool,
    rounds: RoundState,
    phase: NodePhase,
    discovered_tasks: usize,
    migrations_out: u32,
    migrations_in: u32,
    delta: f64,
    timing: Timing,
    bus: Arc<MessageBus>,
    directory: Arc<Directory>,
    report_tx: watch::Sender<NodeReport>,
}

impl ComputeNode {
    pub fn new(
        spec: &NodeSpec,
        delta: f64,
        timing: &Timing,
        bus: Arc<MessageBus>,
        directory: Arc<Directory>,
    ) -> (Self, watch::Receiver<NodeReport>) {
        let workload = Workload::new(spec.capacity);
        let name = spec.display_name();
        let (report_tx, report_rx) = watch::channel(NodeReport {
            id: spec.id,
            name: name.clone(),
            capacity: spec.capacity,
            total_time: 0.0,
            tasks: Vec::new(),
            phase: NodePhase::Idle,
            partner: None,
            settled: false,
            unchanged_rounds: 0,
            rounds: 0,
            migrations_out: 0,
            migrations_in: 0,
        });

        let node = Self {
            id: spec.id,
            name,
            workload,
            known_tasks: BTreeMap::new(),
            known_nodes: BTreeMap::new(),
            accepted_rounds: HashMap::new(),
            lock: BalancingLock::default(),
            initiator: false,
            rounds: RoundState::default(),
            phase: NodePhase::Idle,
            discovered_tasks: 0,
            migrations_out: 0,
            migrations_in: 0,
            delta,
            timing: timing.clone(),
            bus,
            directory,
            report_tx,
        };

        (node, report_rx)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    fn address(&self) -> EntityId {
        EntityId::Node(self.id)
    }

    /// Register on the bus and advertise as task-executing.
    pub fn attach(&self) -> Result<Mailbox> {
        let mailbox = self.bus.register(self.address())?;
        self.directory
            .register(self.address(), ServiceTag::TaskExecuting);
        Ok(mailbox)
    }

    fn detach(&self) {
        self.directory.deregister(&self.address());
        self.bus.deregister(&self.address());
    }

    /// Run the node until shutdown. Returns the final report after logging the
    /// termination summary.
    pub async fn run(mut self, mut mailbox: Mailbox, shutdown: CancellationToken) -> NodeReport {
        tracing::info!(node_id = self.id, name = %self.name, capacity = self.workload.capacity(), "Node started");
        let mut ticker =
            discovery_ticker(self.timing.discovery_interval(), self.timing.jitter_ms);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                frame = mailbox.recv() => match frame {
                    Some(frame) => self.handle(frame),
                    None => break,
                },
                _ = ticker.tick() => self.on_tick(),
            }
            self.publish();
        }

        self.detach();
        let report = self.report();
        report.log_summary();
        report
    }

    fn handle(&mut self, frame: Frame) {
        let message = match Message::from_frame(&frame) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(node_id = self.id, error = %e, "Dropping malformed message");
                return;
            }
        };

        match (frame.sender, message) {
            (EntityId::Task(task), Message::CallForProposal { round, complexity }) => {
                self.on_call_for_proposal(task, round, complexity)
            }
            (EntityId::Task(task), Message::AcceptProposal { round, complexity }) => {
                self.on_accept(task, round, complexity)
            }
            (EntityId::Task(task), Message::RejectProposal { .. }) => {
                self.known_tasks.insert(task, true);
            }
            (EntityId::Task(task), Message::StatusReply { assigned }) => {
                self.known_tasks.insert(task, assigned);
            }
            (
                EntityId::Node(node),
                Message::LoadSnapshot {
                    total_time,
                    capacity,
                },
            ) => self.on_snapshot(node, LoadSnapshot::new(total_time, capacity)),
            (EntityId::Node(node), Message::PairRequest { average }) => {
                self.on_pair_request(node, average)
            }
            (EntityId::Node(node), Message::PairAccept) => self.on_pair_accept(node),
            (EntityId::Node(node), Message::PairRefuse) => self.on_pair_refuse(node),
            (EntityId::Node(node), Message::TaskExchange { task, complexity }) => {
                self.on_task_exchange(node, task, complexity)
            }
            (EntityId::Node(node), Message::ExchangeComplete) => self.on_exchange_complete(node),
            (sender, other) => {
                tracing::debug!(node_id = self.id, %sender, kind = other.kind(), "Ignoring unexpected message");
            }
        }
    }

    // ----- allocation -----

    fn on_call_for_proposal(&mut self, task: TaskId, round: u64, complexity: u32) {
        let completion_time = self.workload.proposal(complexity);
        if !self.workload.contains(&task) {
            self.known_tasks.insert(task.clone(), false);
        }

        let to = EntityId::Task(task);
        match self.bus.send(
            &self.address(),
            &to,
            Message::Propose {
                round,
                completion_time,
            },
        ) {
            Ok(()) => {
                tracing::debug!(node_id = self.id, task = %to, round, completion_time, "Proposal sent")
            }
            Err(e) => tracing::warn!(node_id = self.id, error = %e, "Proposal not delivered"),
        }
    }

    fn on_accept(&mut self, task: TaskId, round: u64, complexity: u32) {
        if self
            .accepted_rounds
            .get(&task)
            .is_some_and(|&accepted| accepted >= round)
        {
            tracing::debug!(node_id = self.id, task = %task, round, "Duplicate accept ignored");
            return;
        }
        self.accepted_rounds.insert(task.clone(), round);
        self.known_tasks.insert(task.clone(), true);

        if !self.workload.assign(task.clone(), complexity) {
            tracing::debug!(node_id = self.id, task = %task, "Task already held");
            return;
        }
        tracing::info!(
            node_id = self.id,
            task = %task,
            complexity,
            total_time = self.workload.total_time(),
            "Task accepted"
        );
        self.on_workload_changed();
    }

    // ----- quiescence -----

    fn on_tick(&mut self) {
        self.expire_negotiation();
        self.poll_tasks();

        if !self.is_settled() {
            return;
        }
        if !self.rounds.settled {
            self.rounds.settled = true;
            tracing::info!(
                node_id = self.id,
                tasks = self.known_tasks.len(),
                total_time = self.workload.total_time(),
                "All tasks assigned, entering rebalancing"
            );
        }
        if matches!(self.phase, NodePhase::Idle | NodePhase::SnapshotCollecting) {
            self.begin_round();
        }
    }

    /// Refresh known tasks from the directory and ask each for its status.
    fn poll_tasks(&mut self) {
        let tasks = match self.directory.search_tasks() {
            Ok(tasks) => tasks,
            Err(e) => {
                tracing::warn!(node_id = self.id, error = %e, "Task discovery failed, retrying next tick");
                return;
            }
        };

        if tasks.len() > self.discovered_tasks {
            if self.rounds.settled || self.phase == NodePhase::Converged {
                tracing::info!(
                    node_id = self.id,
                    before = self.discovered_tasks,
                    now = tasks.len(),
                    "New tasks discovered, reopening balancing"
                );
            }
            self.rounds.reset();
            if self.phase == NodePhase::Converged {
                self.phase = NodePhase::Idle;
            }
        }
        self.discovered_tasks = tasks.len();

        self.known_tasks.retain(|id, _| tasks.contains(id));
        for id in &tasks {
            self.known_tasks.entry(id.clone()).or_insert(false);
        }

        let recipients: Vec<EntityId> = tasks.into_iter().map(EntityId::Task).collect();
        self.bus
            .multicast(&self.address(), &recipients, Message::StatusQuery);
    }

    fn is_settled(&self) -> bool {
        !self.known_tasks.is_empty() && self.known_tasks.values().all(|&assigned| assigned)
    }

    // ----- snapshot exchange -----

    fn begin_round(&mut self) {
        let nodes = match self.directory.search_nodes() {
            Ok(nodes) => nodes,
            Err(e) => {
                tracing::warn!(node_id = self.id, error = %e, "Node discovery failed, retrying next tick");
                return;
            }
        };

        self.known_nodes.retain(|id, _| nodes.contains(id));
        for &id in &nodes {
            self.known_nodes.entry(id).or_insert(None);
        }
        self.known_nodes
            .insert(self.id, Some(self.workload.snapshot()));
        self.broadcast_snapshot();

        self.phase = NodePhase::SnapshotCollecting;
        self.try_decide();
    }

    fn broadcast_snapshot(&self) {
        let snapshot = self.workload.snapshot();
        let peers: Vec<EntityId> = self
            .known_nodes
            .keys()
            .filter(|&&id| id != self.id)
            .map(|&id| EntityId::Node(id))
            .collect();
        self.bus.multicast(
            &self.address(),
            &peers,
            Message::LoadSnapshot {
                total_time: snapshot.total_time,
                capacity: snapshot.capacity,
            },
        );
    }

    fn on_snapshot(&mut self, node: NodeId, snapshot: LoadSnapshot) {
        let first_seen = !matches!(self.known_nodes.get(&node), Some(Some(_)));
        self.known_nodes.insert(node, Some(snapshot));

        // A node we had no snapshot for may not have ours either.
        if first_seen && self.rounds.settled {
            let own = self.workload.snapshot();
            let reply = Message::LoadSnapshot {
                total_time: own.total_time,
                capacity: own.capacity,
            };
            if let Err(e) = self.bus.send(&self.address(), &EntityId::Node(node), reply) {
                tracing::debug!(node_id = self.id, error = %e, "Snapshot reply not delivered");
            }
        }

        if self.phase == NodePhase::SnapshotCollecting {
            self.try_decide();
        }
    }

    fn on_workload_changed(&mut self) {
        self.known_nodes
            .insert(self.id, Some(self.workload.snapshot()));
        if self.rounds.settled {
            self.broadcast_snapshot();
        }
    }

    // ----- rebalancing -----

    fn try_decide(&mut self) {
        if self.lock.is_busy() || self.known_nodes.values().any(Option::is_none) {
            return;
        }
        self.decide();
    }

    fn decide(&mut self) {
        let own = self.workload.snapshot();
        let loads: Vec<(NodeId, LoadSnapshot)> = self
            .known_nodes
            .iter()
            .filter_map(|(&id, snapshot)| {
                let snapshot = if id == self.id { Some(own) } else { *snapshot };
                snapshot.map(|s| (id, s))
            })
            .collect();

        let stats = FleetStats::from_loads(&loads, self.delta);
        let unchanged = self
            .rounds
            .observe(self.workload.total_time(), self.workload.len());
        tracing::debug!(
            node_id = self.id,
            round = self.rounds.rounds,
            average = stats.average,
            within_delta = stats.within_delta,
            nodes = stats.node_count,
            unchanged,
            "Rebalancing round"
        );

        if stats.is_balanced() || self.rounds.is_stagnant() {
            self.phase = NodePhase::Converged;
            tracing::info!(
                node_id = self.id,
                average = stats.average,
                total_time = self.workload.total_time(),
                balanced = stats.is_balanced(),
                unchanged_rounds = unchanged,
                "Rebalancing complete"
            );
            return;
        }

        let ranked = rank_by_load(&loads);
        match pairing_role(&ranked, self.id) {
            PairingRole::Initiator { partner } => self.initiate(partner, stats.average),
            PairingRole::Responder { partner } => {
                self.phase = NodePhase::Idle;
                tracing::debug!(node_id = self.id, partner, "Waiting for pairing request");
            }
            PairingRole::Median | PairingRole::Unpaired => {
                self.phase = NodePhase::Idle;
                tracing::debug!(node_id = self.id, "Sitting out this round");
            }
        }
    }

    fn initiate(&mut self, partner: NodeId, average: f64) {
        if !self.lock.acquire(partner) {
            return;
        }
        self.initiator = true;

        if let Err(e) = self.bus.send(
            &self.address(),
            &EntityId::Node(partner),
            Message::PairRequest { average },
        ) {
            tracing::warn!(node_id = self.id, partner, error = %e, "Pairing request not delivered");
            self.end_negotiation();
            return;
        }
        self.phase = NodePhase::Pairing;
        tracing::info!(node_id = self.id, partner, average, "Pairing requested");
    }

    fn on_pair_request(&mut self, from: NodeId, average: f64) {
        if !self.lock.acquire(from) {
            tracing::debug!(node_id = self.id, from, busy_with = ?self.lock.partner(), "Busy, refusing pairing");
            self.send_to_node(from, Message::PairRefuse);
            return;
        }
        self.initiator = false;

        if !self.send_to_node(from, Message::PairAccept) {
            self.end_negotiation();
            return;
        }
        self.phase = NodePhase::Exchanging;
        tracing::info!(node_id = self.id, partner = from, average, "Pairing accepted");

        let own = self.workload.snapshot();
        let transfer = match self.known_nodes.get(&from).copied().flatten() {
            Some(partner) if own.total_time > partner.total_time => {
                select_transfer(self.workload.tasks(), own, partner, average)
            }
            Some(_) => None,
            None => {
                tracing::debug!(node_id = self.id, partner = from, "No snapshot for partner");
                None
            }
        };

        let Some(transfer) = transfer else {
            tracing::debug!(node_id = self.id, partner = from, "No task worth moving");
            self.send_to_node(from, Message::ExchangeComplete);
            self.end_negotiation();
            return;
        };

        let task = match self.workload.release(&transfer.task.id) {
            Ok(task) => task,
            Err(e) => {
                tracing::warn!(node_id = self.id, error = %e, "Aborting migration");
                self.send_to_node(from, Message::ExchangeComplete);
                self.end_negotiation();
                return;
            }
        };
        self.known_tasks.insert(task.id.clone(), false);
        self.migrations_out += 1;

        if let Err(e) = self
            .bus
            .send(&self.address(), &EntityId::Task(task.id.clone()), Message::Evict)
        {
            tracing::warn!(node_id = self.id, task = %task.id, error = %e, "Eviction not delivered");
        }
        tracing::info!(
            node_id = self.id,
            partner = from,
            task = %task.id,
            complexity = task.complexity,
            improvement = transfer.improvement,
            total_time = self.workload.total_time(),
            "Task migrated out"
        );

        let handed_over = self.send_to_node(
            from,
            Message::TaskExchange {
                task: task.id,
                complexity: task.complexity,
            },
        );
        if !handed_over {
            self.end_negotiation();
        }
        self.on_workload_changed();
    }

    fn on_pair_accept(&mut self, from: NodeId) {
        if self.phase == NodePhase::Pairing && self.lock.is_held_with(from) {
            self.phase = NodePhase::Exchanging;
            tracing::debug!(node_id = self.id, partner = from, "Partner agreed");
        } else {
            tracing::debug!(node_id = self.id, from, "Stale pairing accept ignored");
        }
    }

    fn on_pair_refuse(&mut self, from: NodeId) {
        if self.initiator && self.lock.is_held_with(from) {
            tracing::debug!(node_id = self.id, partner = from, "Partner refused pairing");
            self.end_negotiation();
        }
    }

    fn on_task_exchange(&mut self, from: NodeId, task: TaskId, complexity: u32) {
        self.known_tasks.insert(task.clone(), false);
        self.send_to_node(from, Message::ExchangeComplete);

        if self.initiator && self.lock.is_held_with(from) {
            self.migrations_in += 1;
            tracing::info!(
                node_id = self.id,
                partner = from,
                task = %task,
                complexity,
                "Task handed over, awaiting its new bid"
            );
            self.end_negotiation();
        } else {
            tracing::warn!(node_id = self.id, from, task = %task, "Task exchange outside a negotiation");
        }
    }

    fn on_exchange_complete(&mut self, from: NodeId) {
        if self.lock.is_held_with(from) {
            tracing::debug!(node_id = self.id, partner = from, "Exchange complete");
            self.end_negotiation();
        }
    }

    fn expire_negotiation(&mut self) {
        let expired = self
            .lock
            .held_for()
            .is_some_and(|held| held >= self.negotiation_timeout());
        if expired {
            tracing::warn!(
                node_id = self.id,
                partner = ?self.lock.partner(),
                phase = %self.phase,
                "Negotiation timed out, releasing lock"
            );
            self.end_negotiation();
        }
    }

    fn negotiation_timeout(&self) -> Duration {
        self.timing.negotiation_timeout()
    }

    fn end_negotiation(&mut self) {
        self.lock.release();
        self.initiator = false;
        self.phase = NodePhase::Idle;
    }

    fn send_to_node(&self, node: NodeId, message: Message) -> bool {
        let kind = message.kind();
        match self.bus.send(&self.address(), &EntityId::Node(node), message) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(node_id = self.id, to = node, kind, error = %e, "Message not delivered");
                false
            }
        }
    }

    pub fn report(&self) -> NodeReport {
        NodeReport {
            id: self.id,
            name: self.name.clone(),
            capacity: self.workload.capacity(),
            total_time: self.workload.total_time(),
            tasks: self.workload.tasks().to_vec(),
            phase: self.phase,
            partner: self.lock.partner(),
            settled: self.rounds.settled,
            unchanged_rounds: self.rounds.unchanged_rounds,
            rounds: self.rounds.rounds,
            migrations_out: self.migrations_out,
            migrations_in: self.migrations_in,
        }
    }

    fn publish(&self) {
        self.report_tx.send_replace(self.report());
    }
}
