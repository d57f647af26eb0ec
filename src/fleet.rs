use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::allocation::{TaskAgent, TaskPhase, TaskReport};
use crate::bus::{Directory, MessageBus, NodeId, TaskId};
use crate::compute::{ComputeNode, NodeReport};
use crate::config::{FleetConfig, NodeSpec, TaskSpec, Timing};
use crate::error::Result;

/// Cloneable read-only view over every agent's latest report.
#[derive(Clone, Default)]
pub struct FleetView {
    nodes: Arc<DashMap<NodeId, watch::Receiver<NodeReport>>>,
    tasks: Arc<DashMap<TaskId, watch::Receiver<TaskReport>>>,
}

/// Fleet-wide numbers served by the dashboard and printed by the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct FleetSummary {
    pub nodes: usize,
    pub tasks: usize,
    pub assigned_tasks: usize,
    pub average_load: f64,
    pub max_deviation: f64,
    pub converged: bool,
    pub ownership_conflicts: Vec<TaskId>,
}

impl FleetView {
    /// Latest node reports, ordered by id.
    pub fn node_reports(&self) -> Vec<NodeReport> {
        let mut reports: Vec<NodeReport> = self
            .nodes
            .iter()
            .map(|entry| entry.value().borrow().clone())
            .collect();
        reports.sort_by_key(|r| r.id);
        reports
    }

    /// Latest task reports, ordered by name.
    pub fn task_reports(&self) -> Vec<TaskReport> {
        let mut reports: Vec<TaskReport> = self
            .tasks
            .iter()
            .map(|entry| entry.value().borrow().clone())
            .collect();
        reports.sort_by(|a, b| a.id.cmp(&b.id));
        reports
    }

    pub fn node_report(&self, id: NodeId) -> Option<NodeReport> {
        self.nodes.get(&id).map(|rx| rx.value().borrow().clone())
    }

    pub fn task_report(&self, id: &TaskId) -> Option<TaskReport> {
        self.tasks.get(id).map(|rx| rx.value().borrow().clone())
    }

    /// Every task assigned and every node has stopped balancing.
    pub fn is_converged(&self) -> bool {
        let nodes = self.node_reports();
        let tasks = self.task_reports();
        !nodes.is_empty()
            && nodes.iter().all(NodeReport::is_converged)
            && tasks.iter().all(|t| t.phase == TaskPhase::Assigned)
    }

    /// Tasks held by more than one node at the same time.
    pub fn ownership_conflicts(&self) -> Vec<TaskId> {
        let mut holders: HashMap<TaskId, usize> = HashMap::new();
        for report in self.node_reports() {
            for task in report.tasks {
                *holders.entry(task.id).or_default() += 1;
            }
        }
        let mut conflicts: Vec<TaskId> = holders
            .into_iter()
            .filter(|(_, count)| *count > 1)
            .map(|(id, _)| id)
            .collect();
        conflicts.sort();
        conflicts
    }

    /// Sum of the complexity of every task held by some node.
    pub fn held_complexity(&self) -> u64 {
        self.node_reports()
            .iter()
            .flat_map(|r| r.tasks.iter())
            .map(|t| u64::from(t.complexity))
            .sum()
    }

    pub fn summary(&self) -> FleetSummary {
        let nodes = self.node_reports();
        let tasks = self.task_reports();
        let average_load = if nodes.is_empty() {
            0.0
        } else {
            nodes.iter().map(|n| n.total_time).sum::<f64>() / nodes.len() as f64
        };
        let max_deviation = nodes
            .iter()
            .map(|n| (n.total_time - average_load).abs())
            .fold(0.0, f64::max);

        FleetSummary {
            nodes: nodes.len(),
            tasks: tasks.len(),
            assigned_tasks: tasks
                .iter()
                .filter(|t| t.phase == TaskPhase::Assigned)
                .count(),
            average_load,
            max_deviation,
            converged: self.is_converged(),
            ownership_conflicts: self.ownership_conflicts(),
        }
    }
}

/// Final reports returned by [`Fleet::shutdown`].
#[derive(Debug, Clone)]
pub struct FleetOutcome {
    pub nodes: Vec<NodeReport>,
    pub tasks: Vec<TaskReport>,
}

/// Owns the bus, the directory and every spawned agent.
pub struct Fleet {
    delta: f64,
    timing: Timing,
    bus: Arc<MessageBus>,
    directory: Arc<Directory>,
    shutdown: CancellationToken,
    view: FleetView,
    node_handles: Vec<(NodeId, JoinHandle<NodeReport>)>,
    task_handles: Vec<(TaskId, JoinHandle<TaskReport>)>,
}

impl Fleet {
    /// Empty fleet using the configuration's delta, timing and bus settings.
    pub fn new(config: &FleetConfig, shutdown: CancellationToken) -> Self {
        Self {
            delta: config.delta,
            timing: config.timing.clone(),
            bus: Arc::new(MessageBus::new(&config.bus)),
            directory: Arc::new(Directory::new()),
            shutdown,
            view: FleetView::default(),
            node_handles: Vec::new(),
            task_handles: Vec::new(),
        }
    }

    /// Validate the configuration and spawn its nodes, then its tasks.
    pub fn start(config: &FleetConfig, shutdown: CancellationToken) -> Result<Self> {
        config.validate()?;
        let mut fleet = Self::new(config, shutdown);
        for node in &config.nodes {
            fleet.spawn_node(node)?;
        }
        for task in &config.tasks {
            fleet.spawn_task(task)?;
        }
        tracing::info!(
            nodes = config.nodes.len(),
            tasks = config.tasks.len(),
            delta = config.delta,
            "Fleet started"
        );
        Ok(fleet)
    }

    pub fn directory(&self) -> Arc<Directory> {
        self.directory.clone()
    }

    pub fn view(&self) -> FleetView {
        self.view.clone()
    }

    pub fn spawn_node(&mut self, spec: &NodeSpec) -> Result<()> {
        let (node, report_rx) = ComputeNode::new(
            spec,
            self.delta,
            &self.timing,
            self.bus.clone(),
            self.directory.clone(),
        );
        let mailbox = node.attach()?;
        self.view.nodes.insert(spec.id, report_rx);

        let shutdown = self.shutdown.child_token();
        let handle = tokio::spawn(node.run(mailbox, shutdown));
        self.node_handles.push((spec.id, handle));
        Ok(())
    }

    pub fn spawn_task(&mut self, spec: &TaskSpec) -> Result<()> {
        let (task, report_rx) = TaskAgent::new(
            spec,
            &self.timing,
            self.bus.clone(),
            self.directory.clone(),
        );
        let mailbox = task.attach()?;
        let id = task.id().clone();
        self.view.tasks.insert(id.clone(), report_rx);

        let shutdown = self.shutdown.child_token();
        let handle = tokio::spawn(task.run(mailbox, shutdown));
        self.task_handles.push((id, handle));
        Ok(())
    }

    /// Wait until [`FleetView::is_converged`] holds. Returns false on timeout
    /// or when the fleet is shut down first.
    pub async fn wait_until_converged(&self, timeout: Duration) -> bool {
        let poll = Duration::from_millis(20);
        let wait = async {
            loop {
                if self.view.is_converged() {
                    return true;
                }
                tokio::select! {
                    _ = self.shutdown.cancelled() => return false,
                    _ = tokio::time::sleep(poll) => {}
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.unwrap_or(false)
    }

    /// Stop every agent and collect their final reports.
    pub async fn shutdown(self) -> FleetOutcome {
        self.shutdown.cancel();

        let mut nodes = Vec::with_capacity(self.node_handles.len());
        for (id, handle) in self.node_handles {
            match handle.await {
                Ok(report) => nodes.push(report),
                Err(e) => {
                    tracing::error!(node_id = id, error = %e, "Node task failed");
                    if let Some(report) = self.view.node_report(id) {
                        nodes.push(report);
                    }
                }
            }
        }

        let mut tasks = Vec::with_capacity(self.task_handles.len());
        for (id, handle) in self.task_handles {
            match handle.await {
                Ok(report) => tasks.push(report),
                Err(e) => {
                    tracing::error!(task = %id, error = %e, "Task agent failed");
                    if let Some(report) = self.view.task_report(&id) {
                        tasks.push(report);
                    }
                }
            }
        }

        nodes.sort_by_key(|r| r.id);
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        FleetOutcome { nodes, tasks }
    }
}
