//! Test harness for fleet integration tests.
//!
//! Provides fast timing, a fleet wrapper, and scripted fake agents that speak
//! the bus protocol so a single real agent can be driven message by message.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use fleetnet::bus::{Directory, EntityId, Mailbox, Message, MessageBus, NodeId, ServiceTag, TaskId};
use fleetnet::compute::{ComputeNode, NodeReport};
use fleetnet::config::{FleetConfig, NodeSpec, Timing};
use fleetnet::fleet::{Fleet, FleetOutcome, FleetView};

/// Shorter periods so a whole run settles in well under a second or two
pub fn fast_timing() -> Timing {
    Timing {
        discovery_interval_ms: 40,
        jitter_ms: 10,
        task_retry_ms: 20,
        bid_timeout_ms: 300,
        negotiation_timeout_ms: 250,
    }
}

/// Timing whose ticks never fire during a test
pub fn idle_timing() -> Timing {
    Timing {
        discovery_interval_ms: 60_000,
        jitter_ms: 0,
        task_retry_ms: 60_000,
        bid_timeout_ms: 60_000,
        negotiation_timeout_ms: 60_000,
    }
}

pub fn fleet_config(nodes: &[(NodeId, u32)], tasks: &[(&str, u32)], delta: f64) -> FleetConfig {
    let mut config = FleetConfig::default().with_delta(delta);
    config.timing = fast_timing();
    for &(id, capacity) in nodes {
        config = config.with_node(id, capacity);
    }
    for &(name, complexity) in tasks {
        config = config.with_task(name, complexity);
    }
    config
}

/// `count` tasks named `t0..` of equal complexity
pub fn uniform_tasks(count: usize, complexity: u32) -> Vec<(String, u32)> {
    (0..count).map(|i| (format!("t{}", i), complexity)).collect()
}

/// Handle to a running fleet
pub struct TestFleet {
    pub fleet: Fleet,
    pub config: FleetConfig,
}

impl TestFleet {
    pub fn start(config: FleetConfig) -> Self {
        let fleet = Fleet::start(&config, CancellationToken::new()).unwrap();
        Self { fleet, config }
    }

    pub fn view(&self) -> FleetView {
        self.fleet.view()
    }

    pub async fn wait_for_convergence(&self, timeout_duration: Duration) -> bool {
        self.fleet.wait_until_converged(timeout_duration).await
    }

    pub async fn wait_for_all_assigned(&self, timeout_duration: Duration) -> bool {
        let view = self.view();
        let expected = self.config.tasks.len();
        wait_for(
            || {
                let view = view.clone();
                async move {
                    let tasks = view.task_reports();
                    tasks.len() == expected && tasks.iter().all(|t| t.assigned_node.is_some())
                }
            },
            timeout_duration,
            Duration::from_millis(20),
        )
        .await
    }

    /// Every task held by exactly one node and the complexity sum preserved
    pub fn assert_uniqueness_and_conservation(&self) {
        let view = self.view();
        assert!(
            view.ownership_conflicts().is_empty(),
            "tasks held twice: {:?}",
            view.ownership_conflicts()
        );
        assert_eq!(view.held_complexity(), self.config.total_complexity());

        for task in view.task_reports() {
            let holder = task.assigned_node.expect("task should be assigned");
            let node = view.node_report(holder).unwrap();
            assert!(
                node.tasks.iter().any(|t| t.id == task.id),
                "task {} claims node {} but the node does not hold it",
                task.id,
                holder
            );
        }
    }

    pub async fn shutdown(self) -> FleetOutcome {
        self.fleet.shutdown().await
    }
}

/// A hand-driven participant registered on a bus (and optionally a directory).
pub struct FakeAgent {
    pub id: EntityId,
    bus: Arc<MessageBus>,
    mailbox: Mailbox,
}

impl FakeAgent {
    /// Fake compute node, discoverable as task-executing
    pub fn node(id: NodeId, bus: &Arc<MessageBus>, directory: &Directory) -> Self {
        let id = EntityId::Node(id);
        directory.register(id.clone(), ServiceTag::TaskExecuting);
        Self::attach(id, bus)
    }

    /// Fake task, discoverable under the tasks tag
    pub fn task(name: &str, bus: &Arc<MessageBus>, directory: &Directory) -> Self {
        let id = EntityId::Task(TaskId::new(name));
        directory.register(id.clone(), ServiceTag::Tasks);
        Self::attach(id, bus)
    }

    /// Bus-only participant, invisible to directory searches
    pub fn hidden_task(name: &str, bus: &Arc<MessageBus>) -> Self {
        Self::attach(EntityId::Task(TaskId::new(name)), bus)
    }

    fn attach(id: EntityId, bus: &Arc<MessageBus>) -> Self {
        let mailbox = bus.register(id.clone()).unwrap();
        Self {
            id,
            bus: bus.clone(),
            mailbox,
        }
    }

    pub fn send(&self, to: impl Into<EntityId>, message: Message) {
        self.bus.send(&self.id, &to.into(), message).unwrap();
    }

    /// Next message that is not a status query; panics after two seconds.
    pub async fn recv(&mut self) -> (EntityId, Message) {
        let deadline = Duration::from_secs(2);
        loop {
            let frame = tokio::time::timeout(deadline, self.mailbox.recv())
                .await
                .unwrap_or_else(|_| panic!("{} received nothing", self.id))
                .expect("mailbox closed");
            let message = Message::from_frame(&frame).unwrap();
            if message != Message::StatusQuery {
                return (frame.sender, message);
            }
        }
    }

    /// Messages (status queries excluded) that arrive within `window`.
    pub async fn drain(&mut self, window: Duration) -> Vec<(EntityId, Message)> {
        let mut received = Vec::new();
        let deadline = tokio::time::Instant::now() + window;
        while let Ok(Some(frame)) = tokio::time::timeout_at(deadline, self.mailbox.recv()).await {
            let message = Message::from_frame(&frame).unwrap();
            if message != Message::StatusQuery {
                received.push((frame.sender, message));
            }
        }
        received
    }
}

/// Spawn one real compute node outside of a fleet
pub fn spawn_compute_node(
    spec: NodeSpec,
    delta: f64,
    timing: &Timing,
    bus: &Arc<MessageBus>,
    directory: &Arc<Directory>,
) -> watch::Receiver<NodeReport> {
    let (node, reports) = ComputeNode::new(&spec, delta, timing, bus.clone(), directory.clone());
    let mailbox = node.attach().unwrap();
    tokio::spawn(node.run(mailbox, CancellationToken::new()));
    reports
}

/// Fake task that answers every status query with `assigned` and ignores
/// everything else
pub fn spawn_status_responder(mut task: FakeAgent, assigned: bool) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = task.mailbox.recv().await {
            if let Ok(Message::StatusQuery) = Message::from_frame(&frame) {
                let _ = task
                    .bus
                    .send(&task.id, &frame.sender, Message::StatusReply { assigned });
            }
        }
    })
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(20)).await;
    assert!(result, "{}", message);
}
