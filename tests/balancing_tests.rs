//! Pairing handshake of a single real node driven by scripted peers.

mod test_harness;

use std::sync::Arc;
use std::time::Duration;

use fleetnet::bus::{Directory, EntityId, Message, MessageBus, TaskId};
use fleetnet::compute::NodePhase;
use fleetnet::config::{NodeSpec, Timing};
use test_harness::{
    assert_eventually, fast_timing, idle_timing, spawn_compute_node, spawn_status_responder,
    FakeAgent,
};

fn accept(task: &FakeAgent, node: u64, complexity: u32) {
    task.send(
        node,
        Message::AcceptProposal {
            round: 1,
            complexity,
        },
    );
}

#[tokio::test]
async fn test_busy_node_refuses_second_partner() {
    let bus = Arc::new(MessageBus::default());
    let directory = Arc::new(Directory::new());
    let reports = spawn_compute_node(NodeSpec::new(1, 100), 0.5, &idle_timing(), &bus, &directory);

    let mut task_a = FakeAgent::hidden_task("a", &bus);
    let task_b = FakeAgent::hidden_task("b", &bus);
    let mut light = FakeAgent::node(2, &bus, &directory);
    let mut other = FakeAgent::node(3, &bus, &directory);

    accept(&task_a, 1, 200);
    accept(&task_b, 1, 200);
    light.send(
        1u64,
        Message::LoadSnapshot {
            total_time: 0.0,
            capacity: 100,
        },
    );
    light.send(1u64, Message::PairRequest { average: 2.0 });
    other.send(1u64, Message::PairRequest { average: 2.0 });

    assert_eq!(light.recv().await.1, Message::PairAccept);
    assert_eq!(
        light.recv().await.1,
        Message::TaskExchange {
            task: TaskId::new("a"),
            complexity: 200
        }
    );
    assert_eq!(other.recv().await.1, Message::PairRefuse);
    assert_eq!(
        task_a.recv().await,
        (EntityId::Node(1), Message::Evict)
    );

    let report = reports.borrow().clone();
    assert_eq!(report.partner, Some(2));
    assert_eq!(report.phase, NodePhase::Exchanging);
    assert!((report.total_time - 2.0).abs() < 1e-9);
    assert_eq!(report.migrations_out, 1);

    // Busy with the partner itself: a repeated request is refused, and the
    // exchange already under way keeps its lock.
    light.send(1u64, Message::PairRequest { average: 2.0 });
    assert_eq!(light.recv().await.1, Message::PairRefuse);
    let report = reports.borrow().clone();
    assert_eq!(report.partner, Some(2));
    assert_eq!(report.phase, NodePhase::Exchanging);

    light.send(1u64, Message::ExchangeComplete);
    assert_eventually(
        || {
            let reports = reports.clone();
            async move {
                let report = reports.borrow();
                report.partner.is_none() && report.phase == NodePhase::Idle
            }
        },
        Duration::from_secs(1),
        "lock should be released after the exchange completes",
    )
    .await;

    // Free again: the other node is accepted, but there is no snapshot to
    // choose a task against.
    other.send(1u64, Message::PairRequest { average: 2.0 });
    assert_eq!(other.recv().await.1, Message::PairAccept);
    assert_eq!(other.recv().await.1, Message::ExchangeComplete);
}

#[tokio::test]
async fn test_responder_without_improvement_completes_immediately() {
    let bus = Arc::new(MessageBus::default());
    let directory = Arc::new(Directory::new());
    let reports = spawn_compute_node(NodeSpec::new(1, 100), 0.5, &idle_timing(), &bus, &directory);

    let task = FakeAgent::hidden_task("only", &bus);
    let mut light = FakeAgent::node(2, &bus, &directory);
    accept(&task, 1, 300);

    light.send(
        1u64,
        Message::LoadSnapshot {
            total_time: 1.0,
            capacity: 100,
        },
    );
    light.send(1u64, Message::PairRequest { average: 2.0 });

    assert_eq!(light.recv().await.1, Message::PairAccept);
    assert_eq!(light.recv().await.1, Message::ExchangeComplete);

    assert_eventually(
        || {
            let reports = reports.clone();
            async move {
                let report = reports.borrow();
                report.partner.is_none() && report.tasks.len() == 1
            }
        },
        Duration::from_secs(1),
        "node should keep its task and release the lock",
    )
    .await;
}

#[tokio::test]
async fn test_lighter_node_initiates_and_releases_after_exchange() {
    let bus = Arc::new(MessageBus::default());
    let directory = Arc::new(Directory::new());
    spawn_status_responder(FakeAgent::task("elsewhere", &bus, &directory), true);
    let mut heavy = FakeAgent::node(2, &bus, &directory);
    let reports = spawn_compute_node(NodeSpec::new(1, 100), 0.5, &fast_timing(), &bus, &directory);

    let average = loop {
        match heavy.recv().await {
            (_, Message::LoadSnapshot { .. }) => heavy.send(
                1u64,
                Message::LoadSnapshot {
                    total_time: 5.0,
                    capacity: 100,
                },
            ),
            (sender, Message::PairRequest { average }) => {
                assert_eq!(sender, EntityId::Node(1));
                break average;
            }
            (_, other) => panic!("unexpected message {:?}", other),
        }
    };
    assert!((average - 2.5).abs() < 1e-9);

    heavy.send(1u64, Message::PairAccept);
    heavy.send(
        1u64,
        Message::TaskExchange {
            task: TaskId::new("moved"),
            complexity: 200,
        },
    );

    let complete = loop {
        match heavy.recv().await {
            (_, Message::LoadSnapshot { .. }) => continue,
            (_, message) => break message,
        }
    };
    assert_eq!(complete, Message::ExchangeComplete);

    // Report a light load so that the next round finds the pair balanced.
    heavy.send(
        1u64,
        Message::LoadSnapshot {
            total_time: 0.2,
            capacity: 100,
        },
    );
    assert_eventually(
        || {
            let reports = reports.clone();
            async move {
                let report = reports.borrow();
                report.phase == NodePhase::Converged
                    && report.partner.is_none()
                    && report.migrations_in == 1
                    && report.tasks.is_empty()
            }
        },
        Duration::from_secs(2),
        "initiator should release its lock without taking the task",
    )
    .await;
}

#[tokio::test]
async fn test_unanswered_pairing_request_times_out() {
    let bus = Arc::new(MessageBus::default());
    let directory = Arc::new(Directory::new());
    spawn_status_responder(FakeAgent::task("elsewhere", &bus, &directory), true);
    let mut silent = FakeAgent::node(2, &bus, &directory);
    let timing = Timing {
        negotiation_timeout_ms: 120,
        ..fast_timing()
    };
    spawn_compute_node(NodeSpec::new(1, 100), 0.5, &timing, &bus, &directory);

    // A second request can only be sent once the first lock has expired.
    let mut requests = 0;
    let mut answered_snapshot = false;
    while requests < 2 {
        match silent.recv().await {
            (_, Message::LoadSnapshot { .. }) if !answered_snapshot => {
                answered_snapshot = true;
                silent.send(
                    1u64,
                    Message::LoadSnapshot {
                        total_time: 4.0,
                        capacity: 100,
                    },
                );
            }
            (_, Message::PairRequest { .. }) => requests += 1,
            _ => {}
        }
    }
}
