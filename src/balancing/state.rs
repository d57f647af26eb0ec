use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::bus::{NodeId, TaskId};
use crate::error::{FleetError, Result};

/// Rounds without any change in a node's own load before it stops balancing.
pub const STAGNATION_ROUNDS: u32 = 3;

/// Change in total time below which a round counts as "unchanged".
const CHANGE_EPSILON: f64 = 1e-3;

/// A node's load as advertised to its peers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoadSnapshot {
    pub total_time: f64,
    pub capacity: u32,
}

impl LoadSnapshot {
    pub fn new(total_time: f64, capacity: u32) -> Self {
        Self {
            total_time,
            capacity,
        }
    }

    /// Completion time a task of `complexity` would add to this node.
    pub fn cost(&self, complexity: u32) -> f64 {
        f64::from(complexity) / f64::from(self.capacity)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignedTask {
    pub id: TaskId,
    pub complexity: u32,
}

/// Tasks held by one node and the completion time they add up to.
///
/// Invariant: `total_time` equals the sum of `complexity / capacity` over
/// `tasks`, up to floating point accumulation. Tasks keep their arrival order,
/// which is the iteration order used when choosing a task to migrate.
#[derive(Debug, Clone)]
pub struct Workload {
    capacity: u32,
    total_time: f64,
    tasks: Vec<AssignedTask>,
}

impl Workload {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            total_time: 0.0,
            tasks: Vec::new(),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn total_time(&self) -> f64 {
        self.total_time
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn tasks(&self) -> &[AssignedTask] {
        &self.tasks
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.tasks.iter().any(|t| &t.id == id)
    }

    pub fn snapshot(&self) -> LoadSnapshot {
        LoadSnapshot::new(self.total_time, self.capacity)
    }

    /// The completion time this node would bid for a task of `complexity`.
    pub fn proposal(&self, complexity: u32) -> f64 {
        self.total_time + self.snapshot().cost(complexity)
    }

    /// Take ownership of a task. Returns false if it is already held.
    pub fn assign(&mut self, id: TaskId, complexity: u32) -> bool {
        if self.contains(&id) {
            return false;
        }
        self.total_time += self.snapshot().cost(complexity);
        self.tasks.push(AssignedTask { id, complexity });
        true
    }

    /// Give up a task. Fails if the task is not held here.
    pub fn release(&mut self, id: &TaskId) -> Result<AssignedTask> {
        let position = self
            .tasks
            .iter()
            .position(|t| &t.id == id)
            .ok_or_else(|| {
                FleetError::InvariantViolation(format!("task {} is not held by this node", id))
            })?;

        let task = self.tasks.remove(position);
        self.total_time -= self.snapshot().cost(task.complexity);
        if self.tasks.is_empty() || self.total_time < 0.0 {
            self.total_time = self.recomputed_time();
        }
        Ok(task)
    }

    fn recomputed_time(&self) -> f64 {
        self.tasks
            .iter()
            .map(|t| self.snapshot().cost(t.complexity))
            .sum()
    }
}

/// Pairing lock: a node balances with at most one partner at a time.
#[derive(Debug, Clone, Default)]
pub struct BalancingLock {
    partner: Option<NodeId>,
    since: Option<Instant>,
}

impl BalancingLock {
    pub fn is_busy(&self) -> bool {
        self.partner.is_some()
    }

    pub fn partner(&self) -> Option<NodeId> {
        self.partner
    }

    pub fn is_held_with(&self, node: NodeId) -> bool {
        self.partner == Some(node)
    }

    /// Returns false (and changes nothing) if already busy.
    pub fn acquire(&mut self, partner: NodeId) -> bool {
        if self.is_busy() {
            return false;
        }
        self.partner = Some(partner);
        self.since = Some(Instant::now());
        true
    }

    pub fn release(&mut self) -> Option<NodeId> {
        self.since = None;
        self.partner.take()
    }

    pub fn held_for(&self) -> Option<Duration> {
        self.since.map(|since| since.elapsed())
    }
}

/// Per-node bookkeeping across rebalancing rounds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoundState {
    pub last_total_time: f64,
    pub last_task_count: usize,
    pub unchanged_rounds: u32,
    /// Set once the node has seen a settled fleet and entered rebalancing
    pub settled: bool,
    /// Decisions taken since the last reset
    pub rounds: u32,
}

impl RoundState {
    /// Record this round's own load and return the updated unchanged-round count.
    pub fn observe(&mut self, total_time: f64, task_count: usize) -> u32 {
        let changed = (total_time - self.last_total_time).abs() > CHANGE_EPSILON
            || task_count != self.last_task_count;

        if changed {
            self.unchanged_rounds = 0;
        } else {
            self.unchanged_rounds += 1;
        }
        self.last_total_time = total_time;
        self.last_task_count = task_count;
        self.rounds += 1;
        self.unchanged_rounds
    }

    pub fn is_stagnant(&self) -> bool {
        self.unchanged_rounds >= STAGNATION_ROUNDS
    }

    /// Fleet composition changed: forget convergence progress.
    pub fn reset(&mut self) {
        self.unchanged_rounds = 0;
        self.rounds = 0;
        self.settled = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(name: &str) -> TaskId {
        TaskId::new(name)
    }

    #[test]
    fn assign_and_release_track_total_time() {
        let mut workload = Workload::new(50);
        assert!(workload.assign(task("a"), 100));
        assert!(workload.assign(task("b"), 25));
        assert!((workload.total_time() - 2.5).abs() < 1e-9);
        assert_eq!(workload.proposal(50), 3.5);

        let released = workload.release(&task("a")).unwrap();
        assert_eq!(released.complexity, 100);
        assert!((workload.total_time() - 0.5).abs() < 1e-9);
        assert_eq!(workload.len(), 1);
    }

    #[test]
    fn assign_is_idempotent_per_task() {
        let mut workload = Workload::new(10);
        assert!(workload.assign(task("a"), 10));
        assert!(!workload.assign(task("a"), 10));
        assert_eq!(workload.len(), 1);
        assert_eq!(workload.total_time(), 1.0);
    }

    #[test]
    fn releasing_unknown_task_is_an_invariant_violation() {
        let mut workload = Workload::new(10);
        workload.assign(task("a"), 10);

        let err = workload.release(&task("zzz")).unwrap_err();
        assert!(matches!(err, FleetError::InvariantViolation(_)));
        assert_eq!(workload.len(), 1);
        assert_eq!(workload.total_time(), 1.0);
    }

    #[test]
    fn empty_workload_snaps_back_to_zero() {
        let mut workload = Workload::new(3);
        for name in ["a", "b", "c"] {
            workload.assign(task(name), 1);
        }
        for name in ["a", "b", "c"] {
            workload.release(&task(name)).unwrap();
        }
        assert_eq!(workload.total_time(), 0.0);
        assert!(workload.is_empty());
    }

    #[test]
    fn lock_admits_one_partner() {
        let mut lock = BalancingLock::default();
        assert!(!lock.is_busy());
        assert!(lock.acquire(2));
        assert!(!lock.acquire(3));
        assert_eq!(lock.partner(), Some(2));
        assert!(lock.is_held_with(2));
        assert!(lock.held_for().is_some());

        assert_eq!(lock.release(), Some(2));
        assert!(!lock.is_busy());
        assert!(lock.held_for().is_none());
    }

    #[test]
    fn round_state_counts_unchanged_rounds() {
        let mut rounds = RoundState::default();
        assert_eq!(rounds.observe(2.0, 1), 0);
        assert_eq!(rounds.observe(2.0, 1), 1);
        assert_eq!(rounds.observe(2.0005, 1), 2);
        assert!(!rounds.is_stagnant());
        assert_eq!(rounds.observe(2.0, 1), 3);
        assert!(rounds.is_stagnant());

        assert_eq!(rounds.observe(2.0, 2), 0);
        assert_eq!(rounds.rounds, 5);
    }

    #[test]
    fn reset_clears_progress_but_keeps_last_load() {
        let mut rounds = RoundState {
            settled: true,
            ..Default::default()
        };
        rounds.observe(1.0, 1);
        rounds.observe(1.0, 1);
        rounds.reset();

        assert_eq!(rounds.unchanged_rounds, 0);
        assert!(!rounds.settled);
        assert_eq!(rounds.last_total_time, 1.0);
    }
}
