use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bus::{NodeId, TaskId};
use crate::error::{FleetError, Result};

/// Convergence tolerance used when no delta is configured.
pub const DEFAULT_DELTA: f64 = 2.0;

/// Periods and timeouts driving the agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    /// Period of a node's discovery/status-polling tick
    pub discovery_interval_ms: u64,
    /// Upper bound of the random offset applied to a node's first tick
    pub jitter_ms: u64,
    /// Period at which a task re-checks stalled discovery or bidding
    pub task_retry_ms: u64,
    /// How long a task waits for every proposal before bidding again
    pub bid_timeout_ms: u64,
    /// How long a node holds its balancing lock without an answer
    pub negotiation_timeout_ms: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            discovery_interval_ms: 1000,
            jitter_ms: 100,
            task_retry_ms: 250,
            bid_timeout_ms: 2000,
            negotiation_timeout_ms: 3000,
        }
    }
}

impl Timing {
    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }

    pub fn task_retry(&self) -> Duration {
        Duration::from_millis(self.task_retry_ms)
    }

    pub fn bid_timeout(&self) -> Duration {
        Duration::from_millis(self.bid_timeout_ms)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }
}

/// Fault injection knobs for the in-process bus.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Probability that a frame is delivered twice
    pub duplicate_ratio: f64,
    /// Seed for the duplication RNG (random when absent)
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: NodeId,
    #[serde(default)]
    pub name: Option<String>,
    pub capacity: u32,
}

impl NodeSpec {
    pub fn new(id: NodeId, capacity: u32) -> Self {
        Self {
            id,
            name: None,
            capacity,
        }
    }

    /// Name used as the key in the results file.
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("node-{}", self.id))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    pub complexity: u32,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>, complexity: u32) -> Self {
        Self {
            name: name.into(),
            complexity,
        }
    }

    /// Prefix the task name, so that several batches of tasks can join one fleet
    /// without their names colliding.
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.name = format!("{}{}", prefix, self.name);
        self
    }

    pub fn id(&self) -> TaskId {
        TaskId::new(self.name.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub delta: f64,
    pub timing: Timing,
    pub bus: BusConfig,
    pub nodes: Vec<NodeSpec>,
    pub tasks: Vec<TaskSpec>,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            delta: DEFAULT_DELTA,
            timing: Timing::default(),
            bus: BusConfig::default(),
            nodes: Vec::new(),
            tasks: Vec::new(),
        }
    }
}

impl FleetConfig {
    /// Read and validate a JSON fleet description.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            FleetError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: FleetConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_node(mut self, id: NodeId, capacity: u32) -> Self {
        self.nodes.push(NodeSpec::new(id, capacity));
        self
    }

    pub fn with_task(mut self, name: impl Into<String>, complexity: u32) -> Self {
        self.tasks.push(TaskSpec::new(name, complexity));
        self
    }

    pub fn with_delta(mut self, delta: f64) -> Self {
        self.delta = delta;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !self.delta.is_finite() || self.delta < 0.0 {
            return Err(FleetError::Config(format!(
                "delta must be a finite non-negative number, got {}",
                self.delta
            )));
        }
        if !(0.0..1.0).contains(&self.bus.duplicate_ratio) {
            return Err(FleetError::Config(format!(
                "bus.duplicate_ratio must be in [0, 1), got {}",
                self.bus.duplicate_ratio
            )));
        }
        if self.timing.discovery_interval_ms == 0 || self.timing.task_retry_ms == 0 {
            return Err(FleetError::Config(
                "tick periods must be greater than zero".to_string(),
            ));
        }

        let mut node_ids = HashSet::new();
        for node in &self.nodes {
            if node.capacity == 0 {
                return Err(FleetError::Config(format!(
                    "node {} must have a positive capacity",
                    node.id
                )));
            }
            if !node_ids.insert(node.id) {
                return Err(FleetError::Config(format!("duplicate node id {}", node.id)));
            }
        }

        let mut task_names = HashSet::new();
        for task in &self.tasks {
            if task.complexity == 0 {
                return Err(FleetError::Config(format!(
                    "task {} must have a positive complexity",
                    task.name
                )));
            }
            if task.name.trim().is_empty() {
                return Err(FleetError::Config("task names must not be empty".to_string()));
            }
            if !task_names.insert(task.name.as_str()) {
                return Err(FleetError::Config(format!(
                    "duplicate task name {}",
                    task.name
                )));
            }
        }

        Ok(())
    }

    /// Sum of all task complexities; conserved for the lifetime of a run.
    pub fn total_complexity(&self) -> u64 {
        self.tasks.iter().map(|t| u64::from(t.complexity)).sum()
    }
}

/// Read a bare delta value from a text file, falling back to [`DEFAULT_DELTA`].
pub fn load_delta(path: impl AsRef<Path>) -> f64 {
    let path = path.as_ref();
    match std::fs::read_to_string(path) {
        Ok(raw) => match raw.trim().parse::<f64>() {
            Ok(delta) if delta.is_finite() && delta >= 0.0 => delta,
            _ => {
                tracing::warn!(path = %path.display(), content = raw.trim(), "Invalid delta, using default");
                DEFAULT_DELTA
            }
        },
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Could not read delta, using default");
            DEFAULT_DELTA
        }
    }
}
