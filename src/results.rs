use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::compute::NodeReport;
use crate::error::{FleetError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub name: String,
    pub complexity: u32,
}

/// Final state of one node, keyed by node name in the results file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub capacity: u32,
    pub total_time: f64,
    pub tasks: Vec<TaskRecord>,
    pub finished_at: DateTime<Utc>,
}

impl NodeRecord {
    pub fn from_report(report: &NodeReport, finished_at: DateTime<Utc>) -> Self {
        Self {
            capacity: report.capacity,
            total_time: report.total_time,
            tasks: report
                .tasks
                .iter()
                .map(|t| TaskRecord {
                    name: t.id.to_string(),
                    complexity: t.complexity,
                })
                .collect(),
            finished_at,
        }
    }
}

/// JSON results file shared by every node of a run.
///
/// The file is truncated to `{}` when a run starts; each finishing node then
/// merges its own entry into whatever is already there.
#[derive(Debug, Clone)]
pub struct ResultsStore {
    path: PathBuf,
}

impl ResultsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn reset(&self) -> Result<()> {
        std::fs::write(&self.path, "{}")?;
        tracing::debug!(path = %self.path.display(), "Results file reset");
        Ok(())
    }

    /// Add or replace one entry per report, keeping entries of other nodes.
    pub fn merge(&self, reports: &[NodeReport]) -> Result<()> {
        let mut entries = self.read_object()?;
        let finished_at = Utc::now();
        for report in reports {
            let record = NodeRecord::from_report(report, finished_at);
            entries.insert(report.name.clone(), serde_json::to_value(record)?);
        }

        let json = serde_json::to_string_pretty(&Value::Object(entries))?;
        std::fs::write(&self.path, json)?;
        tracing::info!(path = %self.path.display(), nodes = reports.len(), "Results written");
        Ok(())
    }

    pub fn load(&self) -> Result<BTreeMap<String, NodeRecord>> {
        let entries = self.read_object()?;
        let mut records = BTreeMap::new();
        for (name, value) in entries {
            records.insert(name, serde_json::from_value(value)?);
        }
        Ok(records)
    }

    fn read_object(&self) -> Result<Map<String, Value>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(e) => return Err(e.into()),
        };
        if raw.trim().is_empty() {
            return Ok(Map::new());
        }

        match serde_json::from_str(&raw)? {
            Value::Object(entries) => Ok(entries),
            _ => Err(FleetError::Config(format!(
                "results file {} does not hold a JSON object",
                self.path.display()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancing::AssignedTask;
    use crate::bus::TaskId;
    use crate::compute::NodePhase;
    use tempfile::TempDir;

    fn report(id: u64, name: &str, tasks: &[(&str, u32)]) -> NodeReport {
        let capacity = 100;
        NodeReport {
            id,
            name: name.to_string(),
            capacity,
            total_time: tasks.iter().map(|(_, c)| f64::from(*c) / 100.0).sum(),
            tasks: tasks
                .iter()
                .map(|&(task, complexity)| AssignedTask {
                    id: TaskId::new(task),
                    complexity,
                })
                .collect(),
            phase: NodePhase::Converged,
            partner: None,
            settled: true,
            unchanged_rounds: 0,
            rounds: 1,
            migrations_out: 0,
            migrations_in: 0,
        }
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let store = ResultsStore::new(dir.path().join("results.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn merge_keeps_other_entries() {
        let dir = TempDir::new().unwrap();
        let store = ResultsStore::new(dir.path().join("results.json"));
        store.reset().unwrap();

        store.merge(&[report(1, "alpha", &[("t1", 100)])]).unwrap();
        store
            .merge(&[report(2, "beta", &[("t2", 50), ("t3", 150)])])
            .unwrap();

        let records = store.load().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records["alpha"].tasks[0].name, "t1");
        assert_eq!(records["beta"].tasks.len(), 2);
        assert!((records["beta"].total_time - 2.0).abs() < 1e-9);
    }

    #[test]
    fn merge_replaces_an_existing_node_entry() {
        let dir = TempDir::new().unwrap();
        let store = ResultsStore::new(dir.path().join("results.json"));

        store.merge(&[report(1, "alpha", &[("t1", 100)])]).unwrap();
        store.merge(&[report(1, "alpha", &[])]).unwrap();

        let records = store.load().unwrap();
        assert!(records["alpha"].tasks.is_empty());
        assert_eq!(records["alpha"].total_time, 0.0);
    }

    #[test]
    fn reset_truncates_previous_run() {
        let dir = TempDir::new().unwrap();
        let store = ResultsStore::new(dir.path().join("results.json"));
        store.merge(&[report(1, "alpha", &[("t1", 100)])]).unwrap();

        store.reset().unwrap();
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn non_object_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("results.json");
        std::fs::write(&path, "[1, 2]").unwrap();

        let err = ResultsStore::new(path).load().unwrap_err();
        assert!(matches!(err, FleetError::Config(_)));
    }
}
