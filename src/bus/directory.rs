use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::bus::address::{EntityId, NodeId, TaskId};
use crate::error::{FleetError, Result};

/// Service type an entity registers under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceTag {
    /// Compute nodes that execute tasks.
    TaskExecuting,
    /// Tasks looking for (or holding) a node.
    Tasks,
}

impl std::fmt::Display for ServiceTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceTag::TaskExecuting => write!(f, "task-executing"),
            ServiceTag::Tasks => write!(f, "tasks"),
        }
    }
}

/// Registry used by tasks and nodes to discover each other.
#[derive(Debug)]
pub struct Directory {
    entries: DashMap<EntityId, ServiceTag>,
    available: AtomicBool,
}

impl Default for Directory {
    fn default() -> Self {
        Self::new()
    }
}

impl Directory {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }

    pub fn register(&self, id: EntityId, tag: ServiceTag) {
        tracing::debug!(entity = %id, service = %tag, "Registered in directory");
        self.entries.insert(id, tag);
    }

    pub fn deregister(&self, id: &EntityId) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Toggle availability. While unavailable every search fails.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// All entities currently registered under `tag`, in ascending id order.
    pub fn search(&self, tag: ServiceTag) -> Result<Vec<EntityId>> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(FleetError::DiscoveryFailure(format!(
                "directory unavailable while searching for {}",
                tag
            )));
        }

        let mut found: Vec<EntityId> = self
            .entries
            .iter()
            .filter(|entry| *entry.value() == tag)
            .map(|entry| entry.key().clone())
            .collect();
        found.sort();
        Ok(found)
    }

    pub fn search_nodes(&self) -> Result<Vec<NodeId>> {
        Ok(self
            .search(ServiceTag::TaskExecuting)?
            .iter()
            .filter_map(EntityId::as_node)
            .collect())
    }

    pub fn search_tasks(&self) -> Result<Vec<TaskId>> {
        Ok(self
            .search(ServiceTag::Tasks)?
            .into_iter()
            .filter_map(|id| match id {
                EntityId::Task(task) => Some(task),
                EntityId::Node(_) => None,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_filters_by_tag_and_sorts() {
        let directory = Directory::new();
        directory.register(EntityId::Node(3), ServiceTag::TaskExecuting);
        directory.register(EntityId::Node(1), ServiceTag::TaskExecuting);
        directory.register(EntityId::Task(TaskId::new("b")), ServiceTag::Tasks);
        directory.register(EntityId::Task(TaskId::new("a")), ServiceTag::Tasks);

        assert_eq!(directory.search_nodes().unwrap(), vec![1, 3]);
        assert_eq!(
            directory.search_tasks().unwrap(),
            vec![TaskId::new("a"), TaskId::new("b")]
        );
    }

    #[test]
    fn deregistered_entities_disappear() {
        let directory = Directory::new();
        directory.register(EntityId::Node(1), ServiceTag::TaskExecuting);
        assert!(directory.deregister(&EntityId::Node(1)));
        assert!(!directory.deregister(&EntityId::Node(1)));
        assert!(directory.search_nodes().unwrap().is_empty());
    }

    #[test]
    fn unavailable_directory_fails_searches() {
        let directory = Directory::new();
        directory.register(EntityId::Node(1), ServiceTag::TaskExecuting);
        directory.set_available(false);

        let err = directory.search_nodes().unwrap_err();
        assert!(matches!(err, FleetError::DiscoveryFailure(_)));

        directory.set_available(true);
        assert_eq!(directory.search_nodes().unwrap(), vec![1]);
    }
}
