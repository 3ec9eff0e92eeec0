use serde::{Deserialize, Serialize};

use crate::model::{Id, Metadata};

/// An ordered list of container ids, index 0 = highest precedence.
///
/// The generic stack places no constraints on its composition; the typed
/// profile stack built on top of it enforces the eight-slot discipline.
/// Containers are referenced by id and owned by the registry arena.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerStack {
    pub id: Id,
    pub name: String,
    pub metadata: Metadata,
    pub containers: Vec<Id>,
    /// Stack consulted when a lookup falls off the bottom of this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_stack: Option<Id>,
}

impl ContainerStack {
    pub fn new(id: impl Into<Id>, name: impl Into<String>) -> Self {
        let mut metadata = Metadata::new();
        metadata.set(
            "setting_version",
            crate::CURRENT_SETTING_VERSION as i64,
        );
        Self {
            id: id.into(),
            name: name.into(),
            metadata,
            containers: Vec::new(),
            next_stack: None,
        }
    }

    pub fn add_container(&mut self, container_id: impl Into<Id>) {
        self.containers.push(container_id.into());
    }

    pub fn insert_container(&mut self, index: usize, container_id: impl Into<Id>) {
        let index = index.min(self.containers.len());
        self.containers.insert(index, container_id.into());
    }

    pub fn remove_container(&mut self, index: usize) -> Option<Id> {
        if index < self.containers.len() {
            Some(self.containers.remove(index))
        } else {
            None
        }
    }

    pub fn replace_container(&mut self, index: usize, container_id: impl Into<Id>) -> bool {
        match self.containers.get_mut(index) {
            Some(slot) => {
                *slot = container_id.into();
                true
            }
            None => false,
        }
    }

    pub fn container_at(&self, index: usize) -> Option<&Id> {
        self.containers.get(index)
    }

    pub fn type_tag(&self) -> Option<String> {
        self.metadata.get_str("type")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generic_stack_allows_structural_mutation() {
        let mut stack = ContainerStack::new("s1", "Stack");
        stack.add_container("a");
        stack.add_container("c");
        stack.insert_container(1, "b");
        assert_eq!(stack.containers, vec!["a", "b", "c"]);
        assert_eq!(stack.remove_container(0), Some("a".to_string()));
        assert!(stack.replace_container(0, "b2"));
        assert_eq!(stack.containers, vec!["b2", "c"]);
    }
}
