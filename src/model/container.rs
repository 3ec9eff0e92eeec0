use serde::{Deserialize, Serialize};

use crate::model::{DefinitionContainer, Id, InstanceContainer, Metadata, Slot};

/// A container in the registry arena: either a read-only definition carrying
/// the settings schema, or an instance container carrying overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Container {
    Definition(DefinitionContainer),
    Instance(InstanceContainer),
}

impl Container {
    pub fn id(&self) -> &Id {
        match self {
            Container::Definition(d) => &d.id,
            Container::Instance(i) => &i.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Container::Definition(d) => &d.name,
            Container::Instance(i) => &i.name,
        }
    }

    pub fn metadata(&self) -> &Metadata {
        match self {
            Container::Definition(d) => &d.metadata,
            Container::Instance(i) => &i.metadata,
        }
    }

    pub fn metadata_mut(&mut self) -> &mut Metadata {
        match self {
            Container::Definition(d) => &mut d.metadata,
            Container::Instance(i) => &mut i.metadata,
        }
    }

    /// The "type" metadata tag ("definition", "quality", "user", ...).
    pub fn type_tag(&self) -> String {
        match self {
            Container::Definition(_) => "definition".to_string(),
            Container::Instance(i) => i.container_type.as_str().to_string(),
        }
    }

    pub fn is_read_only(&self) -> bool {
        match self {
            Container::Definition(_) => true,
            Container::Instance(i) => i.read_only,
        }
    }

    pub fn as_definition(&self) -> Option<&DefinitionContainer> {
        match self {
            Container::Definition(d) => Some(d),
            Container::Instance(_) => None,
        }
    }

    pub fn as_instance(&self) -> Option<&InstanceContainer> {
        match self {
            Container::Instance(i) => Some(i),
            Container::Definition(_) => None,
        }
    }

    pub fn as_instance_mut(&mut self) -> Option<&mut InstanceContainer> {
        match self {
            Container::Instance(i) => Some(i),
            Container::Definition(_) => None,
        }
    }

    pub fn is_empty_sentinel(&self) -> bool {
        match self {
            Container::Instance(i) => i.is_empty_sentinel(),
            Container::Definition(_) => false,
        }
    }
}

/// The per-slot empty sentinels shared by every stack; registered once by
/// the registry at startup.
pub fn empty_sentinels() -> Vec<InstanceContainer> {
    Slot::ALL
        .iter()
        .filter(|slot| **slot != Slot::Definition)
        .map(|slot| InstanceContainer::empty_sentinel(*slot))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seven_sentinels_one_per_non_definition_slot() {
        let sentinels = empty_sentinels();
        assert_eq!(sentinels.len(), 7);
        assert!(sentinels.iter().all(|c| c.read_only));
        assert!(!sentinels.iter().any(|c| c.id == Slot::Definition.empty_id()));
    }
}
