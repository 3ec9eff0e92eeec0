use serde::{Deserialize, Serialize};

use crate::model::{ContainerStack, Id, Metadata, Slot, StackError, SLOT_COUNT};

/// A container stack with exactly eight slots in fixed order: user changes,
/// quality changes, intent, quality, material, variant, definition changes,
/// definition.
///
/// Every non-definition slot holds either a typed instance container or the
/// empty sentinel for its type. The definition slot always holds a real
/// definition container. Structural mutation (add/insert/remove) is
/// rejected; slots are only ever replaced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileStack {
    pub stack: ContainerStack,
}

impl ProfileStack {
    pub fn new(id: impl Into<Id>, name: impl Into<String>, definition_id: impl Into<Id>) -> Self {
        let mut stack = ContainerStack::new(id, name);
        stack.containers = Slot::ALL
            .iter()
            .map(|slot| slot.empty_id().to_string())
            .collect();
        stack.containers[Slot::Definition.index()] = definition_id.into();
        Self { stack }
    }

    pub fn id(&self) -> &Id {
        &self.stack.id
    }

    pub fn name(&self) -> &str {
        &self.stack.name
    }

    pub fn metadata(&self) -> &Metadata {
        &self.stack.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.stack.metadata
    }

    pub fn slot(&self, slot: Slot) -> &Id {
        &self.stack.containers[slot.index()]
    }

    pub fn definition_id(&self) -> &Id {
        self.slot(Slot::Definition)
    }

    pub fn user_changes_id(&self) -> &Id {
        self.slot(Slot::UserChanges)
    }

    pub fn is_slot_empty(&self, slot: Slot) -> bool {
        self.slot(slot) == slot.empty_id()
    }

    /// Replace the container in a slot after validating its type tag.
    ///
    /// `type_tag` is the "type" metadata of the candidate container as known
    /// to the registry; the empty sentinel of the slot is always accepted.
    pub fn replace(
        &mut self,
        slot: Slot,
        container_id: impl Into<Id>,
        type_tag: &str,
    ) -> Result<(), StackError> {
        let container_id = container_id.into();
        let accepted = container_id == slot.empty_id()
            || type_tag == slot.expected_type().as_str();
        if !accepted {
            return Err(StackError::InvalidContainer {
                container_id,
                slot,
                expected: slot.expected_type(),
                actual: type_tag.to_string(),
            });
        }
        self.stack.containers[slot.index()] = container_id;
        Ok(())
    }

    /// Reset a slot to its empty sentinel.
    pub fn clear_slot(&mut self, slot: Slot) -> Result<(), StackError> {
        if slot == Slot::Definition {
            return Err(StackError::InvalidOperation(
                "the definition slot cannot be emptied".to_string(),
            ));
        }
        self.stack.containers[slot.index()] = slot.empty_id().to_string();
        Ok(())
    }

    pub fn add_container(&mut self, _container_id: &str) -> Result<(), StackError> {
        Err(StackError::InvalidOperation(
            "cannot add a container to a profile stack".to_string(),
        ))
    }

    pub fn insert_container(&mut self, _index: usize, _container_id: &str) -> Result<(), StackError> {
        Err(StackError::InvalidOperation(
            "cannot insert a container into a profile stack".to_string(),
        ))
    }

    pub fn remove_container(&mut self, _index: usize) -> Result<(), StackError> {
        Err(StackError::InvalidOperation(
            "cannot remove a container from a profile stack".to_string(),
        ))
    }

    /// Rebuild the slot list from a deserialized id list.
    ///
    /// The list is padded with sentinels, then each slot is checked against
    /// the expected type; a mismatched container is swapped with the first
    /// matching container elsewhere in the list, or replaced by the slot's
    /// sentinel. Fails only when no definition container is present.
    /// `lookup_tag` maps a container id to its "type" metadata, or None for
    /// unknown ids.
    pub fn assign_slots<F>(&mut self, ids: Vec<Id>, lookup_tag: F) -> Result<(), StackError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut candidates = ids;
        while candidates.len() < SLOT_COUNT {
            candidates.push(Slot::UserChanges.empty_id().to_string());
        }

        let mut slots: Vec<Id> = Vec::with_capacity(SLOT_COUNT);
        for slot in Slot::ALL {
            let expected = slot.expected_type().as_str();
            let in_place = candidates
                .get(slot.index())
                .filter(|id| lookup_tag(id).as_deref() == Some(expected))
                .cloned();
            let found = in_place.or_else(|| {
                // First container of the right type anywhere in the list.
                candidates
                    .iter()
                    .find(|id| {
                        !slots.contains(*id) && lookup_tag(id).as_deref() == Some(expected)
                    })
                    .cloned()
            });
            match found {
                Some(id) => slots.push(id),
                None if slot == Slot::Definition => {
                    return Err(StackError::InvalidContainerStack(self.stack.id.clone()));
                }
                None => slots.push(slot.empty_id().to_string()),
            }
        }
        self.stack.containers = slots;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ContainerType;
    use std::collections::HashMap;

    fn tag_table() -> HashMap<String, String> {
        let mut tags = HashMap::new();
        for slot in Slot::ALL {
            tags.insert(
                slot.empty_id().to_string(),
                slot.expected_type().as_str().to_string(),
            );
        }
        tags.insert("def_1".into(), "definition".into());
        tags.insert("quality_1".into(), "quality".into());
        tags.insert("material_1".into(), "material".into());
        tags.insert("user_1".into(), "user".into());
        tags
    }

    #[test]
    fn new_stack_is_all_sentinels_plus_definition() {
        let stack = ProfileStack::new("s", "S", "def_1");
        for slot in Slot::ALL {
            if slot == Slot::Definition {
                assert_eq!(stack.slot(slot), "def_1");
            } else {
                assert!(stack.is_slot_empty(slot));
            }
        }
    }

    #[test]
    fn replace_validates_type_tag() {
        let mut stack = ProfileStack::new("s", "S", "def_1");
        stack
            .replace(Slot::Quality, "quality_1", "quality")
            .unwrap();
        assert_eq!(stack.slot(Slot::Quality), "quality_1");

        let err = stack
            .replace(Slot::Quality, "material_1", "material")
            .unwrap_err();
        match err {
            StackError::InvalidContainer { expected, .. } => {
                assert_eq!(expected, ContainerType::Quality)
            }
            other => panic!("unexpected error {other:?}"),
        }
        // Sentinel is always accepted.
        stack
            .replace(Slot::Quality, Slot::Quality.empty_id(), "user")
            .unwrap();
        assert!(stack.is_slot_empty(Slot::Quality));
    }

    #[test]
    fn structural_mutation_is_rejected() {
        let mut stack = ProfileStack::new("s", "S", "def_1");
        assert!(matches!(
            stack.add_container("x"),
            Err(StackError::InvalidOperation(_))
        ));
        assert!(matches!(
            stack.insert_container(0, "x"),
            Err(StackError::InvalidOperation(_))
        ));
        assert!(matches!(
            stack.remove_container(0),
            Err(StackError::InvalidOperation(_))
        ));
    }

    #[test]
    fn assign_slots_moves_mismatched_containers_into_place() {
        let tags = tag_table();
        let lookup = |id: &str| tags.get(id).cloned();
        let mut stack = ProfileStack::new("s", "S", "def_1");
        // Quality and material are swapped; definition is last.
        let ids = vec![
            "user_1".to_string(),
            "material_1".to_string(),
            "quality_1".to_string(),
            "def_1".to_string(),
        ];
        stack.assign_slots(ids, lookup).unwrap();
        assert_eq!(stack.slot(Slot::UserChanges), "user_1");
        assert_eq!(stack.slot(Slot::Quality), "quality_1");
        assert_eq!(stack.slot(Slot::Material), "material_1");
        assert_eq!(stack.slot(Slot::Definition), "def_1");
        assert!(stack.is_slot_empty(Slot::Intent));
    }

    #[test]
    fn assign_slots_without_definition_fails() {
        let tags = tag_table();
        let lookup = |id: &str| tags.get(id).cloned();
        let mut stack = ProfileStack::new("s", "S", "def_1");
        let err = stack
            .assign_slots(vec!["user_1".to_string()], lookup)
            .unwrap_err();
        assert!(matches!(err, StackError::InvalidContainerStack(_)));
    }
}
