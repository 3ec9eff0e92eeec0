use serde::{Deserialize, Serialize};

use crate::model::{Id, ProfileStack, StackError};

/// The stack for one extruder train.
///
/// Every extruder stack has a next stack (its machine's global stack);
/// lookups that fall off its definition continue there.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtruderStack {
    pub profile: ProfileStack,
}

impl ExtruderStack {
    pub fn new(
        id: impl Into<Id>,
        name: impl Into<String>,
        definition_id: impl Into<Id>,
        position: usize,
    ) -> Self {
        let mut profile = ProfileStack::new(id, name, definition_id);
        profile.metadata_mut().set("type", "extruder_train");
        profile.metadata_mut().set("position", position as i64);
        profile.metadata_mut().set("enabled", "True");
        Self { profile }
    }

    pub fn id(&self) -> &Id {
        self.profile.id()
    }

    pub fn position(&self) -> usize {
        self.profile
            .metadata()
            .get_int("position")
            .unwrap_or(0)
            .max(0) as usize
    }

    pub fn is_enabled(&self) -> bool {
        self.profile.metadata().get_bool("enabled", true)
    }

    /// Returns true when the flag actually changed.
    pub fn set_enabled(&mut self, enabled: bool) -> bool {
        if self.is_enabled() == enabled {
            return false;
        }
        self.profile
            .metadata_mut()
            .set("enabled", if enabled { "True" } else { "False" });
        true
    }

    /// Wire this extruder to its machine. The machine id is recorded in
    /// metadata so the registry can re-associate stacks after a reload.
    pub fn set_next_stack(&mut self, global_stack_id: impl Into<Id>) {
        let global_stack_id = global_stack_id.into();
        self.profile.metadata_mut().set("machine", global_stack_id.clone());
        self.profile.stack.next_stack = Some(global_stack_id);
    }

    pub fn next_stack(&self) -> Option<&Id> {
        self.profile.stack.next_stack.as_ref()
    }

    pub fn require_next_stack(&self) -> Result<&Id, StackError> {
        self.next_stack()
            .ok_or_else(|| StackError::NoGlobalStack(self.id().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_extruder_is_enabled_at_its_position() {
        let extruder = ExtruderStack::new("ext_0", "Extruder 1", "fdmextruder", 0);
        assert_eq!(extruder.position(), 0);
        assert!(extruder.is_enabled());
        assert!(extruder.next_stack().is_none());
        assert!(matches!(
            extruder.require_next_stack(),
            Err(StackError::NoGlobalStack(_))
        ));
    }

    #[test]
    fn next_stack_is_mirrored_into_metadata() {
        let mut extruder = ExtruderStack::new("ext_0", "Extruder 1", "fdmextruder", 0);
        extruder.set_next_stack("printer_1");
        assert_eq!(extruder.next_stack(), Some(&"printer_1".to_string()));
        assert_eq!(
            extruder.profile.metadata().get_str("machine").as_deref(),
            Some("printer_1")
        );
    }

    #[test]
    fn enabling_reports_changes_only() {
        let mut extruder = ExtruderStack::new("ext_0", "Extruder 1", "fdmextruder", 0);
        assert!(!extruder.set_enabled(true));
        assert!(extruder.set_enabled(false));
        assert!(!extruder.is_enabled());
    }
}
