use std::collections::HashMap;

use crate::model::Id;

/// A cross-extruder bundle of quality profiles activated as a unit: one
/// global quality container plus one per extruder position, tied together
/// by a quality type ("draft", "normal", "fine").
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QualityGroup {
    pub name: String,
    pub quality_type: String,
    pub node_for_global: Option<Id>,
    pub nodes_for_extruders: HashMap<usize, Id>,
    /// Whether every enabled extruder's variant/material combination offers
    /// this quality type.
    pub is_available: bool,
}

impl QualityGroup {
    pub fn new(name: impl Into<String>, quality_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            quality_type: quality_type.into(),
            ..Default::default()
        }
    }

    pub fn set_extruder_node(&mut self, position: usize, container_id: Id) {
        self.nodes_for_extruders.insert(position, container_id);
    }
}

/// A user-saved custom profile: like a quality group, but grounded on a
/// quality type and an intent category it was created under.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QualityChangesGroup {
    pub name: String,
    pub quality_type: String,
    pub intent_category: String,
    pub container_for_global: Option<Id>,
    pub containers_per_extruder: HashMap<usize, Id>,
    pub is_available: bool,
}

impl QualityChangesGroup {
    pub fn new(
        name: impl Into<String>,
        quality_type: impl Into<String>,
        intent_category: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            quality_type: quality_type.into(),
            intent_category: intent_category.into(),
            ..Default::default()
        }
    }

    /// A group whose underlying quality group vanished is coerced to the
    /// not-supported type with the default intent before activation.
    pub fn mark_not_supported(&mut self) {
        self.quality_type = "not_supported".to_string();
        self.intent_category = "default".to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_group_collects_extruder_nodes() {
        let mut group = QualityGroup::new("Normal", "normal");
        group.node_for_global = Some("normal_global".to_string());
        group.set_extruder_node(0, "normal_0".to_string());
        group.set_extruder_node(1, "normal_1".to_string());
        assert_eq!(group.nodes_for_extruders.len(), 2);
        assert!(!group.is_available);
    }

    #[test]
    fn not_supported_coercion_resets_intent() {
        let mut group = QualityChangesGroup::new("My Profile", "fine", "engineering");
        group.mark_not_supported();
        assert_eq!(group.quality_type, "not_supported");
        assert_eq!(group.intent_category, "default");
    }
}
