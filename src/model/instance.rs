use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::model::{ContainerType, Id, InstanceState, Metadata, SettingValue, Slot};

/// One configured setting inside an instance container: a property-name to
/// value map plus the user/default state flag.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingInstance {
    pub properties: HashMap<String, SettingValue>,
    #[serde(default)]
    pub state: InstanceState,
}

impl SettingInstance {
    pub fn with_value(value: SettingValue) -> Self {
        let mut properties = HashMap::new();
        properties.insert("value".to_string(), value);
        Self {
            properties,
            state: InstanceState::User,
        }
    }
}

/// A mutable, named bag of setting instances: user changes, quality
/// profiles, materials, variants and the like.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceContainer {
    pub id: Id,
    pub name: String,
    pub container_type: ContainerType,
    pub metadata: Metadata,
    pub settings: HashMap<String, SettingInstance>,
    #[serde(default)]
    pub read_only: bool,
}

impl InstanceContainer {
    pub fn new(
        id: impl Into<Id>,
        name: impl Into<String>,
        container_type: ContainerType,
    ) -> Self {
        let mut metadata = Metadata::new();
        metadata.set("type", container_type.as_str());
        metadata.set(
            "setting_version",
            crate::CURRENT_SETTING_VERSION as i64,
        );
        Self {
            id: id.into(),
            name: name.into(),
            container_type,
            metadata,
            settings: HashMap::new(),
            read_only: false,
        }
    }

    /// Build the read-only empty sentinel for a slot.
    pub fn empty_sentinel(slot: Slot) -> Self {
        let mut container = Self::new(slot.empty_id(), "empty", slot.expected_type());
        container.read_only = true;
        container
    }

    pub fn is_empty_sentinel(&self) -> bool {
        Slot::ALL.iter().any(|slot| slot.empty_id() == self.id)
    }

    pub fn has_property(&self, key: &str, property: &str) -> bool {
        self.property(key, property).is_some()
    }

    pub fn property(&self, key: &str, property: &str) -> Option<SettingValue> {
        let instance = self.settings.get(key)?;
        if property == "state" {
            return Some(SettingValue::Str(
                match instance.state {
                    InstanceState::Default => "default",
                    InstanceState::User => "user",
                }
                .to_string(),
            ));
        }
        instance.properties.get(property).cloned()
    }

    pub fn state(&self, key: &str) -> Option<InstanceState> {
        self.settings.get(key).map(|instance| instance.state)
    }

    /// Set a property of a setting, marking the setting as user-touched.
    ///
    /// Mutating a read-only container (shared profiles, sentinels) is
    /// rejected with a warning; the registry checks this up front but the
    /// container guards itself as well.
    pub fn set_property(
        &mut self,
        key: impl Into<String>,
        property: impl Into<String>,
        value: impl Into<SettingValue>,
    ) {
        if self.read_only {
            log::warn!(
                "ignoring property write on read-only container {}",
                self.id
            );
            return;
        }
        let instance = self.settings.entry(key.into()).or_default();
        instance.properties.insert(property.into(), value.into());
        instance.state = InstanceState::User;
    }

    pub fn remove_instance(&mut self, key: &str) -> bool {
        if self.read_only {
            log::warn!(
                "ignoring instance removal on read-only container {}",
                self.id
            );
            return false;
        }
        self.settings.remove(key).is_some()
    }

    pub fn clear(&mut self) {
        if self.read_only {
            return;
        }
        self.settings.clear();
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.settings.keys()
    }

    pub fn len(&self) -> usize {
        self.settings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.settings.is_empty()
    }

    pub fn setting_version(&self) -> u32 {
        self.metadata
            .get_int("setting_version")
            .map(|v| v as u32)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_property_marks_state_user() {
        let mut container = InstanceContainer::new("user_1", "User", ContainerType::User);
        container.set_property("layer_height", "value", 0.1);
        assert_eq!(container.state("layer_height"), Some(InstanceState::User));
        assert_eq!(
            container.property("layer_height", "value"),
            Some(SettingValue::Float(0.1))
        );
        assert_eq!(
            container.property("layer_height", "state"),
            Some(SettingValue::Str("user".into()))
        );
    }

    #[test]
    fn sentinels_are_read_only_and_inert() {
        let mut sentinel = InstanceContainer::empty_sentinel(Slot::Quality);
        assert!(sentinel.is_empty_sentinel());
        assert_eq!(sentinel.container_type, ContainerType::Quality);
        sentinel.set_property("layer_height", "value", 0.1);
        assert!(sentinel.is_empty());
    }

    #[test]
    fn property_miss_returns_none() {
        let container = InstanceContainer::new("q", "Quality", ContainerType::Quality);
        assert_eq!(container.property("layer_height", "value"), None);
        assert!(!container.has_property("layer_height", "value"));
    }
}
