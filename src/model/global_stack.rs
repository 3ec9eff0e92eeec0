use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::model::{Id, ProfileStack, StackError};

/// How a machine is configured to be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    NotConnected = 0,
    UsbConnection = 1,
    NetworkConnection = 2,
    CloudConnection = 3,
}

impl ConnectionType {
    pub fn from_int(value: i64) -> Option<Self> {
        Some(match value {
            0 => ConnectionType::NotConnected,
            1 => ConnectionType::UsbConnection,
            2 => ConnectionType::NetworkConnection,
            3 => ConnectionType::CloudConnection,
            _ => return None,
        })
    }
}

/// The stack for the printer as a whole: the eight profile slots plus the
/// extruder stacks hanging off it.
///
/// Every global stack belongs to a group identified by `group_id`; clones of
/// the same physical printer (a cluster) share it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalStack {
    pub profile: ProfileStack,
    /// position -> extruder stack id; positions must stay contiguous from 0.
    pub extruders: BTreeMap<usize, Id>,
}

impl GlobalStack {
    pub fn new(id: impl Into<Id>, name: impl Into<String>, definition_id: impl Into<Id>) -> Self {
        let mut profile = ProfileStack::new(id, name, definition_id);
        profile.metadata_mut().set("type", "machine");
        profile
            .metadata_mut()
            .set("group_id", Uuid::new_v4().to_string());
        Self {
            profile,
            extruders: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> &Id {
        self.profile.id()
    }

    /// The display name, preferring the cluster's group name when present.
    pub fn name(&self) -> String {
        self.profile
            .metadata()
            .get_str("group_name")
            .unwrap_or_else(|| self.profile.name().to_string())
    }

    pub fn group_id(&self) -> String {
        self.profile.metadata().get_str_or("group_id", "")
    }

    /// The number of extruder trains the definition declares, which caps how
    /// many extruders may ever be attached. Stacks that never copied the
    /// trains table from their definition are left uncapped.
    pub fn max_extruder_count(&self) -> usize {
        match self.profile.metadata().get("machine_extruder_trains") {
            Some(crate::model::SettingValue::Map(trains)) => trains.len().max(1),
            _ => usize::MAX,
        }
    }

    pub fn add_extruder(&mut self, position: usize, extruder_id: impl Into<Id>) -> Result<(), StackError> {
        let extruder_id = extruder_id.into();
        let max = self.max_extruder_count();
        if position >= max {
            return Err(StackError::TooManyExtruders {
                stack_id: self.id().clone(),
                max,
            });
        }
        if self.extruders.values().any(|id| *id == extruder_id) {
            log::warn!(
                "extruder {} has already been added to stack {}",
                extruder_id,
                self.id()
            );
            return Ok(());
        }
        self.extruders.insert(position, extruder_id);
        Ok(())
    }

    /// Extruder ids ordered by position, truncated to `machine_extruder_count`.
    pub fn extruder_ids(&self, machine_extruder_count: usize) -> Vec<Id> {
        self.extruders
            .values()
            .take(machine_extruder_count)
            .cloned()
            .collect()
    }

    /// Extruder positions must form the contiguous range 0..count.
    pub fn is_valid(&self, machine_extruder_count: usize) -> bool {
        (0..machine_extruder_count).all(|position| self.extruders.contains_key(&position))
    }

    pub fn configured_connection_types(&self) -> Vec<ConnectionType> {
        self.profile
            .metadata()
            .get_str_or("connection_type", "")
            .split(',')
            .filter_map(|part| part.trim().parse::<i64>().ok())
            .filter_map(ConnectionType::from_int)
            .collect()
    }

    pub fn add_configured_connection_type(&mut self, connection_type: ConnectionType) {
        let mut current = self.configured_connection_types();
        if !current.contains(&connection_type) {
            current.push(connection_type);
            self.store_connection_types(&current);
        }
    }

    pub fn remove_configured_connection_type(&mut self, connection_type: ConnectionType) {
        let current: Vec<ConnectionType> = self
            .configured_connection_types()
            .into_iter()
            .filter(|c| *c != connection_type)
            .collect();
        self.store_connection_types(&current);
    }

    pub fn has_remote_connection(&self) -> bool {
        self.configured_connection_types().iter().any(|c| {
            matches!(
                c,
                ConnectionType::NetworkConnection | ConnectionType::CloudConnection
            )
        })
    }

    fn store_connection_types(&mut self, types: &[ConnectionType]) {
        let serialized = types
            .iter()
            .map(|c| (*c as i64).to_string())
            .collect::<Vec<_>>()
            .join(",");
        self.profile.metadata_mut().set("connection_type", serialized);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SettingValue;
    use std::collections::HashMap;

    fn machine_with_trains(count: usize) -> GlobalStack {
        let mut stack = GlobalStack::new("printer_1", "Printer", "def_1");
        let trains: HashMap<String, SettingValue> = (0..count)
            .map(|i| (i.to_string(), SettingValue::Str(format!("ext_def_{i}"))))
            .collect();
        stack
            .profile
            .metadata_mut()
            .set("machine_extruder_trains", SettingValue::Map(trains));
        stack
    }

    #[test]
    fn fresh_stack_gets_a_group_id() {
        let a = GlobalStack::new("a", "A", "def");
        let b = GlobalStack::new("b", "B", "def");
        assert!(!a.group_id().is_empty());
        assert_ne!(a.group_id(), b.group_id());
    }

    #[test]
    fn extruder_positions_capped_by_trains() {
        let mut stack = machine_with_trains(2);
        stack.add_extruder(0, "ext_0").unwrap();
        stack.add_extruder(1, "ext_1").unwrap();
        assert!(matches!(
            stack.add_extruder(2, "ext_2"),
            Err(StackError::TooManyExtruders { .. })
        ));
        assert!(stack.is_valid(2));
        assert!(!stack.is_valid(3));
    }

    #[test]
    fn duplicate_extruder_is_ignored() {
        let mut stack = machine_with_trains(2);
        stack.add_extruder(0, "ext_0").unwrap();
        stack.add_extruder(1, "ext_0").unwrap();
        assert_eq!(stack.extruders.len(), 1);
    }

    #[test]
    fn contiguity_detects_gaps() {
        let mut stack = machine_with_trains(3);
        stack.add_extruder(0, "ext_0").unwrap();
        stack.add_extruder(2, "ext_2").unwrap();
        assert!(!stack.is_valid(3));
        assert!(stack.is_valid(1));
    }

    #[test]
    fn connection_types_round_trip_through_metadata() {
        let mut stack = machine_with_trains(1);
        assert!(!stack.has_remote_connection());
        stack.add_configured_connection_type(ConnectionType::CloudConnection);
        stack.add_configured_connection_type(ConnectionType::UsbConnection);
        assert_eq!(
            stack.configured_connection_types(),
            vec![ConnectionType::CloudConnection, ConnectionType::UsbConnection]
        );
        assert!(stack.has_remote_connection());
        stack.remove_configured_connection_type(ConnectionType::CloudConnection);
        assert!(!stack.has_remote_connection());
    }
}
