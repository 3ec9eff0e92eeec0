use parking_lot::Mutex;
use std::collections::BTreeSet;

use crate::logic::quality::{QualityChangesGroup, QualityGroup};
use crate::logic::resolve::{PropertyContext, SettingLookup};
use crate::logic::stack_builder::StackBuilder;
use crate::logic::tree::{ContainerTree, EMPTY_VARIANT_NAME};
use crate::model::{
    Container, ContainerType, GlobalStack, Id, InstanceContainer, SettingValue, Slot,
};
use crate::signals::Event;
use crate::store::registry::ContainerRegistry;
use std::collections::HashMap;

/// Collector for containers that failed validation; the UI renders its
/// contents as one configuration-error notification.
#[derive(Debug, Default)]
pub struct ConfigurationErrorMessage {
    faulty: Mutex<BTreeSet<Id>>,
}

impl ConfigurationErrorMessage {
    pub fn add_faulty_container(&self, id: impl Into<Id>) {
        let id = id.into();
        log::warn!("configuration error recorded for {}", id);
        self.faulty.lock().insert(id);
    }

    pub fn faulty_containers(&self) -> Vec<Id> {
        self.faulty.lock().iter().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.faulty.lock().is_empty()
    }
}

/// A configuration pushed from a remote printer: what is loaded in each
/// extruder slot right now.
#[derive(Debug, Clone, Default)]
pub struct RemoteConfiguration {
    pub extruders: Vec<RemoteExtruderConfiguration>,
}

#[derive(Debug, Clone, Default)]
pub struct RemoteExtruderConfiguration {
    pub variant_name: Option<String>,
    pub material_base_file: Option<String>,
}

/// Transactional coordinator for every state change of the active machine
/// configuration.
///
/// All mutation funnels through here so that observers see atomic
/// transitions: each public operation runs inside one signal-compression
/// batch and leaves the configuration self-consistent. Illegal transitions
/// log a warning and leave state unchanged; nothing here panics or throws
/// across the public surface.
pub struct MachineManager {
    pub registry: ContainerRegistry,
    pub tree: ContainerTree,
    pub errors: ConfigurationErrorMessage,
    active_stack_id: Option<Id>,
    default_extruder_position: usize,
    active_extruder_index: usize,
}

impl MachineManager {
    pub fn new(registry: ContainerRegistry) -> Self {
        Self {
            registry,
            tree: ContainerTree::new(),
            errors: ConfigurationErrorMessage::default(),
            active_stack_id: None,
            default_extruder_position: 0,
            active_extruder_index: 0,
        }
    }

    // ------------------------------------------------------------------
    // Active machine

    pub fn active_machine_id(&self) -> Option<&str> {
        self.active_stack_id.as_deref()
    }

    pub fn active_machine(&self) -> Option<&GlobalStack> {
        self.active_stack_id
            .as_ref()
            .and_then(|id| self.registry.global_stack(id))
    }

    pub fn default_extruder_position(&self) -> usize {
        self.default_extruder_position
    }

    pub fn active_extruder_index(&self) -> usize {
        self.active_extruder_index
    }

    fn lookup(&self) -> SettingLookup<'_> {
        SettingLookup::with_default_extruder(&self.registry, self.default_extruder_position)
    }

    /// Create a machine from a definition and make it active.
    pub fn add_machine(&mut self, definition_id: &str, name: Option<&str>) -> bool {
        let fallback_name = self
            .registry
            .definition(definition_id)
            .map(|d| d.name.clone())
            .unwrap_or_else(|| definition_id.to_string());
        let name = name.unwrap_or(&fallback_name).to_string();
        // Build the tree node first so preferred profiles are known.
        if self.registry.definition(definition_id).is_some() {
            self.tree.machine(&self.registry, definition_id);
        }
        match StackBuilder::create_machine(&mut self.registry, &name, definition_id) {
            Some(new_id) => {
                self.set_active_machine(Some(&new_id));
                self.active_stack_id.as_deref() == Some(new_id.as_str())
            }
            None => {
                self.errors.add_faulty_container(definition_id);
                false
            }
        }
    }

    /// Switch the active machine, or clear it with None. A stack that fails
    /// validation is recorded as faulty and not activated.
    pub fn set_active_machine(&mut self, stack_id: Option<&str>) {
        let bus = self.registry.bus();
        let _batch = bus.batch();

        let Some(stack_id) = stack_id else {
            self.active_stack_id = None;
            bus.emit(Event::GlobalContainerChanged);
            return;
        };
        if self.registry.global_stack(stack_id).is_none() {
            log::warn!("cannot activate unknown machine {}", stack_id);
            return;
        }
        let stack_id = stack_id.to_string();

        // Legacy single-extrusion machines may lack their extruder stack.
        if StackBuilder::repair_single_extrusion_machine(
            &mut self.registry,
            &mut self.tree,
            &stack_id,
        )
        .is_some()
        {
            self.move_settable_values_to_extruders(&stack_id);
        }

        let Some(global) = self.registry.global_stack(&stack_id) else {
            return;
        };
        let machine_extruder_count = self.lookup().machine_extruder_count(global);
        if !global.is_valid(machine_extruder_count) {
            log::warn!("global stack {} is not valid, marking it faulty", stack_id);
            self.errors.add_faulty_container(stack_id);
            return;
        }

        self.active_stack_id = Some(stack_id.clone());
        self.update_number_extruders_enabled();
        self.update_default_extruder();
        self.active_extruder_index = self.default_extruder_position;
        self.validate_variants_and_materials();
        bus.emit(Event::GlobalContainerChanged);
    }

    pub fn rename_machine(&mut self, stack_id: &str, new_name: &str) {
        let new_name = self.registry.unique_name(new_name);
        if let Some(global) = self.registry.global_stack_mut(stack_id) {
            global.profile.stack.name = new_name.clone();
            global.profile.metadata_mut().set("group_name", new_name);
            self.registry
                .bus()
                .emit(Event::ContainerMetadataChanged(stack_id.to_string()));
        } else {
            log::warn!("cannot rename unknown machine {}", stack_id);
        }
    }

    /// Remove a machine with its extruders and their private containers;
    /// activates another machine when the active one is removed.
    pub fn remove_machine(&mut self, stack_id: &str) {
        let Some(global) = self.registry.global_stack(stack_id) else {
            log::warn!("cannot remove unknown machine {}", stack_id);
            return;
        };
        let mut to_remove: Vec<Id> = Vec::new();
        for extruder_id in global.extruders.values() {
            if let Some(extruder) = self.registry.extruder_stack(extruder_id) {
                to_remove.push(extruder.profile.user_changes_id().clone());
                to_remove.push(extruder.profile.slot(Slot::DefinitionChanges).clone());
            }
            to_remove.push(extruder_id.clone());
        }
        to_remove.push(global.profile.user_changes_id().clone());
        to_remove.push(global.profile.slot(Slot::DefinitionChanges).clone());
        to_remove.push(stack_id.to_string());

        let bus = self.registry.bus();
        let _batch = bus.batch();
        for id in to_remove {
            if id != Slot::UserChanges.empty_id() && !id.starts_with("empty") {
                self.registry.remove_container(&id);
            }
        }
        if self.active_stack_id.as_deref() == Some(stack_id) {
            let next = self
                .registry
                .global_stacks()
                .map(|g| g.id().clone())
                .next();
            self.active_stack_id = None;
            match next {
                Some(id) => self.set_active_machine(Some(&id)),
                None => self.set_active_machine(None),
            }
        }
    }

    // ------------------------------------------------------------------
    // Registry pass-through

    /// Add a container through the coordinator so loaded container-tree
    /// subtrees stay current.
    pub fn register_container(&mut self, container: Container) -> bool {
        let id = container.id().clone();
        if !self.registry.add_container(container) {
            return false;
        }
        self.tree.on_container_added(&self.registry, &id);
        true
    }

    /// Remove a container through the coordinator; tree nodes fall back to
    /// less specific siblings where possible.
    pub fn deregister_container(&mut self, id: &str) -> bool {
        let metadata = self.registry.container(id).map(|c| c.metadata().clone());
        if !self.registry.remove_container(id) {
            return false;
        }
        if let Some(metadata) = metadata {
            self.tree.on_container_removed(&self.registry, id, &metadata);
        }
        true
    }

    // ------------------------------------------------------------------
    // Property access

    /// Effective value of a setting on the active machine.
    pub fn active_property(&self, key: &str, property: &str) -> Option<SettingValue> {
        let global = self.active_machine()?;
        let mut ctx = PropertyContext::default();
        self.lookup().global_property(global, key, property, &mut ctx)
    }

    /// Write a user override on the active global stack.
    pub fn set_setting(&mut self, key: &str, value: impl Into<SettingValue>) {
        let Some(stack_id) = self.active_stack_id.clone() else {
            log::warn!("no active machine to set {} on", key);
            return;
        };
        let user_id = self.ensure_user_container(&stack_id);
        self.registry.set_property(&user_id, key, "value", value);
    }

    /// Write a user override on one extruder of the active machine.
    pub fn set_extruder_setting(
        &mut self,
        position: usize,
        key: &str,
        value: impl Into<SettingValue>,
    ) {
        let Some(extruder_id) = self.extruder_id_at(position) else {
            log::warn!("no extruder at position {}", position);
            return;
        };
        let user_id = self.ensure_user_container(&extruder_id);
        self.registry.set_property(&user_id, key, "value", value);
    }

    /// Apply one setting to the user changes of every extruder stack.
    pub fn set_setting_for_all_extruders(
        &mut self,
        key: &str,
        property: &str,
        value: SettingValue,
    ) {
        let bus = self.registry.bus();
        let _batch = bus.batch();
        for extruder_id in self.extruder_ids() {
            let user_id = self.ensure_user_container(&extruder_id);
            self.registry
                .set_property(&user_id, key, property, value.clone());
        }
    }

    /// Remove one key from the user changes of the global stack and every
    /// extruder stack.
    pub fn clear_user_setting_all_stacks(&mut self, key: &str) {
        let bus = self.registry.bus();
        let _batch = bus.batch();
        let mut user_ids: Vec<Id> = Vec::new();
        if let Some(global) = self.active_machine() {
            user_ids.push(global.profile.user_changes_id().clone());
        }
        for extruder_id in self.extruder_ids() {
            if let Some(extruder) = self.registry.extruder_stack(&extruder_id) {
                user_ids.push(extruder.profile.user_changes_id().clone());
            }
        }
        for user_id in user_ids {
            self.registry.remove_instance_value(&user_id, key);
        }
    }

    /// Number of ad-hoc user overrides across the active machine's stacks.
    pub fn num_user_settings(&self) -> usize {
        let mut count = 0;
        if let Some(global) = self.active_machine() {
            count += self
                .registry
                .instance(global.profile.user_changes_id())
                .map(|c| c.len())
                .unwrap_or(0);
        }
        for extruder_id in self.extruder_ids() {
            if let Some(extruder) = self.registry.extruder_stack(&extruder_id) {
                count += self
                    .registry
                    .instance(extruder.profile.user_changes_id())
                    .map(|c| c.len())
                    .unwrap_or(0);
            }
        }
        count
    }

    pub fn has_user_settings(&self) -> bool {
        self.num_user_settings() > 0
    }

    /// The user-changes slot starts as the shared sentinel; materialize a
    /// private container on first write.
    fn ensure_user_container(&mut self, stack_id: &str) -> Id {
        let profile_user_id = match self.registry.stack(stack_id) {
            Some(crate::store::registry::StackEntry::Global(s)) => {
                s.profile.user_changes_id().clone()
            }
            Some(crate::store::registry::StackEntry::Extruder(s)) => {
                s.profile.user_changes_id().clone()
            }
            _ => return Slot::UserChanges.empty_id().to_string(),
        };
        if profile_user_id != Slot::UserChanges.empty_id() {
            return profile_user_id;
        }
        let user_id = format!("{}_user", stack_id);
        let mut container =
            InstanceContainer::new(user_id.clone(), user_id.clone(), ContainerType::User);
        container.metadata.set("machine", stack_id);
        self.registry.add_container(Container::Instance(container));
        self.replace_slot(stack_id, Slot::UserChanges, &user_id);
        user_id
    }

    /// Replace one slot on a stack, emitting containersChanged. Type
    /// mismatches are logged and leave the slot unchanged.
    fn replace_slot(&mut self, stack_id: &str, slot: Slot, container_id: &str) -> bool {
        let type_tag = self.registry.type_tag(container_id).unwrap_or_default();
        let result = match self.registry.profile_stack_mut(stack_id) {
            Some(profile) => profile.replace(slot, container_id, &type_tag),
            None => return false,
        };
        match result {
            Ok(()) => {
                self.registry
                    .bus()
                    .emit(Event::ContainersChanged(stack_id.to_string()));
                true
            }
            Err(err) => {
                log::warn!("refusing slot change on {}: {}", stack_id, err);
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Extruder management

    pub fn extruder_ids(&self) -> Vec<Id> {
        let Some(global) = self.active_machine() else {
            return Vec::new();
        };
        let count = self.lookup().machine_extruder_count(global);
        global.extruder_ids(count)
    }

    pub fn extruder_id_at(&self, position: usize) -> Option<Id> {
        self.active_machine()
            .and_then(|g| g.extruders.get(&position).cloned())
    }

    pub fn number_extruders_enabled(&self) -> usize {
        let Some(global) = self.active_machine() else {
            return 1;
        };
        self.registry
            .instance(global.profile.slot(Slot::DefinitionChanges))
            .and_then(|c| c.property("extruders_enabled_count", "value"))
            .and_then(|v| v.as_int())
            .map(|v| v as usize)
            .unwrap_or_else(|| self.extruder_ids().len())
    }

    /// Enable or disable one extruder, keeping the enabled count, default
    /// extruder and quality selection consistent.
    pub fn set_extruder_enabled(&mut self, position: usize, enabled: bool) {
        let Some(extruder_id) = self.extruder_id_at(position) else {
            log::warn!("cannot change enablement of unknown extruder {}", position);
            return;
        };
        let bus = self.registry.bus();
        let _batch = bus.batch();
        let changed = self
            .registry
            .extruder_stack_mut(&extruder_id)
            .map(|e| e.set_enabled(enabled))
            .unwrap_or(false);
        if !changed {
            return;
        }
        self.update_number_extruders_enabled();
        self.update_default_extruder();
        self.correct_extruder_settings();
        self.update_quality_with_material();
        if let Some(stack_id) = &self.active_stack_id {
            bus.emit(Event::ExtrudersChanged(stack_id.clone()));
        }
    }

    /// Change `machine_extruder_count` in definition changes and repair
    /// everything that referenced removed extruders.
    pub fn set_active_machine_extruder_count(&mut self, extruder_count: usize) {
        let Some(global) = self.active_machine() else {
            return;
        };
        let definition_changes_id = global.profile.slot(Slot::DefinitionChanges).clone();
        if definition_changes_id == Slot::DefinitionChanges.empty_id() {
            return;
        }
        let previous = self.lookup().machine_extruder_count(global);
        if previous == extruder_count {
            return;
        }
        let stack_id = global.id().clone();

        let bus = self.registry.bus();
        let _batch = bus.batch();
        self.registry.set_property(
            &definition_changes_id,
            "machine_extruder_count",
            "value",
            extruder_count as i64,
        );
        self.update_default_extruder();
        self.update_number_extruders_enabled();
        self.correct_extruder_settings();
        self.active_extruder_index = 0;
        self.move_settable_values_to_extruders(&stack_id);
        bus.emit(Event::GlobalContainerChanged);
    }

    /// First enabled extruder becomes the default position.
    fn update_default_extruder(&mut self) {
        let mut new_default = 0;
        for extruder_id in self.extruder_ids() {
            if let Some(extruder) = self.registry.extruder_stack(&extruder_id) {
                if extruder.is_enabled() {
                    new_default = extruder.position();
                    break;
                }
            }
        }
        self.default_extruder_position = new_default;
    }

    fn update_number_extruders_enabled(&mut self) {
        let Some(global) = self.active_machine() else {
            return;
        };
        let definition_changes_id = global.profile.slot(Slot::DefinitionChanges).clone();
        let enabled_count = self
            .extruder_ids()
            .iter()
            .filter(|id| {
                self.registry
                    .extruder_stack(id)
                    .map(|e| e.is_enabled())
                    .unwrap_or(false)
            })
            .count() as i64;
        let current = self
            .registry
            .instance(&definition_changes_id)
            .and_then(|c| c.property("extruders_enabled_count", "value"))
            .and_then(|v| v.as_int());
        if current != Some(enabled_count) {
            self.registry.set_property(
                &definition_changes_id,
                "extruders_enabled_count",
                "value",
                enabled_count,
            );
        }
    }

    /// Settings holding an extruder position that no longer exists are
    /// removed from user changes; offending quality-changes values are
    /// shadowed in user changes with the default position.
    fn correct_extruder_settings(&mut self) {
        let Some(global) = self.active_machine() else {
            return;
        };
        let stack_id = global.id().clone();
        let user_id = global.profile.user_changes_id().clone();
        let quality_changes_id = global.profile.slot(Slot::QualityChanges).clone();
        let definition_id = global.profile.definition_id().clone();
        let extruder_count = self.lookup().machine_extruder_count(global) as i64;

        let incompatible = |registry: &ContainerRegistry, container_id: &str| -> Vec<String> {
            let Some(container) = registry.instance(container_id) else {
                return Vec::new();
            };
            let Some(definition) = registry.definition(&definition_id) else {
                return Vec::new();
            };
            container
                .settings
                .iter()
                .filter_map(|(key, instance)| {
                    let setting_type = definition
                        .setting(key)
                        .map(|s| s.setting_type.as_str())
                        .unwrap_or("");
                    if !matches!(setting_type, "extruder" | "optional_extruder") {
                        return None;
                    }
                    let value = instance.properties.get("value")?.as_int()?;
                    (value >= extruder_count).then(|| key.clone())
                })
                .collect()
        };

        for key in incompatible(&self.registry, &user_id) {
            self.registry.remove_instance_value(&user_id, &key);
        }
        let shadowed = incompatible(&self.registry, &quality_changes_id);
        if !shadowed.is_empty() {
            let user_id = self.ensure_user_container(&stack_id);
            let default_position = self.default_extruder_position as i64;
            for key in &shadowed {
                self.registry
                    .set_property(&user_id, key, "value", default_position);
            }
            log::info!(
                "settings changed to match the available extruders: [{}]",
                shadowed.join(", ")
            );
        }
    }

    /// Move settable-per-extruder user values out of the global user
    /// container into the owning extruder; kept for older project files.
    fn move_settable_values_to_extruders(&mut self, stack_id: &str) {
        let Some(global) = self.registry.global_stack(stack_id) else {
            return;
        };
        let user_id = global.profile.user_changes_id().clone();
        let Some(user_container) = self.registry.instance(&user_id) else {
            return;
        };
        let keys: Vec<String> = user_container.keys().cloned().collect();
        let lookup = self.lookup();
        let mut moves: Vec<(usize, String, SettingValue)> = Vec::new();
        for key in keys {
            let mut ctx = PropertyContext::default();
            let settable = lookup
                .global_property(global, &key, "settable_per_extruder", &mut ctx)
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            if !settable {
                continue;
            }
            let mut ctx = PropertyContext::default();
            let limit = lookup
                .global_property(global, &key, "limit_to_extruder", &mut ctx)
                .and_then(|v| v.as_int())
                .unwrap_or(-1);
            let position = limit.max(0) as usize;
            if let Some(value) = self
                .registry
                .instance(&user_id)
                .and_then(|c| c.property(&key, "value"))
            {
                moves.push((position, key, value));
            }
        }
        for (position, key, value) in moves {
            let Some(extruder_id) = self
                .registry
                .global_stack(stack_id)
                .and_then(|g| g.extruders.get(&position).cloned())
            else {
                log::warn!("unable to find extruder on position {}", position);
                continue;
            };
            let extruder_user_id = self.ensure_user_container(&extruder_id);
            self.registry
                .set_property(&extruder_user_id, &key, "value", value);
            self.registry.remove_instance_value(&user_id, &key);
        }
    }

    // ------------------------------------------------------------------
    // Active configuration accessors

    pub fn active_variant_name(&self, position: usize) -> String {
        self.extruder_id_at(position)
            .and_then(|id| self.registry.extruder_stack(&id).map(|e| e.profile.slot(Slot::Variant).clone()))
            .and_then(|variant_id| {
                if variant_id == Slot::Variant.empty_id() {
                    Some(EMPTY_VARIANT_NAME.to_string())
                } else {
                    self.registry
                        .instance(&variant_id)
                        .map(|c| c.metadata.get_str_or("name", &c.name))
                }
            })
            .unwrap_or_else(|| EMPTY_VARIANT_NAME.to_string())
    }

    pub fn active_material_base_file(&self, position: usize) -> String {
        self.extruder_id_at(position)
            .and_then(|id| {
                self.registry
                    .extruder_stack(&id)
                    .map(|e| e.profile.slot(Slot::Material).clone())
            })
            .map(|material_id| {
                self.registry
                    .instance(&material_id)
                    .map(|c| c.metadata.get_str_or("base_file", &material_id))
                    .unwrap_or(material_id)
            })
            .unwrap_or_else(|| Slot::Material.empty_id().to_string())
    }

    /// The quality type of the active quality profile, or "" when the
    /// quality slot holds the empty sentinel.
    pub fn active_quality_type(&self) -> String {
        let Some(global) = self.active_machine() else {
            return String::new();
        };
        let quality_id = global.profile.slot(Slot::Quality);
        if quality_id == Slot::Quality.empty_id() {
            return String::new();
        }
        self.registry
            .instance(quality_id)
            .map(|c| c.metadata.get_str_or("quality_type", ""))
            .unwrap_or_default()
    }

    pub fn is_active_quality_supported(&self) -> bool {
        !self.active_quality_type().is_empty()
            && self.active_quality_type() != "not_supported"
    }

    /// The first non-default intent category across enabled extruders.
    pub fn active_intent_category(&self) -> String {
        let mut category = "default".to_string();
        for extruder_id in self.extruder_ids() {
            let Some(extruder) = self.registry.extruder_stack(&extruder_id) else {
                continue;
            };
            if !extruder.is_enabled() {
                continue;
            }
            let intent_id = extruder.profile.slot(Slot::Intent);
            let current = self
                .registry
                .instance(intent_id)
                .map(|c| c.metadata.get_str_or("intent_category", "default"))
                .unwrap_or_else(|| "default".to_string());
            if current != "default" && current != category {
                category = current;
            }
        }
        category
    }

    /// All quality groups for the current variant/material/enabled setup.
    pub fn current_quality_groups(&mut self) -> HashMap<String, QualityGroup> {
        let Some(global) = self.active_machine() else {
            return HashMap::new();
        };
        let definition_id = global.profile.definition_id().clone();
        let (variants, materials, enabled) = self.extruder_configuration();
        let machine = self.tree.machine(&self.registry, &definition_id);
        machine.get_quality_groups(&variants, &materials, &enabled)
    }

    pub fn current_quality_changes_groups(&mut self) -> Vec<QualityChangesGroup> {
        let Some(global) = self.active_machine() else {
            return Vec::new();
        };
        let definition_id = global.profile.definition_id().clone();
        let (variants, materials, enabled) = self.extruder_configuration();
        let machine = self.tree.machine(&self.registry, &definition_id);
        machine.get_quality_changes_groups(&self.registry, &variants, &materials, &enabled)
    }

    fn extruder_configuration(&self) -> (Vec<String>, Vec<String>, Vec<bool>) {
        let ids = self.extruder_ids();
        let mut variants = Vec::with_capacity(ids.len());
        let mut materials = Vec::with_capacity(ids.len());
        let mut enabled = Vec::with_capacity(ids.len());
        for (position, id) in ids.iter().enumerate() {
            variants.push(self.active_variant_name(position));
            materials.push(self.active_material_base_file(position));
            enabled.push(
                self.registry
                    .extruder_stack(id)
                    .map(|e| e.is_enabled())
                    .unwrap_or(false),
            );
        }
        (variants, materials, enabled)
    }

    // ------------------------------------------------------------------
    // Variant / material / quality / intent transitions

    /// Select a nozzle for one extruder; keeps the material when it is still
    /// available, then re-picks the quality.
    pub fn set_variant(&mut self, position: usize, variant_name: &str) {
        let Some(global) = self.active_machine() else {
            return;
        };
        let definition_id = global.profile.definition_id().clone();
        let variant_id = {
            let machine = self.tree.machine(&self.registry, &definition_id);
            match machine.variants.get(variant_name) {
                Some(node) => node.container_id.clone(),
                None => {
                    log::warn!("there is no variant named {}", variant_name);
                    return;
                }
            }
        };
        let Some(extruder_id) = self.extruder_id_at(position) else {
            return;
        };
        let bus = self.registry.bus();
        let _batch = bus.batch();
        if self.replace_slot(&extruder_id, Slot::Variant, &variant_id) {
            bus.emit(Event::ActiveVariantChanged);
            self.update_material_with_variant(Some(position));
            self.update_quality_with_material();
        }
    }

    /// Select a material by its base file for one extruder, then re-pick
    /// the quality.
    pub fn set_material(&mut self, position: usize, material_base_file: &str) -> bool {
        let Some(global) = self.active_machine() else {
            return false;
        };
        let definition_id = global.profile.definition_id().clone();
        let variant_name = self.active_variant_name(position);
        let material_id = {
            let machine = self.tree.machine(&self.registry, &definition_id);
            machine
                .variants
                .get(&variant_name)
                .and_then(|variant| variant.materials.get(material_base_file))
                .map(|node| node.container_id.clone())
        };
        let Some(material_id) = material_id else {
            log::warn!(
                "material {} is not available under variant {}",
                material_base_file,
                variant_name
            );
            return false;
        };
        let bus = self.registry.bus();
        let _batch = bus.batch();
        self.apply_material(position, &material_id);
        self.update_quality_with_material();
        true
    }

    fn apply_material(&mut self, position: usize, material_id: &str) {
        let Some(extruder_id) = self.extruder_id_at(position) else {
            return;
        };
        let bus = self.registry.bus();
        if self.replace_slot(&extruder_id, Slot::Material, material_id) {
            bus.emit(Event::ActiveMaterialChanged);
        }
    }

    /// After a variant change, keep the current material when the new
    /// nozzle still offers it at the same approximate diameter; otherwise
    /// switch to the variant's preferred material.
    pub fn update_material_with_variant(&mut self, position: Option<usize>) {
        let Some(global) = self.active_machine() else {
            return;
        };
        let definition_id = global.profile.definition_id().clone();
        let positions: Vec<usize> = match position {
            Some(p) => vec![p],
            None => (0..self.extruder_ids().len()).collect(),
        };
        for position in positions {
            let Some(extruder_id) = self.extruder_id_at(position) else {
                continue;
            };
            let current_base = self.active_material_base_file(position);
            let variant_name = self.active_variant_name(position);
            let old_diameter = self
                .extruder_material_metadata_int(position, "approximate_diameter")
                .unwrap_or(3);
            let new_diameter = self.approximate_material_diameter(&extruder_id).unwrap_or(old_diameter);

            let chosen: Option<Id> = {
                let registry = &self.registry;
                let machine = self.tree.machine(registry, &definition_id);
                let Some(variant) = machine.variants.get(&variant_name) else {
                    continue;
                };
                if new_diameter == old_diameter && variant.materials.contains_key(&current_base) {
                    variant
                        .materials
                        .get(&current_base)
                        .map(|node| node.container_id.clone())
                } else {
                    variant
                        .preferred_material(registry, machine, new_diameter)
                        .map(|node| node.container_id.clone())
                }
            };
            if let Some(material_id) = chosen {
                self.apply_material(position, &material_id);
            }
        }
    }

    fn extruder_material_metadata_int(&self, position: usize, key: &str) -> Option<i64> {
        let extruder_id = self.extruder_id_at(position)?;
        let extruder = self.registry.extruder_stack(&extruder_id)?;
        self.registry
            .instance(extruder.profile.slot(Slot::Material))
            .and_then(|c| c.metadata.get_int(key))
    }

    /// The filament diameter this extruder requires, read from the variant
    /// slot downward so material overrides don't feed back into it.
    pub fn compatible_material_diameter(&self, extruder_id: &str) -> Option<f64> {
        let extruder = self.registry.extruder_stack(extruder_id)?;
        let mut ctx = PropertyContext::starting_at(Slot::Variant);
        self.lookup()
            .extruder_property(extruder, "material_diameter", "value", &mut ctx)
            .ok()
            .flatten()
            .and_then(|v| v.as_float())
    }

    /// The compatible diameter rounded to the nearest millimetre.
    pub fn approximate_material_diameter(&self, extruder_id: &str) -> Option<i64> {
        self.compatible_material_diameter(extruder_id)
            .map(|d| d.round() as i64)
    }

    /// True when every enabled extruder's material is compatible with its
    /// current nozzle.
    pub fn active_materials_compatible(&self) -> bool {
        let Some(global) = self.active_machine() else {
            return true;
        };
        let has_materials = self
            .registry
            .definition(global.profile.definition_id())
            .map(|d| d.metadata.get_bool("has_materials", true))
            .unwrap_or(true);
        if !has_materials {
            return true;
        }
        for (position, extruder_id) in self.extruder_ids().iter().enumerate() {
            let Some(extruder) = self.registry.extruder_stack(extruder_id) else {
                continue;
            };
            if !extruder.is_enabled() {
                continue;
            }
            let material_id = extruder.profile.slot(Slot::Material);
            if material_id == Slot::Material.empty_id() {
                continue;
            }
            let compatible = self
                .registry
                .instance(material_id)
                .map(|c| c.metadata.get_bool("compatible", true))
                .unwrap_or(true);
            if !compatible {
                log::info!("material in extruder {} is not compatible", position);
                return false;
            }
        }
        true
    }

    /// Re-pick the quality after a material or variant change: keep the
    /// current type when still available (clearing quality changes only on
    /// an actual switch), otherwise prefer the machine's preferred type,
    /// otherwise any available one; no available type empties the quality.
    pub fn update_quality_with_material(&mut self) {
        if self.active_machine().is_none() {
            return;
        }
        log::debug!("updating quality following a material change");
        let current_quality_type = self.active_quality_type();
        let groups = self.current_quality_groups();
        let available: Vec<String> = groups
            .iter()
            .filter(|(_, g)| g.is_available)
            .map(|(quality_type, _)| quality_type.clone())
            .collect();

        if !self.active_materials_compatible() {
            log::info!("active materials are not compatible, clearing all qualities");
            self.set_empty_quality();
            return;
        }
        if available.is_empty() {
            log::info!("no available quality types, clearing all qualities");
            self.set_empty_quality();
            return;
        }
        if available.contains(&current_quality_type) {
            // The type survives the switch; re-bind its containers and drop
            // any custom profile.
            let group = groups.get(&current_quality_type).cloned();
            if let Some(group) = group {
                self.apply_quality_group(&group);
            }
            return;
        }
        let preferred = self
            .active_machine()
            .and_then(|g| self.registry.definition(g.profile.definition_id()))
            .map(|d| d.metadata.get_str_or("preferred_quality_type", ""))
            .unwrap_or_default();
        let mut fallback: Vec<String> = available.clone();
        fallback.sort();
        let quality_type = if available.contains(&preferred) {
            preferred
        } else {
            fallback[0].clone()
        };
        log::info!(
            "quality type {} is no longer available, switching to {}",
            current_quality_type,
            quality_type
        );
        if let Some(group) = groups.get(&quality_type).cloned() {
            self.apply_quality_group(&group);
        }
    }

    /// Activate a quality group across the global stack and every extruder.
    pub fn set_quality_group(&mut self, group: &QualityGroup) {
        let bus = self.registry.bus();
        let _batch = bus.batch();
        self.apply_quality_group(group);
    }

    pub fn set_quality_group_by_type(&mut self, quality_type: &str) {
        let groups = self.current_quality_groups();
        match groups.get(quality_type) {
            Some(group) => {
                let group = group.clone();
                self.set_quality_group(&group);
            }
            None => log::warn!("no quality group for type {}", quality_type),
        }
    }

    fn apply_quality_group(&mut self, group: &QualityGroup) {
        let Some(global) = self.active_machine() else {
            return;
        };
        let Some(global_quality) = group.node_for_global.clone() else {
            log::warn!("quality group {} has no global node", group.name);
            return;
        };
        let stack_id = global.id().clone();
        let bus = self.registry.bus();
        let _batch = bus.batch();

        self.replace_slot(&stack_id, Slot::Quality, &global_quality);
        self.replace_slot(&stack_id, Slot::QualityChanges, Slot::QualityChanges.empty_id());
        for (position, extruder_id) in self.extruder_ids().iter().enumerate() {
            let quality_id = group
                .nodes_for_extruders
                .get(&position)
                .cloned()
                .unwrap_or_else(|| Slot::Quality.empty_id().to_string());
            self.replace_slot(extruder_id, Slot::Quality, &quality_id);
            self.replace_slot(
                extruder_id,
                Slot::QualityChanges,
                Slot::QualityChanges.empty_id(),
            );
        }
        bus.emit(Event::ActiveQualityChanged);
        self.update_intent_with_quality();
    }

    /// Set quality and quality-changes to the empty sentinels everywhere.
    fn set_empty_quality(&mut self) {
        let Some(global) = self.active_machine() else {
            return;
        };
        let stack_id = global.id().clone();
        let bus = self.registry.bus();
        let _batch = bus.batch();
        self.replace_slot(&stack_id, Slot::Quality, Slot::Quality.empty_id());
        self.replace_slot(&stack_id, Slot::QualityChanges, Slot::QualityChanges.empty_id());
        for extruder_id in self.extruder_ids() {
            self.replace_slot(&extruder_id, Slot::Quality, Slot::Quality.empty_id());
            self.replace_slot(
                &extruder_id,
                Slot::QualityChanges,
                Slot::QualityChanges.empty_id(),
            );
        }
        bus.emit(Event::ActiveQualityChanged);
        self.update_intent_with_quality();
    }

    /// Activate a user-saved custom profile.
    pub fn set_quality_changes_group(&mut self, group: &QualityChangesGroup) {
        let Some(stack_id) = self.active_stack_id.clone() else {
            return;
        };
        let mut group = group.clone();
        let bus = self.registry.bus();
        let _batch = bus.batch();

        let quality_group = if group.quality_type == "not_supported" {
            None
        } else {
            match self.current_quality_groups().get(&group.quality_type) {
                Some(found) => Some(found.clone()),
                None => {
                    // The quality this profile was based on no longer
                    // exists; pin the profile to not-supported.
                    let container_ids: Vec<Id> = group
                        .container_for_global
                        .iter()
                        .chain(group.containers_per_extruder.values())
                        .cloned()
                        .collect();
                    for id in container_ids {
                        self.registry
                            .set_metadata_entry(&id, "quality_type", "not_supported");
                    }
                    group.mark_not_supported();
                    None
                }
            }
        };

        let global_quality = quality_group
            .as_ref()
            .and_then(|g| g.node_for_global.clone())
            .unwrap_or_else(|| Slot::Quality.empty_id().to_string());
        let global_changes = group
            .container_for_global
            .clone()
            .unwrap_or_else(|| Slot::QualityChanges.empty_id().to_string());
        self.replace_slot(&stack_id, Slot::Quality, &global_quality);
        self.replace_slot(&stack_id, Slot::QualityChanges, &global_changes);

        for (position, extruder_id) in self.extruder_ids().iter().enumerate() {
            let quality_id = quality_group
                .as_ref()
                .and_then(|g| g.nodes_for_extruders.get(&position).cloned())
                .unwrap_or_else(|| Slot::Quality.empty_id().to_string());
            let changes_id = group
                .containers_per_extruder
                .get(&position)
                .cloned()
                .unwrap_or_else(|| Slot::QualityChanges.empty_id().to_string());
            self.replace_slot(extruder_id, Slot::Quality, &quality_id);
            self.replace_slot(extruder_id, Slot::QualityChanges, &changes_id);
        }
        bus.emit(Event::ActiveQualityChanged);
        self.set_intent_by_category(&group.intent_category);
        self.correct_extruder_settings();
    }

    /// Drop any custom profile and return to the plain quality of the
    /// current type.
    pub fn reset_to_default_quality(&mut self) {
        let quality_type = self.active_quality_type();
        let groups = self.current_quality_groups();
        match groups.get(&quality_type) {
            Some(group) => {
                let group = group.clone();
                self.set_quality_group(&group);
            }
            None => self.set_empty_quality(),
        }
    }

    /// Choose, per extruder, the intent profile of the requested category
    /// under the active quality; extruders without a matching intent keep
    /// the empty intent.
    pub fn set_intent_by_category(&mut self, intent_category: &str) {
        let Some(global) = self.active_machine() else {
            return;
        };
        let definition_id = global.profile.definition_id().clone();
        let bus = self.registry.bus();
        let _batch = bus.batch();

        for (position, extruder_id) in self.extruder_ids().iter().enumerate() {
            let Some(extruder) = self.registry.extruder_stack(extruder_id) else {
                continue;
            };
            let quality_id = extruder.profile.slot(Slot::Quality).clone();
            if quality_id == Slot::Quality.empty_id() {
                self.replace_slot(extruder_id, Slot::Intent, Slot::Intent.empty_id());
                continue;
            }
            let variant_name = self.active_variant_name(position);
            let material_base = self.active_material_base_file(position);
            let intent_id = {
                let machine = self.tree.machine(&self.registry, &definition_id);
                let quality_node = machine
                    .variants
                    .get(&variant_name)
                    .and_then(|variant| variant.materials.get(&material_base))
                    .and_then(|material| material.qualities.get(&quality_id));
                match quality_node {
                    Some(node) => node
                        .intents
                        .values()
                        .find(|intent| intent.intent_category == intent_category)
                        .map(|intent| intent.container_id.clone()),
                    None => {
                        log::warn!(
                            "cannot set intent {}: profile {} is not in the container tree",
                            intent_category,
                            quality_id
                        );
                        continue;
                    }
                }
            };
            let intent_id =
                intent_id.unwrap_or_else(|| Slot::Intent.empty_id().to_string());
            self.replace_slot(extruder_id, Slot::Intent, &intent_id);
        }
        bus.emit(Event::ActiveIntentChanged);
    }

    pub fn reset_intents(&mut self) {
        let bus = self.registry.bus();
        let _batch = bus.batch();
        for extruder_id in self.extruder_ids() {
            self.replace_slot(&extruder_id, Slot::Intent, Slot::Intent.empty_id());
        }
        bus.emit(Event::ActiveIntentChanged);
    }

    /// Re-derive the intent category after a quality change: a non-default
    /// category on any enabled extruder (or its custom profile) wins.
    fn update_intent_with_quality(&mut self) {
        if self.active_machine().is_none() {
            return;
        }
        log::debug!("updating intent following a quality change");
        let mut category = self.active_intent_category();
        if category == "default" {
            for extruder_id in self.extruder_ids() {
                let Some(extruder) = self.registry.extruder_stack(&extruder_id) else {
                    continue;
                };
                if !extruder.is_enabled() {
                    continue;
                }
                let changes_id = extruder.profile.slot(Slot::QualityChanges);
                if changes_id == Slot::QualityChanges.empty_id() {
                    continue;
                }
                let current = self
                    .registry
                    .instance(changes_id)
                    .map(|c| c.metadata.get_str_or("intent_category", "default"))
                    .unwrap_or_else(|| "default".to_string());
                if current != "default" {
                    category = current;
                    break;
                }
            }
        }
        self.set_intent_by_category(&category);
    }

    /// Repair stacks whose variant or material is unknown to the container
    /// tree, switching to the machine's preferred ones.
    fn validate_variants_and_materials(&mut self) {
        let Some(global) = self.active_machine() else {
            return;
        };
        let definition_id = global.profile.definition_id().clone();
        let positions = self.extruder_ids().len();
        for position in 0..positions {
            let variant_name = self.active_variant_name(position);
            let (variant_known, preferred_variant) = {
                let machine = self.tree.machine(&self.registry, &definition_id);
                (
                    machine.variants.contains_key(&variant_name),
                    machine.preferred_variant_name.clone(),
                )
            };
            let mut effective_variant = variant_name;
            if !variant_known {
                log::warn!(
                    "extruder {} has an unknown variant, switching to the preferred variant",
                    position
                );
                self.set_variant(position, &preferred_variant);
                effective_variant = preferred_variant;
            }
            let material_base = self.active_material_base_file(position);
            let (material_known, preferred_material) = {
                let machine = self.tree.machine(&self.registry, &definition_id);
                (
                    machine
                        .variants
                        .get(&effective_variant)
                        .map(|v| v.materials.contains_key(&material_base))
                        .unwrap_or(false),
                    machine.preferred_material.clone(),
                )
            };
            if !material_known {
                log::warn!(
                    "extruder {} has an unknown material, switching to the preferred material",
                    position
                );
                if !self.set_material(position, &preferred_material) {
                    log::warn!(
                        "failed to switch to {}, keeping the old material",
                        preferred_material
                    );
                }
            }
        }
    }

    /// Apply a configuration reported by a remote printer: per-extruder
    /// variants and materials in one transaction.
    pub fn apply_remote_configuration(&mut self, configuration: &RemoteConfiguration) {
        if self.active_machine().is_none() {
            return;
        }
        let bus = self.registry.bus();
        let _batch = bus.batch();
        for (position, extruder_config) in configuration.extruders.iter().enumerate() {
            if position >= self.extruder_ids().len() {
                break;
            }
            if let Some(variant_name) = &extruder_config.variant_name {
                self.set_variant(position, variant_name);
            }
            if let Some(material_base) = &extruder_config.material_base_file {
                self.set_material(position, material_base);
            }
        }
        self.update_quality_with_material();
    }
}
