use crate::logic::tree::ContainerTree;
use crate::model::{
    Container, ContainerType, ExtruderStack, GlobalStack, Id, InstanceContainer, SettingValue,
};
use crate::store::registry::ContainerRegistry;

/// Factory assembling fresh, valid stacks for a machine definition: one
/// global stack plus one extruder stack per declared train, all slots on
/// their empty sentinels except a new definition-changes container.
///
/// Variant, material and quality slots are filled afterwards by the machine
/// manager's validation pass.
pub struct StackBuilder;

impl StackBuilder {
    /// Create and register a machine. Returns the new global stack id, or
    /// None when the definition (or one of its extruder definitions) is
    /// unknown.
    pub fn create_machine(
        registry: &mut ContainerRegistry,
        name: &str,
        definition_id: &str,
    ) -> Option<Id> {
        let Some(definition) = registry.definition(definition_id) else {
            log::warn!("definition {} was not found", definition_id);
            return None;
        };
        let trains = extruder_trains(definition.metadata.get("machine_extruder_trains"));
        let definition_metadata = definition.metadata.clone();

        let generated_name = registry.unique_name(name);
        let stack_id = registry.unique_name(&generated_name.to_lowercase().replace(' ', "_"));

        let mut global = GlobalStack::new(stack_id.clone(), generated_name, definition_id);
        if let Some(value) = definition_metadata.get("machine_extruder_trains") {
            global
                .profile
                .metadata_mut()
                .set("machine_extruder_trains", value.clone());
        }
        Self::attach_definition_changes(registry, &mut global.profile);

        // Build every extruder before registering the global stack, so a
        // half-built machine never becomes visible.
        let mut extruders = Vec::new();
        for (position, extruder_definition_id) in &trains {
            match Self::create_extruder(registry, &stack_id, *position, extruder_definition_id) {
                Some(extruder) => extruders.push(extruder),
                None => {
                    log::warn!(
                        "failed to create an extruder stack for position {} of {}",
                        position,
                        stack_id
                    );
                    return None;
                }
            }
        }
        if extruders.is_empty() {
            // Single-extrusion machines may not declare trains at all.
            let extruder = Self::create_extruder(registry, &stack_id, 0, "fdmextruder")?;
            extruders.push(extruder);
        }

        for extruder in extruders {
            let position = extruder.position();
            let extruder_id = extruder.id().clone();
            if !registry.add_extruder_stack(extruder) {
                return None;
            }
            if let Err(err) = global.add_extruder(position, extruder_id) {
                log::warn!("cannot attach extruder: {}", err);
                return None;
            }
        }
        let id = global.id().clone();
        if !registry.add_global_stack(global) {
            return None;
        }
        Some(id)
    }

    /// Create one extruder stack with its definition-changes container; not
    /// yet registered.
    pub fn create_extruder(
        registry: &mut ContainerRegistry,
        global_stack_id: &str,
        position: usize,
        extruder_definition_id: &str,
    ) -> Option<ExtruderStack> {
        if registry.definition(extruder_definition_id).is_none() {
            log::warn!(
                "unable to find extruder definition {}",
                extruder_definition_id
            );
            return None;
        }
        let id = format!("{}_extruder_{}", global_stack_id, position);
        let name = format!("Extruder {}", position + 1);
        let mut extruder = ExtruderStack::new(id, name, extruder_definition_id, position);
        extruder.set_next_stack(global_stack_id);
        Self::attach_definition_changes(registry, &mut extruder.profile);
        Some(extruder)
    }

    /// Synthesize the missing position-0 extruder of a legacy
    /// single-extrusion machine and move the per-extruder user values over
    /// to it.
    pub fn repair_single_extrusion_machine(
        registry: &mut ContainerRegistry,
        tree: &mut ContainerTree,
        global_stack_id: &str,
    ) -> Option<Id> {
        let global = registry.global_stack(global_stack_id)?;
        if !global.extruders.is_empty() {
            return None;
        }
        let definition_id = global.profile.definition_id().clone();
        let _ = tree.machine(registry, &definition_id);

        let extruder = Self::create_extruder(registry, global_stack_id, 0, "fdmextruder")?;
        let extruder_id = extruder.id().clone();
        if !registry.add_extruder_stack(extruder) {
            return None;
        }
        if let Some(global) = registry.global_stack_mut(global_stack_id) {
            if let Err(err) = global.add_extruder(0, extruder_id.clone()) {
                log::warn!("cannot attach synthesized extruder: {}", err);
                return None;
            }
        }
        log::info!(
            "synthesized extruder {} for single-extrusion machine {}",
            extruder_id,
            global_stack_id
        );
        Some(extruder_id)
    }

    /// Every profile stack carries its own, named definition-changes
    /// container.
    fn attach_definition_changes(
        registry: &mut ContainerRegistry,
        profile: &mut crate::model::ProfileStack,
    ) {
        use crate::model::Slot;
        let id = format!("{}_settings", profile.id());
        let container =
            InstanceContainer::new(id.clone(), id.clone(), ContainerType::DefinitionChanges);
        registry.add_container(Container::Instance(container));
        profile.stack.containers[Slot::DefinitionChanges.index()] = id;
    }
}

fn extruder_trains(value: Option<&SettingValue>) -> Vec<(usize, String)> {
    let mut trains: Vec<(usize, String)> = match value {
        Some(SettingValue::Map(map)) => map
            .iter()
            .filter_map(|(position, definition)| {
                position
                    .parse::<usize>()
                    .ok()
                    .map(|p| (p, definition.to_string()))
            })
            .collect(),
        _ => Vec::new(),
    };
    trains.sort_by_key(|(position, _)| *position);
    trains
}
