use itertools::Itertools;
use std::collections::HashMap;

use crate::logic::quality::{QualityChangesGroup, QualityGroup};
use crate::model::{Id, Metadata, SettingValue, Slot};
use crate::store::registry::ContainerRegistry;

/// An intent profile in the tree, keyed under its quality.
#[derive(Debug, Clone, PartialEq)]
pub struct IntentNode {
    pub container_id: Id,
    pub intent_category: String,
}

/// A quality profile in the tree. Its children are intents.
#[derive(Debug, Clone, PartialEq)]
pub struct QualityNode {
    pub container_id: Id,
    pub name: String,
    pub quality_type: String,
    pub intents: HashMap<Id, IntentNode>,
}

/// A material in the tree, keyed by its base file. Its children are the
/// quality profiles available for it.
#[derive(Debug, Clone, PartialEq)]
pub struct MaterialNode {
    pub container_id: Id,
    pub base_file: String,
    pub material_type: String,
    pub brand: String,
    pub guid: String,
    pub qualities: HashMap<Id, QualityNode>,
}

/// A nozzle in the tree. Its children are materials.
#[derive(Debug, Clone, PartialEq)]
pub struct VariantNode {
    pub container_id: Id,
    pub variant_name: String,
    pub materials: HashMap<String, MaterialNode>,
}

/// Cached description of one machine definition: its variants, materials,
/// qualities and intents, pre-indexed for O(1) navigation.
///
/// Metadata cached here must not change during runtime; everything else is
/// looked up through the registry on demand.
#[derive(Debug, Clone, PartialEq)]
pub struct MachineNode {
    pub container_id: Id,
    pub has_materials: bool,
    pub has_variants: bool,
    pub has_machine_quality: bool,
    pub quality_definition: Id,
    pub exclude_materials: Vec<String>,
    pub preferred_variant_name: String,
    pub preferred_material: String,
    pub preferred_quality_type: String,
    pub variants: HashMap<String, VariantNode>,
    /// quality_type -> the machine-wide quality for that type.
    pub global_qualities: HashMap<String, QualityNode>,
}

pub const EMPTY_VARIANT_NAME: &str = "empty";
pub const EMPTY_MATERIAL_BASE: &str = "empty_material";

impl MachineNode {
    pub fn build(registry: &ContainerRegistry, definition_id: &str) -> Self {
        let metadata = registry
            .definition(definition_id)
            .map(|d| d.metadata.clone())
            .unwrap_or_else(|| {
                log::warn!("unable to find metadata for definition {}", definition_id);
                Metadata::new()
            });
        let has_machine_quality = metadata.get_bool("has_machine_quality", false);
        let quality_definition = if has_machine_quality {
            metadata.get_str_or("quality_definition", definition_id)
        } else {
            "fdmprinter".to_string()
        };
        let mut node = Self {
            container_id: definition_id.to_string(),
            has_materials: metadata.get_bool("has_materials", true),
            has_variants: metadata.get_bool("has_variants", false),
            has_machine_quality,
            quality_definition,
            exclude_materials: string_list(metadata.get("exclude_materials")),
            preferred_variant_name: metadata.get_str_or("preferred_variant_name", ""),
            preferred_material: metadata.get_str_or("preferred_material", ""),
            preferred_quality_type: metadata.get_str_or("preferred_quality_type", ""),
            variants: HashMap::new(),
            global_qualities: HashMap::new(),
        };
        node.load_all(registry);
        node
    }

    /// (Re)load every variant and the global qualities for this machine.
    pub fn load_all(&mut self, registry: &ContainerRegistry) {
        self.variants.clear();
        self.global_qualities.clear();

        if self.has_variants {
            let found = registry.find_containers_metadata(&[
                ("type", "variant"),
                ("definition", &self.container_id),
                ("hardware_type", "nozzle"),
            ]);
            for (id, metadata) in found
                .into_iter()
                .sorted_by_key(|(_, m)| m.get_str_or("name", ""))
            {
                let name = metadata.get_str_or("name", "");
                if name.is_empty() || self.variants.contains_key(&name) {
                    continue;
                }
                let variant = build_variant(registry, self, id.clone(), name.clone());
                self.variants.insert(name, variant);
            }
        }
        if self.variants.is_empty() {
            // No nozzle choice on this printer; a single pass-through node.
            let variant = build_variant(
                registry,
                self,
                "empty_variant".to_string(),
                EMPTY_VARIANT_NAME.to_string(),
            );
            self.variants.insert(EMPTY_VARIANT_NAME.to_string(), variant);
        }

        let mut global_qualities = registry.find_containers_metadata(&[
            ("type", "quality"),
            ("definition", &self.quality_definition),
            ("global_quality", "True"),
        ]);
        if global_qualities.is_empty() {
            // This printer doesn't override the global qualities.
            global_qualities = registry.find_containers_metadata(&[
                ("type", "quality"),
                ("definition", "fdmprinter"),
                ("global_quality", "True"),
            ]);
        }
        for (id, metadata) in global_qualities {
            let quality_type = metadata.get_str_or("quality_type", "");
            if quality_type.is_empty() {
                continue;
            }
            let node = build_quality(registry, self, id.clone(), metadata, None, None);
            self.global_qualities.insert(quality_type, node);
        }
        if self.global_qualities.is_empty() {
            // Keep the tree navigable even on a broken installation.
            self.global_qualities.insert(
                "not_supported".to_string(),
                QualityNode {
                    container_id: Slot::Quality.empty_id().to_string(),
                    name: "empty".to_string(),
                    quality_type: "not_supported".to_string(),
                    intents: HashMap::new(),
                },
            );
        }
    }

    pub fn is_excluded_material_base_file(&self, base_file: &str) -> bool {
        self.exclude_materials
            .iter()
            .any(|excluded| base_file.contains(excluded.as_str()))
    }

    /// The preferred global quality, or an arbitrary one when the preferred
    /// type is absent.
    pub fn preferred_global_quality(&self) -> Option<&QualityNode> {
        self.global_qualities
            .get(&self.preferred_quality_type)
            .or_else(|| {
                self.global_qualities
                    .values()
                    .sorted_by_key(|n| n.quality_type.clone())
                    .next()
            })
    }

    /// All quality groups for this machine, with availability computed for
    /// the given per-extruder variants, materials and enabled flags.
    pub fn get_quality_groups(
        &self,
        variant_names: &[String],
        material_bases: &[String],
        extruder_enabled: &[bool],
    ) -> HashMap<String, QualityGroup> {
        if variant_names.len() != material_bases.len()
            || variant_names.len() != extruder_enabled.len()
        {
            log::error!(
                "mismatched extruder configuration lists ({} variants, {} materials, {} enabled flags)",
                variant_names.len(),
                material_bases.len(),
                extruder_enabled.len()
            );
            return HashMap::new();
        }

        // For each extruder, which quality types it can print.
        let mut qualities_per_type_per_extruder: Vec<HashMap<String, &QualityNode>> =
            vec![HashMap::new(); variant_names.len()];
        for (position, variant_name) in variant_names.iter().enumerate() {
            if !extruder_enabled[position] {
                continue;
            }
            let specific = self
                .variants
                .get(variant_name)
                .and_then(|variant| variant.materials.get(&material_bases[position]));
            qualities_per_type_per_extruder[position] = match specific {
                Some(material) => material
                    .qualities
                    .values()
                    .map(|node| (node.quality_type.clone(), node))
                    .collect(),
                // No specialised profiles for this setup; fall back to the
                // machine-wide qualities.
                None => self
                    .global_qualities
                    .values()
                    .map(|node| (node.quality_type.clone(), node))
                    .collect(),
            };
        }

        let mut groups: HashMap<String, QualityGroup> = HashMap::new();
        for (quality_type, global_node) in &self.global_qualities {
            let mut group = QualityGroup::new(global_node.name.clone(), quality_type.clone());
            group.node_for_global = Some(global_node.container_id.clone());
            for (position, qualities) in qualities_per_type_per_extruder.iter().enumerate() {
                if let Some(node) = qualities.get(quality_type) {
                    group.set_extruder_node(position, node.container_id.clone());
                }
            }
            groups.insert(quality_type.clone(), group);
        }

        let mut available: Vec<String> = groups.keys().cloned().collect();
        for (position, qualities) in qualities_per_type_per_extruder.iter().enumerate() {
            if !extruder_enabled[position] {
                continue;
            }
            available.retain(|quality_type| qualities.contains_key(quality_type));
        }
        for quality_type in available {
            if let Some(group) = groups.get_mut(&quality_type) {
                group.is_available = true;
            }
        }
        groups
    }

    /// All user-saved custom profiles for this machine, grouped by profile
    /// name, with availability tied to their underlying quality groups.
    pub fn get_quality_changes_groups(
        &self,
        registry: &ContainerRegistry,
        variant_names: &[String],
        material_bases: &[String],
        extruder_enabled: &[bool],
    ) -> Vec<QualityChangesGroup> {
        let found = registry.find_containers_metadata(&[
            ("type", "quality_changes"),
            ("definition", &self.quality_definition),
        ]);
        let mut groups_by_name: HashMap<String, QualityChangesGroup> = HashMap::new();
        for (id, metadata) in found
            .into_iter()
            .sorted_by_key(|(id, _)| (*id).clone())
        {
            let name = metadata.get_str_or("name", "");
            let intent_category = metadata.get_str_or("intent_category", "default");
            let group = groups_by_name.entry(name.clone()).or_insert_with(|| {
                QualityChangesGroup::new(
                    name.clone(),
                    metadata.get_str_or("quality_type", "not_supported"),
                    intent_category.clone(),
                )
            });
            // The group's intent is the first non-default one of its members.
            if group.intent_category == "default" && intent_category != "default" {
                group.intent_category = intent_category;
            }
            match metadata.get_int("position") {
                Some(position) if position >= 0 => {
                    group
                        .containers_per_extruder
                        .insert(position as usize, id.clone());
                }
                _ => group.container_for_global = Some(id.clone()),
            }
        }

        let quality_groups =
            self.get_quality_groups(variant_names, material_bases, extruder_enabled);
        let mut groups: Vec<QualityChangesGroup> = groups_by_name.into_values().collect();
        for group in &mut groups {
            group.is_available = match quality_groups.get(&group.quality_type) {
                Some(quality_group) => quality_group.is_available,
                // Custom profiles built on an empty profile always apply.
                None => group.quality_type == "not_supported",
            };
        }
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        groups
    }
}

impl VariantNode {
    /// The preferred material for this nozzle at the given approximate
    /// diameter, falling back through the 1.75 mm twin profile, then any
    /// material with a matching diameter, then anything at all.
    pub fn preferred_material(
        &self,
        registry: &ContainerRegistry,
        machine: &MachineNode,
        approximate_diameter: i64,
    ) -> Option<&MaterialNode> {
        let diameter_of = |node: &MaterialNode| {
            registry
                .instance(&node.container_id)
                .and_then(|c| c.metadata.get_int("approximate_diameter"))
        };
        for (base_file, node) in &self.materials {
            if *base_file == machine.preferred_material
                && diameter_of(node) == Some(approximate_diameter)
            {
                return Some(node);
            }
        }
        if approximate_diameter == 2 {
            let preferred_175 = format!("{}_175", machine.preferred_material);
            for (base_file, node) in &self.materials {
                if *base_file == preferred_175 && diameter_of(node) == Some(approximate_diameter) {
                    return Some(node);
                }
            }
        }
        if let Some(node) = self
            .materials
            .values()
            .sorted_by_key(|n| n.base_file.clone())
            .find(|node| diameter_of(node) == Some(approximate_diameter))
        {
            log::warn!(
                "could not find preferred material {}, falling back to {}",
                machine.preferred_material,
                node.base_file
            );
            return Some(node);
        }
        let fallback = self
            .materials
            .values()
            .sorted_by_key(|n| n.base_file.clone())
            .next();
        if let Some(node) = fallback {
            log::warn!(
                "could not find preferred material {} with diameter {} for variant {}, falling back to {}",
                machine.preferred_material,
                approximate_diameter,
                self.container_id,
                node.container_id
            );
        }
        fallback
    }
}

fn build_variant(
    registry: &ContainerRegistry,
    machine: &MachineNode,
    container_id: Id,
    variant_name: String,
) -> VariantNode {
    let mut node = VariantNode {
        container_id,
        variant_name,
        materials: HashMap::new(),
    };
    load_variant_materials(registry, machine, &mut node);
    node
}

fn load_variant_materials(
    registry: &ContainerRegistry,
    machine: &MachineNode,
    variant: &mut VariantNode,
) {
    variant.materials.clear();
    if !machine.has_materials {
        variant.materials.insert(
            EMPTY_MATERIAL_BASE.to_string(),
            build_material(
                registry,
                machine,
                Slot::Material.empty_id().to_string(),
                &Metadata::new(),
                &variant.variant_name,
            ),
        );
        return;
    }

    // Generic profiles, overridden by printer-specific ones, overridden by
    // variant-specific ones; all keyed by base file.
    let mut per_base_file: HashMap<String, (Id, Metadata)> = HashMap::new();
    let base = registry.find_containers_metadata(&[("type", "material"), ("definition", "fdmprinter")]);
    for (id, metadata) in base {
        insert_material_metadata(&mut per_base_file, id, metadata);
    }
    let printer_specific = registry.find_containers_metadata(&[
        ("type", "material"),
        ("definition", &machine.container_id),
    ]);
    for (id, metadata) in printer_specific
        .iter()
        .filter(|(_, m)| !m.contains("variant_name"))
    {
        insert_material_metadata(&mut per_base_file, id, metadata);
    }
    for (id, metadata) in printer_specific
        .iter()
        .filter(|(_, m)| m.get_str("variant_name").as_deref() == Some(&variant.variant_name))
    {
        insert_material_metadata(&mut per_base_file, id, metadata);
    }

    for (base_file, (id, metadata)) in per_base_file
        .into_iter()
        .sorted_by_key(|(base_file, _)| base_file.clone())
    {
        if machine.is_excluded_material_base_file(&base_file) {
            continue;
        }
        let node = build_material(registry, machine, id, &metadata, &variant.variant_name);
        variant.materials.insert(base_file, node);
    }
    if variant.materials.is_empty() {
        variant.materials.insert(
            EMPTY_MATERIAL_BASE.to_string(),
            build_material(
                registry,
                machine,
                Slot::Material.empty_id().to_string(),
                &Metadata::new(),
                &variant.variant_name,
            ),
        );
    }
}

fn insert_material_metadata(
    per_base_file: &mut HashMap<String, (Id, Metadata)>,
    id: &Id,
    metadata: &Metadata,
) {
    let base_file = metadata.get_str_or("base_file", id);
    per_base_file.insert(base_file, (id.clone(), metadata.clone()));
}

fn build_material(
    registry: &ContainerRegistry,
    machine: &MachineNode,
    container_id: Id,
    metadata: &Metadata,
    variant_name: &str,
) -> MaterialNode {
    let base_file = metadata.get_str_or("base_file", &container_id);
    let mut node = MaterialNode {
        container_id,
        base_file: base_file.clone(),
        material_type: metadata.get_str_or("material", ""),
        brand: metadata.get_str_or("brand", ""),
        guid: metadata.get_str_or("GUID", ""),
        qualities: HashMap::new(),
    };

    let found = if !machine.has_machine_quality {
        registry.find_containers_metadata(&[("type", "quality"), ("definition", "fdmprinter")])
    } else if !machine.has_materials {
        registry.find_containers_metadata(&[
            ("type", "quality"),
            ("definition", &machine.quality_definition),
        ])
    } else if machine.has_variants {
        registry.find_containers_metadata(&[
            ("type", "quality"),
            ("definition", &machine.quality_definition),
            ("variant", variant_name),
            ("material", &base_file),
        ])
    } else {
        registry.find_containers_metadata(&[
            ("type", "quality"),
            ("definition", &machine.quality_definition),
            ("material", &base_file),
        ])
    };
    for (id, quality_metadata) in found {
        let quality = build_quality(
            registry,
            machine,
            id.clone(),
            quality_metadata,
            Some(variant_name),
            Some(&base_file),
        );
        node.qualities.insert(id.clone(), quality);
    }
    node
}

fn build_quality(
    registry: &ContainerRegistry,
    machine: &MachineNode,
    container_id: Id,
    metadata: &Metadata,
    variant_name: Option<&str>,
    material_base: Option<&str>,
) -> QualityNode {
    let quality_type = metadata.get_str_or("quality_type", "");
    let mut node = QualityNode {
        name: metadata.get_str_or("name", "Unnamed profile"),
        container_id,
        quality_type: quality_type.clone(),
        intents: HashMap::new(),
    };

    let mut filter: Vec<(&str, &str)> = vec![
        ("type", "intent"),
        ("definition", &machine.quality_definition),
    ];
    if let Some(variant) = variant_name {
        filter.push(("variant", variant));
    }
    if let Some(material) = material_base {
        filter.push(("material", material));
    }
    for (id, intent_metadata) in registry.find_containers_metadata(&filter) {
        if intent_metadata.get_str_or("quality_type", "") != quality_type {
            continue;
        }
        node.intents.insert(
            id.clone(),
            IntentNode {
                container_id: id.clone(),
                intent_category: intent_metadata.get_str_or("intent_category", "default"),
            },
        );
    }
    node
}

fn string_list(value: Option<&SettingValue>) -> Vec<String> {
    match value {
        Some(SettingValue::List(values)) => values.iter().map(|v| v.to_string()).collect(),
        Some(SettingValue::Str(s)) if !s.is_empty() => {
            s.split(',').map(|part| part.trim().to_string()).collect()
        }
        _ => Vec::new(),
    }
}

/// Read-only navigation structure over the registry: machine definitions at
/// the root, then variants, materials, qualities and intents.
///
/// Machine subtrees build lazily on first access and are kept current by the
/// add/remove hooks the coordination layer invokes on registry changes.
#[derive(Debug, Default)]
pub struct ContainerTree {
    machines: HashMap<Id, MachineNode>,
}

impl ContainerTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn machine(&mut self, registry: &ContainerRegistry, definition_id: &str) -> &MachineNode {
        self.machines
            .entry(definition_id.to_string())
            .or_insert_with(|| MachineNode::build(registry, definition_id))
    }

    pub fn machine_if_loaded(&self, definition_id: &str) -> Option<&MachineNode> {
        self.machines.get(definition_id)
    }

    pub fn rebuild_machine(&mut self, registry: &ContainerRegistry, definition_id: &str) {
        if self.machines.contains_key(definition_id) {
            self.machines.insert(
                definition_id.to_string(),
                MachineNode::build(registry, definition_id),
            );
        }
    }

    /// Keep loaded subtrees current after a container was added.
    pub fn on_container_added(&mut self, registry: &ContainerRegistry, container_id: &str) {
        let Some(metadata) = registry.container(container_id).map(|c| c.metadata().clone())
        else {
            return;
        };
        match metadata.get_str_or("type", "").as_str() {
            "material" => self.material_added(registry, container_id, &metadata),
            "variant" | "quality" | "intent" | "quality_changes" => {
                // Structural profiles are rare enough to rebuild the
                // affected machines wholesale.
                let definition = metadata.get_str_or("definition", "");
                let affected: Vec<Id> = self
                    .machines
                    .values()
                    .filter(|m| {
                        m.container_id == definition || m.quality_definition == definition
                    })
                    .map(|m| m.container_id.clone())
                    .collect();
                for machine_id in affected {
                    self.rebuild_machine(registry, &machine_id);
                }
            }
            _ => {}
        }
    }

    /// Keep loaded subtrees current after a container was removed.
    pub fn on_container_removed(
        &mut self,
        registry: &ContainerRegistry,
        container_id: &str,
        metadata: &Metadata,
    ) {
        match metadata.get_str_or("type", "").as_str() {
            "material" => {
                let base_file = metadata.get_str_or("base_file", container_id);
                self.material_removed(registry, &base_file);
            }
            "variant" | "quality" | "intent" | "quality_changes" => {
                let machine_ids: Vec<Id> = self.machines.keys().cloned().collect();
                for machine_id in machine_ids {
                    self.rebuild_machine(registry, &machine_id);
                }
            }
            _ => {}
        }
    }

    fn material_added(
        &mut self,
        registry: &ContainerRegistry,
        container_id: &str,
        metadata: &Metadata,
    ) {
        let base_file = metadata.get_str_or("base_file", container_id);
        let material_definition = metadata.get_str_or("definition", "");
        let material_variant = metadata.get_str("variant_name");

        for machine in self.machines.values_mut() {
            if !machine.has_materials || machine.is_excluded_material_base_file(&base_file) {
                continue;
            }
            let machine_meta = machine.clone();
            for variant in machine.variants.values_mut() {
                let applies = if !variant.materials.contains_key(&base_file) {
                    // A brand-new base file: it must target this printer (or
                    // be generic) and this variant (or no variant).
                    (material_definition == "fdmprinter"
                        || material_definition == machine_meta.container_id)
                        && material_variant
                            .as_deref()
                            .map_or(true, |v| v == variant.variant_name)
                } else {
                    // Known base file: only a more specific profile replaces
                    // the loaded one.
                    let more_specific = material_definition == machine_meta.container_id
                        && material_variant.as_deref() == Some(&variant.variant_name);
                    let current_is_variant_specific = variant
                        .materials
                        .get(&base_file)
                        .and_then(|node| registry.instance(&node.container_id))
                        .map(|c| c.metadata.contains("variant_name"))
                        .unwrap_or(false);
                    more_specific && !current_is_variant_specific
                };
                if !applies {
                    continue;
                }
                variant.materials.remove(EMPTY_MATERIAL_BASE);
                let node = build_material(
                    registry,
                    &machine_meta,
                    container_id.to_string(),
                    metadata,
                    &variant.variant_name,
                );
                variant.materials.insert(base_file.clone(), node);
            }
        }
    }

    fn material_removed(&mut self, registry: &ContainerRegistry, base_file: &str) {
        for machine in self.machines.values_mut() {
            let machine_meta = machine.clone();
            for variant in machine.variants.values_mut() {
                if variant.materials.remove(base_file).is_none() {
                    continue;
                }
                // A sibling profile with the same base file may have been
                // shadowed by the one we just dropped. Prefer the most
                // specific one left: variant-specific, then printer-specific,
                // then generic.
                let candidates =
                    registry.find_containers_metadata(&[("base_file", base_file)]);
                let mut replacement: Option<(Id, Metadata, u8)> = None;
                for (id, metadata) in candidates {
                    let definition = metadata.get_str_or("definition", "");
                    let specificity = if definition == machine_meta.container_id {
                        match metadata.get_str("variant_name") {
                            Some(v) if v == variant.variant_name => 2,
                            None => 1,
                            Some(_) => continue,
                        }
                    } else if definition == "fdmprinter" {
                        0
                    } else {
                        continue;
                    };
                    let better = replacement
                        .as_ref()
                        .map_or(true, |(_, _, s)| specificity > *s);
                    if better {
                        replacement = Some((id.clone(), metadata.clone(), specificity));
                    }
                }
                let replacement = replacement.map(|(id, metadata, _)| (id, metadata));
                match replacement {
                    Some((id, metadata)) => {
                        log::info!("material {} now provided by {}", base_file, id);
                        let node = build_material(
                            registry,
                            &machine_meta,
                            id,
                            &metadata,
                            &variant.variant_name,
                        );
                        variant.materials.insert(base_file.to_string(), node);
                    }
                    None => {
                        log::warn!(
                            "material {} removed with no suitable replacement",
                            base_file
                        );
                    }
                }
                if variant.materials.is_empty() {
                    variant.materials.insert(
                        EMPTY_MATERIAL_BASE.to_string(),
                        build_material(
                            registry,
                            &machine_meta,
                            Slot::Material.empty_id().to_string(),
                            &Metadata::new(),
                            &variant.variant_name,
                        ),
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Container, ContainerType, DefinitionContainer, InstanceContainer};

    fn instance(id: &str, container_type: ContainerType, metadata: &[(&str, &str)]) -> Container {
        let mut container = InstanceContainer::new(id, id, container_type);
        for (key, value) in metadata {
            container.metadata.set(key.to_string(), value.to_string());
        }
        Container::Instance(container)
    }

    /// A printer with no nozzle choice and no machine-specific qualities.
    fn simple_registry() -> ContainerRegistry {
        let mut registry = ContainerRegistry::new();
        let mut definition = DefinitionContainer::new("simple_printer", "Simple Printer");
        definition.metadata.set("has_variants", "false");
        definition.metadata.set("has_materials", "true");
        definition.metadata.set("exclude_materials", "nylon");
        registry.add_container(Container::Definition(definition));
        registry.add_container(instance(
            "generic_pla",
            ContainerType::Material,
            &[("definition", "fdmprinter"), ("base_file", "generic_pla")],
        ));
        registry.add_container(instance(
            "generic_nylon",
            ContainerType::Material,
            &[("definition", "fdmprinter"), ("base_file", "generic_nylon")],
        ));
        registry.add_container(instance(
            "normal",
            ContainerType::Quality,
            &[
                ("definition", "fdmprinter"),
                ("quality_type", "normal"),
                ("global_quality", "True"),
            ],
        ));
        registry
    }

    #[test]
    fn variantless_machines_get_a_passthrough_node() {
        let registry = simple_registry();
        let machine = MachineNode::build(&registry, "simple_printer");
        assert_eq!(machine.variants.len(), 1);
        assert!(machine.variants.contains_key(EMPTY_VARIANT_NAME));
        assert_eq!(machine.quality_definition, "fdmprinter");
    }

    #[test]
    fn excluded_materials_are_filtered_by_substring() {
        let registry = simple_registry();
        let machine = MachineNode::build(&registry, "simple_printer");
        let variant = &machine.variants[EMPTY_VARIANT_NAME];
        assert!(variant.materials.contains_key("generic_pla"));
        assert!(!variant.materials.contains_key("generic_nylon"));
    }

    #[test]
    fn quality_groups_fall_back_to_the_shared_qualities() {
        let registry = simple_registry();
        let machine = MachineNode::build(&registry, "simple_printer");
        let groups = machine.get_quality_groups(
            &[EMPTY_VARIANT_NAME.to_string()],
            &["generic_pla".to_string()],
            &[true],
        );
        assert!(groups["normal"].is_available);
        assert_eq!(groups["normal"].node_for_global.as_deref(), Some("normal"));
    }

    #[test]
    fn removing_a_material_falls_back_to_a_less_specific_sibling() {
        let mut registry = simple_registry();
        let mut definition = DefinitionContainer::new("variant_printer", "Variant Printer");
        definition.metadata.set("has_variants", "true");
        registry.add_container(Container::Definition(definition));
        registry.add_container(instance(
            "nozzle_04",
            ContainerType::Variant,
            &[
                ("name", "0.4 mm"),
                ("definition", "variant_printer"),
                ("hardware_type", "nozzle"),
            ],
        ));
        // A variant-specific override of the generic PLA profile.
        registry.add_container(instance(
            "pla_for_04",
            ContainerType::Material,
            &[
                ("definition", "variant_printer"),
                ("base_file", "generic_pla"),
                ("variant_name", "0.4 mm"),
            ],
        ));

        let mut tree = ContainerTree::new();
        tree.machine(&registry, "variant_printer");
        let node = tree.machine_if_loaded("variant_printer").unwrap();
        let materials = &node.variants["0.4 mm"].materials;
        assert_eq!(
            materials["generic_pla"].container_id, "pla_for_04",
            "the variant-specific profile shadows the generic one"
        );

        // Dropping the override resurfaces the generic profile.
        let metadata = registry
            .container("pla_for_04")
            .unwrap()
            .metadata()
            .clone();
        registry.remove_container("pla_for_04");
        tree.on_container_removed(&registry, "pla_for_04", &metadata);
        let node = tree.machine_if_loaded("variant_printer").unwrap();
        assert_eq!(
            node.variants["0.4 mm"].materials["generic_pla"].container_id,
            "generic_pla"
        );
    }
}
