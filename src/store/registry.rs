use anyhow::Result;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::logic::upgrade::VersionUpgradeManager;
use crate::model::{
    empty_sentinels, Container, ContainerStack, DefinitionContainer, ExtruderStack, GlobalStack,
    Id, InstanceContainer, Metadata, SettingValue,
};
use crate::signals::{Event, SignalBus};
use crate::store::ini;

/// A registered stack: raw if its type metadata did not identify it as a
/// machine or extruder train.
#[derive(Debug, Clone, PartialEq)]
pub enum StackEntry {
    Global(GlobalStack),
    Extruder(ExtruderStack),
    Generic(ContainerStack),
}

impl StackEntry {
    pub fn id(&self) -> &Id {
        match self {
            StackEntry::Global(s) => s.id(),
            StackEntry::Extruder(s) => s.id(),
            StackEntry::Generic(s) => &s.id,
        }
    }

    pub fn metadata(&self) -> &Metadata {
        match self {
            StackEntry::Global(s) => s.profile.metadata(),
            StackEntry::Extruder(s) => s.profile.metadata(),
            StackEntry::Generic(s) => &s.metadata,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            StackEntry::Global(s) => s.profile.name(),
            StackEntry::Extruder(s) => s.profile.name(),
            StackEntry::Generic(s) => &s.name,
        }
    }
}

/// Single source of truth for every container and stack on disk.
///
/// The registry owns the arena; stacks and tree nodes refer to containers by
/// id only. Load errors never abort a load: the offending file is logged and
/// skipped.
pub struct ContainerRegistry {
    containers: HashMap<Id, Container>,
    stacks: HashMap<Id, StackEntry>,
    file_paths: HashMap<Id, PathBuf>,
    bus: Arc<SignalBus>,
}

impl Default for ContainerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            containers: HashMap::new(),
            stacks: HashMap::new(),
            file_paths: HashMap::new(),
            bus: Arc::new(SignalBus::new()),
        };
        for sentinel in empty_sentinels() {
            registry
                .containers
                .insert(sentinel.id.clone(), Container::Instance(sentinel));
        }
        registry
    }

    pub fn bus(&self) -> Arc<SignalBus> {
        self.bus.clone()
    }

    // ------------------------------------------------------------------
    // Queries

    pub fn container(&self, id: &str) -> Option<&Container> {
        self.containers.get(id)
    }

    pub fn instance(&self, id: &str) -> Option<&InstanceContainer> {
        self.containers.get(id).and_then(Container::as_instance)
    }

    pub fn instance_mut(&mut self, id: &str) -> Option<&mut InstanceContainer> {
        self.containers.get_mut(id).and_then(Container::as_instance_mut)
    }

    pub fn definition(&self, id: &str) -> Option<&DefinitionContainer> {
        self.containers.get(id).and_then(Container::as_definition)
    }

    pub fn stack(&self, id: &str) -> Option<&StackEntry> {
        self.stacks.get(id)
    }

    pub fn global_stack(&self, id: &str) -> Option<&GlobalStack> {
        match self.stacks.get(id) {
            Some(StackEntry::Global(s)) => Some(s),
            _ => None,
        }
    }

    pub fn global_stack_mut(&mut self, id: &str) -> Option<&mut GlobalStack> {
        match self.stacks.get_mut(id) {
            Some(StackEntry::Global(s)) => Some(s),
            _ => None,
        }
    }

    pub fn extruder_stack(&self, id: &str) -> Option<&ExtruderStack> {
        match self.stacks.get(id) {
            Some(StackEntry::Extruder(s)) => Some(s),
            _ => None,
        }
    }

    pub fn extruder_stack_mut(&mut self, id: &str) -> Option<&mut ExtruderStack> {
        match self.stacks.get_mut(id) {
            Some(StackEntry::Extruder(s)) => Some(s),
            _ => None,
        }
    }

    /// Mutable access to the profile (slot list) of a typed stack.
    pub fn profile_stack_mut(&mut self, id: &str) -> Option<&mut crate::model::ProfileStack> {
        match self.stacks.get_mut(id) {
            Some(StackEntry::Global(s)) => Some(&mut s.profile),
            Some(StackEntry::Extruder(s)) => Some(&mut s.profile),
            _ => None,
        }
    }

    pub fn global_stacks(&self) -> impl Iterator<Item = &GlobalStack> {
        self.stacks.values().filter_map(|entry| match entry {
            StackEntry::Global(s) => Some(s),
            _ => None,
        })
    }

    /// The "type" metadata of any known container or stack; used for slot
    /// validation.
    pub fn type_tag(&self, id: &str) -> Option<String> {
        if let Some(container) = self.containers.get(id) {
            return Some(container.type_tag());
        }
        self.stacks.get(id).and_then(|s| s.metadata().get_str("type"))
    }

    fn matches(metadata: &Metadata, id: &str, name: &str, filter: &[(&str, &str)]) -> bool {
        filter.iter().all(|(key, expected)| {
            if *expected == "*" {
                return match *key {
                    "id" | "name" => true,
                    _ => metadata.contains(key),
                };
            }
            match *key {
                "id" => id == *expected,
                "name" => name == *expected,
                _ => metadata.get_str(key).as_deref() == Some(*expected),
            }
        })
    }

    /// All containers whose metadata matches the filter exactly
    /// (case-sensitive); `"*"` matches any present value.
    pub fn find_containers(&self, filter: &[(&str, &str)]) -> Vec<&Container> {
        self.containers
            .values()
            .filter(|c| Self::matches(c.metadata(), c.id(), c.name(), filter))
            .collect()
    }

    /// Metadata-only view of `find_containers`, as (id, metadata) pairs.
    pub fn find_containers_metadata(&self, filter: &[(&str, &str)]) -> Vec<(&Id, &Metadata)> {
        self.containers
            .values()
            .filter(|c| Self::matches(c.metadata(), c.id(), c.name(), filter))
            .map(|c| (c.id(), c.metadata()))
            .collect()
    }

    pub fn find_stacks(&self, filter: &[(&str, &str)]) -> Vec<&StackEntry> {
        self.stacks
            .values()
            .filter(|s| Self::matches(s.metadata(), s.id(), s.name(), filter))
            .collect()
    }

    pub fn is_read_only(&self, id: &str) -> bool {
        self.containers
            .get(id)
            .map(Container::is_read_only)
            .unwrap_or(false)
    }

    /// Return `seed` if unused, else `seed #2`, `seed #3`, ... Any existing
    /// ` #N` suffix on the seed is stripped first. Comparison ignores case.
    pub fn unique_name(&self, seed: &str) -> String {
        let base = match seed.rfind(" #") {
            Some(pos) if seed[pos + 2..].chars().all(|c| c.is_ascii_digit())
                && !seed[pos + 2..].is_empty() =>
            {
                &seed[..pos]
            }
            _ => seed,
        };
        let base = base.trim();
        let taken: Vec<String> = self
            .containers
            .values()
            .map(|c| c.name().to_lowercase())
            .chain(self.stacks.values().map(|s| s.name().to_lowercase()))
            .collect();
        if !taken.contains(&base.to_lowercase()) {
            return base.to_string();
        }
        let mut counter = 2;
        loop {
            let candidate = format!("{} #{}", base, counter);
            if !taken.contains(&candidate.to_lowercase()) {
                return candidate;
            }
            counter += 1;
        }
    }

    // ------------------------------------------------------------------
    // Mutation

    /// Add a container to the arena. Containers with a duplicate id or a
    /// stale `setting_version` are rejected with a warning, never a panic.
    pub fn add_container(&mut self, container: Container) -> bool {
        let id = container.id().clone();
        if self.containers.contains_key(&id) || self.stacks.contains_key(&id) {
            log::warn!("rejecting container with duplicate id {}", id);
            return false;
        }
        if let Container::Instance(instance) = &container {
            let version = instance.setting_version();
            if version != crate::CURRENT_SETTING_VERSION {
                log::warn!(
                    "rejecting container {} with setting_version {} (current is {})",
                    id,
                    version,
                    crate::CURRENT_SETTING_VERSION
                );
                return false;
            }
        }
        self.containers.insert(id.clone(), container);
        self.bus.emit(Event::ContainerAdded(id));
        true
    }

    /// Register a raw stack, converting it to a typed global or extruder
    /// stack based on its `type` metadata and repairing its slot layout.
    pub fn add_stack(&mut self, stack: ContainerStack) -> bool {
        let id = stack.id.clone();
        if self.containers.contains_key(&id) || self.stacks.contains_key(&id) {
            log::warn!("rejecting stack with duplicate id {}", id);
            return false;
        }
        let entry = match self.typed_stack_from(stack) {
            Ok(entry) => entry,
            Err(err) => {
                log::warn!("cannot register stack {}: {}", id, err);
                return false;
            }
        };
        self.stacks.insert(id.clone(), entry);
        self.bus.emit(Event::ContainerAdded(id));
        true
    }

    pub fn add_global_stack(&mut self, stack: GlobalStack) -> bool {
        let id = stack.id().clone();
        if self.containers.contains_key(&id) || self.stacks.contains_key(&id) {
            log::warn!("rejecting stack with duplicate id {}", id);
            return false;
        }
        self.stacks.insert(id.clone(), StackEntry::Global(stack));
        self.bus.emit(Event::ContainerAdded(id));
        true
    }

    pub fn add_extruder_stack(&mut self, stack: ExtruderStack) -> bool {
        let id = stack.id().clone();
        if self.containers.contains_key(&id) || self.stacks.contains_key(&id) {
            log::warn!("rejecting stack with duplicate id {}", id);
            return false;
        }
        self.stacks.insert(id.clone(), StackEntry::Extruder(stack));
        self.bus.emit(Event::ContainerAdded(id));
        true
    }

    fn typed_stack_from(&self, stack: ContainerStack) -> Result<StackEntry> {
        let type_tag = stack.metadata.get_str_or("type", "");
        let ids = stack.containers.clone();
        match type_tag.as_str() {
            "machine" => {
                let mut global = GlobalStack::new(stack.id.clone(), stack.name.clone(), "");
                let fresh_group_id = global.group_id();
                // Preserve persisted metadata (including group_id) wholesale.
                global.profile.stack.metadata = stack.metadata;
                if global.group_id().is_empty() {
                    global.profile.metadata_mut().set("group_id", fresh_group_id);
                }
                global
                    .profile
                    .assign_slots(ids, |id| self.type_tag(id))?;
                self.repair_definition_changes(&mut global.profile);
                Ok(StackEntry::Global(global))
            }
            "extruder_train" => {
                let mut extruder = ExtruderStack::new(stack.id.clone(), stack.name.clone(), "", 0);
                extruder.profile.stack.metadata = stack.metadata;
                extruder.profile.stack.next_stack = stack.next_stack;
                extruder
                    .profile
                    .assign_slots(ids, |id| self.type_tag(id))?;
                self.repair_definition_changes(&mut extruder.profile);
                Ok(StackEntry::Extruder(extruder))
            }
            _ => Ok(StackEntry::Generic(stack)),
        }
    }

    /// Stacks saved before definition-changes existed get a fresh, named,
    /// empty definition-changes container.
    fn repair_definition_changes(&self, profile: &mut crate::model::ProfileStack) {
        use crate::model::Slot;
        if profile.is_slot_empty(Slot::DefinitionChanges) {
            let id = format!("{}_settings", profile.id());
            profile.stack.containers[Slot::DefinitionChanges.index()] = id;
        }
    }

    /// Create any definition-changes containers referenced by repaired
    /// stacks but not present in the arena.
    pub fn materialize_definition_changes(&mut self) {
        use crate::model::{ContainerType, Slot};
        let missing: Vec<Id> = self
            .stacks
            .values()
            .filter_map(|entry| {
                let profile = match entry {
                    StackEntry::Global(s) => &s.profile,
                    StackEntry::Extruder(s) => &s.profile,
                    StackEntry::Generic(_) => return None,
                };
                let id = profile.slot(Slot::DefinitionChanges).clone();
                (!self.containers.contains_key(&id)).then_some(id)
            })
            .collect();
        for id in missing {
            let name = id.clone();
            let container = InstanceContainer::new(id, name, ContainerType::DefinitionChanges);
            self.add_container(Container::Instance(container));
        }
    }

    /// Remove a container or stack, deleting its backing file if it has one.
    pub fn remove_container(&mut self, id: &str) -> bool {
        let removed =
            self.containers.remove(id).is_some() || self.stacks.remove(id).is_some();
        if !removed {
            log::warn!("cannot remove unknown container {}", id);
            return false;
        }
        if let Some(path) = self.file_paths.remove(id) {
            if let Err(err) = std::fs::remove_file(&path) {
                log::warn!("could not delete {}: {}", path.display(), err);
            }
        }
        self.bus.emit(Event::ContainerRemoved(id.to_string()));
        true
    }

    /// Write a metadata entry, refusing read-only containers.
    pub fn set_metadata_entry(
        &mut self,
        id: &str,
        key: &str,
        value: impl Into<SettingValue>,
    ) -> bool {
        if self.is_read_only(id) {
            log::warn!("refusing metadata write on read-only container {}", id);
            return false;
        }
        if let Some(container) = self.containers.get_mut(id) {
            container.metadata_mut().set(key.to_string(), value);
            self.bus.emit(Event::ContainerMetadataChanged(id.to_string()));
            return true;
        }
        if let Some(stack) = self.stacks.get_mut(id) {
            let metadata = match stack {
                StackEntry::Global(s) => s.profile.metadata_mut(),
                StackEntry::Extruder(s) => s.profile.metadata_mut(),
                StackEntry::Generic(s) => &mut s.metadata,
            };
            metadata.set(key.to_string(), value);
            self.bus.emit(Event::ContainerMetadataChanged(id.to_string()));
            return true;
        }
        false
    }

    /// Write a setting property into a mutable instance container.
    pub fn set_property(
        &mut self,
        container_id: &str,
        key: &str,
        property: &str,
        value: impl Into<SettingValue>,
    ) -> bool {
        if self.is_read_only(container_id) {
            log::warn!(
                "refusing property write on read-only container {}",
                container_id
            );
            return false;
        }
        let Some(instance) = self.instance_mut(container_id) else {
            log::warn!("cannot set property on unknown container {}", container_id);
            return false;
        };
        instance.set_property(key, property, value.into());
        self.bus.emit(Event::PropertyChanged {
            key: key.to_string(),
            property: property.to_string(),
        });
        true
    }

    pub fn remove_instance_value(&mut self, container_id: &str, key: &str) -> bool {
        if self.is_read_only(container_id) {
            return false;
        }
        let Some(instance) = self.instance_mut(container_id) else {
            return false;
        };
        let removed = instance.remove_instance(key);
        if removed {
            self.bus.emit(Event::PropertyChanged {
                key: key.to_string(),
                property: "value".to_string(),
            });
        }
        removed
    }

    // ------------------------------------------------------------------
    // Loading and saving

    /// Load every container file under `dir`, migrating stale files through
    /// the upgrade pipeline. Bad files are skipped with a warning.
    pub fn load_directory(&mut self, dir: &Path, upgrades: &VersionUpgradeManager) {
        let mut definitions = Vec::new();
        let mut instances = Vec::new();
        let mut stack_files = Vec::new();
        for entry in walk_files(dir) {
            let name = entry.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if name.ends_with(".def.json") {
                definitions.push(entry);
            } else if name.ends_with(".inst.cfg") {
                instances.push(entry);
            } else if name.ends_with(".global.cfg") || name.ends_with(".extruder.cfg") {
                stack_files.push(entry);
            }
        }

        // Definitions first: everything else validates against them.
        for path in definitions {
            if let Err(err) = self.load_definition_file(&path) {
                log::warn!("skipping {}: {}", path.display(), err);
            }
        }
        self.resolve_definition_inheritance();
        for path in instances {
            if let Err(err) = self.load_instance_file(&path, upgrades) {
                log::warn!("skipping {}: {}", path.display(), err);
            }
        }
        // Globals before extruders so next-stack wiring can succeed.
        stack_files.sort_by_key(|path| path.to_string_lossy().ends_with(".extruder.cfg"));
        for path in stack_files {
            if let Err(err) = self.load_stack_file(&path, upgrades) {
                log::warn!("skipping {}: {}", path.display(), err);
            }
        }
        self.materialize_definition_changes();
        self.wire_extruders();
    }

    fn load_definition_file(&mut self, path: &Path) -> Result<()> {
        let text = std::fs::read_to_string(path)?;
        let id = file_stem(path, ".def.json");
        let definition = DefinitionContainer::deserialize(id.clone(), &text)?;
        if self.add_container(Container::Definition(definition)) {
            self.file_paths.insert(id, path.to_path_buf());
        }
        Ok(())
    }

    fn resolve_definition_inheritance(&mut self) {
        // Parents are merged bottom-up; chains deeper than the arena size
        // indicate a cycle and are abandoned.
        let ids: Vec<Id> = self
            .containers
            .values()
            .filter(|c| c.as_definition().is_some())
            .map(|c| c.id().clone())
            .collect();
        for id in ids {
            let mut chain = Vec::new();
            let mut current = self
                .definition(&id)
                .and_then(|d| d.inherits.clone());
            while let Some(parent_id) = current {
                if chain.contains(&parent_id) || chain.len() > self.containers.len() {
                    log::warn!("definition inheritance cycle at {}", parent_id);
                    break;
                }
                let Some(parent) = self.definition(&parent_id) else {
                    log::warn!("definition {} inherits unknown {}", id, parent_id);
                    break;
                };
                chain.push(parent_id.clone());
                current = parent.inherits.clone();
                let parent = parent.clone();
                if let Some(Container::Definition(child)) = self.containers.get_mut(&id) {
                    child.merge_parent(&parent);
                }
            }
        }
    }

    fn load_instance_file(&mut self, path: &Path, upgrades: &VersionUpgradeManager) -> Result<()> {
        let text = std::fs::read_to_string(path)?;
        let mut raw = ini::parse_raw(&text)?;
        let siblings = upgrades.upgrade(&mut raw)?;
        let id = file_stem(path, ".inst.cfg");
        let container = ini::instance_from_raw(&raw, Some(&id))?;
        let container_id = container.id.clone();
        if self.add_container(Container::Instance(container)) {
            self.file_paths.insert(container_id, path.to_path_buf());
        }
        self.register_upgrade_siblings(siblings);
        Ok(())
    }

    fn load_stack_file(&mut self, path: &Path, upgrades: &VersionUpgradeManager) -> Result<()> {
        let text = std::fs::read_to_string(path)?;
        let mut raw = ini::parse_raw(&text)?;
        let siblings = upgrades.upgrade(&mut raw)?;
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        let suffix = if name.ends_with(".extruder.cfg") {
            ".extruder.cfg"
        } else {
            ".global.cfg"
        };
        let id = file_stem(path, suffix);
        let stack = ini::stack_from_raw(&raw, Some(&id))?;
        let stack_id = stack.id.clone();
        if self.add_stack(stack) {
            self.file_paths.insert(stack_id, path.to_path_buf());
        }
        self.register_upgrade_siblings(siblings);
        Ok(())
    }

    /// Upgrades may split one file into several (e.g. the abstract-machine
    /// stack emitted for cloud printers); register the extras too.
    fn register_upgrade_siblings(&mut self, siblings: Vec<ini::RawContainerFile>) {
        for raw in siblings {
            let is_stack = !raw.containers.is_empty()
                || matches!(raw.type_tag(), Some("machine") | Some("extruder_train"));
            let outcome = if is_stack {
                ini::stack_from_raw(&raw, None)
                    .map(|stack| self.add_stack(stack))
                    .map(|_| ())
            } else {
                ini::instance_from_raw(&raw, None)
                    .map(|instance| self.add_container(Container::Instance(instance)))
                    .map(|_| ())
            };
            if let Err(err) = outcome {
                log::warn!("discarding malformed upgrade output: {}", err);
            }
        }
    }

    /// Attach every extruder stack to the global stack named by its
    /// `machine` metadata.
    pub fn wire_extruders(&mut self) {
        let links: Vec<(Id, usize, Id)> = self
            .stacks
            .values()
            .filter_map(|entry| match entry {
                StackEntry::Extruder(extruder) => {
                    let machine = extruder.profile.metadata().get_str("machine")?;
                    Some((extruder.id().clone(), extruder.position(), machine))
                }
                _ => None,
            })
            .collect();
        for (extruder_id, position, machine_id) in links {
            if self.global_stack(&machine_id).is_none() {
                log::warn!(
                    "extruder {} references unknown machine {}",
                    extruder_id,
                    machine_id
                );
                continue;
            }
            if let Some(extruder) = self.extruder_stack_mut(&extruder_id) {
                extruder.set_next_stack(machine_id.clone());
            }
            if let Some(global) = self.global_stack_mut(&machine_id) {
                if let Err(err) = global.add_extruder(position, extruder_id.clone()) {
                    log::warn!("cannot attach extruder {}: {}", extruder_id, err);
                }
            }
        }
    }

    /// Persist every mutable container and stack under `dir`, using the
    /// extension conventions of the loader.
    pub fn save_all(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        for container in self.containers.values() {
            match container {
                Container::Instance(instance) => {
                    if instance.read_only {
                        continue;
                    }
                    let path = dir.join(format!("{}.inst.cfg", instance.id));
                    std::fs::write(path, ini::serialize_instance(instance))?;
                }
                Container::Definition(definition) => {
                    let path = dir.join(format!("{}.def.json", definition.id));
                    std::fs::write(path, definition.serialize()?)?;
                }
            }
        }
        for entry in self.stacks.values() {
            let (stack, extension) = match entry {
                StackEntry::Global(s) => (&s.profile.stack, "global.cfg"),
                StackEntry::Extruder(s) => (&s.profile.stack, "extruder.cfg"),
                StackEntry::Generic(s) => (s, "stack.cfg"),
            };
            let path = dir.join(format!("{}.{}", stack.id, extension));
            std::fs::write(path, ini::serialize_stack(stack))?;
        }
        Ok(())
    }
}

fn walk_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let Ok(entries) = std::fs::read_dir(&current) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files.sort();
    files
}

fn file_stem(path: &Path, suffix: &str) -> String {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    name.strip_suffix(suffix)
        .map(|s| s.to_string())
        .unwrap_or_else(|| {
            // Strip a single extension as a fallback.
            Path::new(name)
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or(name)
                .to_string()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ContainerType;

    fn quality(id: &str, name: &str) -> Container {
        let mut c = InstanceContainer::new(id, name, ContainerType::Quality);
        c.metadata.set("quality_type", "normal");
        Container::Instance(c)
    }

    #[test]
    fn duplicate_ids_are_rejected_with_warning() {
        let mut registry = ContainerRegistry::new();
        assert!(registry.add_container(quality("q1", "Normal")));
        assert!(!registry.add_container(quality("q1", "Normal Again")));
        assert_eq!(registry.find_containers(&[("id", "q1")]).len(), 1);
    }

    #[test]
    fn stale_setting_version_is_rejected() {
        let mut registry = ContainerRegistry::new();
        let mut old = InstanceContainer::new("old", "Old", ContainerType::Quality);
        old.metadata.set("setting_version", 2i64);
        assert!(!registry.add_container(Container::Instance(old)));
        assert!(registry.container("old").is_none());
    }

    #[test]
    fn metadata_filter_supports_wildcards() {
        let mut registry = ContainerRegistry::new();
        registry.add_container(quality("q1", "Normal"));
        let mut fine = InstanceContainer::new("q2", "Fine", ContainerType::Quality);
        fine.metadata.set("quality_type", "fine");
        fine.metadata.set("global_quality", "True");
        registry.add_container(Container::Instance(fine));

        // Two real profiles plus the shared empty-quality sentinel.
        let all_quality = registry.find_containers_metadata(&[("type", "quality")]);
        assert_eq!(all_quality.len(), 3);
        let globals = registry.find_containers_metadata(&[("global_quality", "*")]);
        assert_eq!(globals.len(), 1);
        // Case sensitive by default.
        assert!(registry
            .find_containers_metadata(&[("quality_type", "Normal")])
            .is_empty());
    }

    #[test]
    fn unique_name_counts_up_and_strips_suffix() {
        let mut registry = ContainerRegistry::new();
        registry.add_container(quality("q1", "My Profile"));
        registry.add_container(quality("q2", "My Profile #2"));
        assert_eq!(registry.unique_name("My Profile"), "My Profile #3");
        assert_eq!(registry.unique_name("My Profile #2"), "My Profile #3");
        assert_eq!(registry.unique_name("Fresh"), "Fresh");
    }

    #[test]
    fn raw_machine_stack_is_converted_to_global() {
        let mut registry = ContainerRegistry::new();
        let mut definition = DefinitionContainer::new("test_printer", "Test Printer");
        definition.metadata.set("type", "machine");
        registry.add_container(Container::Definition(definition));

        let mut stack = ContainerStack::new("printer_1", "Printer");
        stack.metadata.set("type", "machine");
        stack.containers = vec!["test_printer".into()];
        assert!(registry.add_stack(stack));
        let global = registry.global_stack("printer_1").expect("typed as global");
        assert_eq!(global.profile.definition_id(), "test_printer");
        // Repair synthesized a definition-changes id.
        assert!(!global
            .profile
            .is_slot_empty(crate::model::Slot::DefinitionChanges));
    }

    #[test]
    fn read_only_containers_refuse_mutation() {
        let mut registry = ContainerRegistry::new();
        assert!(!registry.set_property("empty_quality", "layer_height", "value", 0.1));
        assert!(!registry.set_metadata_entry("empty_quality", "name", "nope"));
    }
}
