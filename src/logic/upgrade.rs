use anyhow::{anyhow, Result};

use crate::store::ini::RawContainerFile;

/// What kind of persisted file an upgrade step applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeTarget {
    /// Any instance container file.
    Instance,
    /// Any container stack file.
    Stack,
}

fn target_of(raw: &RawContainerFile) -> UpgradeTarget {
    match raw.type_tag() {
        Some("machine") | Some("extruder_train") => UpgradeTarget::Stack,
        _ if !raw.containers.is_empty() => UpgradeTarget::Stack,
        _ => UpgradeTarget::Instance,
    }
}

type TransformFn = fn(&mut RawContainerFile) -> Vec<RawContainerFile>;

/// One registered migration step.
pub struct Upgrade {
    pub target: UpgradeTarget,
    pub from_version: u32,
    pub to_version: u32,
    transform: TransformFn,
}

/// Schema migration pipeline over persisted container files.
///
/// Each step declares (target kind, source version) and is applied
/// repeatedly until the file reaches the current setting version. Steps may
/// rename settings, rewrite enum values, or split one file into several;
/// extra files are returned to the caller for registration.
pub struct VersionUpgradeManager {
    upgrades: Vec<Upgrade>,
}

impl Default for VersionUpgradeManager {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionUpgradeManager {
    /// The pipeline with all shipped migrations registered.
    pub fn new() -> Self {
        let mut manager = Self::empty();
        manager.register(UpgradeTarget::Instance, 2, 3, upgrade_instance_2_to_3);
        manager.register(UpgradeTarget::Instance, 3, 4, upgrade_instance_3_to_4);
        manager.register(UpgradeTarget::Instance, 4, 5, upgrade_instance_4_to_5);
        manager.register(UpgradeTarget::Instance, 5, 6, upgrade_noop);
        manager.register(UpgradeTarget::Stack, 2, 3, upgrade_noop);
        manager.register(UpgradeTarget::Stack, 3, 4, upgrade_noop);
        manager.register(UpgradeTarget::Stack, 4, 5, upgrade_noop);
        manager.register(UpgradeTarget::Stack, 5, 6, upgrade_stack_5_to_6);
        manager
    }

    pub fn empty() -> Self {
        Self {
            upgrades: Vec::new(),
        }
    }

    pub fn register(
        &mut self,
        target: UpgradeTarget,
        from_version: u32,
        to_version: u32,
        transform: TransformFn,
    ) {
        assert!(to_version > from_version, "upgrades must move forward");
        self.upgrades.push(Upgrade {
            target,
            from_version,
            to_version,
            transform,
        });
    }

    /// Migrate a parsed file up to the current setting version, returning
    /// any sibling files a step split off. Already-current files pass
    /// through untouched.
    pub fn upgrade(&self, raw: &mut RawContainerFile) -> Result<Vec<RawContainerFile>> {
        let mut siblings = Vec::new();
        loop {
            let version = raw.setting_version();
            if version >= crate::CURRENT_SETTING_VERSION {
                return Ok(siblings);
            }
            let target = target_of(raw);
            let step = self
                .upgrades
                .iter()
                .find(|u| u.target == target && u.from_version == version)
                .ok_or_else(|| {
                    anyhow!(
                        "no upgrade path from setting_version {} for {:?}",
                        version,
                        target
                    )
                })?;
            log::info!(
                "upgrading {} from setting_version {} to {}",
                raw.general.get("id").map(|s| s.as_str()).unwrap_or("?"),
                step.from_version,
                step.to_version
            );
            let mut extra = (step.transform)(raw);
            raw.metadata
                .insert("setting_version".into(), step.to_version.to_string());
            for sibling in &mut extra {
                sibling
                    .metadata
                    .insert("setting_version".into(), step.to_version.to_string());
            }
            siblings.append(&mut extra);
        }
    }
}

fn upgrade_noop(_raw: &mut RawContainerFile) -> Vec<RawContainerFile> {
    Vec::new()
}

fn rename_value_key(raw: &mut RawContainerFile, old: &str, new: &str) {
    if let Some(value) = raw.values.remove(old) {
        raw.values.insert(new.to_string(), value);
    }
}

/// skin_overlap became infill_overlap; combing became an enum.
fn upgrade_instance_2_to_3(raw: &mut RawContainerFile) -> Vec<RawContainerFile> {
    rename_value_key(raw, "skin_overlap", "infill_overlap");
    if let Some(combing) = raw.values.get_mut("retraction_combing") {
        *combing = if crate::model::parse_bool(combing) {
            "all".to_string()
        } else {
            "off".to_string()
        };
    }
    Vec::new()
}

fn upgrade_instance_3_to_4(raw: &mut RawContainerFile) -> Vec<RawContainerFile> {
    rename_value_key(raw, "speed_support_lines", "speed_support_infill");
    raw.values.remove("machine_start_gcode_legacy");
    Vec::new()
}

/// The noskin combing mode was dropped from quality profiles.
fn upgrade_instance_4_to_5(raw: &mut RawContainerFile) -> Vec<RawContainerFile> {
    let is_quality = matches!(raw.type_tag(), Some("quality") | Some("quality_changes"));
    if is_quality {
        if let Some(combing) = raw.values.get_mut("retraction_combing") {
            if combing == "noskin" {
                *combing = "infill".to_string();
            }
        }
    }
    Vec::new()
}

/// Cloud-connected machines gain a companion abstract-machine stack that
/// represents "any printer of this type" in cluster-aware UIs.
fn upgrade_stack_5_to_6(raw: &mut RawContainerFile) -> Vec<RawContainerFile> {
    if raw.type_tag() != Some("machine") {
        return Vec::new();
    }
    let is_cloud = raw
        .metadata
        .get("connection_type")
        .map(|types| types.split(',').any(|t| t.trim() == "3"))
        .unwrap_or(false);
    if !is_cloud {
        return Vec::new();
    }
    let Some(id) = raw.general.get("id").cloned() else {
        return Vec::new();
    };
    let mut abstract_machine = raw.clone();
    let abstract_id = format!("{}_abstract_machine", id);
    abstract_machine
        .general
        .insert("id".into(), abstract_id.clone());
    let name = raw
        .metadata
        .get("group_name")
        .or_else(|| raw.general.get("name"))
        .cloned()
        .unwrap_or(abstract_id);
    abstract_machine.general.insert("name".into(), name);
    abstract_machine
        .metadata
        .insert("is_abstract_machine".into(), "True".into());
    abstract_machine
        .metadata
        .insert("is_online".into(), "True".into());
    // The clone keeps group_id, so the abstract machine joins the cluster.
    vec![abstract_machine]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ini;

    fn legacy_user_file(version: u32) -> RawContainerFile {
        let text = format!(
            "[general]\nversion = 2\nname = Legacy\nid = legacy_user\n\n\
             [metadata]\ntype = user\nsetting_version = {}\n\n\
             [values]\nskin_overlap = 15\nretraction_combing = True\n",
            version
        );
        ini::parse_raw(&text).unwrap()
    }

    #[test]
    fn legacy_instance_reaches_current_version() {
        let manager = VersionUpgradeManager::new();
        let mut raw = legacy_user_file(2);
        let siblings = manager.upgrade(&mut raw).unwrap();
        assert!(siblings.is_empty());
        assert_eq!(raw.setting_version(), crate::CURRENT_SETTING_VERSION);
        assert_eq!(raw.values.get("infill_overlap").map(String::as_str), Some("15"));
        assert!(!raw.values.contains_key("skin_overlap"));
        assert_eq!(
            raw.values.get("retraction_combing").map(String::as_str),
            Some("all")
        );
    }

    #[test]
    fn upgrading_twice_is_a_no_op() {
        let manager = VersionUpgradeManager::new();
        let mut raw = legacy_user_file(2);
        manager.upgrade(&mut raw).unwrap();
        let snapshot = raw.clone();
        let siblings = manager.upgrade(&mut raw).unwrap();
        assert!(siblings.is_empty());
        assert_eq!(raw, snapshot);
    }

    #[test]
    fn unknown_version_has_no_path() {
        let manager = VersionUpgradeManager::new();
        let mut raw = legacy_user_file(1);
        assert!(manager.upgrade(&mut raw).is_err());
    }

    #[test]
    fn noskin_combing_is_rewritten_for_qualities_only() {
        let manager = VersionUpgradeManager::new();
        let text = "[general]\nversion = 2\nname = Q\nid = q\n\n\
                    [metadata]\ntype = quality\nsetting_version = 4\n\n\
                    [values]\nretraction_combing = noskin\n";
        let mut raw = ini::parse_raw(text).unwrap();
        manager.upgrade(&mut raw).unwrap();
        assert_eq!(
            raw.values.get("retraction_combing").map(String::as_str),
            Some("infill")
        );

        let user_text = text.replace("type = quality", "type = user");
        let mut user_raw = ini::parse_raw(&user_text).unwrap();
        manager.upgrade(&mut user_raw).unwrap();
        assert_eq!(
            user_raw.values.get("retraction_combing").map(String::as_str),
            Some("noskin")
        );
    }

    #[test]
    fn cloud_machine_stack_emits_abstract_companion() {
        let manager = VersionUpgradeManager::new();
        let text = "[general]\nversion = 4\nname = My Printer\nid = printer_1\n\n\
                    [metadata]\ntype = machine\nsetting_version = 5\nconnection_type = 3\n\
                    group_id = 1234\n\n\
                    [containers]\n0 = empty\n";
        let mut raw = ini::parse_raw(text).unwrap();
        let siblings = manager.upgrade(&mut raw).unwrap();
        assert_eq!(siblings.len(), 1);
        let abstract_machine = &siblings[0];
        assert_eq!(
            abstract_machine.general.get("id").map(String::as_str),
            Some("printer_1_abstract_machine")
        );
        assert_eq!(
            abstract_machine.metadata.get("is_abstract_machine").map(String::as_str),
            Some("True")
        );
        assert_eq!(
            abstract_machine.metadata.get("group_id"),
            raw.metadata.get("group_id")
        );
        assert_eq!(abstract_machine.setting_version(), crate::CURRENT_SETTING_VERSION);

        // A USB-only machine stays alone.
        let usb = text.replace("connection_type = 3", "connection_type = 1");
        let mut usb_raw = ini::parse_raw(&usb).unwrap();
        assert!(manager.upgrade(&mut usb_raw).unwrap().is_empty());
    }
}
