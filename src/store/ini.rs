use ini::Ini;
use std::collections::HashMap;

use crate::model::{
    ContainerStack, ContainerType, InstanceContainer, SerializationError, SettingInstance,
};

/// File format version written into `[general]`.
pub const CONTAINER_FILE_VERSION: i64 = 4;

/// A parsed-but-untyped container file: the four INI sections as string
/// maps. The version upgrade pipeline rewrites this shape before any typed
/// container is constructed from it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawContainerFile {
    pub general: HashMap<String, String>,
    pub metadata: HashMap<String, String>,
    pub values: HashMap<String, String>,
    /// Stack member ids in precedence order; empty for plain containers.
    pub containers: Vec<String>,
}

impl RawContainerFile {
    pub fn setting_version(&self) -> u32 {
        self.metadata
            .get("setting_version")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    pub fn type_tag(&self) -> Option<&str> {
        self.metadata.get("type").map(|s| s.as_str())
    }
}

pub fn parse_raw(text: &str) -> Result<RawContainerFile, SerializationError> {
    let ini = Ini::load_from_str(text).map_err(|e| SerializationError::Ini(e.to_string()))?;
    let mut raw = RawContainerFile::default();
    for (section, properties) in ini.iter() {
        match section {
            Some("general") => {
                for (key, value) in properties.iter() {
                    raw.general.insert(key.to_string(), value.to_string());
                }
            }
            Some("metadata") => {
                for (key, value) in properties.iter() {
                    raw.metadata.insert(key.to_string(), value.to_string());
                }
            }
            Some("values") => {
                for (key, value) in properties.iter() {
                    raw.values.insert(key.to_string(), value.to_string());
                }
            }
            Some("containers") => {
                let mut indexed: Vec<(usize, String)> = properties
                    .iter()
                    .filter_map(|(key, value)| {
                        key.trim().parse::<usize>().ok().map(|i| (i, value.to_string()))
                    })
                    .collect();
                indexed.sort_by_key(|(index, _)| *index);
                raw.containers = indexed.into_iter().map(|(_, id)| id).collect();
            }
            _ => {}
        }
    }
    if raw.general.is_empty() {
        return Err(SerializationError::MissingSection("general"));
    }
    Ok(raw)
}

pub fn write_raw(raw: &RawContainerFile) -> String {
    let mut ini = Ini::new();
    let sorted = |map: &HashMap<String, String>| {
        let mut entries: Vec<(String, String)> =
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        entries.sort();
        entries
    };
    for (key, value) in sorted(&raw.general) {
        ini.set_to(Some("general"), key, value);
    }
    for (key, value) in sorted(&raw.metadata) {
        ini.set_to(Some("metadata"), key, value);
    }
    if !raw.values.is_empty() {
        for (key, value) in sorted(&raw.values) {
            ini.set_to(Some("values"), key, value);
        }
    }
    for (index, id) in raw.containers.iter().enumerate() {
        ini.set_to(Some("containers"), index.to_string(), id.clone());
    }
    let mut out = Vec::new();
    // Writing to a Vec cannot fail.
    let _ = ini.write_to(&mut out);
    String::from_utf8(out).unwrap_or_default()
}

/// Decode an instance container from its INI form. `fallback_id` supplies
/// the id when `[general]` lacks one (historically the file stem).
pub fn instance_from_raw(
    raw: &RawContainerFile,
    fallback_id: Option<&str>,
) -> Result<InstanceContainer, SerializationError> {
    let id = raw
        .general
        .get("id")
        .cloned()
        .or_else(|| fallback_id.map(|s| s.to_string()))
        .ok_or(SerializationError::MissingField("general.id"))?;
    let name = raw
        .general
        .get("name")
        .cloned()
        .ok_or(SerializationError::MissingField("general.name"))?;
    let type_tag = raw
        .metadata
        .get("type")
        .ok_or(SerializationError::MissingField("metadata.type"))?;
    let container_type = ContainerType::parse(type_tag)
        .ok_or(SerializationError::MissingField("metadata.type"))?;

    let mut container = InstanceContainer::new(id, name, container_type);
    container.metadata = crate::model::Metadata::new();
    for (key, value) in &raw.metadata {
        container.metadata.set(key.clone(), value.clone());
    }
    container.metadata.set("type", container_type.as_str());
    for (key, value) in &raw.values {
        container.settings.insert(
            key.clone(),
            SettingInstance::with_value(crate::model::SettingValue::Str(value.clone())),
        );
    }
    Ok(container)
}

pub fn deserialize_instance(
    text: &str,
    fallback_id: Option<&str>,
) -> Result<InstanceContainer, SerializationError> {
    let raw = parse_raw(text)?;
    instance_from_raw(&raw, fallback_id)
}

pub fn serialize_instance(container: &InstanceContainer) -> String {
    let mut raw = RawContainerFile::default();
    raw.general
        .insert("version".into(), CONTAINER_FILE_VERSION.to_string());
    raw.general.insert("id".into(), container.id.clone());
    raw.general.insert("name".into(), container.name.clone());
    for (key, value) in container.metadata.iter() {
        raw.metadata.insert(key.clone(), value.to_string());
    }
    for (key, instance) in &container.settings {
        if let Some(value) = instance.properties.get("value") {
            raw.values.insert(key.clone(), value.to_string());
        }
    }
    write_raw(&raw)
}

/// Decode a stack file. Slot repair happens later, against the registry.
pub fn stack_from_raw(
    raw: &RawContainerFile,
    fallback_id: Option<&str>,
) -> Result<ContainerStack, SerializationError> {
    let id = raw
        .general
        .get("id")
        .cloned()
        .or_else(|| fallback_id.map(|s| s.to_string()))
        .ok_or(SerializationError::MissingField("general.id"))?;
    let name = raw
        .general
        .get("name")
        .cloned()
        .unwrap_or_else(|| id.clone());
    let mut stack = ContainerStack::new(id, name);
    stack.metadata = crate::model::Metadata::new();
    for (key, value) in &raw.metadata {
        stack.metadata.set(key.clone(), value.clone());
    }
    stack.containers = raw.containers.clone();
    Ok(stack)
}

pub fn deserialize_stack(
    text: &str,
    fallback_id: Option<&str>,
) -> Result<ContainerStack, SerializationError> {
    let raw = parse_raw(text)?;
    stack_from_raw(&raw, fallback_id)
}

pub fn serialize_stack(stack: &ContainerStack) -> String {
    let mut raw = RawContainerFile::default();
    raw.general
        .insert("version".into(), CONTAINER_FILE_VERSION.to_string());
    raw.general.insert("id".into(), stack.id.clone());
    raw.general.insert("name".into(), stack.name.clone());
    for (key, value) in stack.metadata.iter() {
        raw.metadata.insert(key.clone(), value.to_string());
    }
    raw.containers = stack.containers.clone();
    write_raw(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Metadata;

    const USER_CFG: &str = "\
[general]
version = 4
name = My Settings
id = printer_1_user

[metadata]
type = user
setting_version = 6
machine = printer_1

[values]
layer_height = 0.1
infill_sparse_density = 20
";

    #[test]
    fn instance_round_trip_preserves_semantics() {
        let container = deserialize_instance(USER_CFG, None).unwrap();
        assert_eq!(container.id, "printer_1_user");
        assert_eq!(container.container_type, ContainerType::User);
        assert_eq!(
            container
                .property("layer_height", "value")
                .and_then(|v| v.as_float()),
            Some(0.1)
        );

        let text = serialize_instance(&container);
        let back = deserialize_instance(&text, None).unwrap();
        assert_eq!(back.id, container.id);
        assert_eq!(back.name, container.name);
        assert_eq!(back.metadata.get_str("machine"), Some("printer_1".into()));
        assert_eq!(
            back.property("infill_sparse_density", "value")
                .and_then(|v| v.as_int()),
            Some(20)
        );
    }

    #[test]
    fn stack_round_trip_preserves_container_order() {
        let mut stack = ContainerStack::new("printer_1", "Printer");
        stack.metadata = Metadata::new();
        stack.metadata.set("type", "machine");
        stack.containers = vec![
            "printer_1_user".into(),
            "empty_quality_changes".into(),
            "empty_intent".into(),
            "normal".into(),
            "generic_pla".into(),
            "0.4mm_nozzle".into(),
            "printer_1_settings".into(),
            "test_printer".into(),
        ];
        let text = serialize_stack(&stack);
        let back = deserialize_stack(&text, None).unwrap();
        assert_eq!(back.containers, stack.containers);
        assert_eq!(back.metadata.get_str("type"), Some("machine".into()));
    }

    #[test]
    fn missing_general_section_is_an_error() {
        assert!(matches!(
            parse_raw("[metadata]\ntype = user\n"),
            Err(SerializationError::MissingSection("general"))
        ));
    }

    #[test]
    fn unknown_type_tag_is_rejected() {
        let bad = "[general]\nname = x\nid = x\n\n[metadata]\ntype = nonsense\n";
        assert!(deserialize_instance(bad, None).is_err());
    }
}
