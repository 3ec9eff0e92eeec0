use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::model::{Expr, Id, Metadata, SerializationError, SettingValue};

/// Schema entry for one setting key in a definition container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Data type as declared in the schema ("float", "bool", "int", "str",
    /// "enum", "extruder", ...).
    #[serde(rename = "type", default)]
    pub setting_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<SettingValue>,
    /// Expression computing the value when no container overrides it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Expr>,
    /// Expression aggregating per-extruder values into a global answer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolve: Option<Expr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<Expr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_value: Option<SettingValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum_value: Option<SettingValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<HashMap<String, String>>,
    #[serde(default = "default_settable_per_extruder")]
    pub settable_per_extruder: bool,
    /// Expression yielding the extruder position that owns this setting;
    /// -1 means not limited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_to_extruder: Option<Expr>,
}

fn default_settable_per_extruder() -> bool {
    true
}

/// On-disk shape of a `.def.json` file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DefinitionFile {
    #[serde(default)]
    version: Option<i64>,
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    inherits: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, SettingValue>,
    #[serde(default)]
    settings: HashMap<String, SettingDefinition>,
    /// Partial setting overrides applied on top of an inherited schema.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    overrides: HashMap<String, SettingDefinition>,
}

/// Read-only container carrying the settings schema for a machine or
/// extruder definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefinitionContainer {
    pub id: Id,
    pub name: String,
    pub metadata: Metadata,
    pub settings: HashMap<String, SettingDefinition>,
    /// Id of the parent definition this one inherits from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inherits: Option<Id>,
    /// key -> keys whose value/resolve expressions reference it.
    #[serde(skip)]
    pub relations: HashMap<String, Vec<String>>,
}

impl DefinitionContainer {
    pub fn new(id: impl Into<Id>, name: impl Into<String>) -> Self {
        let mut meta = Metadata::new();
        meta.set("type", "definition");
        Self {
            id: id.into(),
            name: name.into(),
            metadata: meta,
            settings: HashMap::new(),
            inherits: None,
            relations: HashMap::new(),
        }
    }

    /// Parse a `.def.json` document. The id is taken from the file name by
    /// convention and therefore passed in.
    pub fn deserialize(id: impl Into<Id>, text: &str) -> Result<Self, SerializationError> {
        let file: DefinitionFile = serde_json::from_str(text)?;
        let mut metadata = Metadata::new();
        metadata.set("type", "definition");
        for (key, value) in file.metadata {
            metadata.set(key, value);
        }
        let mut settings = file.settings;
        for (key, over) in file.overrides {
            settings.insert(key, over);
        }
        let mut container = Self {
            id: id.into(),
            name: file.name,
            metadata,
            settings,
            inherits: file.inherits,
            relations: HashMap::new(),
        };
        container.rebuild_relations();
        Ok(container)
    }

    pub fn serialize(&self) -> Result<String, SerializationError> {
        let file = DefinitionFile {
            version: Some(2),
            name: self.name.clone(),
            inherits: self.inherits.clone(),
            metadata: self.metadata.0.clone(),
            settings: self.settings.clone(),
            overrides: HashMap::new(),
        };
        Ok(serde_json::to_string_pretty(&file)?)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.settings.contains_key(key)
    }

    pub fn setting(&self, key: &str) -> Option<&SettingDefinition> {
        self.settings.get(key)
    }

    /// Merge an inherited parent schema below this one: the child keeps its
    /// own settings and metadata where both define them.
    pub fn merge_parent(&mut self, parent: &DefinitionContainer) {
        for (key, definition) in &parent.settings {
            self.settings
                .entry(key.clone())
                .or_insert_with(|| definition.clone());
        }
        for (key, value) in parent.metadata.iter() {
            if !self.metadata.contains(key) {
                self.metadata.set(key.clone(), value.clone());
            }
        }
        self.rebuild_relations();
    }

    /// Recompute the reverse-reference map from value/resolve expressions.
    pub fn rebuild_relations(&mut self) {
        let mut relations: HashMap<String, Vec<String>> = HashMap::new();
        for (key, definition) in &self.settings {
            let mut referenced = Vec::new();
            if let Some(expr) = &definition.value {
                collect_refs(expr, &mut referenced);
            }
            if let Some(expr) = &definition.resolve {
                collect_refs(expr, &mut referenced);
            }
            for target in referenced {
                let entry = relations.entry(target).or_default();
                if !entry.contains(key) {
                    entry.push(key.clone());
                }
            }
        }
        self.relations = relations;
    }
}

fn collect_refs(expr: &Expr, out: &mut Vec<String>) {
    match expr {
        Expr::Ref { key } | Expr::ExtruderValues { key } => out.push(key.clone()),
        Expr::Lit { .. } => {}
        Expr::Any { of }
        | Expr::All { of }
        | Expr::Sum { of }
        | Expr::Min { of }
        | Expr::Max { of }
        | Expr::Count { of }
        | Expr::Not { of } => collect_refs(of, out),
        Expr::Add { left, right }
        | Expr::Sub { left, right }
        | Expr::Mul { left, right }
        | Expr::Div { left, right }
        | Expr::And { left, right }
        | Expr::Or { left, right }
        | Expr::Eq { left, right }
        | Expr::Gt { left, right }
        | Expr::Lt { left, right } => {
            collect_refs(left, out);
            collect_refs(right, out);
        }
        Expr::If { cond, then, r#else } => {
            collect_refs(cond, out);
            collect_refs(then, out);
            collect_refs(r#else, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MACHINE_JSON: &str = r#"{
        "version": 2,
        "name": "Test Printer",
        "metadata": {
            "type": "machine",
            "has_variants": true,
            "preferred_variant_name": "0.4 mm",
            "machine_extruder_trains": {"0": "test_extruder_0", "1": "test_extruder_1"}
        },
        "settings": {
            "layer_height": {"type": "float", "default_value": 0.2, "settable_per_extruder": false},
            "support_enable": {"type": "bool", "default_value": false},
            "support_enabled_global": {
                "type": "bool",
                "default_value": false,
                "settable_per_extruder": false,
                "resolve": {"op": "any", "of": {"op": "extruder_values", "key": "support_enable"}}
            }
        }
    }"#;

    #[test]
    fn deserializes_schema_and_metadata() {
        let def = DefinitionContainer::deserialize("test_printer", MACHINE_JSON).unwrap();
        assert_eq!(def.name, "Test Printer");
        assert!(def.metadata.get_bool("has_variants", false));
        assert_eq!(
            def.setting("layer_height").unwrap().default_value,
            Some(SettingValue::Float(0.2))
        );
        assert!(!def.setting("layer_height").unwrap().settable_per_extruder);
        assert!(def.setting("support_enable").unwrap().settable_per_extruder);
    }

    #[test]
    fn relations_track_expression_references() {
        let def = DefinitionContainer::deserialize("test_printer", MACHINE_JSON).unwrap();
        let dependants = def.relations.get("support_enable").unwrap();
        assert_eq!(dependants, &vec!["support_enabled_global".to_string()]);
    }

    #[test]
    fn inherited_settings_fill_gaps_only() {
        let mut child = DefinitionContainer::new("child", "Child");
        child.settings.insert(
            "layer_height".into(),
            SettingDefinition {
                default_value: Some(SettingValue::Float(0.1)),
                settable_per_extruder: false,
                ..Default::default()
            },
        );
        let parent = DefinitionContainer::deserialize("test_printer", MACHINE_JSON).unwrap();
        child.merge_parent(&parent);
        // Child keeps its override, gains the parent-only keys.
        assert_eq!(
            child.setting("layer_height").unwrap().default_value,
            Some(SettingValue::Float(0.1))
        );
        assert!(child.contains_key("support_enable"));
    }
}
