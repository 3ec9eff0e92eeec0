use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

pub type Id = String;

/// Parse the loose boolean spelling used in persisted metadata ("True",
/// "true", "yes", "1").
pub fn parse_bool(value: &str) -> bool {
    matches!(value.trim(), "True" | "true" | "Yes" | "yes" | "1")
}

pub fn generate_id(prefix: &str) -> Id {
    format!("{}_{}", prefix, Uuid::new_v4().simple())
}

/// A single setting or metadata value.
///
/// INI files only give us strings; the typed accessors on [`Metadata`] and
/// the evaluator coerce on access instead of at parse time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<SettingValue>),
    Map(HashMap<String, SettingValue>),
}

impl SettingValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SettingValue::Bool(b) => Some(*b),
            SettingValue::Int(i) => Some(*i != 0),
            SettingValue::Str(s) => Some(parse_bool(s)),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            SettingValue::Int(i) => Some(*i),
            SettingValue::Float(f) => Some(*f as i64),
            SettingValue::Bool(b) => Some(*b as i64),
            SettingValue::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            SettingValue::Float(f) => Some(*f),
            SettingValue::Int(i) => Some(*i as f64),
            SettingValue::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SettingValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Truthiness as used by boolean reductions in setting expressions.
    pub fn is_truthy(&self) -> bool {
        match self {
            SettingValue::Bool(b) => *b,
            SettingValue::Int(i) => *i != 0,
            SettingValue::Float(f) => *f != 0.0,
            SettingValue::Str(s) => !s.is_empty() && parse_bool(s),
            SettingValue::List(l) => !l.is_empty(),
            SettingValue::Map(m) => !m.is_empty(),
        }
    }
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingValue::Bool(b) => write!(f, "{}", if *b { "True" } else { "False" }),
            SettingValue::Int(i) => write!(f, "{}", i),
            SettingValue::Float(v) => write!(f, "{}", v),
            SettingValue::Str(s) => write!(f, "{}", s),
            SettingValue::List(_) | SettingValue::Map(_) => {
                // Nested values only occur in definition metadata, which is
                // persisted as JSON rather than INI.
                write!(
                    f,
                    "{}",
                    serde_json::to_string(self).unwrap_or_else(|_| String::new())
                )
            }
        }
    }
}

impl From<&str> for SettingValue {
    fn from(value: &str) -> Self {
        SettingValue::Str(value.to_string())
    }
}

impl From<String> for SettingValue {
    fn from(value: String) -> Self {
        SettingValue::Str(value)
    }
}

impl From<bool> for SettingValue {
    fn from(value: bool) -> Self {
        SettingValue::Bool(value)
    }
}

impl From<i64> for SettingValue {
    fn from(value: i64) -> Self {
        SettingValue::Int(value)
    }
}

impl From<f64> for SettingValue {
    fn from(value: f64) -> Self {
        SettingValue::Float(value)
    }
}

/// Typed metadata map attached to every container and stack.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata(pub HashMap<String, SettingValue>);

impl Metadata {
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    pub fn get(&self, key: &str) -> Option<&SettingValue> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        self.0.get(key).map(|v| v.to_string())
    }

    pub fn get_str_or(&self, key: &str, default: &str) -> String {
        self.get_str(key).unwrap_or_else(|| default.to_string())
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.0.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.0.get(key).and_then(|v| v.as_int())
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<SettingValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<SettingValue> {
        self.0.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &SettingValue)> {
        self.0.iter()
    }
}

/// The type tag a container carries in its metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerType {
    Definition,
    DefinitionChanges,
    Variant,
    Material,
    Quality,
    Intent,
    QualityChanges,
    User,
}

impl ContainerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerType::Definition => "definition",
            ContainerType::DefinitionChanges => "definition_changes",
            ContainerType::Variant => "variant",
            ContainerType::Material => "material",
            ContainerType::Quality => "quality",
            ContainerType::Intent => "intent",
            ContainerType::QualityChanges => "quality_changes",
            ContainerType::User => "user",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "definition" => ContainerType::Definition,
            "definition_changes" => ContainerType::DefinitionChanges,
            "variant" => ContainerType::Variant,
            "material" => ContainerType::Material,
            "quality" => ContainerType::Quality,
            "intent" => ContainerType::Intent,
            "quality_changes" => ContainerType::QualityChanges,
            "user" => ContainerType::User,
            _ => return None,
        })
    }
}

impl fmt::Display for ContainerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed slot positions of a profile stack, index 0 = highest precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Slot {
    UserChanges = 0,
    QualityChanges = 1,
    Intent = 2,
    Quality = 3,
    Material = 4,
    Variant = 5,
    DefinitionChanges = 6,
    Definition = 7,
}

pub const SLOT_COUNT: usize = 8;

impl Slot {
    pub const ALL: [Slot; SLOT_COUNT] = [
        Slot::UserChanges,
        Slot::QualityChanges,
        Slot::Intent,
        Slot::Quality,
        Slot::Material,
        Slot::Variant,
        Slot::DefinitionChanges,
        Slot::Definition,
    ];

    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn from_index(index: usize) -> Option<Slot> {
        Slot::ALL.get(index).copied()
    }

    /// The container type a slot accepts.
    pub fn expected_type(&self) -> ContainerType {
        match self {
            Slot::UserChanges => ContainerType::User,
            Slot::QualityChanges => ContainerType::QualityChanges,
            Slot::Intent => ContainerType::Intent,
            Slot::Quality => ContainerType::Quality,
            Slot::Material => ContainerType::Material,
            Slot::Variant => ContainerType::Variant,
            Slot::DefinitionChanges => ContainerType::DefinitionChanges,
            Slot::Definition => ContainerType::Definition,
        }
    }

    /// Id of the per-type empty sentinel container for this slot.
    ///
    /// The Definition slot has no sentinel; a stack without a definition is
    /// invalid.
    pub fn empty_id(&self) -> &'static str {
        match self {
            Slot::UserChanges => "empty",
            Slot::QualityChanges => "empty_quality_changes",
            Slot::Intent => "empty_intent",
            Slot::Quality => "empty_quality",
            Slot::Material => "empty_material",
            Slot::Variant => "empty_variant",
            Slot::DefinitionChanges => "empty_definition_changes",
            Slot::Definition => "empty_definition",
        }
    }
}

/// State of a user-modifiable setting property.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    #[default]
    Default,
    User,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setting_value_coercions() {
        assert_eq!(SettingValue::Str("0.15".into()).as_float(), Some(0.15));
        assert_eq!(SettingValue::Str("3".into()).as_int(), Some(3));
        assert_eq!(SettingValue::Str("True".into()).as_bool(), Some(true));
        assert_eq!(SettingValue::Int(0).as_bool(), Some(false));
        assert!(!SettingValue::Str("False".into()).is_truthy());
    }

    #[test]
    fn display_round_trips_through_ini_strings() {
        assert_eq!(SettingValue::Bool(true).to_string(), "True");
        assert_eq!(SettingValue::Float(0.2).to_string(), "0.2");
        assert_eq!(SettingValue::Int(-1).to_string(), "-1");
    }

    #[test]
    fn slot_type_mapping_is_total() {
        for slot in Slot::ALL {
            assert_eq!(Slot::from_index(slot.index()), Some(slot));
            let dups = Slot::ALL
                .iter()
                .filter(|s| s.empty_id() == slot.empty_id())
                .count();
            assert_eq!(dups, 1);
        }
    }

    #[test]
    fn metadata_decodes_ini_strings_on_access() {
        let mut meta = Metadata::new();
        meta.set("has_variants", "True");
        meta.set("position", "2");
        assert!(meta.get_bool("has_variants", false));
        assert_eq!(meta.get_int("position"), Some(2));
    }
}
