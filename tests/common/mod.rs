use stackforge::{
    Container, ContainerRegistry, ContainerType, DefinitionContainer, InstanceContainer,
    MachineManager,
};

pub const MACHINE_DEFINITION: &str = r#"{
    "version": 2,
    "name": "Test Printer",
    "metadata": {
        "type": "machine",
        "has_variants": true,
        "has_materials": true,
        "has_machine_quality": true,
        "preferred_variant_name": "0.4 mm",
        "preferred_material": "generic_pla",
        "preferred_quality_type": "normal",
        "machine_extruder_trains": {"0": "test_extruder", "1": "test_extruder"}
    },
    "settings": {
        "machine_extruder_count": {
            "type": "int",
            "default_value": 2,
            "settable_per_extruder": false
        },
        "layer_height": {
            "type": "float",
            "default_value": 0.2,
            "settable_per_extruder": false
        },
        "support_enable": {
            "type": "bool",
            "default_value": false
        },
        "support_enabled": {
            "type": "bool",
            "default_value": false,
            "settable_per_extruder": false,
            "resolve": {"op": "any", "of": {"op": "extruder_values", "key": "support_enable"}}
        },
        "adhesion_extruder_nr": {
            "type": "optional_extruder",
            "default_value": -1,
            "settable_per_extruder": false
        },
        "infill_sparse_density": {
            "type": "float",
            "default_value": 20
        }
    }
}"#;

pub const EXTRUDER_DEFINITION: &str = r#"{
    "version": 2,
    "name": "Test Extruder",
    "metadata": {
        "type": "extruder"
    },
    "settings": {
        "material_diameter": {
            "type": "float",
            "default_value": 2.85
        },
        "extruder_nr": {
            "type": "int",
            "default_value": 0
        }
    }
}"#;

pub fn instance_with(
    id: &str,
    container_type: ContainerType,
    metadata: &[(&str, &str)],
) -> InstanceContainer {
    let mut container = InstanceContainer::new(id, id, container_type);
    for (key, value) in metadata {
        container.metadata.set(key.to_string(), value.to_string());
    }
    container
}

/// A registry with one two-extruder printer's worth of profiles:
/// two nozzles, three materials, global + specialised qualities, and an
/// engineering intent for PLA at 0.4 mm.
pub fn seeded_registry() -> ContainerRegistry {
    let mut registry = ContainerRegistry::new();
    registry.add_container(Container::Definition(
        DefinitionContainer::deserialize("test_printer", MACHINE_DEFINITION).unwrap(),
    ));
    registry.add_container(Container::Definition(
        DefinitionContainer::deserialize("test_extruder", EXTRUDER_DEFINITION).unwrap(),
    ));
    registry.add_container(Container::Definition(
        DefinitionContainer::deserialize("fdmextruder", EXTRUDER_DEFINITION).unwrap(),
    ));

    for (id, name) in [("nozzle_04", "0.4 mm"), ("nozzle_06", "0.6 mm")] {
        registry.add_container(Container::Instance(instance_with(
            id,
            ContainerType::Variant,
            &[
                ("name", name),
                ("definition", "test_printer"),
                ("hardware_type", "nozzle"),
            ],
        )));
    }

    for (id, compatible) in [
        ("generic_pla", "True"),
        ("generic_abs", "True"),
        ("generic_nylon", "False"),
    ] {
        registry.add_container(Container::Instance(instance_with(
            id,
            ContainerType::Material,
            &[
                ("name", id),
                ("definition", "fdmprinter"),
                ("base_file", id),
                ("material", id),
                ("brand", "Generic"),
                ("GUID", id),
                ("approximate_diameter", "3"),
                ("compatible", compatible),
            ],
        )));
    }

    for (id, quality_type) in [("normal_global", "normal"), ("draft_global", "draft")] {
        registry.add_container(Container::Instance(instance_with(
            id,
            ContainerType::Quality,
            &[
                ("name", quality_type),
                ("definition", "test_printer"),
                ("quality_type", quality_type),
                ("global_quality", "True"),
            ],
        )));
    }

    // Specialised qualities: PLA prints at normal and draft under 0.4 mm
    // and at normal under 0.6 mm; ABS and nylon only at normal under
    // 0.4 mm.
    for (id, quality_type, material, variant) in [
        ("normal_pla_04", "normal", "generic_pla", "0.4 mm"),
        ("draft_pla_04", "draft", "generic_pla", "0.4 mm"),
        ("normal_pla_06", "normal", "generic_pla", "0.6 mm"),
        ("normal_abs_04", "normal", "generic_abs", "0.4 mm"),
        ("normal_nylon_04", "normal", "generic_nylon", "0.4 mm"),
    ] {
        registry.add_container(Container::Instance(instance_with(
            id,
            ContainerType::Quality,
            &[
                ("name", quality_type),
                ("definition", "test_printer"),
                ("quality_type", quality_type),
                ("variant", variant),
                ("material", material),
            ],
        )));
    }

    registry.add_container(Container::Instance(instance_with(
        "engineering_pla_04",
        ContainerType::Intent,
        &[
            ("name", "Engineering"),
            ("definition", "test_printer"),
            ("variant", "0.4 mm"),
            ("material", "generic_pla"),
            ("quality_type", "normal"),
            ("intent_category", "engineering"),
        ],
    )));

    registry
}

/// A manager with the seeded registry and one active machine.
pub fn seeded_manager() -> MachineManager {
    let mut manager = MachineManager::new(seeded_registry());
    assert!(manager.add_machine("test_printer", Some("My Printer")));
    manager
}
