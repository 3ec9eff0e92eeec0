use stackforge::{AppConfig, ContainerRegistry, MachineManager, VersionUpgradeManager};

/// Load the configured resource directories and print what the engine sees:
/// machines, their extruders, and the quality groups available to each.
fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = AppConfig::load()?;
    let upgrades = VersionUpgradeManager::new();
    let mut registry = ContainerRegistry::new();
    registry.load_directory(&config.resources.data_dir, &upgrades);
    registry.load_directory(&config.resources.user_dir, &upgrades);

    let machine_ids: Vec<String> = registry.global_stacks().map(|g| g.id().clone()).collect();
    let mut manager = MachineManager::new(registry);
    if machine_ids.is_empty() {
        println!("no machines configured");
        return Ok(());
    }

    for machine_id in machine_ids {
        manager.set_active_machine(Some(&machine_id));
        let Some(global) = manager.active_machine() else {
            println!("{}: failed validation", machine_id);
            continue;
        };
        println!("{} ({})", global.name(), machine_id);
        for (position, _) in manager.extruder_ids().iter().enumerate() {
            println!(
                "  extruder {}: variant={} material={}",
                position,
                manager.active_variant_name(position),
                manager.active_material_base_file(position),
            );
        }
        let mut quality_types: Vec<String> = manager
            .current_quality_groups()
            .into_iter()
            .filter(|(_, group)| group.is_available)
            .map(|(quality_type, _)| quality_type)
            .collect();
        quality_types.sort();
        println!(
            "  quality types: {} (active: {})",
            quality_types.join(", "),
            manager.active_quality_type()
        );
    }
    Ok(())
}
