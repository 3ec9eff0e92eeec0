use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub resources: ResourceConfig,
}

/// Where container files live on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Read-only bundled resources: definitions, variants, materials,
    /// qualities, intents.
    pub data_dir: PathBuf,
    /// Writable per-user resources: machine stacks, user changes, custom
    /// profiles.
    pub user_dir: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            resources: ResourceConfig::default(),
        }
    }
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("resources"),
            user_dir: PathBuf::from("user"),
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, an optional `stackforge.toml`, and
    /// `STACKFORGE_*` environment overrides, in that order.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = config::Config::builder();

        config = config.add_source(config::Config::try_from(&AppConfig::default())?);
        config = config.add_source(config::File::with_name("stackforge").required(false));
        config = config.add_source(
            config::Environment::with_prefix("STACKFORGE").separator("__"),
        );

        let config = config.build()?;
        Ok(config.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_a_config_file() {
        let config = AppConfig::load().unwrap();
        assert_eq!(config.resources.data_dir, PathBuf::from("resources"));
        assert_eq!(config.resources.user_dir, PathBuf::from("user"));
    }
}
