pub mod config;
pub mod logic;
pub mod model;
pub mod signals;
pub mod store;

// Export the core types at the crate root.
pub use config::AppConfig;
pub use logic::{
    ConfigurationErrorMessage, ContainerTree, MachineManager, QualityChangesGroup, QualityGroup,
    SettingLookup, StackBuilder, VersionUpgradeManager,
};
pub use model::*;
pub use signals::{Channel, Event, SignalBus};
pub use store::{ContainerRegistry, StackEntry};

/// Schema version every active container must carry; files behind this are
/// routed through the upgrade pipeline at load time.
pub const CURRENT_SETTING_VERSION: u32 = 6;
