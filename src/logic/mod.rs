pub mod machine_manager;
pub mod quality;
pub mod resolve;
pub mod stack_builder;
pub mod tree;
pub mod upgrade;

pub use machine_manager::{
    ConfigurationErrorMessage, MachineManager, RemoteConfiguration, RemoteExtruderConfiguration,
};
pub use quality::{QualityChangesGroup, QualityGroup};
pub use resolve::{PropertyContext, SettingLookup};
pub use stack_builder::StackBuilder;
pub use tree::{ContainerTree, MachineNode, MaterialNode, QualityNode, VariantNode};
pub use upgrade::{UpgradeTarget, VersionUpgradeManager};
