mod config;
mod descriptor;
mod error;
mod instance;

pub use config::{Settings, WILDCARD_INSTANCE};
pub use descriptor::{
    parse_release_version, parse_version_descriptor, read_version_file, VersionDescriptor,
};
pub use error::UpgradeError;
pub use instance::{
    instance_name, is_instance, parse_instance_config, read_instance_config, set_installed,
    DatabaseConfig, InstanceConfig, OjsInstance,
};
