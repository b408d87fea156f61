mod raw;
mod loader;
pub mod error;

pub use error::ConfigError;
pub use loader::{
    load_device_config, parse_device_config, BrokerConfig, ConfigMode, DeviceConfig,
    HttpNodeAuth,
};
