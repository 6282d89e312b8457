//! Configuration management.
use crate::error::VcapError;
use config::Config;
use serde::Deserialize;

/// Default listen port when neither file nor environment override it.
pub const DEFAULT_PORT: u16 = 9999;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub port: u16,
    pub log_level: String,
    pub device_name: String,
}

impl Settings {
    /// Loads settings from built-in defaults, an optional TOML file and
    /// `VCAP_*` environment variables, in that precedence order.
    pub fn new(config_name: Option<&str>) -> Result<Self, VcapError> {
        let mut builder = Config::builder()
            .set_default("port", i64::from(DEFAULT_PORT))
            .map_err(VcapError::Config)?
            .set_default("log_level", "info")
            .map_err(VcapError::Config)?
            .set_default("device_name", "VirtualCapability")
            .map_err(VcapError::Config)?;

        if let Some(name) = config_name {
            builder = builder.add_source(config::File::with_name(name));
        }

        let s = builder
            .add_source(config::Environment::with_prefix("VCAP"))
            .build()
            .map_err(VcapError::Config)?;

        s.try_deserialize().map_err(VcapError::Config)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            log_level: "info".to_string(),
            device_name: "VirtualCapability".to_string(),
        }
    }
}
