use std::path::PathBuf;

use config::{Config, ConfigError};
use serde::Deserialize;

use crate::link::LinkEndpoint;

#[derive(Debug, Clone, Deserialize)]
pub struct UgvConfig {
    /// Transport used to reach the vehicle's telemetry radio.
    pub endpoint: LinkEndpoint,

    /// MAVLink wire version, "V1" or "V2".
    pub mavlink: String,

    /// Interval between background telemetry refreshes, in milliseconds.
    pub refresh_interval_ms: Option<u64>,

    /// Where parameter snapshots are saved and loaded.
    pub params_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InteropConfig {
    /// Base URL of the interop server that supplies the drop target.
    pub address: String,
}

#[derive(Debug, Deserialize)]
pub struct UgvSystemConfig {
    pub ugv: UgvConfig,
    pub interop: Option<InteropConfig>,
}

impl UgvSystemConfig {
    pub fn read() -> Result<Self, ConfigError> {
        let mut c = Config::new();

        c.merge(config::File::with_name("ugv-system"))?;
        c.merge(config::Environment::with_prefix("UGV_SYSTEM"))?;

        c.try_into()
    }

    pub fn read_from_path(path: PathBuf) -> Result<Self, ConfigError> {
        let mut c = Config::new();

        c.merge(config::File::from(path))?;
        c.merge(config::Environment::with_prefix("UGV_SYSTEM"))?;

        c.try_into()
    }
}
