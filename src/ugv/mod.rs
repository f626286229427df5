pub mod command;
pub mod mission;
pub mod nav;
pub mod params;
mod task;

use std::{path::PathBuf, time::Duration};

use crate::config::UgvSystemConfig;
use crate::interop::{InteropClient, TargetSource};
use crate::link::MavlinkConnector;

pub use command::*;
pub use task::*;

const DEFAULT_REFRESH_INTERVAL_MS: u64 = 1000;

pub fn create_task(config: &UgvSystemConfig) -> anyhow::Result<ControlTask> {
    let connector = MavlinkConnector::new(&config.ugv)?;

    let target_source = match &config.interop {
        Some(interop) => Some(Box::new(InteropClient::new(interop)?) as Box<dyn TargetSource>),
        None => None,
    };

    Ok(ControlTask::new(
        Box::new(connector),
        target_source,
        Duration::from_millis(
            config
                .ugv
                .refresh_interval_ms
                .unwrap_or(DEFAULT_REFRESH_INTERVAL_MS),
        ),
        config
            .ugv
            .params_file
            .clone()
            .unwrap_or_else(|| PathBuf::from("ugv_params.json")),
    ))
}
