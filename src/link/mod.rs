//! The narrow interface the controller consumes to talk to a vehicle.
//!
//! The controller owns exactly one link and is its only writer; everything
//! behind this trait (wire protocol, handshakes, retries) belongs to the
//! link implementation.

mod mavlink;

use std::{collections::BTreeMap, net::SocketAddr, time::Duration};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::state::{Attitude, Coords3D, GpsQuality};
use crate::ugv::mission::MissionCommand;

pub use self::mavlink::{MavlinkConnector, MavlinkVehicleLink};

fn default_baud() -> u32 {
    57600
}

/// How to reach the vehicle's telemetry transport.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum LinkEndpoint {
    Udp {
        address: SocketAddr,
    },
    Serial {
        path: String,
        #[serde(default = "default_baud")]
        baud: u32,
    },
}

/// The link's live mirror of vehicle telemetry, read without blocking on
/// the radio. Attitude angles are in radians; speed is in meters per second.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawTelemetry {
    pub position: Coords3D,
    pub attitude: Attitude,
    pub ground_speed: f64,
    pub battery_voltage: f64,
    pub gps: GpsQuality,
    pub mode: String,
    pub status: String,
    pub armed: bool,
    pub armable: bool,
}

/// Failure of a blocking link command, with the deadline case kept separate
/// so callers can decide whether a retry is meaningful.
#[derive(Debug, Error)]
pub enum LinkCommandError {
    #[error("the vehicle did not confirm within the deadline")]
    Timeout,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Telemetry and command channels of a connected vehicle.
///
/// Mission operations mirror the transport's staged model: `mission_clear`
/// and `mission_add` edit a staged list, `mission_upload` transfers it in
/// one handshake. A failure mid-transfer leaves the vehicle-side mission
/// undefined; the transport offers no rollback.
#[async_trait]
pub trait VehicleLink: Send {
    /// Reads the current telemetry mirror. Fails only if the link itself
    /// has broken, never because a single message was late.
    async fn read_telemetry(&mut self) -> anyhow::Result<RawTelemetry>;

    async fn set_mode(&mut self, mode: &str) -> anyhow::Result<()>;

    async fn arm(&mut self, timeout: Duration) -> Result<(), LinkCommandError>;

    async fn disarm(&mut self, timeout: Duration) -> Result<(), LinkCommandError>;

    async fn reboot(&mut self) -> anyhow::Result<()>;

    /// Sets the vehicle's home position to its current location.
    async fn set_home(&mut self) -> anyhow::Result<()>;

    /// Raw RC channel values, one per configured channel.
    async fn rc_channels(&mut self) -> anyhow::Result<Vec<u16>>;

    async fn mission_download(&mut self) -> anyhow::Result<Vec<MissionCommand>>;

    fn mission_clear(&mut self);

    fn mission_add(&mut self, command: MissionCommand);

    async fn mission_upload(&mut self) -> anyhow::Result<()>;

    /// Whether the one-time initial parameter transfer has completed.
    fn params_ready(&self) -> bool;

    /// Blocks until the initial parameter transfer completes. No deadline:
    /// callers wait until ready or the process is torn down.
    async fn wait_params_ready(&mut self) -> anyhow::Result<()>;

    async fn param_get(&mut self, key: &str) -> anyhow::Result<Option<f64>>;

    async fn param_set(&mut self, key: &str, value: f64) -> anyhow::Result<()>;

    async fn param_items(&mut self) -> anyhow::Result<BTreeMap<String, f64>>;
}

/// Establishes vehicle links. The controller goes through this seam so the
/// transport can be swapped out under test.
#[async_trait]
pub trait LinkConnector: Send {
    async fn connect(&mut self) -> anyhow::Result<Box<dyn VehicleLink>>;
}
