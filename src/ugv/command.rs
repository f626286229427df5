use std::{collections::BTreeMap, path::PathBuf};

use clap::Subcommand;
use serde::Serialize;

use crate::state::{ArmState, Coords2D, GpsQuality, RoverMode};
use crate::ugv::mission::MissionCommand;

/// The full operation surface of the vehicle controller. Parsed straight
/// from interactive input; also the programmatic request type.
#[derive(Subcommand, Debug, Clone)]
pub enum UgvRequest {
    /// establish the vehicle link and prime the first snapshot
    Connect,

    /// re-read telemetry from the link into the snapshot
    Update,

    /// positional telemetry from the last refresh
    Quick,

    /// everything: telemetry, mode, mission, arming classification
    Stats,

    /// set the vehicle's home position to its current location
    SetHome,

    /// placeholder: no vehicle-side calibration sequence is implemented
    Calibrate,

    /// reboot the autopilot
    Reboot,

    /// raw RC channel values
    Channels,

    /// change the flight mode
    SetFlightMode { mode: RoverMode },

    /// read the current flight mode from the vehicle
    GetFlightMode,

    /// read one parameter
    GetParam { key: String },

    /// read the full parameter mapping
    GetParams,

    /// write one parameter; the value must parse as a float
    SetParam { key: String, value: String },

    /// write several parameters as KEY=VALUE pairs; all values are
    /// validated before any write happens
    SetParams { assignments: Vec<String> },

    /// persist the full parameter mapping to the snapshot file
    SaveParams,

    /// replace the vehicle's parameters from the snapshot file
    LoadParams,

    /// download the current mission from the vehicle
    GetCommands,

    /// replace the mission with a single waypoint
    WriteCommand {
        latitude: f64,
        longitude: f64,
        altitude: f64,
    },

    /// clear the vehicle's mission
    ClearCommands,

    /// upload a mission from a waypoint file
    LoadMission { path: PathBuf },

    /// download the mission and save it to a waypoint file
    SaveMission { path: PathBuf },

    /// live arming classification
    GetArmed,

    /// arm the vehicle (requires it to be armable)
    Arm,

    /// disarm the vehicle
    Disarm,
}

/// Positional telemetry served from the cached snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuickStatus {
    pub yaw: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub ground_speed: f64,
    pub battery_voltage: f64,
    pub target: Option<Coords2D>,
    pub distance_to_target_ft: Option<f64>,
    pub gps: Option<GpsQuality>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FullStatus {
    pub quick: QuickStatus,
    pub mode: String,
    pub commands: Vec<MissionCommand>,
    pub armed: ArmState,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UgvResponse {
    Ok,
    Quick(QuickStatus),
    Stats(Box<FullStatus>),
    Channels(Vec<u16>),
    FlightMode(String),
    Param { key: String, value: f64 },
    Params(BTreeMap<String, f64>),
    Commands(Vec<MissionCommand>),
    ArmedState(ArmState),
}
