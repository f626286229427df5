use std::{fmt, str::FromStr};

use anyhow::bail;
use serde::{Deserialize, Serialize};

#[derive(Default, Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coords2D {
    /// Latitude in decimal degrees
    pub latitude: f64,

    /// Longitude in decimal degrees
    pub longitude: f64,
}

impl Coords2D {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Coords2D {
            latitude,
            longitude,
        }
    }

    pub fn with_altitude(self, altitude: f64) -> Coords3D {
        Coords3D::new(self.latitude, self.longitude, altitude)
    }
}

impl From<Coords3D> for Coords2D {
    fn from(c: Coords3D) -> Self {
        Coords2D::new(c.latitude, c.longitude)
    }
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coords3D {
    /// Latitude in decimal degrees
    pub latitude: f64,

    /// Longitude in decimal degrees
    pub longitude: f64,

    /// Altitude in meters above the home position
    pub altitude: f64,
}

impl Coords3D {
    pub fn new(latitude: f64, longitude: f64, altitude: f64) -> Self {
        Coords3D {
            latitude,
            longitude,
            altitude,
        }
    }
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Attitude {
    /// Roll in radians
    pub roll: f64,

    /// Pitch in radians
    pub pitch: f64,

    /// Yaw in radians
    pub yaw: f64,
}

impl Attitude {
    pub fn new(roll: f64, pitch: f64, yaw: f64) -> Self {
        Attitude { roll, pitch, yaw }
    }
}

/// GPS fix quality as reported by the vehicle: raw horizontal/vertical
/// dilution values and the visible satellite count.
#[derive(Default, Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsQuality {
    pub horizontal_error: f64,
    pub vertical_error: f64,
    pub satellites_visible: u8,
}

/// The controller's cached view of current vehicle telemetry.
///
/// Recomputed wholesale on each refresh and swapped atomically through a
/// watch channel; readers never observe a partially updated value. A failed
/// refresh leaves the previous snapshot in place.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    /// Heading in degrees, normalized to [0, 360).
    pub yaw: f64,

    /// Ground speed in miles per hour.
    pub ground_speed: f64,

    pub position: Coords2D,

    pub battery_voltage: f64,

    pub gps: Option<GpsQuality>,

    pub mode: String,

    pub armed: bool,

    /// Vehicle-reported system status (BOOT until the first refresh).
    pub status: String,

    /// Drop target, once fetched from the interop provider.
    pub target: Option<Coords2D>,

    /// Planar distance to the drop target in feet; None until the target
    /// is known.
    pub distance_to_target_ft: Option<f64>,
}

impl Default for TelemetrySnapshot {
    fn default() -> Self {
        TelemetrySnapshot {
            yaw: 0.0,
            ground_speed: 0.0,
            position: Coords2D::default(),
            battery_voltage: 0.0,
            gps: None,
            mode: RoverMode::Manual.to_string(),
            armed: false,
            status: "BOOT".to_owned(),
            target: None,
            distance_to_target_ft: None,
        }
    }
}

/// Arming classification derived from the link's live armed/armable flags.
/// Never cached: arming eligibility can change between the vehicle's own
/// safety checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ArmState {
    #[serde(rename = "ARMED")]
    Armed,

    #[serde(rename = "DISARMED (ARMABLE)")]
    DisarmedArmable,

    #[serde(rename = "DISARMED (NOT ARMABLE)")]
    DisarmedNotArmable,
}

impl ArmState {
    pub fn classify(armed: bool, armable: bool) -> Self {
        if armed {
            ArmState::Armed
        } else if armable {
            ArmState::DisarmedArmable
        } else {
            ArmState::DisarmedNotArmable
        }
    }
}

impl fmt::Display for ArmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ArmState::Armed => "ARMED",
            ArmState::DisarmedArmable => "DISARMED (ARMABLE)",
            ArmState::DisarmedNotArmable => "DISARMED (NOT ARMABLE)",
        })
    }
}

/// ArduPilot rover flight modes, with their custom mode numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoverMode {
    Manual,
    Acro,
    Steering,
    Hold,
    Loiter,
    Follow,
    Simple,
    Auto,
    Rtl,
    SmartRtl,
    Guided,
}

impl RoverMode {
    pub fn custom_mode(self) -> u32 {
        match self {
            RoverMode::Manual => 0,
            RoverMode::Acro => 1,
            RoverMode::Steering => 3,
            RoverMode::Hold => 4,
            RoverMode::Loiter => 5,
            RoverMode::Follow => 6,
            RoverMode::Simple => 7,
            RoverMode::Auto => 10,
            RoverMode::Rtl => 11,
            RoverMode::SmartRtl => 12,
            RoverMode::Guided => 15,
        }
    }

    pub fn from_custom_mode(mode: u32) -> Option<Self> {
        Some(match mode {
            0 => RoverMode::Manual,
            1 => RoverMode::Acro,
            3 => RoverMode::Steering,
            4 => RoverMode::Hold,
            5 => RoverMode::Loiter,
            6 => RoverMode::Follow,
            7 => RoverMode::Simple,
            10 => RoverMode::Auto,
            11 => RoverMode::Rtl,
            12 => RoverMode::SmartRtl,
            15 => RoverMode::Guided,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            RoverMode::Manual => "MANUAL",
            RoverMode::Acro => "ACRO",
            RoverMode::Steering => "STEERING",
            RoverMode::Hold => "HOLD",
            RoverMode::Loiter => "LOITER",
            RoverMode::Follow => "FOLLOW",
            RoverMode::Simple => "SIMPLE",
            RoverMode::Auto => "AUTO",
            RoverMode::Rtl => "RTL",
            RoverMode::SmartRtl => "SMART_RTL",
            RoverMode::Guided => "GUIDED",
        }
    }
}

impl fmt::Display for RoverMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for RoverMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_uppercase().as_str() {
            "MANUAL" => RoverMode::Manual,
            "ACRO" => RoverMode::Acro,
            "STEERING" => RoverMode::Steering,
            "HOLD" => RoverMode::Hold,
            "LOITER" => RoverMode::Loiter,
            "FOLLOW" => RoverMode::Follow,
            "SIMPLE" => RoverMode::Simple,
            "AUTO" => RoverMode::Auto,
            "RTL" => RoverMode::Rtl,
            "SMART_RTL" | "SMARTRTL" => RoverMode::SmartRtl,
            "GUIDED" => RoverMode::Guided,
            _ => bail!("unknown rover flight mode: {s}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arm_state_classification() {
        assert_eq!(ArmState::classify(true, false), ArmState::Armed);
        assert_eq!(ArmState::classify(true, true), ArmState::Armed);
        assert_eq!(ArmState::classify(false, true), ArmState::DisarmedArmable);
        assert_eq!(
            ArmState::classify(false, false),
            ArmState::DisarmedNotArmable
        );
    }

    #[test]
    fn rover_mode_round_trip() {
        for mode in [
            RoverMode::Manual,
            RoverMode::Hold,
            RoverMode::Auto,
            RoverMode::Guided,
        ] {
            assert_eq!(mode.name().parse::<RoverMode>().unwrap(), mode);
            assert_eq!(RoverMode::from_custom_mode(mode.custom_mode()), Some(mode));
        }
        assert!("FLY".parse::<RoverMode>().is_err());
    }
}
