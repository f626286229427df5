//! The in-memory mission list, its waypoint file format, and transfer
//! against the vehicle link.

use std::{fs, path::Path};

use anyhow::Context;
use num_traits::FromPrimitive;
use serde::Serialize;

use crate::error::UgvError;
use crate::link::VehicleLink;

/// Version header every waypoint file must begin with.
pub const WAYPOINT_FILE_HEADER: &str = "QGC WPL 110";

/// Coordinate frame of a mission command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, Serialize)]
pub enum MissionFrame {
    Global = 0,
    LocalNed = 1,
    Mission = 2,
    GlobalRelativeAlt = 3,
    GlobalTerrainAlt = 10,
}

/// Mission command types the controller understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, Serialize)]
pub enum MissionCommandType {
    Waypoint = 16,
    LoiterUnlimited = 17,
    ReturnToLaunch = 20,
    Land = 21,
    Takeoff = 22,
    DoSetHome = 179,
    GeofenceVertex = 5004,
}

/// One navigation command in a mission. `params[4..7]` carry the
/// latitude/longitude/altitude for position-bearing commands.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MissionCommand {
    pub seq: u16,
    pub frame: MissionFrame,
    pub command: MissionCommandType,
    pub params: [f64; 7],
    pub autocontinue: bool,
}

/// Ordered mission list. Sequence indices are unique and contiguous from
/// zero; uploads replace the vehicle-side mission atomically from the
/// caller's perspective (the transport offers no rollback on a failure
/// mid-transfer).
#[derive(Debug, Default, Clone, PartialEq)]
pub struct MissionStore {
    commands: Vec<MissionCommand>,
}

impl MissionStore {
    pub fn new(commands: Vec<MissionCommand>) -> Self {
        MissionStore { commands }
    }

    /// A mission consisting of a single waypoint in the relative-altitude
    /// frame.
    pub fn single_waypoint(latitude: f64, longitude: f64, altitude: f64) -> Self {
        MissionStore {
            commands: vec![MissionCommand {
                seq: 0,
                frame: MissionFrame::GlobalRelativeAlt,
                command: MissionCommandType::Waypoint,
                params: [0.0, 0.0, 0.0, 0.0, latitude, longitude, altitude],
                autocontinue: false,
            }],
        }
    }

    pub fn commands(&self) -> &[MissionCommand] {
        &self.commands
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn load_from_file(path: &Path) -> Result<Self, UgvError> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("could not read mission file {path:?}"))?;
        Self::parse(&contents)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<(), UgvError> {
        fs::write(path, self.render())
            .with_context(|| format!("could not write mission file {path:?}"))?;
        Ok(())
    }

    /// Parses the tab-separated waypoint format. Line 0 must carry the
    /// version header; every data row maps positionally to
    /// (index, current, frame, command, param1..param7, autocontinue).
    pub fn parse(contents: &str) -> Result<Self, UgvError> {
        let mut lines = contents.lines();

        match lines.next() {
            Some(header) if header.starts_with(WAYPOINT_FILE_HEADER) => {}
            _ => {
                return Err(UgvError::Format(format!(
                    "missing '{WAYPOINT_FILE_HEADER}' header"
                )))
            }
        }

        let mut commands = Vec::new();
        for (row, line) in lines.enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            commands.push(parse_row(row, line)?);
        }

        for (position, command) in commands.iter().enumerate() {
            if command.seq as usize != position {
                return Err(UgvError::Format(format!(
                    "sequence indices must be contiguous from 0, found {} at position {position}",
                    command.seq
                )));
            }
        }

        Ok(MissionStore { commands })
    }

    pub fn render(&self) -> String {
        let mut out = format!("{WAYPOINT_FILE_HEADER}\n");
        for command in &self.commands {
            out.push_str(&format!(
                "{}\t0\t{}\t{}",
                command.seq, command.frame as u8, command.command as u16
            ));
            for param in command.params {
                out.push_str(&format!("\t{param}"));
            }
            out.push_str(&format!("\t{}\n", command.autocontinue as u8));
        }
        out
    }

    /// Pulls the full ordered mission from the vehicle.
    pub async fn download(link: &mut dyn VehicleLink) -> Result<Self, UgvError> {
        let commands = link.mission_download().await.map_err(UgvError::General)?;
        Ok(MissionStore { commands })
    }

    /// Replaces the vehicle-side mission with this one: clear, stage each
    /// command in sequence order, transfer. Sequence indices are reassigned
    /// contiguously from zero on the way out.
    pub async fn upload(&self, link: &mut dyn VehicleLink) -> Result<(), UgvError> {
        link.mission_clear();
        for (seq, command) in self.commands.iter().enumerate() {
            link.mission_add(MissionCommand {
                seq: seq as u16,
                ..*command
            });
        }
        link.mission_upload().await.map_err(UgvError::General)
    }

    /// Empties the vehicle-side mission and confirms the transfer.
    pub async fn clear(link: &mut dyn VehicleLink) -> Result<(), UgvError> {
        link.mission_clear();
        link.mission_upload().await.map_err(UgvError::General)
    }
}

fn parse_row(row: usize, line: &str) -> Result<MissionCommand, UgvError> {
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() < 12 {
        return Err(UgvError::Format(format!(
            "row {row}: expected 12 tab-separated fields, found {}",
            fields.len()
        )));
    }

    let seq: u16 = parse_field(row, "sequence index", fields[0])?;

    // column 1 is the current-waypoint flag; validated, not retained
    let _: u8 = parse_field(row, "current flag", fields[1])?;

    let frame_code: u8 = parse_field(row, "frame", fields[2])?;
    let frame = MissionFrame::from_u8(frame_code)
        .ok_or_else(|| UgvError::Format(format!("row {row}: unsupported frame {frame_code}")))?;

    let command_code: u16 = parse_field(row, "command", fields[3])?;
    let command = MissionCommandType::from_u16(command_code).ok_or_else(|| {
        UgvError::Format(format!("row {row}: unsupported command {command_code}"))
    })?;

    let mut params = [0.0; 7];
    for (slot, field) in params.iter_mut().zip(&fields[4..11]) {
        *slot = parse_field(row, "param", field)?;
    }

    let autocontinue: i64 = parse_field(row, "autocontinue", fields[11].trim())?;

    Ok(MissionCommand {
        seq,
        frame,
        command,
        params,
        autocontinue: autocontinue != 0,
    })
}

fn parse_field<T: std::str::FromStr>(row: usize, name: &str, raw: &str) -> Result<T, UgvError> {
    raw.parse().map_err(|_| {
        UgvError::Format(format!("row {row}: {name} field {raw:?} is not numeric"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_mission() -> MissionStore {
        MissionStore::new(vec![
            MissionCommand {
                seq: 0,
                frame: MissionFrame::GlobalRelativeAlt,
                command: MissionCommandType::Waypoint,
                params: [0.0, 2.5, 0.0, 0.0, 38.147, -76.427, 30.0],
                autocontinue: true,
            },
            MissionCommand {
                seq: 1,
                frame: MissionFrame::GlobalRelativeAlt,
                command: MissionCommandType::Land,
                params: [0.0, 0.0, 0.0, 0.0, 38.148, -76.426, 0.0],
                autocontinue: false,
            },
        ])
    }

    #[test]
    fn file_round_trip_is_exact() {
        let mission = sample_mission();
        let reloaded = MissionStore::parse(&mission.render()).unwrap();
        assert_eq!(reloaded, mission);
    }

    #[test]
    fn bad_header_yields_no_partial_mission() {
        let mut text = sample_mission().render();
        text.replace_range(..WAYPOINT_FILE_HEADER.len(), "BAD HEADERX");

        match MissionStore::parse(&text) {
            Err(UgvError::Format(msg)) => assert!(msg.contains("header")),
            other => panic!("expected format error, got {other:?}"),
        }
    }

    #[test]
    fn non_numeric_field_is_a_format_error() {
        let text = format!(
            "{WAYPOINT_FILE_HEADER}\n0\t0\t3\t16\t0\tabc\t0\t0\t38.1\t-76.4\t30\t1\n"
        );
        assert!(matches!(
            MissionStore::parse(&text),
            Err(UgvError::Format(_))
        ));
    }

    #[test]
    fn autocontinue_field_is_trimmed_before_parsing() {
        let text = format!(
            "{WAYPOINT_FILE_HEADER}\n0\t0\t3\t16\t0\t0\t0\t0\t38.1\t-76.4\t30\t1 \n"
        );
        let mission = MissionStore::parse(&text).unwrap();
        assert!(mission.commands()[0].autocontinue);
    }

    #[test]
    fn gapped_sequence_indices_are_rejected() {
        let text = format!(
            "{WAYPOINT_FILE_HEADER}\n\
             0\t0\t3\t16\t0\t0\t0\t0\t38.1\t-76.4\t30\t1\n\
             2\t0\t3\t16\t0\t0\t0\t0\t38.2\t-76.4\t30\t1\n"
        );
        assert!(matches!(
            MissionStore::parse(&text),
            Err(UgvError::Format(_))
        ));
    }

    #[test]
    fn single_waypoint_uses_relative_altitude_frame() {
        let mission = MissionStore::single_waypoint(38.1, -76.4, 25.0);
        let command = mission.commands()[0];
        assert_eq!(command.frame, MissionFrame::GlobalRelativeAlt);
        assert_eq!(command.command, MissionCommandType::Waypoint);
        assert_eq!(command.params[4..7], [38.1, -76.4, 25.0]);
    }
}
