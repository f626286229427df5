//! MAVLink-backed vehicle link over a UDP socket or a serial radio.
//!
//! The link keeps a live mirror of the message stream (position, attitude,
//! battery, GPS, heartbeat state, parameters) and layers the mission and
//! parameter microservices on top of a shared framing loop.

use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU8, Ordering},
    time::{Duration, Instant},
};

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::*;

use mavlink::{ardupilotmega as apm, MavHeader, MavlinkVersion};

use crate::config::UgvConfig;
use crate::link::{LinkCommandError, LinkConnector, LinkEndpoint, RawTelemetry, VehicleLink};
use crate::state::{Attitude, Coords3D, GpsQuality, RoverMode};
use crate::ugv::mission::{MissionCommand, MissionCommandType, MissionFrame};

/// Our own identity on the network: a ground control station.
const SYSTEM_ID: u8 = 255;
const COMPONENT_ID: u8 = 190;

/// The autopilot we command.
const TARGET_SYSTEM: u8 = 1;
const TARGET_COMPONENT: u8 = 1;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
const ACK_TIMEOUT: Duration = Duration::from_secs(10);
const PARAM_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// How long a telemetry read drains pending traffic before reporting the
/// mirror. Refreshes run on the order of seconds, so this stays small.
const DRAIN_WINDOW: Duration = Duration::from_millis(25);

enum LinkTransport {
    Udp(tokio::net::UdpSocket),
    Serial(SerialStream),
}

impl LinkTransport {
    async fn recv_chunk(&mut self, chunk: &mut [u8]) -> anyhow::Result<usize> {
        match self {
            LinkTransport::Udp(sock) => Ok(sock.recv(chunk).await?),
            LinkTransport::Serial(port) => Ok(port.read(chunk).await?),
        }
    }

    async fn send_bytes(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        match self {
            LinkTransport::Udp(sock) => {
                sock.send(bytes).await?;
            }
            LinkTransport::Serial(port) => {
                port.write_all(bytes).await?;
            }
        }
        Ok(())
    }
}

/// Last-seen values from the telemetry stream.
#[derive(Default)]
struct Mirror {
    heartbeat_seen: bool,
    position: Option<Coords3D>,
    attitude: Option<Attitude>,
    ground_speed: f64,
    battery_voltage: f64,
    gps: GpsQuality,
    mode: String,
    status: String,
    armed: bool,
    rc_channels: Vec<u16>,
}

pub struct MavlinkVehicleLink {
    transport: LinkTransport,
    version: MavlinkVersion,
    buf: BytesMut,
    recv_seq: Option<u8>,
    send_seq: AtomicU8,
    mirror: Mirror,
    staged_mission: Vec<MissionCommand>,
    params: BTreeMap<String, f64>,
    param_count: Option<u16>,
    params_ready: bool,
}

impl MavlinkVehicleLink {
    /// Establishes the transport and blocks until the minimum telemetry set
    /// (heartbeat, position, attitude) has been observed, then requests the
    /// full parameter manifest so the readiness gate can complete.
    pub async fn connect(
        endpoint: &LinkEndpoint,
        version: MavlinkVersion,
    ) -> anyhow::Result<Self> {
        let transport = match endpoint {
            LinkEndpoint::Udp { address } => {
                let sock = tokio::net::UdpSocket::bind(address)
                    .await
                    .context("failed to bind telemetry socket")?;

                debug!("waiting for a packet from the telemetry bridge");

                let (_, remote_addr) =
                    tokio::time::timeout(CONNECT_TIMEOUT, sock.recv_from(&mut []))
                        .await
                        .context("timed out waiting for a packet from the telemetry bridge")?
                        .context("error receiving packet from the telemetry bridge")?;

                info!("locking to telemetry peer {:?}", remote_addr);

                sock.connect(remote_addr)
                    .await
                    .context("failed to lock to telemetry peer")?;

                LinkTransport::Udp(sock)
            }
            LinkEndpoint::Serial { path, baud } => {
                info!("opening telemetry radio {} at {} baud", path, baud);

                let port = tokio_serial::new(path, *baud)
                    .open_native_async()
                    .context("failed to open telemetry radio")?;

                LinkTransport::Serial(port)
            }
        };

        match version {
            MavlinkVersion::V1 => debug!("using mavlink v1"),
            MavlinkVersion::V2 => debug!("using mavlink v2"),
        };

        let mut link = MavlinkVehicleLink {
            transport,
            version,
            buf: BytesMut::with_capacity(1024),
            recv_seq: None,
            send_seq: AtomicU8::default(),
            mirror: Mirror::default(),
            staged_mission: Vec::new(),
            params: BTreeMap::new(),
            param_count: None,
            params_ready: false,
        };

        link.request_data_streams().await?;

        info!("waiting for initial telemetry");

        let deadline = Instant::now() + CONNECT_TIMEOUT;
        while !link.mirror_complete() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                bail!("timed out waiting for initial telemetry");
            }
            match tokio::time::timeout(remaining, link.recv()).await {
                Ok(result) => {
                    result.context("link error while waiting for initial telemetry")?;
                }
                Err(_) => bail!("timed out waiting for initial telemetry"),
            }
        }

        info!("link initialized, requesting parameter manifest");
        link.request_all_params().await?;

        Ok(link)
    }

    fn mirror_complete(&self) -> bool {
        self.mirror.heartbeat_seen
            && self.mirror.position.is_some()
            && self.mirror.attitude.is_some()
    }

    async fn request_data_streams(&mut self) -> anyhow::Result<()> {
        // stream id 0 = all streams
        self.send(apm::MavMessage::REQUEST_DATA_STREAM(
            apm::REQUEST_DATA_STREAM_DATA {
                req_message_rate: 4,
                target_system: TARGET_SYSTEM,
                target_component: TARGET_COMPONENT,
                req_stream_id: 0,
                start_stop: 1,
            },
        ))
        .await
    }

    async fn request_all_params(&mut self) -> anyhow::Result<()> {
        self.send(apm::MavMessage::PARAM_REQUEST_LIST(
            apm::PARAM_REQUEST_LIST_DATA {
                target_system: TARGET_SYSTEM,
                target_component: TARGET_COMPONENT,
            },
        ))
        .await
    }

    /// Sends a message to the vehicle.
    async fn send(&mut self, message: apm::MavMessage) -> anyhow::Result<()> {
        let sequence = self.send_seq.fetch_add(1, Ordering::SeqCst);

        trace!("sending message: {:?}", &message);

        let header = MavHeader {
            sequence,
            system_id: SYSTEM_ID,
            component_id: COMPONENT_ID,
        };

        let mut buf = Vec::with_capacity(1024);

        mavlink::write_versioned_msg(&mut buf, self.version, header, &message)?;
        self.transport.send_bytes(buf.as_ref()).await?;

        Ok(())
    }

    /// Waits for the next well-formed message, applies it to the mirror,
    /// and returns it.
    async fn recv(&mut self) -> anyhow::Result<apm::MavMessage> {
        loop {
            let mut chunk = vec![0; 1024];

            let magic = match self.version {
                MavlinkVersion::V1 => 0xFE,
                MavlinkVersion::V2 => 0xFD,
            };

            let magic_position = loop {
                let magic_position = self.buf.iter().position(|&b| b == magic);

                match magic_position {
                    // we need at least two bytes after the magic in the buffer
                    Some(magic_position) if magic_position + 2 < self.buf.len() => {
                        break magic_position
                    }
                    _ => {
                        let n = self.transport.recv_chunk(&mut chunk[..]).await?;
                        self.buf.extend(&chunk[..n]);
                    }
                };
            };

            let payload_len = self.buf[magic_position + 1];

            let seq_num = self.buf[magic_position + 4];

            if let Some(prev_seq_num) = &mut self.recv_seq {
                let expected_seq_num = prev_seq_num.wrapping_add(1);

                if expected_seq_num != seq_num {
                    debug!("unexpected sequence number {seq_num} (wanted {expected_seq_num}), assuming packet loss");
                    let skip = magic_position + 1;
                    self.buf.advance(skip);
                    continue;
                } else {
                    *prev_seq_num = seq_num;
                }
            } else {
                self.recv_seq = Some(seq_num);
            }

            let msg_body_size = match self.version {
                // in v1: 1 byte magic + 1 byte payload len + 4 byte header + 2 byte checksum
                MavlinkVersion::V1 => payload_len as usize + 8,
                // in v2: 1 byte magic + 1 byte payload len + 8 byte header + 2 byte checksum
                MavlinkVersion::V2 => payload_len as usize + 12,
            };

            while magic_position + msg_body_size > self.buf.len() {
                let mut chunk = vec![0; 1024];
                let n = self.transport.recv_chunk(&mut chunk[..]).await?;
                self.buf.extend(&chunk[..n]);
            }

            let msg_content = &self.buf[magic_position..magic_position + msg_body_size];

            let msg = match mavlink::read_versioned_msg(&mut &msg_content[..], self.version) {
                Ok((_, msg)) => {
                    let skip = magic_position + msg_body_size;
                    self.buf.advance(skip);
                    msg
                }
                Err(err) => {
                    warn!(
                        "message parsing failure ({:?}); buffer contents: {:02x?}",
                        err, msg_content
                    );
                    return Err(err).context("error while parsing message");
                }
            };

            trace!("received message: {:?}", msg);

            self.apply(&msg);

            return Ok(msg);
        }
    }

    /// Drains pending traffic for at most `window` so mirror reads reflect
    /// what the vehicle has sent up to now.
    async fn pump_for(&mut self, window: Duration) -> anyhow::Result<()> {
        let deadline = Instant::now() + window;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(());
            }
            match tokio::time::timeout(remaining, self.recv()).await {
                Ok(result) => {
                    result?;
                }
                Err(_) => return Ok(()),
            }
        }
    }

    /// Waits for a message matching `predicate`, with a hard deadline.
    async fn wait_for_message<F>(
        &mut self,
        predicate: F,
        timeout: Duration,
    ) -> Result<apm::MavMessage, LinkCommandError>
    where
        F: Fn(&apm::MavMessage) -> bool + Send,
    {
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(LinkCommandError::Timeout);
            }

            match tokio::time::timeout(remaining, self.recv()).await {
                Ok(Ok(message)) => {
                    if predicate(&message) {
                        return Ok(message);
                    }
                }
                Ok(Err(err)) => return Err(LinkCommandError::Other(err)),
                Err(_) => return Err(LinkCommandError::Timeout),
            }
        }
    }

    /// Sends a COMMAND_LONG and waits for its acknowledgement.
    async fn send_command(
        &mut self,
        command: apm::MavCmd,
        params: [f32; 7],
    ) -> anyhow::Result<()> {
        debug!("sending command {:?} ({:?})", command, params);

        let message = apm::MavMessage::COMMAND_LONG(apm::COMMAND_LONG_DATA {
            command,
            confirmation: 0,
            param1: params[0],
            param2: params[1],
            param3: params[2],
            param4: params[3],
            param5: params[4],
            param6: params[5],
            param7: params[6],
            target_system: TARGET_SYSTEM,
            target_component: TARGET_COMPONENT,
        });

        self.send(message).await?;

        let ack_message = self
            .wait_for_message(
                |message| match message {
                    apm::MavMessage::COMMAND_ACK(data) => data.command == command,
                    _ => false,
                },
                ACK_TIMEOUT,
            )
            .await
            .map_err(|err| anyhow!("no acknowledgement for {:?}: {}", command, err))?;

        match ack_message {
            apm::MavMessage::COMMAND_ACK(data) => match data.result {
                apm::MavResult::MAV_RESULT_ACCEPTED | apm::MavResult::MAV_RESULT_IN_PROGRESS => {
                    Ok(())
                }
                _ => Err(anyhow!(
                    "command {:?} failed with status code {:?}",
                    command,
                    data.result
                )),
            },
            _ => unreachable!(),
        }
    }

    fn apply(&mut self, message: &apm::MavMessage) {
        match message {
            apm::MavMessage::HEARTBEAT(data) => {
                // other ground stations heartbeat too; only the autopilot's
                // reflects vehicle state
                if data.autopilot == apm::MavAutopilot::MAV_AUTOPILOT_INVALID {
                    return;
                }

                self.mirror.heartbeat_seen = true;
                self.mirror.armed = data
                    .base_mode
                    .contains(apm::MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED);
                self.mirror.mode = match RoverMode::from_custom_mode(data.custom_mode) {
                    Some(mode) => mode.name().to_owned(),
                    None => format!("MODE({})", data.custom_mode),
                };
                let status = format!("{:?}", data.system_status);
                self.mirror.status = status
                    .strip_prefix("MAV_STATE_")
                    .unwrap_or(&status)
                    .to_owned();
            }
            apm::MavMessage::GLOBAL_POSITION_INT(data) => {
                self.mirror.position = Some(Coords3D::new(
                    data.lat as f64 / 1e7,
                    data.lon as f64 / 1e7,
                    data.relative_alt as f64 / 1e3,
                ));
                // vx/vy are cm/s over ground
                self.mirror.ground_speed = (data.vx as f64).hypot(data.vy as f64) / 100.0;
            }
            apm::MavMessage::VFR_HUD(data) => {
                self.mirror.ground_speed = data.groundspeed as f64;
            }
            apm::MavMessage::ATTITUDE(data) => {
                self.mirror.attitude = Some(Attitude::new(
                    data.roll as f64,
                    data.pitch as f64,
                    data.yaw as f64,
                ));
            }
            apm::MavMessage::SYS_STATUS(data) => {
                self.mirror.battery_voltage = data.voltage_battery as f64 / 1000.0;
            }
            apm::MavMessage::GPS_RAW_INT(data) => {
                self.mirror.gps = GpsQuality {
                    horizontal_error: data.eph as f64,
                    vertical_error: data.epv as f64,
                    satellites_visible: data.satellites_visible,
                };
            }
            apm::MavMessage::RC_CHANNELS(data) => {
                let raw = [
                    data.chan1_raw,
                    data.chan2_raw,
                    data.chan3_raw,
                    data.chan4_raw,
                    data.chan5_raw,
                    data.chan6_raw,
                    data.chan7_raw,
                    data.chan8_raw,
                    data.chan9_raw,
                    data.chan10_raw,
                    data.chan11_raw,
                    data.chan12_raw,
                    data.chan13_raw,
                    data.chan14_raw,
                    data.chan15_raw,
                    data.chan16_raw,
                    data.chan17_raw,
                    data.chan18_raw,
                ];
                let count = (data.chancount as usize).min(raw.len());
                self.mirror.rc_channels = raw[..count].to_vec();
            }
            apm::MavMessage::PARAM_VALUE(data) => {
                let key = decode_param_id(&data.param_id);
                self.params.insert(key, data.param_value as f64);
                self.param_count = Some(data.param_count);
                if let Some(count) = self.param_count {
                    if count > 0 && self.params.len() >= count as usize && !self.params_ready {
                        info!("initial parameter transfer complete ({})", self.params.len());
                        self.params_ready = true;
                    }
                }
            }
            _ => {}
        }
    }

    /// Pre-arm readiness as far as the link can tell: the autopilot is
    /// standing by and holds a usable GPS fix.
    fn armable(&self) -> bool {
        self.mirror.status == "STANDBY" && self.mirror.gps.satellites_visible >= 4
    }

    fn mission_item_message(&self, command: &MissionCommand, as_int: bool) -> apm::MavMessage {
        let frame = mav_frame(command.frame);
        let cmd = mav_command(command.command);
        let params: Vec<f32> = command.params.iter().map(|p| *p as f32).collect();

        if as_int {
            apm::MavMessage::MISSION_ITEM_INT(apm::MISSION_ITEM_INT_DATA {
                param1: params[0],
                param2: params[1],
                param3: params[2],
                param4: params[3],
                x: (command.params[4] * 1e7) as i32,
                y: (command.params[5] * 1e7) as i32,
                z: params[6],
                seq: command.seq,
                command: cmd,
                target_system: TARGET_SYSTEM,
                target_component: TARGET_COMPONENT,
                frame,
                current: 0,
                autocontinue: command.autocontinue as u8,
                ..Default::default()
            })
        } else {
            apm::MavMessage::MISSION_ITEM(apm::MISSION_ITEM_DATA {
                param1: params[0],
                param2: params[1],
                param3: params[2],
                param4: params[3],
                x: params[4],
                y: params[5],
                z: params[6],
                seq: command.seq,
                command: cmd,
                target_system: TARGET_SYSTEM,
                target_component: TARGET_COMPONENT,
                frame,
                current: 0,
                autocontinue: command.autocontinue as u8,
                ..Default::default()
            })
        }
    }

    async fn clear_remote_mission(&mut self) -> anyhow::Result<()> {
        self.send(apm::MavMessage::MISSION_CLEAR_ALL(
            apm::MISSION_CLEAR_ALL_DATA {
                target_system: TARGET_SYSTEM,
                target_component: TARGET_COMPONENT,
                ..Default::default()
            },
        ))
        .await?;

        let ack = self
            .wait_for_message(
                |message| matches!(message, apm::MavMessage::MISSION_ACK(_)),
                ACK_TIMEOUT,
            )
            .await
            .map_err(|err| anyhow!("mission clear was not acknowledged: {}", err))?;

        check_mission_ack(&ack)
    }
}

#[async_trait]
impl VehicleLink for MavlinkVehicleLink {
    async fn read_telemetry(&mut self) -> anyhow::Result<RawTelemetry> {
        self.pump_for(DRAIN_WINDOW).await?;

        let position = self
            .mirror
            .position
            .context("link has not reported a position yet")?;
        let attitude = self
            .mirror
            .attitude
            .context("link has not reported an attitude yet")?;

        Ok(RawTelemetry {
            position,
            attitude,
            ground_speed: self.mirror.ground_speed,
            battery_voltage: self.mirror.battery_voltage,
            gps: self.mirror.gps,
            mode: self.mirror.mode.clone(),
            status: self.mirror.status.clone(),
            armed: self.mirror.armed,
            armable: self.armable(),
        })
    }

    async fn set_mode(&mut self, mode: &str) -> anyhow::Result<()> {
        let mode: RoverMode = mode.parse()?;

        self.send_command(
            apm::MavCmd::MAV_CMD_DO_SET_MODE,
            // param1 = MAV_MODE_FLAG_CUSTOM_MODE_ENABLED
            [1.0, mode.custom_mode() as f32, 0.0, 0.0, 0.0, 0.0, 0.0],
        )
        .await?;

        self.mirror.mode = mode.name().to_owned();
        Ok(())
    }

    async fn arm(&mut self, timeout: Duration) -> Result<(), LinkCommandError> {
        arm_disarm(self, true, timeout).await
    }

    async fn disarm(&mut self, timeout: Duration) -> Result<(), LinkCommandError> {
        arm_disarm(self, false, timeout).await
    }

    async fn reboot(&mut self) -> anyhow::Result<()> {
        // no acknowledgement: the autopilot restarts immediately
        self.send(apm::MavMessage::COMMAND_LONG(apm::COMMAND_LONG_DATA {
            command: apm::MavCmd::MAV_CMD_PREFLIGHT_REBOOT_SHUTDOWN,
            confirmation: 0,
            param1: 1.0,
            param2: 0.0,
            param3: 0.0,
            param4: 0.0,
            param5: 0.0,
            param6: 0.0,
            param7: 0.0,
            target_system: TARGET_SYSTEM,
            target_component: TARGET_COMPONENT,
        }))
        .await
    }

    async fn set_home(&mut self) -> anyhow::Result<()> {
        // param1 = 1: use the vehicle's current location
        self.send_command(
            apm::MavCmd::MAV_CMD_DO_SET_HOME,
            [1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        )
        .await
    }

    async fn rc_channels(&mut self) -> anyhow::Result<Vec<u16>> {
        self.pump_for(DRAIN_WINDOW).await?;
        Ok(self.mirror.rc_channels.clone())
    }

    async fn mission_download(&mut self) -> anyhow::Result<Vec<MissionCommand>> {
        self.send(apm::MavMessage::MISSION_REQUEST_LIST(
            apm::MISSION_REQUEST_LIST_DATA {
                target_system: TARGET_SYSTEM,
                target_component: TARGET_COMPONENT,
                ..Default::default()
            },
        ))
        .await?;

        let count_message = self
            .wait_for_message(
                |message| matches!(message, apm::MavMessage::MISSION_COUNT(_)),
                ACK_TIMEOUT,
            )
            .await
            .map_err(|err| anyhow!("vehicle did not report a mission count: {}", err))?;

        let count = match count_message {
            apm::MavMessage::MISSION_COUNT(data) => data.count,
            _ => unreachable!(),
        };

        let mut commands = Vec::with_capacity(count as usize);

        for seq in 0..count {
            self.send(apm::MavMessage::MISSION_REQUEST(apm::MISSION_REQUEST_DATA {
                seq,
                target_system: TARGET_SYSTEM,
                target_component: TARGET_COMPONENT,
                ..Default::default()
            }))
            .await?;

            let item = self
                .wait_for_message(
                    |message| match message {
                        apm::MavMessage::MISSION_ITEM(data) => data.seq == seq,
                        apm::MavMessage::MISSION_ITEM_INT(data) => data.seq == seq,
                        _ => false,
                    },
                    ACK_TIMEOUT,
                )
                .await
                .map_err(|err| anyhow!("vehicle did not send mission item {}: {}", seq, err))?;

            commands.push(mission_command_from_item(&item)?);
        }

        self.send(apm::MavMessage::MISSION_ACK(apm::MISSION_ACK_DATA {
            target_system: TARGET_SYSTEM,
            target_component: TARGET_COMPONENT,
            mavtype: apm::MavMissionResult::MAV_MISSION_ACCEPTED,
            ..Default::default()
        }))
        .await?;

        self.staged_mission = commands.clone();

        Ok(commands)
    }

    fn mission_clear(&mut self) {
        self.staged_mission.clear();
    }

    fn mission_add(&mut self, command: MissionCommand) {
        self.staged_mission.push(command);
    }

    async fn mission_upload(&mut self) -> anyhow::Result<()> {
        if self.staged_mission.is_empty() {
            return self.clear_remote_mission().await;
        }

        let count = self.staged_mission.len() as u16;

        self.send(apm::MavMessage::MISSION_COUNT(apm::MISSION_COUNT_DATA {
            count,
            target_system: TARGET_SYSTEM,
            target_component: TARGET_COMPONENT,
            ..Default::default()
        }))
        .await?;

        loop {
            let message = self
                .wait_for_message(
                    |message| {
                        matches!(
                            message,
                            apm::MavMessage::MISSION_REQUEST(_)
                                | apm::MavMessage::MISSION_REQUEST_INT(_)
                                | apm::MavMessage::MISSION_ACK(_)
                        )
                    },
                    ACK_TIMEOUT,
                )
                .await
                .map_err(|err| anyhow!("mission transfer stalled: {}", err))?;

            let (seq, as_int) = match &message {
                apm::MavMessage::MISSION_REQUEST(data) => (data.seq, false),
                apm::MavMessage::MISSION_REQUEST_INT(data) => (data.seq, true),
                apm::MavMessage::MISSION_ACK(_) => return check_mission_ack(&message),
                _ => unreachable!(),
            };

            let command = *self
                .staged_mission
                .get(seq as usize)
                .with_context(|| format!("vehicle requested mission item {seq} of {count}"))?;

            let item = self.mission_item_message(&command, as_int);
            self.send(item).await?;
        }
    }

    fn params_ready(&self) -> bool {
        self.params_ready
    }

    async fn wait_params_ready(&mut self) -> anyhow::Result<()> {
        while !self.params_ready {
            match tokio::time::timeout(PARAM_RETRY_INTERVAL, self.recv()).await {
                Ok(result) => {
                    result?;
                }
                // nudge a lossy link
                Err(_) => self.request_all_params().await?,
            }
        }
        Ok(())
    }

    async fn param_get(&mut self, key: &str) -> anyhow::Result<Option<f64>> {
        self.pump_for(DRAIN_WINDOW).await?;

        if let Some(value) = self.params.get(key) {
            return Ok(Some(*value));
        }

        // the initial sweep may have dropped this one; ask directly
        let param_id = encode_param_id(key)?;
        self.send(apm::MavMessage::PARAM_REQUEST_READ(
            apm::PARAM_REQUEST_READ_DATA {
                param_index: -1,
                param_id,
                target_system: TARGET_SYSTEM,
                target_component: TARGET_COMPONENT,
            },
        ))
        .await?;

        match self
            .wait_for_message(
                |message| match message {
                    apm::MavMessage::PARAM_VALUE(data) => data.param_id == param_id,
                    _ => false,
                },
                ACK_TIMEOUT,
            )
            .await
        {
            Ok(apm::MavMessage::PARAM_VALUE(data)) => Ok(Some(data.param_value as f64)),
            Ok(_) => unreachable!(),
            Err(LinkCommandError::Timeout) => Ok(None),
            Err(LinkCommandError::Other(err)) => Err(err),
        }
    }

    async fn param_set(&mut self, key: &str, value: f64) -> anyhow::Result<()> {
        debug!("setting param {:?} to {:?}", key, value);

        let param_id = encode_param_id(key)?;

        self.send(apm::MavMessage::PARAM_SET(apm::PARAM_SET_DATA {
            param_id,
            param_type: apm::MavParamType::MAV_PARAM_TYPE_REAL32,
            param_value: value as f32,
            target_system: TARGET_SYSTEM,
            target_component: TARGET_COMPONENT,
        }))
        .await?;

        self.wait_for_message(
            |message| match message {
                apm::MavMessage::PARAM_VALUE(data) => data.param_id == param_id,
                _ => false,
            },
            ACK_TIMEOUT,
        )
        .await
        .map_err(|err| anyhow!("parameter write was not acknowledged: {}", err))?;

        Ok(())
    }

    async fn param_items(&mut self) -> anyhow::Result<BTreeMap<String, f64>> {
        self.pump_for(DRAIN_WINDOW).await?;
        Ok(self.params.clone())
    }
}

async fn arm_disarm(
    link: &mut MavlinkVehicleLink,
    arm: bool,
    timeout: Duration,
) -> Result<(), LinkCommandError> {
    let deadline = Instant::now() + timeout;

    link.send(apm::MavMessage::COMMAND_LONG(apm::COMMAND_LONG_DATA {
        command: apm::MavCmd::MAV_CMD_COMPONENT_ARM_DISARM,
        confirmation: 0,
        param1: arm as u8 as f32,
        param2: 0.0,
        param3: 0.0,
        param4: 0.0,
        param5: 0.0,
        param6: 0.0,
        param7: 0.0,
        target_system: TARGET_SYSTEM,
        target_component: TARGET_COMPONENT,
    }))
    .await
    .map_err(LinkCommandError::Other)?;

    // confirmed by the heartbeat armed bit flipping, not by the command ack;
    // a rejection ack ends the wait early
    let message = link
        .wait_for_message(
            |message| match message {
                apm::MavMessage::HEARTBEAT(data) => {
                    data.autopilot != apm::MavAutopilot::MAV_AUTOPILOT_INVALID
                        && data
                            .base_mode
                            .contains(apm::MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED)
                            == arm
                }
                apm::MavMessage::COMMAND_ACK(data) => {
                    data.command == apm::MavCmd::MAV_CMD_COMPONENT_ARM_DISARM
                        && !matches!(
                            data.result,
                            apm::MavResult::MAV_RESULT_ACCEPTED
                                | apm::MavResult::MAV_RESULT_IN_PROGRESS
                        )
                }
                _ => false,
            },
            deadline.saturating_duration_since(Instant::now()),
        )
        .await?;

    match message {
        apm::MavMessage::COMMAND_ACK(data) => Err(LinkCommandError::Other(anyhow!(
            "vehicle rejected the request with {:?}",
            data.result
        ))),
        _ => Ok(()),
    }
}

fn check_mission_ack(message: &apm::MavMessage) -> anyhow::Result<()> {
    match message {
        apm::MavMessage::MISSION_ACK(data) => match data.mavtype {
            apm::MavMissionResult::MAV_MISSION_ACCEPTED => Ok(()),
            other => Err(anyhow!("vehicle rejected the mission: {:?}", other)),
        },
        _ => unreachable!(),
    }
}

fn mav_frame(frame: MissionFrame) -> apm::MavFrame {
    match frame {
        MissionFrame::Global => apm::MavFrame::MAV_FRAME_GLOBAL,
        MissionFrame::LocalNed => apm::MavFrame::MAV_FRAME_LOCAL_NED,
        MissionFrame::Mission => apm::MavFrame::MAV_FRAME_MISSION,
        MissionFrame::GlobalRelativeAlt => apm::MavFrame::MAV_FRAME_GLOBAL_RELATIVE_ALT,
        MissionFrame::GlobalTerrainAlt => apm::MavFrame::MAV_FRAME_GLOBAL_TERRAIN_ALT,
    }
}

fn mav_command(command: MissionCommandType) -> apm::MavCmd {
    match command {
        MissionCommandType::Waypoint => apm::MavCmd::MAV_CMD_NAV_WAYPOINT,
        MissionCommandType::LoiterUnlimited => apm::MavCmd::MAV_CMD_NAV_LOITER_UNLIM,
        MissionCommandType::ReturnToLaunch => apm::MavCmd::MAV_CMD_NAV_RETURN_TO_LAUNCH,
        MissionCommandType::Land => apm::MavCmd::MAV_CMD_NAV_LAND,
        MissionCommandType::Takeoff => apm::MavCmd::MAV_CMD_NAV_TAKEOFF,
        MissionCommandType::DoSetHome => apm::MavCmd::MAV_CMD_DO_SET_HOME,
        MissionCommandType::GeofenceVertex => {
            apm::MavCmd::MAV_CMD_NAV_FENCE_POLYGON_VERTEX_INCLUSION
        }
    }
}

fn mission_command_from_item(message: &apm::MavMessage) -> anyhow::Result<MissionCommand> {
    use num_traits::FromPrimitive;

    let (seq, frame_code, command_code, p1, p2, p3, p4, x, y, z, autocontinue) = match message {
        apm::MavMessage::MISSION_ITEM(data) => (
            data.seq,
            data.frame as u8,
            data.command as u16,
            data.param1,
            data.param2,
            data.param3,
            data.param4,
            data.x as f64,
            data.y as f64,
            data.z,
            data.autocontinue,
        ),
        apm::MavMessage::MISSION_ITEM_INT(data) => (
            data.seq,
            data.frame as u8,
            data.command as u16,
            data.param1,
            data.param2,
            data.param3,
            data.param4,
            data.x as f64 / 1e7,
            data.y as f64 / 1e7,
            data.z,
            data.autocontinue,
        ),
        other => bail!("expected a mission item, got {:?}", other),
    };

    let frame = MissionFrame::from_u8(frame_code)
        .with_context(|| format!("vehicle sent unsupported mission frame {frame_code}"))?;
    let command = MissionCommandType::from_u16(command_code)
        .with_context(|| format!("vehicle sent unsupported mission command {command_code}"))?;

    Ok(MissionCommand {
        seq,
        frame,
        command,
        params: [
            p1 as f64,
            p2 as f64,
            p3 as f64,
            p4 as f64,
            x,
            y,
            z as f64,
        ],
        autocontinue: autocontinue != 0,
    })
}

fn encode_param_id(key: &str) -> anyhow::Result<[u8; 16]> {
    if key.len() > 16 {
        bail!("parameter id {:?} is longer than 16 bytes", key);
    }
    let mut param_id: [u8; 16] = [0; 16];
    for (index, byte) in key.as_bytes().iter().enumerate() {
        param_id[index] = *byte;
    }
    Ok(param_id)
}

fn decode_param_id(param_id: &[u8; 16]) -> String {
    let len = param_id
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(param_id.len());
    String::from_utf8_lossy(&param_id[..len]).into_owned()
}

pub struct MavlinkConnector {
    endpoint: LinkEndpoint,
    version: MavlinkVersion,
}

impl MavlinkConnector {
    pub fn new(config: &UgvConfig) -> anyhow::Result<Self> {
        let version = match config.mavlink.as_str() {
            "V1" => MavlinkVersion::V1,
            "V2" => MavlinkVersion::V2,
            other => bail!("invalid mavlink version {other}"),
        };

        Ok(MavlinkConnector {
            endpoint: config.endpoint.clone(),
            version,
        })
    }
}

#[async_trait]
impl LinkConnector for MavlinkConnector {
    async fn connect(&mut self) -> anyhow::Result<Box<dyn VehicleLink>> {
        let link = MavlinkVehicleLink::connect(&self.endpoint, self.version).await?;
        Ok(Box::new(link))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_id_round_trip() {
        let id = encode_param_id("CRUISE_SPEED").unwrap();
        assert_eq!(decode_param_id(&id), "CRUISE_SPEED");

        let full = encode_param_id("ABCDEFGHIJKLMNOP").unwrap();
        assert_eq!(decode_param_id(&full), "ABCDEFGHIJKLMNOP");

        assert!(encode_param_id("THIS_KEY_IS_TOO_LONG").is_err());
    }

    #[test]
    fn mission_item_decodes_to_command() {
        let item = apm::MavMessage::MISSION_ITEM(apm::MISSION_ITEM_DATA {
            param1: 0.0,
            param2: 2.5,
            param3: 0.0,
            param4: 0.0,
            x: 38.147,
            y: -76.427,
            z: 30.0,
            seq: 2,
            command: apm::MavCmd::MAV_CMD_NAV_WAYPOINT,
            target_system: TARGET_SYSTEM,
            target_component: TARGET_COMPONENT,
            frame: apm::MavFrame::MAV_FRAME_GLOBAL_RELATIVE_ALT,
            current: 0,
            autocontinue: 1,
            ..Default::default()
        });

        let decoded = mission_command_from_item(&item).unwrap();
        assert_eq!(decoded.seq, 2);
        assert_eq!(decoded.frame, MissionFrame::GlobalRelativeAlt);
        assert_eq!(decoded.command, MissionCommandType::Waypoint);
        assert!(decoded.autocontinue);
        assert!((decoded.params[4] - 38.147).abs() < 1e-4);
        assert!((decoded.params[6] - 30.0).abs() < 1e-6);
    }

    #[test]
    fn mission_item_int_scales_coordinates() {
        let item = apm::MavMessage::MISSION_ITEM_INT(apm::MISSION_ITEM_INT_DATA {
            param1: 0.0,
            param2: 0.0,
            param3: 0.0,
            param4: 0.0,
            x: 381_470_000,
            y: -764_270_000,
            z: 30.0,
            seq: 0,
            command: apm::MavCmd::MAV_CMD_NAV_WAYPOINT,
            target_system: TARGET_SYSTEM,
            target_component: TARGET_COMPONENT,
            frame: apm::MavFrame::MAV_FRAME_GLOBAL_RELATIVE_ALT,
            current: 0,
            autocontinue: 0,
            ..Default::default()
        });

        let decoded = mission_command_from_item(&item).unwrap();
        assert!((decoded.params[4] - 38.147).abs() < 1e-7);
        assert!((decoded.params[5] + 76.427).abs() < 1e-7);
        assert!(!decoded.autocontinue);
    }
}
