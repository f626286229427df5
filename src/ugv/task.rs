//! The vehicle control task: sole owner of the link, sole writer of the
//! telemetry snapshot.
//!
//! All operations funnel through one dispatch loop, so a background refresh
//! can never interleave with an in-flight arm or mission transfer. Readers
//! observe the snapshot through a watch channel and always see either the
//! pre- or post-command value.

use std::{path::PathBuf, time::Duration};

use async_trait::async_trait;
use tokio::{select, sync::watch, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::client::{ChannelCommandSink, ChannelCommandSource, Task};
use crate::error::UgvError;
use crate::interop::TargetSource;
use crate::link::{LinkCommandError, LinkConnector, VehicleLink};
use crate::state::{ArmState, Coords2D, RoverMode, TelemetrySnapshot};
use crate::ugv::command::{FullStatus, QuickStatus, UgvRequest, UgvResponse};
use crate::ugv::mission::MissionStore;
use crate::ugv::nav;
use crate::ugv::params::{parse_assignments, ParameterStore};

/// Hard deadline on blocking arm/disarm confirmation.
pub const ARM_TIMEOUT: Duration = Duration::from_secs(15);

pub struct ControlTask {
    cmd_tx: ChannelCommandSink<UgvRequest, UgvResponse>,
    cmd_rx: ChannelCommandSource<UgvRequest, UgvResponse>,
    telem_rx: watch::Receiver<TelemetrySnapshot>,
    refresh_interval: Duration,
    controller: Controller,
}

impl ControlTask {
    pub fn new(
        connector: Box<dyn LinkConnector>,
        target_source: Option<Box<dyn TargetSource>>,
        refresh_interval: Duration,
        params_file: PathBuf,
    ) -> Self {
        let (cmd_tx, cmd_rx) = flume::bounded(256);
        let (telem_tx, telem_rx) = watch::channel(TelemetrySnapshot::default());

        ControlTask {
            cmd_tx,
            cmd_rx,
            telem_rx,
            refresh_interval,
            controller: Controller {
                connector,
                target_source,
                params: ParameterStore::new(params_file),
                telem_tx,
                link: None,
                snapshot: TelemetrySnapshot::default(),
                mission: MissionStore::default(),
                target: None,
            },
        }
    }

    pub fn cmd(&self) -> ChannelCommandSink<UgvRequest, UgvResponse> {
        self.cmd_tx.clone()
    }

    /// Read side of the snapshot. Always reflects the last successful
    /// refresh, independent of whatever the dispatch loop is doing.
    pub fn telemetry(&self) -> watch::Receiver<TelemetrySnapshot> {
        self.telem_rx.clone()
    }
}

#[async_trait]
impl Task for ControlTask {
    fn name(&self) -> &'static str {
        "ugv/control"
    }

    async fn run(self: Box<Self>, cancel: CancellationToken) -> anyhow::Result<()> {
        let Self {
            cmd_rx,
            refresh_interval,
            mut controller,
            ..
        } = *self;

        let loop_fut = async {
            let mut refresh = tokio::time::interval(refresh_interval);
            refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                select! {
                    _ = refresh.tick() => {
                        if controller.link.is_some() {
                            if let Err(err) = controller.refresh().await {
                                warn!("background refresh failed: {err}");
                            }
                        }
                    }

                    cmd = cmd_rx.recv_async() => {
                        match cmd {
                            Ok((request, ret)) => {
                                let result = controller.handle(request).await;
                                let _ = ret.send(result);
                            }
                            Err(_) => break,
                        }
                    }
                }
            }

            Ok::<_, anyhow::Error>(())
        };

        select! {
          _ = cancel.cancelled() => {}
          res = loop_fut => { res? }
        }

        Ok(())
    }
}

struct Controller {
    connector: Box<dyn LinkConnector>,
    target_source: Option<Box<dyn TargetSource>>,
    params: ParameterStore,
    telem_tx: watch::Sender<TelemetrySnapshot>,
    link: Option<Box<dyn VehicleLink>>,
    snapshot: TelemetrySnapshot,
    mission: MissionStore,
    target: Option<Coords2D>,
}

impl Controller {
    async fn handle(&mut self, request: UgvRequest) -> Result<UgvResponse, UgvError> {
        debug!("handling request: {request:?}");

        match request {
            UgvRequest::Connect => self.connect().await,

            UgvRequest::Update => {
                self.refresh().await?;
                Ok(UgvResponse::Ok)
            }

            UgvRequest::Quick => Ok(UgvResponse::Quick(self.quick_status())),

            UgvRequest::Stats => self.stats().await,

            UgvRequest::SetHome => {
                self.link_mut()?.set_home().await?;
                Ok(UgvResponse::Ok)
            }

            // no vehicle-side calibration sequence exists
            UgvRequest::Calibrate => Ok(UgvResponse::Ok),

            UgvRequest::Reboot => {
                self.link_mut()?.reboot().await?;
                Ok(UgvResponse::Ok)
            }

            UgvRequest::Channels => {
                let channels = self.link_mut()?.rc_channels().await?;
                Ok(UgvResponse::Channels(channels))
            }

            UgvRequest::SetFlightMode { mode } => self.set_flight_mode(mode).await,

            UgvRequest::GetFlightMode => {
                let raw = self.read_live().await?;
                Ok(UgvResponse::FlightMode(raw.mode))
            }

            UgvRequest::GetParam { key } => {
                let (params, link) = self.params_parts()?;
                let value = params.get(link, &key).await?;
                Ok(UgvResponse::Param { key, value })
            }

            UgvRequest::GetParams => {
                let (params, link) = self.params_parts()?;
                Ok(UgvResponse::Params(params.get_all(link).await?))
            }

            UgvRequest::SetParam { key, value } => {
                let (params, link) = self.params_parts()?;
                params.set(link, &key, &value).await?;
                Ok(UgvResponse::Ok)
            }

            UgvRequest::SetParams { assignments } => {
                let pairs = parse_assignments(&assignments)?;
                let (params, link) = self.params_parts()?;
                params.set_many(link, &pairs).await?;
                Ok(UgvResponse::Ok)
            }

            UgvRequest::SaveParams => {
                let (params, link) = self.params_parts()?;
                params.save(link).await?;
                Ok(UgvResponse::Ok)
            }

            UgvRequest::LoadParams => {
                let (params, link) = self.params_parts()?;
                params.load(link).await?;
                Ok(UgvResponse::Ok)
            }

            UgvRequest::GetCommands => {
                let mission = MissionStore::download(self.link_mut()?).await?;
                self.mission = mission;
                Ok(UgvResponse::Commands(self.mission.commands().to_vec()))
            }

            UgvRequest::WriteCommand {
                latitude,
                longitude,
                altitude,
            } => {
                let mission = MissionStore::single_waypoint(latitude, longitude, altitude);
                mission.upload(self.link_mut()?).await?;
                self.mission = mission;
                Ok(UgvResponse::Ok)
            }

            UgvRequest::ClearCommands => {
                MissionStore::clear(self.link_mut()?).await?;
                self.mission = MissionStore::default();
                Ok(UgvResponse::Ok)
            }

            UgvRequest::LoadMission { path } => {
                let mission = MissionStore::load_from_file(&path)?;
                mission.upload(self.link_mut()?).await?;
                self.mission = mission;
                Ok(UgvResponse::Ok)
            }

            UgvRequest::SaveMission { path } => {
                let mission = MissionStore::download(self.link_mut()?).await?;
                mission.save_to_file(&path)?;
                self.mission = mission;
                Ok(UgvResponse::Ok)
            }

            UgvRequest::GetArmed => Ok(UgvResponse::ArmedState(self.arm_state().await?)),

            UgvRequest::Arm => self.arm().await,

            UgvRequest::Disarm => self.disarm().await,
        }
    }

    fn link_mut(&mut self) -> Result<&mut (dyn VehicleLink + 'static), UgvError> {
        self.link
            .as_deref_mut()
            .ok_or_else(|| UgvError::invalid_state("vehicle link is not connected"))
    }

    fn params_parts(&mut self) -> Result<(&ParameterStore, &mut dyn VehicleLink), UgvError> {
        match self.link.as_deref_mut() {
            Some(link) => Ok((&self.params, link)),
            None => Err(UgvError::invalid_state("vehicle link is not connected")),
        }
    }

    async fn read_live(&mut self) -> Result<crate::link::RawTelemetry, UgvError> {
        self.link_mut()?
            .read_telemetry()
            .await
            .map_err(UgvError::Telemetry)
    }

    async fn connect(&mut self) -> Result<UgvResponse, UgvError> {
        // a failed attempt must retain nothing
        self.link = None;

        let link = self
            .connector
            .connect()
            .await
            .map_err(UgvError::Connection)?;
        self.link = Some(link);

        info!("vehicle link established");

        self.refresh().await?;
        Ok(UgvResponse::Ok)
    }

    /// Recomputes the snapshot wholesale from the link's mirror. On any
    /// failure the previously published snapshot stays untouched.
    async fn refresh(&mut self) -> Result<(), UgvError> {
        let raw = self.read_live().await?;

        if self.target.is_none() {
            if let Some(source) = &self.target_source {
                match source.get_drop_target().await {
                    Ok(target) => {
                        info!("cached drop target {target:?}");
                        self.target = Some(target);
                    }
                    Err(err) => {
                        warn!("drop target unavailable, distance stays unknown: {err:#}")
                    }
                }
            }
        }

        let position = Coords2D::from(raw.position);

        let snapshot = TelemetrySnapshot {
            yaw: nav::normalize_heading(raw.attitude.yaw.to_degrees()),
            ground_speed: raw.ground_speed * nav::MPH_PER_METER_PER_SECOND,
            position,
            battery_voltage: raw.battery_voltage,
            gps: Some(raw.gps),
            mode: raw.mode,
            armed: raw.armed,
            status: raw.status,
            target: self.target,
            distance_to_target_ft: self
                .target
                .map(|target| nav::distance_to_target_ft(position, target)),
        };

        self.snapshot = snapshot.clone();
        let _ = self.telem_tx.send(snapshot);

        Ok(())
    }

    fn quick_status(&self) -> QuickStatus {
        let snapshot = &self.snapshot;
        QuickStatus {
            yaw: snapshot.yaw,
            latitude: snapshot.position.latitude,
            longitude: snapshot.position.longitude,
            ground_speed: snapshot.ground_speed,
            battery_voltage: snapshot.battery_voltage,
            target: snapshot.target,
            distance_to_target_ft: snapshot.distance_to_target_ft,
            gps: snapshot.gps,
        }
    }

    async fn stats(&mut self) -> Result<UgvResponse, UgvError> {
        let armed = self.arm_state().await?;

        Ok(UgvResponse::Stats(Box::new(FullStatus {
            quick: self.quick_status(),
            mode: self.snapshot.mode.clone(),
            commands: self.mission.commands().to_vec(),
            armed,
            status: self.snapshot.status.clone(),
        })))
    }

    async fn set_flight_mode(&mut self, mode: RoverMode) -> Result<UgvResponse, UgvError> {
        self.link_mut()?.set_mode(mode.name()).await?;

        if let Err(err) = self.refresh().await {
            warn!("post-mode-change refresh failed: {err}");
        }

        Ok(UgvResponse::Ok)
    }

    /// Arming classification is never served from the snapshot; eligibility
    /// can change between the vehicle's own safety checks.
    async fn arm_state(&mut self) -> Result<ArmState, UgvError> {
        let raw = self.read_live().await?;
        Ok(ArmState::classify(raw.armed, raw.armable))
    }

    async fn arm(&mut self) -> Result<UgvResponse, UgvError> {
        let raw = self.read_live().await?;
        if !raw.armable {
            return Err(UgvError::invalid_state("vehicle is not armable"));
        }

        match self.link_mut()?.arm(ARM_TIMEOUT).await {
            Ok(()) => {}
            Err(LinkCommandError::Timeout) => return Err(UgvError::ArmTimeout),
            Err(LinkCommandError::Other(err)) => return Err(UgvError::General(err)),
        }

        // re-read actual state rather than trusting the request's outcome
        if let Err(err) = self.refresh().await {
            warn!("post-arm refresh failed: {err}");
        }

        Ok(UgvResponse::Ok)
    }

    async fn disarm(&mut self) -> Result<UgvResponse, UgvError> {
        match self.link_mut()?.disarm(ARM_TIMEOUT).await {
            Ok(()) => {}
            Err(LinkCommandError::Timeout) => return Err(UgvError::DisarmTimeout),
            Err(LinkCommandError::Other(err)) => return Err(UgvError::General(err)),
        }

        if let Err(err) = self.refresh().await {
            warn!("post-disarm refresh failed: {err}");
        }

        Ok(UgvResponse::Ok)
    }
}
