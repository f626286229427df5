//! End-to-end tests driving the control task through its command channel
//! against a scripted in-memory vehicle link.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use ugv_system::client::{ChannelCommandSink, CommandSink, Task};
use ugv_system::error::UgvError;
use ugv_system::interop::TargetSource;
use ugv_system::link::{LinkCommandError, LinkConnector, RawTelemetry, VehicleLink};
use ugv_system::state::{ArmState, Attitude, Coords2D, Coords3D, GpsQuality, TelemetrySnapshot};
use ugv_system::ugv::mission::{MissionCommand, MissionCommandType, MissionFrame};
use ugv_system::ugv::{ControlTask, UgvRequest, UgvResponse};

/// Scripted outcome of the next arm/disarm call.
#[derive(Clone, Copy, PartialEq)]
enum ArmScript {
    Confirm,
    Timeout,
}

struct LinkState {
    telemetry: RawTelemetry,
    read_failures: VecDeque<String>,
    arm_calls: usize,
    disarm_calls: usize,
    arm_script: ArmScript,
    vehicle_mission: Vec<MissionCommand>,
    staged: Vec<MissionCommand>,
    params: BTreeMap<String, f64>,
    ready: bool,
    ready_waits: usize,
    mode_sets: Vec<String>,
}

impl Default for LinkState {
    fn default() -> Self {
        LinkState {
            telemetry: RawTelemetry {
                position: Coords3D::new(38.0, -76.0, 2.0),
                attitude: Attitude::new(0.0, 0.0, 0.1),
                ground_speed: 2.0,
                battery_voltage: 12.6,
                gps: GpsQuality {
                    horizontal_error: 121.0,
                    vertical_error: 65.0,
                    satellites_visible: 10,
                },
                mode: "MANUAL".to_owned(),
                status: "STANDBY".to_owned(),
                armed: false,
                armable: true,
            },
            read_failures: VecDeque::new(),
            arm_calls: 0,
            disarm_calls: 0,
            arm_script: ArmScript::Confirm,
            vehicle_mission: Vec::new(),
            staged: Vec::new(),
            params: BTreeMap::new(),
            ready: false,
            ready_waits: 0,
            mode_sets: Vec::new(),
        }
    }
}

#[derive(Clone, Default)]
struct MockLink(Arc<Mutex<LinkState>>);

impl MockLink {
    fn with<T>(&self, f: impl FnOnce(&mut LinkState) -> T) -> T {
        f(&mut self.0.lock().unwrap())
    }
}

#[async_trait]
impl VehicleLink for MockLink {
    async fn read_telemetry(&mut self) -> anyhow::Result<RawTelemetry> {
        self.with(|state| match state.read_failures.pop_front() {
            Some(message) => Err(anyhow!(message)),
            None => Ok(state.telemetry.clone()),
        })
    }

    async fn set_mode(&mut self, mode: &str) -> anyhow::Result<()> {
        self.with(|state| {
            state.mode_sets.push(mode.to_owned());
            state.telemetry.mode = mode.to_owned();
        });
        Ok(())
    }

    async fn arm(&mut self, _timeout: Duration) -> Result<(), LinkCommandError> {
        self.with(|state| {
            state.arm_calls += 1;
            match state.arm_script {
                ArmScript::Timeout => Err(LinkCommandError::Timeout),
                ArmScript::Confirm => {
                    state.telemetry.armed = true;
                    Ok(())
                }
            }
        })
    }

    async fn disarm(&mut self, _timeout: Duration) -> Result<(), LinkCommandError> {
        self.with(|state| {
            state.disarm_calls += 1;
            match state.arm_script {
                ArmScript::Timeout => Err(LinkCommandError::Timeout),
                ArmScript::Confirm => {
                    state.telemetry.armed = false;
                    Ok(())
                }
            }
        })
    }

    async fn reboot(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn set_home(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn rc_channels(&mut self) -> anyhow::Result<Vec<u16>> {
        Ok(vec![1500; 8])
    }

    async fn mission_download(&mut self) -> anyhow::Result<Vec<MissionCommand>> {
        Ok(self.with(|state| state.vehicle_mission.clone()))
    }

    fn mission_clear(&mut self) {
        self.with(|state| state.staged.clear());
    }

    fn mission_add(&mut self, command: MissionCommand) {
        self.with(|state| state.staged.push(command));
    }

    async fn mission_upload(&mut self) -> anyhow::Result<()> {
        self.with(|state| {
            state.vehicle_mission = state.staged.clone();
        });
        Ok(())
    }

    fn params_ready(&self) -> bool {
        self.with(|state| state.ready)
    }

    async fn wait_params_ready(&mut self) -> anyhow::Result<()> {
        self.with(|state| {
            state.ready_waits += 1;
            state.ready = true;
        });
        Ok(())
    }

    async fn param_get(&mut self, key: &str) -> anyhow::Result<Option<f64>> {
        Ok(self.with(|state| state.params.get(key).copied()))
    }

    async fn param_set(&mut self, key: &str, value: f64) -> anyhow::Result<()> {
        self.with(|state| {
            state.params.insert(key.to_owned(), value);
        });
        Ok(())
    }

    async fn param_items(&mut self) -> anyhow::Result<BTreeMap<String, f64>> {
        Ok(self.with(|state| state.params.clone()))
    }
}

struct MockConnector {
    link: MockLink,
    fail: bool,
}

#[async_trait]
impl LinkConnector for MockConnector {
    async fn connect(&mut self) -> anyhow::Result<Box<dyn VehicleLink>> {
        if self.fail {
            Err(anyhow!("no route to vehicle"))
        } else {
            Ok(Box::new(self.link.clone()))
        }
    }
}

struct MockTarget {
    target: Coords2D,
}

#[async_trait]
impl TargetSource for MockTarget {
    async fn get_drop_target(&self) -> anyhow::Result<Coords2D> {
        Ok(self.target)
    }
}

struct Harness {
    cmd: ChannelCommandSink<UgvRequest, UgvResponse>,
    telemetry: watch::Receiver<TelemetrySnapshot>,
    link: MockLink,
    _cancel: CancellationToken,
}

impl Harness {
    fn spawn(link: MockLink, target: Option<Coords2D>, connect_fails: bool, params_file: &str) -> Self {
        let target_source: Option<Box<dyn TargetSource>> =
            target.map(|target| Box::new(MockTarget { target }) as Box<dyn TargetSource>);

        let task = ControlTask::new(
            Box::new(MockConnector {
                link: link.clone(),
                fail: connect_fails,
            }),
            target_source,
            // keep the background refresh out of the way; tests drive
            // refreshes explicitly
            Duration::from_secs(3600),
            std::env::temp_dir().join(params_file),
        );

        let cmd = task.cmd();
        let telemetry = task.telemetry();
        let cancel = CancellationToken::new();
        tokio::spawn(Box::new(task).run(cancel.clone()));

        Harness {
            cmd,
            telemetry,
            link,
            _cancel: cancel,
        }
    }

    async fn request(&self, request: UgvRequest) -> Result<UgvResponse, UgvError> {
        self.cmd.command(request).await
    }

    fn snapshot(&self) -> TelemetrySnapshot {
        self.telemetry.borrow().clone()
    }
}

fn waypoint(seq: u16, latitude: f64, longitude: f64) -> MissionCommand {
    MissionCommand {
        seq,
        frame: MissionFrame::GlobalRelativeAlt,
        command: MissionCommandType::Waypoint,
        params: [0.0, 0.0, 0.0, 0.0, latitude, longitude, 10.0],
        autocontinue: true,
    }
}

#[tokio::test]
async fn failed_connect_retains_no_link() {
    let harness = Harness::spawn(MockLink::default(), None, true, "itest-connect-fail.json");

    assert!(matches!(
        harness.request(UgvRequest::Connect).await,
        Err(UgvError::Connection(_))
    ));

    // nothing mutating may work without a link
    assert!(matches!(
        harness.request(UgvRequest::Update).await,
        Err(UgvError::InvalidState(_))
    ));
}

#[tokio::test]
async fn connect_primes_the_snapshot() {
    let target = Coords2D::new(38.0, -76.01);
    let harness = Harness::spawn(
        MockLink::default(),
        Some(target),
        false,
        "itest-connect.json",
    );

    harness.request(UgvRequest::Connect).await.unwrap();

    let snapshot = harness.snapshot();
    assert_eq!(snapshot.position, Coords2D::new(38.0, -76.0));
    assert!((snapshot.yaw - 0.1f64.to_degrees()).abs() < 1e-9);
    assert!((snapshot.ground_speed - 2.0 * 2.23694).abs() < 1e-9);
    assert_eq!(snapshot.target, Some(target));
    assert_eq!(snapshot.status, "STANDBY");

    // cos(38 deg) * 0.01 deg of longitude, in feet
    let expected = 0.01 * 38.0f64.to_radians().cos() * 69.172 * 5280.0;
    let distance = snapshot.distance_to_target_ft.unwrap();
    assert!((distance - expected).abs() / expected < 0.001);
}

#[tokio::test]
async fn failed_refresh_preserves_the_snapshot() {
    let harness = Harness::spawn(MockLink::default(), None, false, "itest-refresh.json");
    harness.request(UgvRequest::Connect).await.unwrap();

    let before = harness.snapshot();

    harness.link.with(|state| {
        state.telemetry.position.latitude = 39.0;
        state
            .read_failures
            .push_back("telemetry stream dropped".to_owned());
    });

    assert!(matches!(
        harness.request(UgvRequest::Update).await,
        Err(UgvError::Telemetry(_))
    ));
    assert_eq!(harness.snapshot(), before);

    // the next refresh picks the new position up
    harness.request(UgvRequest::Update).await.unwrap();
    assert_eq!(harness.snapshot().position.latitude, 39.0);
}

#[tokio::test]
async fn arm_requires_the_vehicle_to_be_armable() {
    let link = MockLink::default();
    link.with(|state| state.telemetry.armable = false);
    let harness = Harness::spawn(link, None, false, "itest-arm-blocked.json");
    harness.request(UgvRequest::Connect).await.unwrap();

    assert!(matches!(
        harness.request(UgvRequest::Arm).await,
        Err(UgvError::InvalidState(_))
    ));

    // the precondition failure never reached the arm endpoint
    assert_eq!(harness.link.with(|state| state.arm_calls), 0);
}

#[tokio::test]
async fn arm_timeout_is_distinct_from_failure() {
    let link = MockLink::default();
    link.with(|state| state.arm_script = ArmScript::Timeout);
    let harness = Harness::spawn(link, None, false, "itest-arm-timeout.json");
    harness.request(UgvRequest::Connect).await.unwrap();

    assert!(matches!(
        harness.request(UgvRequest::Arm).await,
        Err(UgvError::ArmTimeout)
    ));
    assert_eq!(harness.link.with(|state| state.arm_calls), 1);

    assert!(matches!(
        harness.request(UgvRequest::Disarm).await,
        Err(UgvError::DisarmTimeout)
    ));
    assert_eq!(harness.link.with(|state| state.disarm_calls), 1);
}

#[tokio::test]
async fn arm_success_resyncs_the_snapshot() {
    let harness = Harness::spawn(MockLink::default(), None, false, "itest-arm.json");
    harness.request(UgvRequest::Connect).await.unwrap();
    assert!(!harness.snapshot().armed);

    harness.request(UgvRequest::Arm).await.unwrap();
    assert!(harness.snapshot().armed);

    match harness.request(UgvRequest::GetArmed).await.unwrap() {
        UgvResponse::ArmedState(state) => assert_eq!(state, ArmState::Armed),
        other => panic!("unexpected response {other:?}"),
    }

    harness.request(UgvRequest::Disarm).await.unwrap();
    assert!(!harness.snapshot().armed);
}

#[tokio::test]
async fn armed_state_classifies_all_three_states() {
    let harness = Harness::spawn(MockLink::default(), None, false, "itest-armed-state.json");
    harness.request(UgvRequest::Connect).await.unwrap();

    match harness.request(UgvRequest::GetArmed).await.unwrap() {
        UgvResponse::ArmedState(state) => assert_eq!(state, ArmState::DisarmedArmable),
        other => panic!("unexpected response {other:?}"),
    }

    harness.link.with(|state| state.telemetry.armable = false);
    match harness.request(UgvRequest::GetArmed).await.unwrap() {
        UgvResponse::ArmedState(state) => assert_eq!(state, ArmState::DisarmedNotArmable),
        other => panic!("unexpected response {other:?}"),
    }
}

#[tokio::test]
async fn mission_download_is_idempotent() {
    let link = MockLink::default();
    link.with(|state| {
        state.vehicle_mission = vec![waypoint(0, 38.1, -76.4), waypoint(1, 38.2, -76.5)];
    });
    let harness = Harness::spawn(link, None, false, "itest-mission.json");
    harness.request(UgvRequest::Connect).await.unwrap();

    let first = match harness.request(UgvRequest::GetCommands).await.unwrap() {
        UgvResponse::Commands(commands) => commands,
        other => panic!("unexpected response {other:?}"),
    };
    let second = match harness.request(UgvRequest::GetCommands).await.unwrap() {
        UgvResponse::Commands(commands) => commands,
        other => panic!("unexpected response {other:?}"),
    };

    assert_eq!(first, second);
    assert_eq!(first.len(), 2);
}

#[tokio::test]
async fn write_command_replaces_the_mission() {
    let link = MockLink::default();
    link.with(|state| {
        state.vehicle_mission = vec![waypoint(0, 38.1, -76.4), waypoint(1, 38.2, -76.5)];
    });
    let harness = Harness::spawn(link, None, false, "itest-write-command.json");
    harness.request(UgvRequest::Connect).await.unwrap();

    harness
        .request(UgvRequest::WriteCommand {
            latitude: 38.3,
            longitude: -76.6,
            altitude: 20.0,
        })
        .await
        .unwrap();

    let commands = match harness.request(UgvRequest::GetCommands).await.unwrap() {
        UgvResponse::Commands(commands) => commands,
        other => panic!("unexpected response {other:?}"),
    };
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].command, MissionCommandType::Waypoint);
    assert_eq!(commands[0].frame, MissionFrame::GlobalRelativeAlt);
    assert_eq!(commands[0].params[4..7], [38.3, -76.6, 20.0]);

    harness.request(UgvRequest::ClearCommands).await.unwrap();
    assert!(harness
        .link
        .with(|state| state.vehicle_mission.is_empty()));
}

#[tokio::test]
async fn mission_file_round_trip_through_the_vehicle() {
    let link = MockLink::default();
    link.with(|state| {
        state.vehicle_mission = vec![waypoint(0, 38.1, -76.4), waypoint(1, 38.2, -76.5)];
    });
    let harness = Harness::spawn(link, None, false, "itest-mission-file.json");
    harness.request(UgvRequest::Connect).await.unwrap();

    let path = std::env::temp_dir().join("ugv-system-itest-mission.txt");

    harness
        .request(UgvRequest::SaveMission { path: path.clone() })
        .await
        .unwrap();

    let original = harness.link.with(|state| state.vehicle_mission.clone());
    harness.request(UgvRequest::ClearCommands).await.unwrap();

    harness
        .request(UgvRequest::LoadMission { path })
        .await
        .unwrap();

    assert_eq!(
        harness.link.with(|state| state.vehicle_mission.clone()),
        original
    );
}

#[tokio::test]
async fn parameter_writes_are_validated_before_the_link() {
    let link = MockLink::default();
    link.with(|state| {
        state.params.insert("CRUISE_SPEED".to_owned(), 3.0);
    });
    let harness = Harness::spawn(link, None, false, "itest-params.json");
    harness.request(UgvRequest::Connect).await.unwrap();

    assert!(matches!(
        harness
            .request(UgvRequest::SetParam {
                key: "CRUISE_SPEED".to_owned(),
                value: "not-a-number".to_owned(),
            })
            .await,
        Err(UgvError::InvalidRequest(_))
    ));
    assert_eq!(
        harness
            .link
            .with(|state| state.params.get("CRUISE_SPEED").copied()),
        Some(3.0)
    );

    harness
        .request(UgvRequest::SetParam {
            key: "CRUISE_SPEED".to_owned(),
            value: "3.14".to_owned(),
        })
        .await
        .unwrap();

    match harness
        .request(UgvRequest::GetParam {
            key: "CRUISE_SPEED".to_owned(),
        })
        .await
        .unwrap()
    {
        UgvResponse::Param { value, .. } => assert_eq!(value, 3.14),
        other => panic!("unexpected response {other:?}"),
    }

    // both operations that reached the link passed through the readiness
    // gate; the invalid write was rejected before it
    assert_eq!(harness.link.with(|state| state.ready_waits), 2);
}

#[tokio::test]
async fn set_many_validates_every_key_before_applying() {
    let link = MockLink::default();
    link.with(|state| {
        state.params.insert("CRUISE_SPEED".to_owned(), 3.0);
    });
    let harness = Harness::spawn(link, None, false, "itest-set-many.json");
    harness.request(UgvRequest::Connect).await.unwrap();

    let err = harness
        .request(UgvRequest::SetParams {
            assignments: vec![
                "CRUISE_SPEED=9.0".to_owned(),
                "WP_RADIUS=wide".to_owned(),
            ],
        })
        .await
        .unwrap_err();

    match err {
        UgvError::InvalidRequest(message) => assert!(message.contains("WP_RADIUS")),
        other => panic!("unexpected error {other:?}"),
    }

    // validate-all-before-apply: the valid key was not written either
    assert_eq!(
        harness
            .link
            .with(|state| state.params.get("CRUISE_SPEED").copied()),
        Some(3.0)
    );

    harness
        .request(UgvRequest::SetParams {
            assignments: vec![
                "CRUISE_SPEED=9.0".to_owned(),
                "WP_RADIUS=2.5".to_owned(),
            ],
        })
        .await
        .unwrap();

    assert_eq!(
        harness.link.with(|state| state.params.clone()),
        BTreeMap::from([
            ("CRUISE_SPEED".to_owned(), 9.0),
            ("WP_RADIUS".to_owned(), 2.5),
        ])
    );
}

#[tokio::test]
async fn unknown_parameter_reports_not_found() {
    let harness = Harness::spawn(MockLink::default(), None, false, "itest-notfound.json");
    harness.request(UgvRequest::Connect).await.unwrap();

    assert!(matches!(
        harness
            .request(UgvRequest::GetParam {
                key: "NO_SUCH_KEY".to_owned(),
            })
            .await,
        Err(UgvError::NotFound(_))
    ));
}

#[tokio::test]
async fn parameter_snapshot_round_trip() {
    let link = MockLink::default();
    link.with(|state| {
        state.params.insert("CRUISE_SPEED".to_owned(), 3.0);
        state.params.insert("WP_RADIUS".to_owned(), 2.0);
    });
    let harness = Harness::spawn(link, None, false, "itest-param-snapshot.json");
    harness.request(UgvRequest::Connect).await.unwrap();

    harness.request(UgvRequest::SaveParams).await.unwrap();

    harness.link.with(|state| {
        state.params.insert("CRUISE_SPEED".to_owned(), 99.0);
    });

    harness.request(UgvRequest::LoadParams).await.unwrap();

    assert_eq!(
        harness.link.with(|state| state.params.clone()),
        BTreeMap::from([
            ("CRUISE_SPEED".to_owned(), 3.0),
            ("WP_RADIUS".to_owned(), 2.0),
        ])
    );
}

#[tokio::test]
async fn set_flight_mode_reaches_the_link_and_snapshot() {
    let harness = Harness::spawn(MockLink::default(), None, false, "itest-mode.json");
    harness.request(UgvRequest::Connect).await.unwrap();

    harness
        .request(UgvRequest::SetFlightMode {
            mode: "AUTO".parse().unwrap(),
        })
        .await
        .unwrap();

    assert_eq!(
        harness.link.with(|state| state.mode_sets.clone()),
        vec!["AUTO".to_owned()]
    );
    assert_eq!(harness.snapshot().mode, "AUTO");

    match harness.request(UgvRequest::GetFlightMode).await.unwrap() {
        UgvResponse::FlightMode(mode) => assert_eq!(mode, "AUTO"),
        other => panic!("unexpected response {other:?}"),
    }
}
