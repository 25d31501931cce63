use super::*;
use crate::domain::{CameraSettings, Product, Verdict};
use crate::error::StoreError;
use crate::infra::config::{Config, NotificationsConfig, OutputsConfig};
use crate::io::profiles::ConfigProfileStore;
use crate::io::store::JsonlRunStore;
use crate::services::notifier::create_notifier;
use crate::services::test_support::{FakeBus, FakeCamera, FixedInspector, RecordingAnnouncer};

const ENTRY: u8 = 1;
const EXIT: u8 = 2;
const PROFILE: u32 = 1;
const PROFILE_NO_CAMERA: u32 = 2;
const OPERATOR: u32 = 7;

fn profile(id: u32, camera: bool) -> Profile {
    Profile {
        id,
        name: format!("profile-{id}"),
        product: Product {
            name: "BL-CARRY-BAGS".to_string(),
            min_sensor_block_time_ms: Some(100),
            max_sensor_block_time_ms: Some(400),
        },
        camera: camera.then(|| CameraSettings { name: "bags".to_string(), ..Default::default() }),
    }
}

fn test_config() -> Config {
    Config::default()
        .with_profiles(
            vec![profile(PROFILE, true), profile(PROFILE_NO_CAMERA, false)],
            vec![Operator { id: OPERATOR, name: "Ana".to_string() }],
        )
        .with_max_transit_time_ms(2000)
        .with_post_run_delay_ms(500)
        .with_countdown_beeps(1)
}

struct Harness {
    orchestrator: Arc<Orchestrator>,
    bus: Arc<FakeBus>,
    store: Arc<JsonlRunStore>,
    camera: Arc<FakeCamera>,
    announcer: Arc<RecordingAnnouncer>,
    config: ConfigHandle,
    metrics: Arc<Metrics>,
    _shutdown: watch::Sender<bool>,
}

impl Harness {
    fn new() -> Self {
        Self::with_parts(Arc::new(JsonlRunStore::in_memory()), Verdict::Accept)
    }

    fn with_parts(store: Arc<JsonlRunStore>, verdict: Verdict) -> Self {
        Self::build(store.clone(), store, verdict, false)
    }

    /// Notifier wired to the gateway, so alerts blink the red LED
    fn with_alert_blinks() -> Self {
        let store = Arc::new(JsonlRunStore::in_memory());
        Self::build(store.clone(), store, Verdict::Accept, true)
    }

    fn build(
        store: Arc<JsonlRunStore>,
        run_store: Arc<dyn RunStore>,
        verdict: Verdict,
        alert_blinks: bool,
    ) -> Self {
        let config = ConfigHandle::new(test_config());
        let metrics = Arc::new(Metrics::new());
        let bus = Arc::new(FakeBus::new(4, 8));
        let gateway = Arc::new(OutputGateway::new(
            bus.clone(),
            &OutputsConfig::default(),
            3,
            metrics.clone(),
        ));
        let buzzer = Arc::new(BuzzerSequencer::start(gateway.clone(), Duration::from_millis(50)));
        let (notifier, worker) = create_notifier(
            run_store.clone(),
            alert_blinks.then(|| gateway.clone()),
            &NotificationsConfig::default(),
            metrics.clone(),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(worker.run(shutdown_rx));

        let camera = Arc::new(FakeCamera::default());
        let announcer = Arc::new(RecordingAnnouncer::default());
        let collab = Collaborators {
            camera: camera.clone(),
            inspector: Arc::new(FixedInspector(verdict)),
            announcer: announcer.clone(),
            run_store,
            profiles: Arc::new(ConfigProfileStore::new(config.clone())),
        };
        let orchestrator =
            Orchestrator::new(config.clone(), gateway, buzzer, notifier, collab, metrics.clone());
        Self {
            orchestrator,
            bus,
            store,
            camera,
            announcer,
            config,
            metrics,
            _shutdown: shutdown_tx,
        }
    }

    async fn start(&self, target: u32, delay_secs: u64) -> bool {
        self.orchestrator.start_run(PROFILE, target, delay_secs, "B1", Some(OPERATOR)).await
    }

    async fn sensor(&self, channel: u8, state: SensorState) {
        self.orchestrator.handle_sensor_event(SensorEvent::new(SensorId(channel), state)).await;
    }

    /// One item through both sensors with a block time inside the window
    async fn pass_item(&self) {
        self.sensor(ENTRY, SensorState::Triggered).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.sensor(ENTRY, SensorState::Cleared).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        self.sensor(EXIT, SensorState::Triggered).await;
        self.sensor(EXIT, SensorState::Cleared).await;
    }

    fn status(&self) -> RunStatus {
        self.orchestrator.get_status()
    }

    fn coil(&self, name: &str) -> Option<bool> {
        let outputs = OutputsConfig::default();
        let address = outputs.entries().iter().find(|(n, _)| *n == name).map(|(_, a)| *a)?;
        self.bus.coil(address)
    }
}

/// Run store whose writes always fail
struct BrokenStore;

#[async_trait]
impl RunStore for BrokenStore {
    async fn create_run(&self, _run: &NewRun) -> Result<RunId, StoreError> {
        Err(StoreError::Io(std::io::Error::other("disk full")))
    }

    async fn update_status(
        &self,
        id: RunId,
        _status: RunRecordStatus,
        _ended_at: Option<chrono::DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        Err(StoreError::UnknownRun(id.0))
    }

    async fn record_event(&self, id: RunId, _event: &RunEvent) -> Result<(), StoreError> {
        Err(StoreError::UnknownRun(id.0))
    }

    async fn query_events(&self, id: RunId) -> Result<Vec<RunEvent>, StoreError> {
        Err(StoreError::UnknownRun(id.0))
    }

    async fn log_alert(&self, _alert: &Alert) -> Result<(), StoreError> {
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_start_sets_outputs_and_status() {
    let h = Harness::new();
    assert!(h.start(5, 3).await);

    let status = h.status();
    assert_eq!(status.mode, OperatingMode::Running);
    assert_eq!(status.active_profile.as_deref(), Some("profile-1"));
    assert_eq!(status.product_name.as_deref(), Some("BL-CARRY-BAGS"));
    assert_eq!(status.operator_name.as_deref(), Some("Ana"));
    assert_eq!(status.batch_code.as_deref(), Some("B1"));
    assert_eq!(status.target_count, 5);
    assert_eq!(status.run_progress, 0);

    assert_eq!(h.coil("conveyor"), Some(true));
    assert_eq!(h.coil("led_green"), Some(true));
    assert_eq!(h.coil("led_red"), Some(false));
    assert_eq!(h.camera.applied.lock().len(), 1);
    assert_eq!(h.store.run_status(RunId(1)), Some(RunRecordStatus::Running));
}

#[tokio::test(start_paused = true)]
async fn test_count_follows_exits_across_target() {
    let h = Harness::new();
    assert!(h.start(3, 60).await);

    h.pass_item().await;
    h.pass_item().await;
    assert_eq!(h.status().run_progress, 2);
    assert_eq!(h.status().mode, OperatingMode::Running);

    h.pass_item().await;
    let status = h.status();
    assert_eq!(status.run_progress, 3);
    assert_eq!(status.mode, OperatingMode::PostRunDelay);
    assert_eq!(h.store.run_status(RunId(1)), Some(RunRecordStatus::Completed));

    // Past the target nothing is counted any more
    h.sensor(EXIT, SensorState::Triggered).await;
    assert_eq!(h.status().run_progress, 3);
}

#[tokio::test(start_paused = true)]
async fn test_exit_ignored_when_not_running() {
    let h = Harness::new();
    h.sensor(EXIT, SensorState::Triggered).await;
    assert_eq!(h.status().run_progress, 0);
    assert_eq!(h.status().mode, OperatingMode::Stopped);

    assert!(h.start(5, 3).await);
    h.pass_item().await;
    h.orchestrator.stop_run().await;
    h.sensor(EXIT, SensorState::Triggered).await;
    assert_eq!(h.status().run_progress, 0);
}

#[tokio::test(start_paused = true)]
async fn test_exit_without_item_not_counted() {
    let h = Harness::new();
    assert!(h.start(5, 3).await);
    h.sensor(EXIT, SensorState::Triggered).await;
    assert_eq!(h.status().run_progress, 0);
    assert_eq!(h.status().mode, OperatingMode::Running);
}

#[tokio::test(start_paused = true)]
async fn test_double_entry_registers_one_item() {
    let h = Harness::new();
    assert!(h.start(5, 3).await);
    h.sensor(ENTRY, SensorState::Triggered).await;
    h.sensor(ENTRY, SensorState::Triggered).await;
    assert_eq!(h.status().in_flight, 1);
}

#[tokio::test(start_paused = true)]
async fn test_stall_fails_run_once() {
    let h = Harness::new();
    assert!(h.start(5, 3).await);
    h.sensor(ENTRY, SensorState::Triggered).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    h.sensor(ENTRY, SensorState::Cleared).await;

    tokio::time::sleep(Duration::from_millis(2500)).await;
    tokio::task::yield_now().await;

    let status = h.status();
    assert_eq!(status.mode, OperatingMode::Stopped);
    let alarm = status.active_alarm_message.unwrap();
    assert!(alarm.starts_with("stalled product: "), "{alarm}");
    assert_eq!(h.store.run_status(RunId(1)), Some(RunRecordStatus::Failed));
    assert_eq!(h.metrics.items_stalled(), 1);
    assert_eq!(h.coil("conveyor"), Some(false));
    assert_eq!(h.coil("led_red"), Some(true));

    // A late exit neither counts nor raises anything new
    h.sensor(EXIT, SensorState::Triggered).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.status().run_progress, 0);
    assert_eq!(h.announcer.events.lock().iter().filter(|e| *e == "run_failed").count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failure_while_stopped_is_noop() {
    let h = Harness::new();
    h.orchestrator.trigger_run_failure("x".to_string()).await;
    assert_eq!(h.status().mode, OperatingMode::Stopped);
    assert!(h.status().active_alarm_message.is_none());
    assert!(h.announcer.events.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failure_while_idle_keeps_profile() {
    let h = Harness::new();
    assert!(h.orchestrator.load_profile(PROFILE).await);
    h.orchestrator.trigger_run_failure("x".to_string()).await;

    let status = h.status();
    assert_eq!(status.mode, OperatingMode::Idle);
    assert_eq!(status.active_profile.as_deref(), Some("profile-1"));
    assert!(status.active_alarm_message.is_none());
    assert_eq!(h.metrics.report().runs_failed, 0);
}

#[tokio::test(start_paused = true)]
async fn test_restart_after_failure_leaves_red_led_off() {
    let h = Harness::with_alert_blinks();
    assert!(h.start(5, 3).await);
    h.orchestrator.trigger_run_failure("x".to_string()).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    h.orchestrator.acknowledge_alarm().await;
    assert!(h.start(5, 3).await);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(h.status().mode, OperatingMode::Running);
    assert_eq!(h.coil("led_red"), Some(false));
    assert_eq!(h.coil("led_green"), Some(true));

    h.orchestrator.stop_run().await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(h.coil("led_red"), Some(true));
}

#[tokio::test(start_paused = true)]
async fn test_stop_while_stopped_is_noop() {
    let h = Harness::new();
    h.orchestrator.stop_run().await;
    assert_eq!(h.status().mode, OperatingMode::Stopped);
    assert!(h.status().active_alarm_message.is_none());
    assert!(h.bus.writes_to(OutputsConfig::default().led_red).is_empty());
    assert_eq!(h.store.run_status(RunId(1)), None);
}

#[tokio::test(start_paused = true)]
async fn test_stop_aborts_running_record() {
    let h = Harness::new();
    assert!(h.start(5, 3).await);
    h.sensor(ENTRY, SensorState::Triggered).await;
    h.orchestrator.stop_run().await;

    let status = h.status();
    assert_eq!(status.mode, OperatingMode::Stopped);
    assert_eq!(status.in_flight, 0);
    assert!(status.batch_code.is_none());
    assert_eq!(h.store.run_status(RunId(1)), Some(RunRecordStatus::Aborted));
    assert_eq!(h.coil("conveyor"), Some(false));
    assert_eq!(h.coil("led_red"), Some(true));

    // Tracker was cleared: no stall later
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(h.status().active_alarm_message.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_stop_in_post_run_delay_keeps_completed_record() {
    let h = Harness::new();
    assert!(h.start(1, 3).await);
    h.pass_item().await;
    assert_eq!(h.status().mode, OperatingMode::PostRunDelay);

    h.orchestrator.stop_run().await;
    assert_eq!(h.store.run_status(RunId(1)), Some(RunRecordStatus::Completed));

    // The completion sequence is gone: nothing restarts
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.status().mode, OperatingMode::Stopped);
    assert_eq!(h.store.run_status(RunId(2)), None);
}

#[tokio::test(start_paused = true)]
async fn test_start_rejected_while_active() {
    let h = Harness::new();
    assert!(h.start(5, 3).await);
    h.pass_item().await;

    assert!(!h.start(9, 3).await);
    let status = h.status();
    assert_eq!(status.target_count, 5);
    assert_eq!(status.run_progress, 1);
    assert_eq!(status.run_id, Some(1));
}

#[tokio::test(start_paused = true)]
async fn test_start_refused_without_camera_profile() {
    let h = Harness::new();
    assert!(!h.orchestrator.start_run(PROFILE_NO_CAMERA, 5, 3, "B1", None).await);
    assert!(!h.orchestrator.start_run(99, 5, 3, "B1", None).await);
    assert!(!h.orchestrator.start_run(PROFILE, 0, 3, "B1", None).await);
    assert!(!h.orchestrator.start_run(PROFILE, 5, 3, "B1", Some(404)).await);
    assert_eq!(h.status().mode, OperatingMode::Stopped);
    assert_eq!(h.store.run_status(RunId(1)), None);
}

#[tokio::test(start_paused = true)]
async fn test_store_failure_refuses_start() {
    let h = Harness::build(
        Arc::new(JsonlRunStore::in_memory()),
        Arc::new(BrokenStore),
        Verdict::Accept,
        false,
    );
    assert!(!h.start(5, 3).await);
    assert_eq!(h.status().mode, OperatingMode::Stopped);
    assert_ne!(h.coil("conveyor"), Some(true));
}

#[tokio::test(start_paused = true)]
async fn test_hardware_failure_refuses_start() {
    let h = Harness::new();
    h.bus.set_fail_writes(true);
    assert!(!h.start(5, 3).await);
    assert_eq!(h.status().mode, OperatingMode::Stopped);
    assert_eq!(h.store.run_status(RunId(1)), Some(RunRecordStatus::Failed));
}

#[tokio::test(start_paused = true)]
async fn test_size_mismatch_raises_alarm_until_acknowledged() {
    let h = Harness::new();
    assert!(h.start(5, 3).await);
    h.sensor(ENTRY, SensorState::Triggered).await;
    tokio::time::sleep(Duration::from_millis(900)).await;
    h.sensor(ENTRY, SensorState::Cleared).await;

    let status = h.status();
    assert_eq!(status.mode, OperatingMode::Running);
    let alarm = status.active_alarm_message.unwrap();
    assert!(alarm.starts_with("Product size mismatch!"), "{alarm}");

    // First alarm wins
    h.sensor(ENTRY, SensorState::Triggered).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.sensor(ENTRY, SensorState::Cleared).await;
    assert_eq!(h.status().active_alarm_message.as_deref(), Some(alarm.as_str()));

    h.orchestrator.acknowledge_alarm().await;
    assert!(h.status().active_alarm_message.is_none());
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(h.announcer.events.lock().iter().any(|e| e == "alarm_acknowledged"));
}

#[tokio::test(start_paused = true)]
async fn test_load_profile_enters_idle() {
    let h = Harness::new();
    assert!(!h.orchestrator.load_profile(PROFILE_NO_CAMERA).await);
    assert!(h.orchestrator.load_profile(PROFILE).await);

    let status = h.status();
    assert_eq!(status.mode, OperatingMode::Idle);
    assert_eq!(status.active_profile.as_deref(), Some("profile-1"));
    assert_eq!(h.camera.applied.lock().len(), 1);

    assert!(h.start(5, 3).await);
    assert_eq!(h.status().mode, OperatingMode::Running);
    assert!(!h.orchestrator.load_profile(PROFILE).await);
}

#[tokio::test(start_paused = true)]
async fn test_batch_loop_restarts_with_fresh_count() {
    let h = Harness::new();
    assert!(h.start(2, 1).await);
    h.pass_item().await;
    h.pass_item().await;
    assert_eq!(h.status().mode, OperatingMode::PostRunDelay);

    tokio::time::sleep(Duration::from_millis(600)).await;
    let status = h.status();
    assert_eq!(status.mode, OperatingMode::PausedBetweenBatches);
    assert_eq!(status.in_flight, 0);
    assert_eq!(h.coil("conveyor"), Some(false));

    tokio::time::sleep(Duration::from_millis(1200)).await;
    let status = h.status();
    assert_eq!(status.mode, OperatingMode::Running);
    assert_eq!(status.run_progress, 0);
    assert_eq!(status.run_id, Some(2));
    assert_eq!(status.batch_code.as_deref(), Some("B1"));
    assert_eq!(h.coil("conveyor"), Some(true));
    assert_eq!(h.store.run_status(RunId(1)), Some(RunRecordStatus::Completed));
    assert_eq!(h.store.run_status(RunId(2)), Some(RunRecordStatus::Running));

    let narrations = h.announcer.narrations.lock().clone();
    assert_eq!(narrations.len(), 1);
    assert!(narrations[0].contains("2 items counted, 0 rejected"), "{}", narrations[0]);
    assert!(h.announcer.events.lock().iter().any(|e| e == "batch_complete"));
}

#[tokio::test(start_paused = true)]
async fn test_rejects_reach_the_summary() {
    let h = Harness::with_parts(
        Arc::new(JsonlRunStore::in_memory()),
        Verdict::Reject { reason: "REJECT_DISTORTION".to_string() },
    );
    assert!(h.start(1, 1).await);
    h.pass_item().await;
    assert_eq!(h.camera.captures.lock().len(), 1);

    tokio::time::sleep(Duration::from_millis(600)).await;
    let narrations = h.announcer.narrations.lock().clone();
    assert!(narrations[0].contains("1 items counted, 1 rejected"), "{}", narrations[0]);
}

#[tokio::test(start_paused = true)]
async fn test_failed_auto_restart_stops_with_alarm() {
    let h = Harness::new();
    assert!(h.start(1, 1).await);
    h.pass_item().await;

    // Profile disappears from the configuration during the pause
    h.config.replace(Config::default());
    tokio::time::sleep(Duration::from_secs(10)).await;

    let status = h.status();
    assert_eq!(status.mode, OperatingMode::Stopped);
    let alarm = status.active_alarm_message.unwrap();
    assert!(alarm.starts_with("Auto-restart failed"), "{alarm}");
    assert_eq!(h.coil("conveyor"), Some(false));
    assert_eq!(h.coil("led_red"), Some(true));
}

#[tokio::test(start_paused = true)]
async fn test_dispatch_updates_io_health() {
    let h = Harness::new();
    let (tx, rx) = mpsc::channel(8);
    let dispatcher = tokio::spawn(dispatch_events(h.orchestrator.clone(), rx));

    assert!(h.start(5, 3).await);
    tx.send(PollerEvent::Health(IoHealth::Connected)).await.unwrap();
    tx.send(PollerEvent::Sensor(SensorEvent::new(SensorId(ENTRY), SensorState::Triggered)))
        .await
        .unwrap();
    drop(tx);
    dispatcher.await.unwrap();

    let status = h.status();
    assert_eq!(status.io_health, IoHealth::Connected);
    assert_eq!(status.in_flight, 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_leaves_outputs_safe() {
    let h = Harness::new();
    assert!(h.start(5, 3).await);
    h.orchestrator.beep_for(5000);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.coil("buzzer"), Some(true));

    h.orchestrator.shutdown().await;
    assert_eq!(h.status().mode, OperatingMode::Stopped);
    assert_eq!(h.coil("buzzer"), Some(false));
    assert_eq!(h.coil("conveyor"), Some(false));
    assert_eq!(h.store.run_status(RunId(1)), Some(RunRecordStatus::Aborted));
}
