//! Run orchestrator - the operating mode state machine
//!
//! Every transition runs under one async mutex over [`RunState`]. Status is
//! published through a watch channel after each transition so readers never
//! touch the lock. The completion sequence (post-run delay, inter-batch
//! pause, countdown, auto-restart) is a single task whose handle lives in the
//! state; start, stop and failure abort and await it before doing anything
//! else.
//!
//! Collaborator failures are typed internally and translated here into
//! alarms, notifications and `bool` results.

use crate::domain::{
    Alarm, Alert, AlertLevel, IoHealth, ItemSerial, NewRun, OperatingMode, Operator, Profile,
    RunEvent, RunEventKind, RunId, RunRecordStatus, RunStatus, SensorEvent, SensorId, SensorState,
};
use crate::error::{CollaboratorError, StartError};
use crate::infra::config::ConfigHandle;
use crate::infra::metrics::Metrics;
use crate::io::audio::Announcer;
use crate::io::camera::Camera;
use crate::io::inspector::Inspector;
use crate::io::profiles::ProfileStore;
use crate::io::store::RunStore;
use crate::services::buzzer::BuzzerSequencer;
use crate::services::inflight::{InFlightTracker, RunFailureSink};
use crate::services::notifier::Notifier;
use crate::services::outputs::{OutputGateway, CONVEYOR, LED_GREEN, LED_RED};
use crate::services::poller::PollerEvent;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

mod capture;

use capture::CaptureJob;

#[cfg(test)]
mod tests;

/// External collaborators injected at construction
pub struct Collaborators {
    pub camera: Arc<dyn Camera>,
    pub inspector: Arc<dyn Inspector>,
    pub announcer: Arc<dyn Announcer>,
    pub run_store: Arc<dyn RunStore>,
    pub profiles: Arc<dyn ProfileStore>,
}

/// Parameters of a start request, kept for the auto-restart
#[derive(Debug, Clone)]
struct StartRequest {
    profile_id: u32,
    target_count: u32,
    post_batch_delay_secs: u64,
    batch_code: String,
    operator_id: Option<u32>,
}

#[derive(Debug, Clone)]
struct ActiveRun {
    run_id: RunId,
    profile: Profile,
    operator: Option<Operator>,
    batch_code: String,
    target_count: u32,
    post_batch_delay_secs: u64,
}

#[derive(Default)]
struct RunState {
    mode: OperatingMode,
    /// Profile preloaded in Idle
    loaded_profile: Option<Profile>,
    run: Option<ActiveRun>,
    current_count: u32,
    alarm: Option<Alarm>,
    completion: Option<JoinHandle<()>>,
    last_start: Option<StartRequest>,
}

impl RunState {
    /// First alarm wins until acknowledged
    fn raise_alarm(&mut self, message: &str) -> bool {
        if self.alarm.is_some() {
            debug!(message = %message, "alarm_suppressed");
            return false;
        }
        warn!(message = %message, "alarm_raised");
        self.alarm = Some(Alarm::new(message));
        true
    }

    fn clear_metadata(&mut self) {
        self.run = None;
        self.loaded_profile = None;
        self.current_count = 0;
    }

    /// Abort the completion sequence and wait until it is gone
    async fn cancel_completion(&mut self) {
        if let Some(handle) = self.completion.take() {
            handle.abort();
            let _ = handle.await;
            debug!("completion_sequence_cancelled");
        }
    }
}

pub struct Orchestrator {
    config: ConfigHandle,
    state: Mutex<RunState>,
    tracker: InFlightTracker,
    gateway: Arc<OutputGateway>,
    buzzer: Arc<BuzzerSequencer>,
    notifier: Notifier,
    collab: Collaborators,
    /// Capture pipelines and fire-and-forget announcements
    side_tasks: parking_lot::Mutex<JoinSet<()>>,
    status_tx: watch::Sender<RunStatus>,
    io_health: parking_lot::Mutex<IoHealth>,
    metrics: Arc<Metrics>,
    weak_self: Weak<Orchestrator>,
}

impl Orchestrator {
    pub fn new(
        config: ConfigHandle,
        gateway: Arc<OutputGateway>,
        buzzer: Arc<BuzzerSequencer>,
        notifier: Notifier,
        collab: Collaborators,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        let max_transit = Duration::from_millis(config.current().max_transit_time_ms());
        let orchestrator = Arc::new_cyclic(|weak_self| Self {
            config,
            state: Mutex::new(RunState::default()),
            tracker: InFlightTracker::new(max_transit, metrics.clone()),
            gateway,
            buzzer,
            notifier,
            collab,
            side_tasks: parking_lot::Mutex::new(JoinSet::new()),
            status_tx: watch::channel(RunStatus::default()).0,
            io_health: parking_lot::Mutex::new(IoHealth::default()),
            metrics,
            weak_self: weak_self.clone(),
        });
        let weak: Weak<Orchestrator> = Arc::downgrade(&orchestrator);
        let sink: Weak<dyn RunFailureSink> = weak;
        orchestrator.tracker.start_watchdog(sink);
        orchestrator
    }

    /// Drive the outputs to the safe state at boot
    pub async fn initialize_hardware(&self) -> bool {
        let failures = self.gateway.apply_safe_state().await;
        if failures.is_empty() {
            return true;
        }
        let failed: Vec<String> = failures.iter().map(|(name, e)| format!("{name}: {e}")).collect();
        self.notifier.send(
            Alert::new(AlertLevel::Error, "Failed to initialize outputs")
                .with_details(serde_json::json!({ "failures": failed })),
        );
        false
    }

    pub fn get_status(&self) -> RunStatus {
        self.status_tx.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<RunStatus> {
        self.status_tx.subscribe()
    }

    pub fn beep_for(&self, duration_ms: u64) {
        self.buzzer.beep_for(Duration::from_millis(duration_ms));
    }

    pub fn set_io_health(&self, health: IoHealth) {
        *self.io_health.lock() = health;
        self.status_tx.send_modify(|status| status.io_health = health);
    }

    /// Preload a profile and enter Idle
    pub async fn load_profile(&self, profile_id: u32) -> bool {
        let mut state = self.state.lock().await;
        if state.mode.is_active() {
            warn!(profile_id = %profile_id, mode = %state.mode.as_str(), "load_profile_rejected");
            return false;
        }

        let profile = match self.lookup_profile(profile_id).await {
            Ok(profile) => profile,
            Err(e) => {
                warn!(profile_id = %profile_id, error = %e, "load_profile_failed");
                return false;
            }
        };
        self.apply_camera_settings(&profile).await;

        info!(profile_id = %profile.id, profile = %profile.name, "profile_loaded");
        state.loaded_profile = Some(profile);
        state.mode = OperatingMode::Idle;
        self.publish(&state);
        true
    }

    pub async fn start_run(
        &self,
        profile_id: u32,
        target_count: u32,
        post_batch_delay_secs: u64,
        batch_code: &str,
        operator_id: Option<u32>,
    ) -> bool {
        let request = StartRequest {
            profile_id,
            target_count,
            post_batch_delay_secs,
            batch_code: batch_code.to_string(),
            operator_id,
        };
        let mut state = self.state.lock().await;
        match self.start_locked(&mut state, request, false).await {
            Ok(run_id) => {
                info!(run_id = %run_id, "start_run_accepted");
                true
            }
            Err(e) => {
                warn!(profile_id = %profile_id, batch_code = %batch_code, error = %e, "start_run_rejected");
                if matches!(e, StartError::Store(_) | StartError::Hardware(_)) {
                    self.notifier.notify(AlertLevel::Error, format!("Run start failed: {e}"));
                }
                false
            }
        }
    }

    async fn lookup_profile(&self, profile_id: u32) -> Result<Profile, StartError> {
        let profile = self
            .collab
            .profiles
            .profile(profile_id)
            .await
            .map_err(StartError::ProfileStore)?
            .ok_or(StartError::ProfileNotFound(profile_id))?;
        if profile.camera.is_none() {
            return Err(StartError::MissingCameraProfile(profile_id));
        }
        Ok(profile)
    }

    /// Best effort; a camera that cannot take settings does not block a run
    async fn apply_camera_settings(&self, profile: &Profile) {
        let Some(settings) = &profile.camera else {
            return;
        };
        let timeout = Duration::from_millis(self.config.current().camera().timeout_ms);
        match tokio::time::timeout(timeout, self.collab.camera.apply_settings(settings)).await {
            Ok(Ok(())) => debug!(camera_profile = %settings.name, "camera_settings_applied"),
            Ok(Err(CollaboratorError::Disabled(_))) => {}
            Ok(Err(e)) => warn!(error = %e, "camera_settings_failed"),
            Err(_) => warn!("camera_settings_timeout"),
        }
    }

    /// The start sequence. On any error the state is left untouched.
    async fn start_locked(
        &self,
        state: &mut RunState,
        request: StartRequest,
        auto_restart: bool,
    ) -> Result<RunId, StartError> {
        let restartable = auto_restart && state.mode == OperatingMode::PausedBetweenBatches;
        if state.mode.is_active() && !restartable {
            return Err(StartError::AlreadyActive(state.mode));
        }
        if request.target_count == 0 {
            return Err(StartError::ZeroTarget);
        }

        let profile = self.lookup_profile(request.profile_id).await?;
        let operator = match request.operator_id {
            Some(id) => Some(
                self.collab
                    .profiles
                    .operator(id)
                    .await
                    .map_err(StartError::ProfileStore)?
                    .ok_or(StartError::OperatorNotFound(id))?,
            ),
            None => None,
        };

        let new_run = NewRun {
            batch_code: request.batch_code.clone(),
            profile_id: profile.id,
            profile_name: profile.name.clone(),
            product_name: profile.product.name.clone(),
            operator_id: operator.as_ref().map(|o| o.id),
            operator_name: operator.as_ref().map(|o| o.name.clone()),
            target_count: request.target_count,
            started_at: Utc::now(),
        };
        let run_id = self.collab.run_store.create_run(&new_run).await?;

        self.apply_camera_settings(&profile).await;

        if let Err(e) = self.switch_on_line().await {
            error!(run_id = %run_id, error = %e, "start_outputs_failed");
            self.update_record(run_id, RunRecordStatus::Failed).await;
            self.gateway.apply_safe_state().await;
            return Err(e.into());
        }

        // Committed from here on
        state.cancel_completion().await;
        self.tracker.set_max_transit(Duration::from_millis(
            self.config.current().max_transit_time_ms(),
        ));
        self.tracker.reset();
        state.alarm = None;
        state.mode = OperatingMode::Running;
        state.current_count = 0;
        state.loaded_profile = Some(profile.clone());
        state.run = Some(ActiveRun {
            run_id,
            profile,
            operator,
            batch_code: request.batch_code.clone(),
            target_count: request.target_count,
            post_batch_delay_secs: request.post_batch_delay_secs,
        });
        state.last_start = Some(request.clone());

        self.metrics.record_run_started();
        info!(
            run_id = %run_id,
            batch_code = %request.batch_code,
            target = %request.target_count,
            auto_restart = %auto_restart,
            "run_started"
        );
        self.notifier.notify(
            AlertLevel::Info,
            format!("Run {} started, batch {}", run_id, request.batch_code),
        );
        self.publish(state);
        Ok(run_id)
    }

    async fn switch_on_line(&self) -> Result<(), crate::error::HardwareError> {
        self.gateway.write_output(LED_RED, false).await?;
        self.gateway.write_output(LED_GREEN, true).await?;
        self.gateway.write_output(CONVEYOR, true).await
    }

    async fn update_record(&self, run_id: RunId, status: RunRecordStatus) {
        let ended_at = Some(Utc::now());
        if let Err(e) = self.collab.run_store.update_status(run_id, status, ended_at).await {
            warn!(run_id = %run_id, status = %status.as_str(), error = %e, "run_record_update_failed");
        }
    }

    /// Stop from any mode. Always reaches Stopped.
    pub async fn stop_run(&self) {
        let mut state = self.state.lock().await;
        if state.mode == OperatingMode::Stopped {
            debug!("stop_run_ignored");
            return;
        }
        state.cancel_completion().await;

        if state.mode == OperatingMode::Running {
            if let Some(run) = &state.run {
                self.update_record(run.run_id, RunRecordStatus::Aborted).await;
            }
            self.metrics.record_run_aborted();
        }

        let failures = self.gateway.apply_safe_state().await;
        if !failures.is_empty() {
            let failed: Vec<String> =
                failures.iter().map(|(name, e)| format!("{name}: {e}")).collect();
            self.notifier.send(
                Alert::new(AlertLevel::Error, "Safe state incomplete after stop")
                    .with_details(serde_json::json!({ "failures": failed })),
            );
        }

        let previous = state.mode;
        self.tracker.reset();
        state.clear_metadata();
        state.mode = OperatingMode::Stopped;
        info!(from = %previous.as_str(), "run_stopped");
        self.notifier.notify(AlertLevel::Info, "Run stopped");
        self.publish(&state);
    }

    pub async fn acknowledge_alarm(&self) {
        let mut state = self.state.lock().await;
        if let Some(alarm) = state.alarm.take() {
            info!(message = %alarm.message, "alarm_acknowledged");
            self.announce_event("alarm_acknowledged");
        }
        self.publish(&state);
    }

    pub async fn handle_sensor_event(&self, event: SensorEvent) {
        let mut state = self.state.lock().await;
        self.metrics.record_sensor_event(event.timestamp.elapsed().as_micros() as u64);

        if state.mode != OperatingMode::Running {
            if !self.tracker.is_empty() || self.tracker.is_entry_blocked() {
                self.tracker.reset();
                self.publish(&state);
            }
            return;
        }

        let config = self.config.current();
        let entry = SensorId(config.entry_channel());
        let exit = SensorId(config.exit_channel());

        match (event.sensor_id, event.new_state) {
            (id, SensorState::Triggered) if id == entry => {
                if let Some(serial) = self.tracker.register_entry(event.timestamp) {
                    self.buzzer.beep_for(Duration::from_millis(config.entry_beep_ms()));
                    if let Some(run) = &state.run {
                        self.spawn_capture(run.run_id, serial);
                    }
                }
            }
            (id, SensorState::Cleared) if id == entry => {
                let Some(blocked) = self.tracker.entry_cleared(event.timestamp) else {
                    return;
                };
                let complaint =
                    state.run.as_ref().and_then(|run| run.profile.product.check_block_time(blocked));
                if let Some(message) = complaint {
                    self.metrics.record_size_mismatch();
                    state.raise_alarm(&message);
                    self.notifier.notify(AlertLevel::Warning, message);
                    self.buzzer.beep_for(Duration::from_millis(config.alarm_beep_ms()));
                }
            }
            (id, SensorState::Triggered) if id == exit => {
                let Some(serial) = self.tracker.on_exit() else {
                    warn!("exit_without_item");
                    self.metrics.record_exit_without_item();
                    self.publish(&state);
                    return;
                };
                state.current_count += 1;
                self.metrics.record_item_counted();
                self.buzzer.beep_for(Duration::from_millis(config.exit_beep_ms()));

                let (run_id, target) = match &state.run {
                    Some(run) => (run.run_id, run.target_count),
                    None => return,
                };
                info!(
                    run_id = %run_id,
                    serial = %serial,
                    count = %state.current_count,
                    target = %target,
                    "item_counted"
                );
                let counted = RunEvent::new(serial, RunEventKind::Counted);
                if let Err(e) = self.collab.run_store.record_event(run_id, &counted).await {
                    warn!(run_id = %run_id, error = %e, "count_record_failed");
                }
                if state.current_count >= target {
                    self.complete_run_locked(&mut state).await;
                }
            }
            _ => {}
        }
        self.publish(&state);
    }

    async fn complete_run_locked(&self, state: &mut RunState) {
        let Some(run) = state.run.clone() else {
            return;
        };
        state.mode = OperatingMode::PostRunDelay;
        self.update_record(run.run_id, RunRecordStatus::Completed).await;
        self.metrics.record_run_completed();

        let rejects = match self.collab.run_store.query_events(run.run_id).await {
            Ok(events) => crate::domain::run::reject_count(&events),
            Err(e) => {
                warn!(run_id = %run.run_id, error = %e, "reject_count_failed");
                0
            }
        };
        info!(
            run_id = %run.run_id,
            count = %state.current_count,
            rejects = %rejects,
            "run_completed"
        );
        self.notifier.notify(
            AlertLevel::Info,
            format!("Batch {} complete: {} counted, {} rejected", run.batch_code, state.current_count, rejects),
        );
        self.announce_event("batch_complete");

        let summary = format!(
            "Batch {} complete. {} items counted, {} rejected. Next batch starts in {} seconds.",
            run.batch_code, state.current_count, rejects, run.post_batch_delay_secs
        );
        let weak = self.weak_self.clone();
        state.completion = Some(tokio::spawn(completion_sequence(weak, run.run_id, summary)));
        self.publish(state);
    }

    /// PostRunDelay -> PausedBetweenBatches. False if the run moved on.
    async fn enter_pause(&self, run_id: RunId) -> Option<u64> {
        let mut state = self.state.lock().await;
        let same_run = state.run.as_ref().is_some_and(|run| run.run_id == run_id);
        if state.mode != OperatingMode::PostRunDelay || !same_run {
            return None;
        }
        state.mode = OperatingMode::PausedBetweenBatches;
        if let Err(e) = self.gateway.write_output(CONVEYOR, false).await {
            warn!(error = %e, "conveyor_stop_failed");
        }
        self.tracker.reset();
        let pause = state.run.as_ref().map_or(0, |run| run.post_batch_delay_secs);
        info!(run_id = %run_id, pause_secs = %pause, "batch_pause_started");
        self.publish(&state);
        Some(pause)
    }

    /// PausedBetweenBatches -> Running with the previous parameters
    async fn auto_restart(&self, run_id: RunId) {
        let mut state = self.state.lock().await;
        let same_run = state.run.as_ref().is_some_and(|run| run.run_id == run_id);
        if state.mode != OperatingMode::PausedBetweenBatches || !same_run {
            return;
        }
        // This task is the completion task; it must not abort itself
        state.completion = None;

        let Some(request) = state.last_start.clone() else {
            return;
        };
        if let Err(e) = self.start_locked(&mut state, request, true).await {
            error!(previous_run = %run_id, error = %e, "auto_restart_failed");
            self.gateway.apply_safe_state().await;
            self.tracker.reset();
            state.clear_metadata();
            state.mode = OperatingMode::Stopped;
            let message = format!("Auto-restart failed: {e}");
            state.raise_alarm(&message);
            self.notifier.notify(AlertLevel::Error, message);
            self.publish(&state);
        }
    }

    fn spawn_capture(&self, run_id: RunId, serial: ItemSerial) {
        let config = self.config.current();
        let job = CaptureJob {
            run_id,
            serial,
            camera: self.collab.camera.clone(),
            inspector: self.collab.inspector.clone(),
            store: self.collab.run_store.clone(),
            metrics: self.metrics.clone(),
            camera_id: config.camera().camera_id.clone(),
            trigger_delay: Duration::from_millis(config.camera().trigger_delay_ms),
            camera_timeout: Duration::from_millis(config.camera().timeout_ms),
            inspection_timeout: Duration::from_millis(config.inspection().timeout_ms),
        };
        self.spawn_side_task(job.run());
    }

    fn announce_event(&self, name: &'static str) {
        let announcer = self.collab.announcer.clone();
        self.spawn_side_task(async move {
            if let Err(e) = announcer.play_event(name).await {
                debug!(event = %name, error = %e, "announcement_failed");
            }
        });
    }

    fn spawn_side_task<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.side_tasks.lock();
        // Reap finished tasks so the set does not grow over a shift
        while let Some(result) = tasks.try_join_next() {
            if let Err(e) = result {
                if e.is_panic() {
                    error!(error = %e, "side_task_panicked");
                }
            }
        }
        tasks.spawn(task);
    }

    fn publish(&self, state: &RunState) {
        let profile = state.run.as_ref().map(|run| &run.profile).or(state.loaded_profile.as_ref());
        let status = RunStatus {
            mode: state.mode,
            active_profile: profile.map(|p| p.name.clone()),
            product_name: profile.map(|p| p.product.name.clone()),
            operator_name: state
                .run
                .as_ref()
                .and_then(|run| run.operator.as_ref())
                .map(|o| o.name.clone()),
            batch_code: state.run.as_ref().map(|run| run.batch_code.clone()),
            run_id: state.run.as_ref().map(|run| run.run_id.0),
            run_progress: state.current_count,
            target_count: state.run.as_ref().map_or(0, |run| run.target_count),
            post_batch_delay_secs: state.run.as_ref().map_or(0, |run| run.post_batch_delay_secs),
            active_alarm_message: state.alarm.as_ref().map(|a| a.message.clone()),
            in_flight: self.tracker.len(),
            io_health: *self.io_health.lock(),
        };
        self.metrics.set_mode(status.mode);
        self.metrics.set_run_progress(status.run_progress);
        self.status_tx.send_replace(status);
    }

    /// Stop everything and leave the outputs safe
    pub async fn shutdown(&self) {
        info!("orchestrator_shutdown_started");
        self.stop_run().await;

        let mut tasks = std::mem::take(&mut *self.side_tasks.lock());
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}

        self.gateway.apply_safe_state().await;
        self.buzzer.shutdown().await;
        info!("orchestrator_shutdown_complete");
    }
}

#[async_trait]
impl RunFailureSink for Orchestrator {
    async fn trigger_run_failure(&self, reason: String) {
        let mut state = self.state.lock().await;
        if !state.mode.is_active() {
            debug!(reason = %reason, mode = %state.mode.as_str(), "run_failure_ignored");
            return;
        }
        state.cancel_completion().await;

        if state.mode == OperatingMode::Running {
            if let Some(run) = &state.run {
                self.update_record(run.run_id, RunRecordStatus::Failed).await;
            }
        }
        self.metrics.record_run_failed();

        self.gateway.apply_safe_state().await;
        self.tracker.reset();
        let previous = state.mode;
        state.clear_metadata();
        state.mode = OperatingMode::Stopped;
        error!(reason = %reason, from = %previous.as_str(), "run_failed");

        state.raise_alarm(&reason);
        self.notifier.notify(AlertLevel::Critical, format!("Run failed: {reason}"));
        let alarm_beep = self.config.current().alarm_beep_ms();
        self.buzzer.beep_for(Duration::from_millis(alarm_beep));
        self.announce_event("run_failed");
        self.publish(&state);
    }
}

/// Post-run delay, inter-batch pause with narration and countdown, then the
/// next batch. Holds only a weak reference between steps.
async fn completion_sequence(orchestrator: Weak<Orchestrator>, run_id: RunId, summary: String) {
    let config = match orchestrator.upgrade() {
        Some(o) => o.config.current(),
        None => return,
    };
    tokio::time::sleep(Duration::from_millis(config.post_run_delay_ms())).await;

    let Some(o) = orchestrator.upgrade() else {
        return;
    };
    let Some(pause_secs) = o.enter_pause(run_id).await else {
        return;
    };

    let beeps = config.countdown_beeps();
    let lead_in = Duration::from_secs(pause_secs.saturating_sub(u64::from(beeps)));
    let narration_timeout = Duration::from_millis(config.narration_timeout_ms());
    let announcer = o.collab.announcer.clone();
    drop(o);

    let narrate = async {
        match tokio::time::timeout(narration_timeout, announcer.narrate(&summary)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "narration_failed"),
            Err(_) => warn!("narration_timeout"),
        }
    };
    tokio::join!(narrate, tokio::time::sleep(lead_in));

    for remaining in (1..=beeps).rev() {
        let Some(o) = orchestrator.upgrade() else {
            return;
        };
        debug!(remaining = %remaining, "countdown_beep");
        o.buzzer.beep_for(Duration::from_millis(config.countdown_beep_ms()));
        drop(o);
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    if let Some(o) = orchestrator.upgrade() {
        o.auto_restart(run_id).await;
    }
}

/// Feed poller events to the orchestrator in arrival order
pub async fn dispatch_events(orchestrator: Arc<Orchestrator>, mut rx: mpsc::Receiver<PollerEvent>) {
    info!("event_dispatcher_started");
    while let Some(event) = rx.recv().await {
        match event {
            PollerEvent::Sensor(event) => orchestrator.handle_sensor_event(event).await,
            PollerEvent::Health(health) => {
                info!(io_health = %health.as_str(), "io_health_changed");
                orchestrator.set_io_health(health);
            }
        }
    }
    info!("event_dispatcher_stopped");
}
