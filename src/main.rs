//! Line controller - run orchestration for an item counting and inspection line
//!
//! Module structure:
//! - `domain/` - Core business types (sensor events, runs, profiles)
//! - `io/` - External interfaces (Modbus RTU, run store, camera, inspection, audio)
//! - `services/` - Business logic (orchestrator, poller, tracker, outputs, buzzer)
//! - `infra/` - Infrastructure (config, metrics)

use anyhow::{bail, Context};
use clap::Parser;
use line_controller::domain::SensorId;
use line_controller::infra::{Config, ConfigHandle, Metrics};
use line_controller::io::audio::{Announcer, CommandAnnouncer, NullAnnouncer};
use line_controller::io::camera::{Camera, HttpCamera, NullCamera};
use line_controller::io::inspector::{HttpInspector, Inspector, NullInspector};
use line_controller::io::profiles::ConfigProfileStore;
use line_controller::io::{DiscreteBus, JsonlRunStore, ModbusRtu, ModbusSettings, RunStore};
use line_controller::services::{
    create_notifier, dispatch_events, BuzzerSequencer, Collaborators, Orchestrator, OutputGateway,
    SensorPoller,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Line controller - counting, inspection and batch sequencing
#[derive(Parser, Debug)]
#[command(name = "line-controller", version, about)]
struct Args {
    /// Path to TOML configuration file (falls back to CONFIG_FILE, then config/line.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Start a run at boot: profile:target:delay_secs:batch[:operator]
    #[arg(long)]
    start: Option<String>,
}

/// Parsed `--start` argument
#[derive(Debug, PartialEq)]
struct BootRun {
    profile_id: u32,
    target_count: u32,
    post_batch_delay_secs: u64,
    batch_code: String,
    operator_id: Option<u32>,
}

fn parse_boot_run(arg: &str) -> anyhow::Result<BootRun> {
    let parts: Vec<&str> = arg.split(':').collect();
    if !(4..=5).contains(&parts.len()) {
        bail!("expected profile:target:delay_secs:batch[:operator], got '{arg}'");
    }
    if parts[3].is_empty() {
        bail!("batch code must not be empty");
    }
    Ok(BootRun {
        profile_id: parts[0].parse().context("profile id")?,
        target_count: parts[1].parse().context("target count")?,
        post_batch_delay_secs: parts[2].parse().context("post batch delay")?,
        batch_code: parts[3].to_string(),
        operator_id: parts.get(4).map(|s| s.parse::<u32>()).transpose().context("operator id")?,
    })
}

fn init_logging(json: bool) {
    // Default: INFO, use RUST_LOG=debug for full event visibility
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn build_collaborators(
    config: &Config,
    handle: &ConfigHandle,
    store: Arc<dyn RunStore>,
) -> anyhow::Result<Collaborators> {
    let camera: Arc<dyn Camera> = if config.camera().enabled {
        Arc::new(HttpCamera::new(config.camera()).context("camera client")?)
    } else {
        Arc::new(NullCamera)
    };
    let inspector: Arc<dyn Inspector> = if config.inspection().enabled {
        Arc::new(HttpInspector::new(config.inspection()).context("inspection client")?)
    } else {
        Arc::new(NullInspector)
    };
    let announcer: Arc<dyn Announcer> = if config.audio().enabled {
        Arc::new(CommandAnnouncer::new(config.audio()))
    } else {
        Arc::new(NullAnnouncer)
    };
    Ok(Collaborators {
        camera,
        inspector,
        announcer,
        run_store: store,
        profiles: Arc::new(ConfigProfileStore::new(handle.clone())),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.json_logs);

    info!(git = %env!("GIT_HASH"), "line-controller starting");

    let boot_run = args.start.as_deref().map(parse_boot_run).transpose().context("--start")?;

    let config_path = Config::resolve_config_path(args.config.as_deref());
    let config = Config::load_from_path(&config_path);
    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        device = %config.modbus().device,
        entry_channel = %config.entry_channel(),
        exit_channel = %config.exit_channel(),
        poll_interval_ms = %config.poll_interval_ms(),
        max_transit_ms = %config.max_transit_time_ms(),
        profiles = %config.profiles().len(),
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );
    let handle = ConfigHandle::new(config);
    let config = handle.current();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    let bus: Arc<dyn DiscreteBus> = Arc::new(ModbusRtu::new(ModbusSettings::from_config(&config)));
    let gateway = Arc::new(OutputGateway::new(
        bus.clone(),
        config.outputs(),
        config.modbus().unhealthy_after_failures,
        metrics.clone(),
    ));
    let buzzer = Arc::new(BuzzerSequencer::start(
        gateway.clone(),
        Duration::from_millis(config.buzzer_tick_ms()),
    ));

    let store: Arc<dyn RunStore> = Arc::new(
        JsonlRunStore::open(config.runs_file())
            .with_context(|| format!("opening run store {}", config.runs_file()))?,
    );

    let (notifier, notification_worker) =
        create_notifier(store.clone(), Some(gateway.clone()), config.notifications(), metrics.clone());
    // Stopped last so alerts raised while shutting down are still persisted
    let (notifier_stop_tx, notifier_stop_rx) = watch::channel(false);
    let worker_handle = tokio::spawn(notification_worker.run(notifier_stop_rx));

    let collab = build_collaborators(&config, &handle, store)?;
    let orchestrator =
        Orchestrator::new(handle.clone(), gateway.clone(), buzzer, notifier, collab, metrics.clone());
    orchestrator.initialize_hardware().await;

    // Poller -> dispatcher, bounded for backpressure
    let (event_tx, event_rx) = mpsc::channel(256);
    let poller = SensorPoller::new(
        bus,
        &[SensorId(config.entry_channel()), SensorId(config.exit_channel())],
        Duration::from_millis(config.poll_interval_ms()),
        event_tx,
        metrics.clone(),
    )
    .with_coil_readback(gateway);
    let poller_handle = tokio::spawn(poller.run(shutdown_rx.clone()));
    let dispatcher_handle = tokio::spawn(dispatch_events(orchestrator.clone(), event_rx));

    // Start Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let prom_status = orchestrator.subscribe_status();
        let prom_shutdown = shutdown_rx.clone();
        let site = config.site_id().to_string();
        tokio::spawn(async move {
            if let Err(e) = line_controller::io::prometheus::start_metrics_server(
                prometheus_port,
                prom_metrics,
                site,
                prom_status,
                prom_shutdown,
            )
            .await
            {
                error!(error = %e, "prometheus_server_error");
            }
        });
    }

    // Periodic metrics summary
    let metrics_interval = config.metrics_interval_secs();
    if metrics_interval > 0 {
        let metrics_clone = metrics.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
            interval.tick().await;
            loop {
                interval.tick().await;
                metrics_clone.report().log();
            }
        });
    }

    // SIGHUP reloads the configuration
    #[cfg(unix)]
    {
        let reload_handle = handle.clone();
        let mut reload_shutdown = shutdown_rx.clone();
        let mut hangup =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()).context("SIGHUP handler")?;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = reload_shutdown.changed() => break,
                    received = hangup.recv() => {
                        if received.is_none() {
                            break;
                        }
                        match reload_handle.reload() {
                            Ok(config) => info!(config_file = %config.config_file(), "config_reloaded"),
                            Err(e) => warn!(error = %e, "config_reload_failed"),
                        }
                    }
                }
            }
        });
    }

    if let Some(run) = boot_run {
        let started = orchestrator
            .start_run(
                run.profile_id,
                run.target_count,
                run.post_batch_delay_secs,
                &run.batch_code,
                run.operator_id,
            )
            .await;
        if !started {
            warn!(batch = %run.batch_code, "boot_run_not_started");
        }
    }

    tokio::signal::ctrl_c().await.context("waiting for Ctrl+C")?;
    info!("shutdown_signal_received");
    let _ = shutdown_tx.send(true);

    // Poller exit closes the event channel, which ends the dispatcher
    if let Err(e) = poller_handle.await {
        error!(error = %e, "poller_task_failed");
    }
    if let Err(e) = dispatcher_handle.await {
        error!(error = %e, "dispatcher_task_failed");
    }
    orchestrator.shutdown().await;
    let _ = notifier_stop_tx.send(true);
    if let Err(e) = worker_handle.await {
        error!(error = %e, "notification_worker_failed");
    }

    info!("line-controller shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_boot_run() {
        let run = parse_boot_run("3:50:10:B-0042:7").unwrap();
        assert_eq!(
            run,
            BootRun {
                profile_id: 3,
                target_count: 50,
                post_batch_delay_secs: 10,
                batch_code: "B-0042".to_string(),
                operator_id: Some(7),
            }
        );
        assert_eq!(parse_boot_run("3:50:10:B1").unwrap().operator_id, None);
    }

    #[test]
    fn test_parse_boot_run_rejects_garbage() {
        assert!(parse_boot_run("3:50").is_err());
        assert!(parse_boot_run("x:50:10:B1").is_err());
        assert!(parse_boot_run("3:50:10:").is_err());
        assert!(parse_boot_run("3:50:10:B1:7:9").is_err());
    }
}
