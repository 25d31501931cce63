//! Prometheus metrics HTTP endpoint
//!
//! Exposes line metrics in Prometheus text format at /metrics and the latest
//! run status as JSON at /health. Uses hyper for the HTTP server.

use crate::domain::RunStatus;
use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with site label
fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    site: &str,
    val: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    avg: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in METRICS_BUCKET_BOUNDS.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {}", avg * count);
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {count}");
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(metrics: &Metrics, site_id: &str) -> String {
    let summary = metrics.report();
    let mut output = String::with_capacity(4096);

    write_io_metrics(&mut output, site_id, &summary);
    write_item_metrics(&mut output, site_id, &summary);
    write_run_metrics(&mut output, site_id, &summary);
    write_alert_metrics(&mut output, site_id, &summary);

    output
}

fn write_io_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "line_sensor_events_total",
        "Sensor edges handled by the orchestrator",
        MetricType::Counter,
        site,
        summary.sensor_events_total,
    );
    write_histogram(
        output,
        "line_event_latency_us",
        "Edge detection to handling latency in microseconds",
        site,
        &summary.event_lat_buckets,
        summary.event_lat_avg_us,
    );
    write_metric(
        output,
        "line_polls_total",
        "Successful input polls",
        MetricType::Counter,
        site,
        summary.polls_ok,
    );
    write_metric(
        output,
        "line_polls_failed_total",
        "Failed input polls",
        MetricType::Counter,
        site,
        summary.polls_failed,
    );
    write_metric(
        output,
        "line_poll_latency_p99_us",
        "99th percentile input poll round trip",
        MetricType::Gauge,
        site,
        summary.poll_lat_p99_us,
    );
    write_metric(
        output,
        "line_coil_writes_failed_total",
        "Failed coil writes",
        MetricType::Counter,
        site,
        summary.coil_writes_failed,
    );
    write_metric(
        output,
        "line_io_connected",
        "Discrete I/O bus reachable (1) or not (0)",
        MetricType::Gauge,
        site,
        u64::from(summary.io_connected),
    );
}

fn write_item_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    for (name, help, val) in [
        ("line_items_entered_total", "Items seen at the entry sensor", summary.items_entered),
        ("line_items_counted_total", "Items counted at the exit sensor", summary.items_counted),
        ("line_items_stalled_total", "Items that never reached the exit", summary.items_stalled),
        ("line_exits_without_item_total", "Exit triggers with nothing in flight", summary.exits_without_item),
        ("line_size_mismatches_total", "Entry block times outside the product window", summary.size_mismatches),
        ("line_captures_failed_total", "Failed entry captures", summary.captures_failed),
        ("line_inspection_rejects_total", "Items rejected by inspection", summary.inspection_rejects),
    ] {
        write_metric(output, name, help, MetricType::Counter, site, val);
    }
    write_metric(
        output,
        "line_in_flight",
        "Items between entry and exit",
        MetricType::Gauge,
        site,
        summary.in_flight,
    );
}

fn write_run_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    for (name, help, val) in [
        ("line_runs_started_total", "Runs started", summary.runs_started),
        ("line_runs_completed_total", "Runs that reached their target", summary.runs_completed),
        ("line_runs_failed_total", "Runs ended by a failure", summary.runs_failed),
        ("line_runs_aborted_total", "Runs stopped by the operator", summary.runs_aborted),
    ] {
        write_metric(output, name, help, MetricType::Counter, site, val);
    }
    write_metric(
        output,
        "line_mode",
        "Operating mode (0 stopped, 1 idle, 2 running, 3 post-run delay, 4 paused)",
        MetricType::Gauge,
        site,
        summary.mode,
    );
    write_metric(
        output,
        "line_run_progress",
        "Items counted in the current run",
        MetricType::Gauge,
        site,
        summary.run_progress,
    );
}

fn write_alert_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    let name = "line_alerts_total";
    let _ = writeln!(output, "# HELP {name} Notifications by level");
    let _ = writeln!(output, "# TYPE {name} counter");
    for (level, val) in ["info", "warning", "error", "critical"].iter().zip(summary.alerts) {
        let _ = writeln!(output, "{name}{{site=\"{site}\",level=\"{level}\"}} {val}");
    }
    write_metric(
        output,
        "line_alerts_dropped_total",
        "Notifications dropped on a full queue",
        MetricType::Counter,
        site,
        summary.alerts_dropped,
    );
}

fn response(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    site_id: Arc<String>,
    status: watch::Receiver<RunStatus>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let body = format_prometheus_metrics(&metrics, &site_id);
            Ok(response(StatusCode::OK, "text/plain; version=0.0.4; charset=utf-8", body))
        }
        (&Method::GET, "/health") => {
            let snapshot = status.borrow().clone();
            match serde_json::to_vec(&snapshot) {
                Ok(body) => Ok(response(StatusCode::OK, "application/json", body)),
                Err(e) => {
                    error!(error = %e, "status_serialize_failed");
                    Ok(response(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", "error"))
                }
            }
        }
        _ => Ok(response(StatusCode::NOT_FOUND, "text/plain", "Not Found")),
    }
}

/// Start the Prometheus metrics HTTP server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    site_id: String,
    status: watch::Receiver<RunStatus>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let site_id = Arc::new(site_id);

    info!(port = %port, site = %site_id, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();
                        let site_id = site_id.clone();
                        let status = status.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                handle_request(req, metrics.clone(), site_id.clone(), status.clone())
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
