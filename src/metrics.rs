use anyhow::{Context, Result};
use axum::{Json, Router, extract::State, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::info;

use crate::station_cache::{StationState, StationStateReader};

/// Initialize Prometheus metrics exporter
/// Returns a handle that can be used to render metrics for scraping
pub fn init_metrics() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        // Buckets: 0.1ms .. 1s
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Full(
                "aprs.line_processing_latency_ms".to_string(),
            ),
            &[0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 25.0, 50.0, 100.0, 1000.0],
        )
        .context("failed to set buckets for aprs.line_processing_latency_ms")?
        .install_recorder()
        .context("failed to install Prometheus recorder")
}

/// Background task to update process metrics
/// Updates uptime and memory usage metrics every 5 seconds
pub async fn process_metrics_task() {
    let start_time = Instant::now();

    loop {
        let uptime_seconds = start_time.elapsed().as_secs() as f64;
        metrics::gauge!("process.uptime.seconds").set(uptime_seconds);
        metrics::gauge!("process.is_up").set(1.0);

        #[cfg(target_os = "linux")]
        {
            if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
                for line in status.lines() {
                    if line.starts_with("VmRSS:") {
                        // RSS in kB
                        if let Some(kb_str) = line.split_whitespace().nth(1)
                            && let Ok(kb) = kb_str.parse::<f64>()
                        {
                            metrics::gauge!("process.memory.bytes").set(kb * 1024.0);
                        }
                        break;
                    }
                }
            }
        }

        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}

/// Initialize feed metrics to zero/default values
/// This ensures metrics always appear in Prometheus queries even if no events have occurred
pub fn initialize_feed_metrics() {
    // Connection
    metrics::counter!("aprs.connection.established_total").absolute(0);
    metrics::counter!("aprs.connection_failed_total").absolute(0);
    metrics::counter!("aprs.connection.operation_failed_total").absolute(0);
    metrics::counter!("aprs.connection.server_closed_total").absolute(0);
    metrics::counter!("aprs.connection.timeout_total").absolute(0);
    metrics::counter!("aprs.connection.reconnect_total").absolute(0);
    metrics::counter!("aprs.login.rejected_total").absolute(0);
    metrics::gauge!("aprs.connection.connected").set(0.0);
    metrics::counter!("aprs.keepalive.sent_total").absolute(0);

    // Raw lines
    metrics::counter!("aprs.raw_message.received.aprs_total").absolute(0);
    metrics::counter!("aprs.raw_message.received.server_total").absolute(0);
    metrics::counter!("aprs.raw_message.invalid_utf8_total").absolute(0);
    metrics::counter!("aprs.process_line.called_total").absolute(0);
    metrics::counter!("aprs.parse.success_total").absolute(0);
    metrics::counter!("aprs.parse.failed_total").absolute(0);
    metrics::gauge!("aprs.lag_seconds").set(0.0);
}

/// Initialize weather pipeline metrics to zero/default values
pub fn initialize_weather_metrics() {
    metrics::counter!("weather.router.forwarded_total").absolute(0);
    metrics::counter!("weather.router.dropped.empty_total").absolute(0);
    metrics::counter!("weather.router.dropped.no_weather_total").absolute(0);
    metrics::gauge!("weather.station_cache.stations").set(0.0);
    metrics::counter!("weather.dispatch.created_total").absolute(0);
    metrics::counter!("weather.dispatch.updated_total").absolute(0);
    metrics::counter!("weather.dispatch.sink_failed_total").absolute(0);
}

/// Latest state of every known station, sorted by station id
async fn stations_handler(State(reader): State<StationStateReader>) -> Json<Vec<StationState>> {
    let mut stations: Vec<StationState> = reader
        .snapshot()
        .into_values()
        .map(|state| (*state).clone())
        .collect();
    stations.sort_by(|a, b| a.station_id.cmp(&b.station_id));
    Json(stations)
}

/// Router serving `/metrics` and `/stations`
pub fn metrics_router(handle: PrometheusHandle, reader: StationStateReader) -> Router {
    Router::new()
        .route(
            "/metrics",
            get(move || {
                let handle = handle.clone();
                async move { handle.render() }
            }),
        )
        .route("/stations", get(stations_handler))
        .with_state(reader)
}

/// Start a standalone metrics server on the specified port
/// This is used by the "run" subcommand to expose metrics independently
pub async fn start_metrics_server(port: u16, reader: StationStateReader) -> Result<()> {
    let handle = init_metrics()?;

    tokio::spawn(process_metrics_task());

    let app = metrics_router(handle, reader);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting metrics server on http://{}/metrics", addr);
    info!("Station snapshot available at http://{}/stations", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind metrics server to {}", addr))?;

    axum::serve(listener, app)
        .await
        .context("Metrics server failed")
}
